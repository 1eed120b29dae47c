// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The narrow integration surface a host scheduler implements against
//! (§4.4): `on_tick`, `can_dispatch`, `on_switch_out`, `on_task_delete`.
//!
//! `KernelHooks` composes one [`CgroupEngine`], one [`PidNsRegistry`] and
//! one [`IpcNsRegistry`] and forwards each hook to the subsystem(s) it
//! concerns. It owns no state of its own.

use abi::Tick;

use crate::cgroup::CgroupBindings;
use crate::cgroup::CgroupEngine;
use crate::ipcns::IpcNsRegistry;
use crate::pidns::PidBindings;
use crate::pidns::PidNsRegistry;

ringbuf::ringbuf!(TRACE, Trace, 8, Trace::None);

#[derive(Copy, Clone, Eq, PartialEq)]
enum Trace {
    None,
    SwitchOut,
}

/// Composes the three registries behind the four integration hooks. `T` is
/// whatever handle the host scheduler uses to name a task; the same `T`
/// must be threaded through every binding trait the host implements.
pub struct KernelHooks<T: Copy + Eq> {
    cgroups: CgroupEngine,
    pidns: PidNsRegistry<T>,
    ipcns: IpcNsRegistry<T>,
}

impl<T: Copy + Eq> KernelHooks<T> {
    pub fn new() -> Self {
        KernelHooks {
            cgroups: CgroupEngine::new(),
            pidns: PidNsRegistry::new(),
            ipcns: IpcNsRegistry::new(),
        }
    }

    pub fn cgroups(&self) -> &CgroupEngine {
        &self.cgroups
    }

    pub fn pidns(&self) -> &PidNsRegistry<T> {
        &self.pidns
    }

    pub fn ipcns(&self) -> &IpcNsRegistry<T> {
        &self.ipcns
    }

    /// Called once per tick, from the tick ISR tail, after the scheduler's
    /// own accounting (§4.1 steps 1-3). `running` is the task that was
    /// charged for the tick just elapsed, or `None` if the idle task ran.
    pub fn on_tick<B: CgroupBindings<Task = T>>(&self, now: Tick, running: Option<T>, bindings: &B) {
        let cgroup = running.and_then(|t| bindings.get_cgroup(t));
        self.cgroups.on_tick(now, cgroup);
    }

    /// Called from next-task selection, after the scheduler has chosen a
    /// candidate but before it commits to running it. Must not suspend;
    /// idempotent against itself with no intervening `on_tick`.
    pub fn can_dispatch<B: CgroupBindings<Task = T>>(&self, task: T, bindings: &B) -> bool {
        let cgroup = bindings.get_cgroup(task);
        self.cgroups.can_run(cgroup)
    }

    /// Reserved hook, called after the outgoing task's context is saved.
    /// Currently side-effect free beyond a diagnostic trace; must not be
    /// relied on to advance windows (§4.4).
    pub fn on_switch_out(&self, _task: T) {
        ringbuf::ringbuf_entry!(TRACE, Trace::SwitchOut);
    }

    /// Called once per task, on the path that reclaims its TCB. Removes
    /// the task from its cgroup, then its PID namespace, in that order
    /// (§5); tolerates the task not being in either. The task's IPC
    /// namespace binding is left for the scheduler to tear down.
    pub fn on_task_delete<B>(&self, task: T, bindings: &mut B)
    where
        B: CgroupBindings<Task = T> + PidBindings<Task = T>,
    {
        let _ = self.cgroups.remove_task(task, bindings);
        let _ = self.pidns.remove_task(task, bindings);
    }
}

impl<T: Copy + Eq> Default for KernelHooks<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{CgroupHandle, CpuQuota, PidNsHandle, VirtualPid, MEM_UNLIMITED};
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeHost {
        cgroup: HashMap<u32, CgroupHandle>,
        pid_ns: HashMap<u32, PidNsHandle>,
        vpid: HashMap<u32, VirtualPid>,
    }

    impl CgroupBindings for FakeHost {
        type Task = u32;

        fn get_cgroup(&self, task: u32) -> Option<CgroupHandle> {
            self.cgroup.get(&task).copied()
        }
        fn set_cgroup(&mut self, task: u32, cgroup: Option<CgroupHandle>) {
            match cgroup {
                Some(h) => {
                    self.cgroup.insert(task, h);
                }
                None => {
                    self.cgroup.remove(&task);
                }
            }
        }
    }

    impl PidBindings for FakeHost {
        type Task = u32;

        fn get_pid_namespace(&self, task: u32) -> Option<PidNsHandle> {
            self.pid_ns.get(&task).copied()
        }
        fn set_pid_namespace(&mut self, task: u32, ns: Option<PidNsHandle>) {
            match ns {
                Some(ns) => {
                    self.pid_ns.insert(task, ns);
                }
                None => {
                    self.pid_ns.remove(&task);
                }
            }
        }
        fn get_virtual_pid(&self, task: u32) -> VirtualPid {
            self.vpid.get(&task).copied().unwrap_or(VirtualPid::NONE)
        }
        fn set_virtual_pid(&mut self, task: u32, vpid: VirtualPid) {
            self.vpid.insert(task, vpid);
        }
    }

    #[test]
    fn can_dispatch_reflects_cgroup_throttling() {
        let hooks: KernelHooks<u32> = KernelHooks::new();
        let mut host = FakeHost::default();
        let g = hooks
            .cgroups()
            .create("g", MEM_UNLIMITED, CpuQuota(1), 0)
            .unwrap();
        hooks.cgroups().add_task(g, 1, &mut host).unwrap();

        assert!(hooks.can_dispatch(1, &host));
        hooks.on_tick(0, Some(1), &host);
        assert!(!hooks.can_dispatch(1, &host));
    }

    #[test]
    fn task_with_no_cgroup_is_always_dispatchable() {
        let hooks: KernelHooks<u32> = KernelHooks::new();
        let host = FakeHost::default();
        assert!(hooks.can_dispatch(7, &host));
    }

    #[test]
    fn on_task_delete_removes_cgroup_then_pid_namespace_membership() {
        let hooks: KernelHooks<u32> = KernelHooks::new();
        let mut host = FakeHost::default();
        let g = hooks
            .cgroups()
            .create("g", MEM_UNLIMITED, CpuQuota::UNLIMITED, 0)
            .unwrap();
        hooks.cgroups().add_task(g, 1, &mut host).unwrap();
        hooks.pidns().add_task(PidNsHandle::ROOT, 1, &mut host).unwrap();

        hooks.on_task_delete(1, &mut host);

        assert_eq!(host.get_cgroup(1), None);
        assert_eq!(host.get_pid_namespace(1), None);
        assert_eq!(hooks.cgroups().stats(g).unwrap().membership_count, 0);
    }

    #[test]
    fn on_task_delete_tolerates_a_task_in_neither_container() {
        let hooks: KernelHooks<u32> = KernelHooks::new();
        let mut host = FakeHost::default();
        hooks.on_task_delete(42, &mut host);
    }

    #[test]
    fn on_switch_out_does_not_panic_and_does_not_advance_windows() {
        let hooks: KernelHooks<u32> = KernelHooks::new();
        let mut host = FakeHost::default();
        let g = hooks
            .cgroups()
            .create("g", MEM_UNLIMITED, CpuQuota(1), 0)
            .unwrap();
        hooks.cgroups().add_task(g, 1, &mut host).unwrap();
        let before = hooks.cgroups().stats(g).unwrap();
        hooks.on_switch_out(1);
        let after = hooks.cgroups().stats(g).unwrap();
        assert_eq!(before, after);
    }
}
