// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sliding-window CPU and memory accounting (§4.1).
//!
//! A cgroup owns a window `[start, start + duration)` measured in ticks.
//! `on_tick` advances the window and applies penalties; `can_run` is a pure
//! predicate over the current window state, queried from `can_dispatch` and
//! never itself advancing anything (idempotent within a tick, Testable
//! Property 7).

use core::cell::RefCell;

use abi::config::{
    MAX_CGROUPS, MAX_NAME_LEN_CGROUP, MAX_PENALTY_WINDOWS,
};
use abi::{Bytes, CgroupHandle, CpuQuota, Error, Name, Tick, MEM_UNLIMITED};
use critical_section::Mutex;

use crate::slots::Slots;

ringbuf::ringbuf!(TRACE, Trace, 32, Trace::None);

#[derive(Copy, Clone, Eq, PartialEq)]
enum Trace {
    None,
    WindowRolled { cgroup: usize, excess: u64, penalty: u64 },
    Created(usize),
    Deleted(usize),
}

/// Host-provided access to the per-task cgroup field of the task control
/// block (§3 `TaskBinding::cgroup`). The core never stores a task list
/// inside a `Cgroup`; membership is tracked by the task's own field plus a
/// running count, per Design Notes §9 item 4.
pub trait CgroupBindings {
    type Task: Copy + Eq;

    fn get_cgroup(&self, task: Self::Task) -> Option<CgroupHandle>;
    fn set_cgroup(&mut self, task: Self::Task, cgroup: Option<CgroupHandle>);
}

/// A snapshot of a cgroup's accounting state (§4.1 `stats`). Callers must
/// treat this as an instantaneous sample; it is not updated after it is
/// returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Stats {
    pub mem_limit: Bytes,
    pub mem_used: Bytes,
    pub mem_peak: Bytes,
    pub cpu_quota: CpuQuota,
    pub ticks_used: u64,
    pub penalty_ticks_left: u64,
    pub window_start: Tick,
    pub membership_count: u32,
}

struct Cgroup {
    #[allow(dead_code)] // debugging aid only; not read by any invariant
    name: Name<MAX_NAME_LEN_CGROUP>,
    mem_limit: Bytes,
    mem_used: Bytes,
    mem_peak: Bytes,
    cpu_quota: CpuQuota,
    ticks_used: u64,
    penalty_ticks_left: u64,
    window_start: Tick,
    window_duration: Tick,
    membership_count: u32,
    active: bool,
}

struct Inner {
    cgroups: Slots<Cgroup, MAX_CGROUPS>,
}

/// The resource-accounting engine described in §4.1: one instance owns the
/// entire cgroup table.
pub struct CgroupEngine {
    inner: Mutex<RefCell<Inner>>,
}

impl CgroupEngine {
    pub fn new() -> Self {
        CgroupEngine {
            inner: Mutex::new(RefCell::new(Inner {
                cgroups: Slots::new(),
            })),
        }
    }

    /// Allocates a cgroup, recording `mem_limit`/`cpu_quota` and starting a
    /// window aligned with `now`. `cpu_quota == CpuQuota::UNLIMITED`
    /// disables throttling entirely.
    pub fn create(
        &self,
        name: &str,
        mem_limit: Bytes,
        cpu_quota: CpuQuota,
        now: Tick,
    ) -> Result<CgroupHandle, Error> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let (index, generation) = inner.cgroups.insert(Cgroup {
                name: Name::new(name),
                mem_limit,
                mem_used: 0,
                mem_peak: 0,
                cpu_quota,
                ticks_used: 0,
                penalty_ticks_left: 0,
                window_start: now,
                window_duration: abi::config::CGROUP_WINDOW_DURATION_TICKS,
                membership_count: 0,
                active: true,
            })?;
            ringbuf::ringbuf_entry!(TRACE, Trace::Created(index));
            Ok(CgroupHandle::new(index, generation))
        })
    }

    /// Refuses while any task is still a member (§4.1, Testable Property
    /// 4).
    pub fn delete(&self, handle: CgroupHandle) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let cg = inner
                .cgroups
                .get(handle.index(), handle.generation())
                .ok_or(Error::InvalidArgument)?;
            if cg.membership_count != 0 {
                return Err(Error::NotPermitted);
            }
            inner.cgroups.remove(handle.index());
            ringbuf::ringbuf_entry!(TRACE, Trace::Deleted(handle.index()));
            Ok(())
        })
    }

    /// Atomically records `task`'s cgroup and increments membership.
    /// Refuses if `task` already belongs to a cgroup.
    pub fn add_task<B: CgroupBindings>(
        &self,
        handle: CgroupHandle,
        task: B::Task,
        bindings: &mut B,
    ) -> Result<(), Error> {
        if bindings.get_cgroup(task).is_some() {
            return Err(Error::InvalidArgument);
        }
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let cg = inner
                .cgroups
                .get_mut(handle.index(), handle.generation())
                .ok_or(Error::InvalidArgument)?;
            cg.membership_count += 1;
            Ok(())
        })?;
        bindings.set_cgroup(task, Some(handle));
        Ok(())
    }

    pub fn remove_task<B: CgroupBindings>(
        &self,
        task: B::Task,
        bindings: &mut B,
    ) -> Result<(), Error> {
        let handle = bindings.get_cgroup(task).ok_or(Error::InvalidArgument)?;
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let cg = inner
                .cgroups
                .get_mut(handle.index(), handle.generation())
                .ok_or(Error::InvalidArgument)?;
            cg.membership_count = cg.membership_count.saturating_sub(1);
            Ok(())
        })?;
        bindings.set_cgroup(task, None);
        Ok(())
    }

    pub fn set_mem_limit(&self, handle: CgroupHandle, limit: Bytes) -> Result<(), Error> {
        self.with_cgroup_mut(handle, |cg| cg.mem_limit = limit)
    }

    pub fn set_cpu_quota(&self, handle: CgroupHandle, quota: CpuQuota) -> Result<(), Error> {
        self.with_cgroup_mut(handle, |cg| cg.cpu_quota = quota)
    }

    /// Pure predicate over current usage plus a proposed delta versus the
    /// limit (§4.1). `task` with no cgroup always passes — unlike IPC
    /// namespaces, there is no root cgroup an unassigned task implicitly
    /// belongs to, so "no cgroup" means "unrestricted", not "in root".
    pub fn check_mem<B: CgroupBindings>(
        &self,
        task: B::Task,
        size: Bytes,
        bindings: &B,
    ) -> bool {
        let Some(handle) = bindings.get_cgroup(task) else {
            return true;
        };
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            match inner.cgroups.get(handle.index(), handle.generation()) {
                None => true,
                Some(cg) if cg.mem_limit == MEM_UNLIMITED => true,
                Some(cg) => cg.mem_used.saturating_add(size) <= cg.mem_limit,
            }
        })
    }

    /// Signed update of current usage; negative deltas saturate at zero;
    /// peak is monotonically tracked.
    pub fn update_mem<B: CgroupBindings>(&self, task: B::Task, delta: i64, bindings: &B) {
        let Some(handle) = bindings.get_cgroup(task) else {
            return;
        };
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if let Some(cg) = inner.cgroups.get_mut(handle.index(), handle.generation()) {
                cg.mem_used = if delta >= 0 {
                    cg.mem_used.saturating_add(delta as u64)
                } else {
                    cg.mem_used.saturating_sub((-delta) as u64)
                };
                cg.mem_peak = cg.mem_peak.max(cg.mem_used);
            }
        })
    }

    pub fn stats(&self, handle: CgroupHandle) -> Result<Stats, Error> {
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            let cg = inner
                .cgroups
                .get(handle.index(), handle.generation())
                .ok_or(Error::InvalidArgument)?;
            Ok(Stats {
                mem_limit: cg.mem_limit,
                mem_used: cg.mem_used,
                mem_peak: cg.mem_peak,
                cpu_quota: cg.cpu_quota,
                ticks_used: cg.ticks_used,
                penalty_ticks_left: cg.penalty_ticks_left,
                window_start: cg.window_start,
                membership_count: cg.membership_count,
            })
        })
    }

    /// §4.1 step (1)-(3). `running` is the cgroup of the task that is about
    /// to be charged for the tick just elapsed, as read from that task's
    /// binding by the caller (`KernelHooks::on_tick`). This is the only
    /// place window state changes; `can_run` never does.
    pub fn on_tick(&self, now: Tick, running: Option<CgroupHandle>) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);

            if let Some(handle) = running {
                if let Some(cg) =
                    inner.cgroups.get_mut(handle.index(), handle.generation())
                {
                    cg.ticks_used = cg.ticks_used.saturating_add(1);
                }
            }

            for (index, cg) in inner.cgroups.iter_mut() {
                if !cg.active {
                    continue;
                }
                if now.saturating_sub(cg.window_start) >= cg.window_duration {
                    let excess = if cg.cpu_quota.is_unlimited() {
                        0
                    } else {
                        cg.ticks_used.saturating_sub(cg.cpu_quota.0 as u64)
                    };
                    if excess > 0 {
                        let quota = cg.cpu_quota.0 as u64;
                        let added = excess.saturating_mul(cg.window_duration) / quota.max(1);
                        let cap = cg.window_duration.saturating_mul(MAX_PENALTY_WINDOWS);
                        cg.penalty_ticks_left =
                            (cg.penalty_ticks_left.saturating_add(added)).min(cap);
                        ringbuf::ringbuf_entry!(
                            TRACE,
                            Trace::WindowRolled {
                                cgroup: index,
                                excess,
                                penalty: cg.penalty_ticks_left,
                            }
                        );
                    } else if cg.penalty_ticks_left > 0 {
                        // No overrun this window: a leftover penalty from an
                        // earlier window decays by one unit per boundary
                        // crossed, until it reaches zero (§4.4 state diagram).
                        cg.penalty_ticks_left -= 1;
                    }
                    cg.window_start = now;
                    cg.ticks_used = 0;
                }

                // Independently of any window roll-over above, the cgroup
                // that just received this tick decays by one more unit
                // (§4.1 step 3). The two decrements can both apply in the
                // same tick; that overlap is preserved from the source.
                if running.map(|h| h.index()) == Some(index) && cg.penalty_ticks_left > 0 {
                    cg.penalty_ticks_left -= 1;
                }
            }
        })
    }

    /// §4.1 dispatch predicate. Does not advance windows; repeated calls
    /// with no intervening `on_tick` are idempotent (Testable Property 7).
    pub fn can_run(&self, cgroup: Option<CgroupHandle>) -> bool {
        let Some(handle) = cgroup else {
            return true;
        };
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            match inner.cgroups.get(handle.index(), handle.generation()) {
                None => true,
                Some(cg) if cg.cpu_quota.is_unlimited() => true,
                Some(cg) => {
                    cg.penalty_ticks_left == 0
                        && cg.ticks_used < cg.cpu_quota.0 as u64
                }
            }
        })
    }

    /// Snapshot of every live cgroup handle, for introspection/debugging
    /// tooling. Bounded by `MAX_CGROUPS`; like `stats`, the snapshot is
    /// stale the instant concurrent mutation resumes.
    pub fn cgroups(&self) -> impl Iterator<Item = CgroupHandle> {
        let mut buf = [None; MAX_CGROUPS];
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            for (slot, (index, generation, _)) in
                inner.cgroups.iter_with_generation().enumerate()
            {
                buf[slot] = Some(CgroupHandle::new(index, generation));
            }
        });
        buf.into_iter().flatten()
    }

    fn with_cgroup_mut(
        &self,
        handle: CgroupHandle,
        f: impl FnOnce(&mut Cgroup),
    ) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let cg = inner
                .cgroups
                .get_mut(handle.index(), handle.generation())
                .ok_or(Error::InvalidArgument)?;
            f(cg);
            Ok(())
        })
    }
}

impl Default for CgroupEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeHost {
        cgroup: HashMap<u32, CgroupHandle>,
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

    const TH: u32 = 1;
    const TL: u32 = 2;

    #[test]
    fn s1_ratio_of_quotas_is_respected_over_a_window() {
        let engine = CgroupEngine::new();
        let mut host = FakeHost::default();

        let h = engine.create("H", MEM_UNLIMITED, CpuQuota(300), 0).unwrap();
        let l = engine.create("L", MEM_UNLIMITED, CpuQuota(20), 0).unwrap();
        engine.add_task(h, TH, &mut host).unwrap();
        engine.add_task(l, TL, &mut host).unwrap();

        let mut dispatched_h = 0u64;
        let mut dispatched_l = 0u64;
        for tick in 0..1000u64 {
            // Single CPU: prefer H while it has budget, otherwise give the
            // tick to L. Both tasks are CPU-bound (always have work).
            if engine.can_run(Some(h)) {
                dispatched_h += 1;
                engine.on_tick(tick, Some(h));
            } else if engine.can_run(Some(l)) {
                dispatched_l += 1;
                engine.on_tick(tick, Some(l));
            } else {
                engine.on_tick(tick, None);
            }
        }

        assert!(dispatched_h >= 299, "H should run close to its quota: {dispatched_h}");
        assert!(dispatched_l <= 40, "L should be capped near its quota: {dispatched_l}");
    }

    #[test]
    fn s2_memory_limit_is_enforced_and_peak_tracked() {
        let engine = CgroupEngine::new();
        let mut host = FakeHost::default();
        let g = engine.create("G", 8192, CpuQuota::UNLIMITED, 0).unwrap();
        engine.add_task(g, TH, &mut host).unwrap();

        assert!(engine.check_mem(TH, 4096, &host));
        engine.update_mem(TH, 4096, &host);
        assert!(engine.check_mem(TH, 4096, &host));
        engine.update_mem(TH, 4096, &host);
        assert!(!engine.check_mem(TH, 1, &host));

        let stats = engine.stats(g).unwrap();
        assert_eq!(stats.mem_peak, 8192);
    }

    #[test]
    fn s6_penalty_reflects_overrun_ratio() {
        let engine = CgroupEngine::new();
        let mut host = FakeHost::default();
        let g = engine.create("G", MEM_UNLIMITED, CpuQuota(100), 0).unwrap();
        engine.add_task(g, TH, &mut host).unwrap();

        for tick in 0..150u64 {
            engine.on_tick(tick, Some(g));
        }
        // Window (1000 ticks) hasn't elapsed yet, so no roll-over occurred;
        // advance time to the window boundary without further charging.
        engine.on_tick(1000, None);

        let stats = engine.stats(g).unwrap();
        assert!(
            stats.penalty_ticks_left >= 500,
            "expected penalty >= 500, got {}",
            stats.penalty_ticks_left
        );
        assert!(!engine.can_run(Some(g)));
    }

    #[test]
    fn property4_delete_requires_empty_membership() {
        let engine = CgroupEngine::new();
        let mut host = FakeHost::default();
        let g = engine.create("G", MEM_UNLIMITED, CpuQuota::UNLIMITED, 0).unwrap();
        engine.add_task(g, TH, &mut host).unwrap();
        assert_eq!(engine.delete(g), Err(Error::NotPermitted));
        engine.remove_task(TH, &mut host).unwrap();
        assert_eq!(engine.delete(g), Ok(()));
    }

    #[test]
    fn property5_add_then_remove_restores_binding() {
        let engine = CgroupEngine::new();
        let mut host = FakeHost::default();
        let g = engine.create("G", MEM_UNLIMITED, CpuQuota::UNLIMITED, 0).unwrap();
        assert_eq!(host.get_cgroup(TH), None);
        engine.add_task(g, TH, &mut host).unwrap();
        engine.remove_task(TH, &mut host).unwrap();
        assert_eq!(host.get_cgroup(TH), None);
    }

    #[test]
    fn property6_update_mem_round_trip_does_not_lower_peak() {
        let engine = CgroupEngine::new();
        let mut host = FakeHost::default();
        let g = engine.create("G", MEM_UNLIMITED, CpuQuota::UNLIMITED, 0).unwrap();
        engine.add_task(g, TH, &mut host).unwrap();

        engine.update_mem(TH, 4096, &host);
        engine.update_mem(TH, -4096, &host);
        let stats = engine.stats(g).unwrap();
        assert_eq!(stats.mem_used, 0);
        assert_eq!(stats.mem_peak, 4096);
    }

    #[test]
    fn property7_can_run_is_idempotent_without_a_tick() {
        let engine = CgroupEngine::new();
        let g = engine.create("G", MEM_UNLIMITED, CpuQuota(1), 0).unwrap();
        assert_eq!(engine.can_run(Some(g)), engine.can_run(Some(g)));
    }

    #[test]
    fn property8_capacity_error_past_max_cgroups() {
        let engine = CgroupEngine::new();
        for i in 0..MAX_CGROUPS {
            engine
                .create(&format!("g{i}"), MEM_UNLIMITED, CpuQuota::UNLIMITED, 0)
                .unwrap();
        }
        assert_eq!(
            engine.create("overflow", MEM_UNLIMITED, CpuQuota::UNLIMITED, 0),
            Err(Error::Capacity)
        );
    }

    #[test]
    fn cgroups_lists_live_handles_and_omits_deleted_ones() {
        let engine = CgroupEngine::new();
        let g1 = engine.create("g1", MEM_UNLIMITED, CpuQuota::UNLIMITED, 0).unwrap();
        let g2 = engine.create("g2", MEM_UNLIMITED, CpuQuota::UNLIMITED, 0).unwrap();
        let listed: Vec<_> = engine.cgroups().collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&g1));
        assert!(listed.contains(&g2));

        engine.delete(g1).unwrap();
        let listed: Vec<_> = engine.cgroups().collect();
        assert_eq!(listed, vec![g2]);
    }

    #[test]
    fn property10_unlimited_quota_is_never_throttled() {
        let engine = CgroupEngine::new();
        let g = engine.create("G", MEM_UNLIMITED, CpuQuota::UNLIMITED, 0).unwrap();
        for tick in 0..10_000u64 {
            engine.on_tick(tick, Some(g));
            assert!(engine.can_run(Some(g)));
        }
    }

    #[test]
    fn invalid_handle_after_delete_is_rejected() {
        let engine = CgroupEngine::new();
        let g = engine.create("G", MEM_UNLIMITED, CpuQuota::UNLIMITED, 0).unwrap();
        engine.delete(g).unwrap();
        assert_eq!(engine.delete(g), Err(Error::InvalidArgument));
        assert_eq!(engine.set_mem_limit(g, 10), Err(Error::InvalidArgument));
    }
}
