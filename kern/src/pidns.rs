// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual PID translation, one namespace per slot (§4.2).
//!
//! Each namespace owns a table of `MAX_VIRTUAL_PID_PER_NS` slots and hands
//! out virtual PIDs monotonically; a PID is never reused within the
//! lifetime of its namespace, even after the task that held it leaves.
//! The root namespace (`PidNsHandle::ROOT`) is created once, at registry
//! construction, and can never be deleted.

use core::cell::RefCell;

use abi::config::{MAX_PID_NAMESPACES, MAX_NAME_LEN_NS, MAX_VIRTUAL_PID_PER_NS};
use abi::{Error, Name, PidNsHandle, VirtualPid};
use critical_section::Mutex;

use crate::slots::Slots;

ringbuf::ringbuf!(TRACE, Trace, 16, Trace::None);

#[derive(Copy, Clone, Eq, PartialEq)]
enum Trace {
    None,
    Created(usize),
    Deleted(usize),
    PidExhausted(usize),
}

/// Host binding for tasks tracked by a [`PidNsRegistry`]: where a task's
/// namespace membership and virtual PID are actually stored.
pub trait PidBindings {
    type Task: Copy + Eq;

    fn get_pid_namespace(&self, task: Self::Task) -> Option<PidNsHandle>;
    fn set_pid_namespace(&mut self, task: Self::Task, ns: Option<PidNsHandle>);
    fn get_virtual_pid(&self, task: Self::Task) -> VirtualPid;
    fn set_virtual_pid(&mut self, task: Self::Task, vpid: VirtualPid);
}

/// Host hook for `create_in_namespace`, which must create a new task and
/// immediately enroll it, rolling the task creation back if enrollment
/// fails.
pub trait TaskFactory {
    type Task: Copy + Eq;

    fn create_task(&mut self) -> Result<Self::Task, Error>;
    fn delete_task(&mut self, task: Self::Task);
}

struct PidNamespace<T> {
    #[allow(dead_code)]
    name: Name<MAX_NAME_LEN_NS>,
    next_vpid: u32,
    tasks: [Option<T>; MAX_VIRTUAL_PID_PER_NS],
    membership_count: u32,
}

impl<T> PidNamespace<T> {
    fn new(name: Name<MAX_NAME_LEN_NS>) -> Self {
        PidNamespace {
            name,
            next_vpid: 1,
            tasks: core::array::from_fn(|_| None),
            membership_count: 0,
        }
    }
}

struct Inner<T> {
    namespaces: Slots<PidNamespace<T>, MAX_PID_NAMESPACES>,
}

/// A fixed-capacity table of PID namespaces, each translating its own
/// virtual PID space onto host task handles.
pub struct PidNsRegistry<T> {
    inner: Mutex<RefCell<Inner<T>>>,
}

impl<T: Copy + Eq> PidNsRegistry<T> {
    pub fn new() -> Self {
        let mut namespaces = Slots::new();
        // The root namespace always occupies slot 0: `Slots::insert` picks
        // the first free slot, and nothing has run yet, so this is safe.
        namespaces
            .insert(PidNamespace::new(Name::new("root")))
            .expect("fresh registry has room for the root namespace");
        PidNsRegistry {
            inner: Mutex::new(RefCell::new(Inner { namespaces })),
        }
    }

    pub fn create(&self, name: &str) -> Result<PidNsHandle, Error> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let (index, generation) = inner
                .namespaces
                .insert(PidNamespace::new(Name::new(name)))?;
            ringbuf::ringbuf_entry!(TRACE, Trace::Created(index));
            Ok(PidNsHandle::new(index, generation))
        })
    }

    pub fn delete(&self, handle: PidNsHandle) -> Result<(), Error> {
        if handle == PidNsHandle::ROOT {
            return Err(Error::NotPermitted);
        }
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let ns = inner
                .namespaces
                .get(handle.index(), handle.generation())
                .ok_or(Error::InvalidArgument)?;
            if ns.membership_count != 0 {
                return Err(Error::NotPermitted);
            }
            inner.namespaces.remove(handle.index());
            ringbuf::ringbuf_entry!(TRACE, Trace::Deleted(handle.index()));
            Ok(())
        })
    }

    /// Assigns `task` the next virtual PID in `handle`'s namespace. Fails
    /// with `Error::InvalidArgument` if the task already belongs to a
    /// namespace, or `Error::Capacity` once the namespace's PID space is
    /// exhausted — PIDs are never recycled, so a namespace that churns
    /// `MAX_VIRTUAL_PID_PER_NS` tasks over its lifetime is permanently full
    /// even if every one of them has since left.
    pub fn add_task<B: PidBindings<Task = T>>(
        &self,
        handle: PidNsHandle,
        task: T,
        bindings: &mut B,
    ) -> Result<(), Error> {
        if bindings.get_pid_namespace(task).is_some() {
            return Err(Error::InvalidArgument);
        }
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let ns = inner
                .namespaces
                .get_mut(handle.index(), handle.generation())
                .ok_or(Error::InvalidArgument)?;
            let vpid = ns.next_vpid;
            if vpid as usize >= MAX_VIRTUAL_PID_PER_NS {
                ringbuf::ringbuf_entry!(TRACE, Trace::PidExhausted(handle.index()));
                return Err(Error::Capacity);
            }
            ns.tasks[vpid as usize] = Some(task);
            ns.next_vpid += 1;
            ns.membership_count += 1;
            bindings.set_pid_namespace(task, Some(handle));
            bindings.set_virtual_pid(task, VirtualPid(vpid));
            Ok(())
        })
    }

    /// Removes `task` from whatever namespace it currently occupies. Its
    /// virtual PID is not reassigned to anyone else.
    pub fn remove_task<B: PidBindings<Task = T>>(
        &self,
        task: T,
        bindings: &mut B,
    ) -> Result<(), Error> {
        let handle = bindings.get_pid_namespace(task).ok_or(Error::InvalidArgument)?;
        let vpid = bindings.get_virtual_pid(task);
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let ns = inner
                .namespaces
                .get_mut(handle.index(), handle.generation())
                .ok_or(Error::InvalidArgument)?;
            if vpid.is_none() || ns.tasks[vpid.0 as usize].is_none() {
                return Err(Error::InvalidArgument);
            }
            ns.tasks[vpid.0 as usize] = None;
            ns.membership_count = ns.membership_count.saturating_sub(1);
            Ok(())
        })?;
        bindings.set_pid_namespace(task, None);
        bindings.set_virtual_pid(task, VirtualPid::NONE);
        Ok(())
    }

    /// Convenience accessor equivalent to `bindings.get_virtual_pid(task)`.
    pub fn virtual_pid<B: PidBindings<Task = T>>(&self, task: T, bindings: &B) -> VirtualPid {
        bindings.get_virtual_pid(task)
    }

    /// Translates a virtual PID back to the task it names within `handle`'s
    /// namespace, or `None` if the slot is unassigned or was never issued.
    pub fn find(&self, handle: PidNsHandle, vpid: VirtualPid) -> Option<T> {
        if vpid.is_none() || vpid.0 as usize >= MAX_VIRTUAL_PID_PER_NS {
            return None;
        }
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            inner
                .namespaces
                .get(handle.index(), handle.generation())
                .and_then(|ns| ns.tasks[vpid.0 as usize])
        })
    }

    /// Snapshot of every live PID namespace handle, for introspection
    /// tooling. Bounded by `MAX_PID_NAMESPACES`.
    pub fn namespaces(&self) -> impl Iterator<Item = PidNsHandle> {
        let mut buf = [None; MAX_PID_NAMESPACES];
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            for (slot, (index, generation, _)) in
                inner.namespaces.iter_with_generation().enumerate()
            {
                buf[slot] = Some(PidNsHandle::new(index, generation));
            }
        });
        buf.into_iter().flatten()
    }

    /// Creates a task through `factory` and enrolls it in `handle`'s
    /// namespace in one step, for hosts that don't want a task to exist
    /// PID-less even momentarily. If enrollment fails the freshly created
    /// task is deleted again through `factory`; this rollback is
    /// best-effort and assumes `delete_task` cannot itself fail.
    pub fn create_in_namespace<B: PidBindings<Task = T>, F: TaskFactory<Task = T>>(
        &self,
        handle: PidNsHandle,
        bindings: &mut B,
        factory: &mut F,
    ) -> Result<T, Error> {
        let task = factory.create_task()?;
        match self.add_task(handle, task, bindings) {
            Ok(()) => Ok(task),
            Err(e) => {
                factory.delete_task(task);
                Err(e)
            }
        }
    }
}

impl<T: Copy + Eq> Default for PidNsRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
