// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Namespace-gated access control over host IPC objects (§4.3).
//!
//! IPC objects are opaque handles owned by the host scheduler; the core
//! cannot extend them with a namespace field, so membership lives in a
//! side table — one shared pool of entries, each carrying the namespace it
//! was registered into. `check_access` scans that pool; it is `O(pool
//! size)`, not `O(membership)`, and the pool is expected to stay small
//! (tens of entries).

use core::cell::RefCell;

use abi::config::{
    MAX_IPC_NAMESPACES, MAX_IPC_OBJECTS_PER_NS, MAX_IPC_OBJECT_POOL, MAX_NAME_LEN_NS,
};
use abi::{Error, IpcNsHandle, IpcObjectKind, Name, ObjectId};
use critical_section::Mutex;

use crate::slots::Slots;

ringbuf::ringbuf!(TRACE, Trace, 16, Trace::None);

#[derive(Copy, Clone, Eq, PartialEq)]
enum Trace {
    None,
    Registered(u32),
    Denied(u32),
}

/// Host binding for a task's current IPC namespace.
pub trait IpcBindings {
    type Task: Copy + Eq;

    fn get_ipc_namespace(&self, task: Self::Task) -> Option<IpcNsHandle>;
    fn set_ipc_namespace(&mut self, task: Self::Task, ns: Option<IpcNsHandle>);
}

/// Host hook for the isolated constructors: create a native IPC primitive
/// of the requested kind, or tear one down again on registration failure.
pub trait IpcObjectFactory {
    type Object: Copy + Eq;

    fn create_object(&mut self, kind: IpcObjectKind) -> Result<Self::Object, Error>;
    fn delete_object(&mut self, object: Self::Object);
}

struct Namespace {
    #[allow(dead_code)]
    name: Name<MAX_NAME_LEN_NS>,
    object_count: u32,
}

struct ObjectEntry<O> {
    id: ObjectId,
    object: O,
    ns: IpcNsHandle,
    #[allow(dead_code)]
    kind: IpcObjectKind,
    #[allow(dead_code)]
    name: Name<MAX_NAME_LEN_NS>,
}

struct Inner<O> {
    namespaces: Slots<Namespace, MAX_IPC_NAMESPACES>,
    objects: Slots<ObjectEntry<O>, MAX_IPC_OBJECT_POOL>,
    next_object_id: u32,
}

/// A fixed-capacity table of IPC namespaces plus the shared object-entry
/// pool that backs `check_access`.
pub struct IpcNsRegistry<O> {
    inner: Mutex<RefCell<Inner<O>>>,
}

impl<O: Copy + Eq> IpcNsRegistry<O> {
    pub fn new() -> Self {
        let mut namespaces = Slots::new();
        namespaces
            .insert(Namespace {
                name: Name::new("root"),
                object_count: 0,
            })
            .expect("fresh registry has room for the root namespace");
        IpcNsRegistry {
            inner: Mutex::new(RefCell::new(Inner {
                namespaces,
                objects: Slots::new(),
                next_object_id: 1,
            })),
        }
    }

    pub fn create(&self, name: &str) -> Result<IpcNsHandle, Error> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let (index, generation) = inner.namespaces.insert(Namespace {
                name: Name::new(name),
                object_count: 0,
            })?;
            Ok(IpcNsHandle::new(index, generation))
        })
    }

    pub fn delete(&self, handle: IpcNsHandle) -> Result<(), Error> {
        if handle == IpcNsHandle::ROOT {
            return Err(Error::NotPermitted);
        }
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let ns = inner
                .namespaces
                .get(handle.index(), handle.generation())
                .ok_or(Error::InvalidArgument)?;
            if ns.object_count != 0 {
                return Err(Error::NotPermitted);
            }
            inner.namespaces.remove(handle.index());
            Ok(())
        })
    }

    /// Reserves an entry for `object` in `ns`'s pool. Returns
    /// `ObjectId::NONE` (rather than an `Err`) on capacity exhaustion or if
    /// `object` is already registered anywhere, per §4.3 — registration
    /// failure is reported through the sentinel, not the error enum.
    pub fn register(
        &self,
        ns: IpcNsHandle,
        object: O,
        kind: IpcObjectKind,
        name: &str,
    ) -> ObjectId {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);

            if inner.objects.iter().any(|(_, e)| e.object == object) {
                return ObjectId::NONE;
            }
            let Some(namespace) = inner.namespaces.get(ns.index(), ns.generation()) else {
                return ObjectId::NONE;
            };
            if namespace.object_count as usize >= MAX_IPC_OBJECTS_PER_NS {
                return ObjectId::NONE;
            }

            let id = ObjectId(inner.next_object_id);
            if inner
                .objects
                .insert(ObjectEntry {
                    id,
                    object,
                    ns,
                    kind,
                    name: Name::new(name),
                })
                .is_err()
            {
                return ObjectId::NONE;
            }
            inner.next_object_id += 1;
            if let Some(namespace) = inner.namespaces.get_mut(ns.index(), ns.generation()) {
                namespace.object_count += 1;
            }
            ringbuf::ringbuf_entry!(TRACE, Trace::Registered(id.0));
            id
        })
    }

    /// Removes `object`'s entry, wherever it is registered.
    pub fn unregister(&self, object: O) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let found = inner
                .objects
                .iter()
                .find(|(_, e)| e.object == object)
                .map(|(i, e)| (i, e.ns));
            let (index, ns) = found.ok_or(Error::InvalidArgument)?;
            inner.objects.remove(index);
            if let Some(namespace) = inner.namespaces.get_mut(ns.index(), ns.generation()) {
                namespace.object_count = namespace.object_count.saturating_sub(1);
            }
            Ok(())
        })
    }

    pub fn find(&self, object_id: ObjectId) -> Option<O> {
        if object_id.is_none() {
            return None;
        }
        // The entry pool is indexed by slot, not by id, and ids are never
        // reused; scanning the pool is the only way back from id to object
        // without a second side table, and the pool is small by design
        // (§4.3).
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            inner
                .objects
                .iter()
                .find_map(|(_, e)| (e.id == object_id).then_some(e.object))
        })
    }

    /// §4.3's central authorisation predicate: (i) find the unique entry
    /// for `object`; (ii) none registered ⇒ allow; (iii) task's namespace
    /// equals the entry's ⇒ allow; (iv) task's namespace is root ⇒ allow;
    /// (v) otherwise deny. A task with no namespace binding at all falls
    /// into root, same as everywhere else in this module.
    pub fn check_access<B: IpcBindings<Task = O>>(
        &self,
        task: B::Task,
        object: O,
        bindings: &B,
    ) -> bool {
        let task_ns = bindings.get_ipc_namespace(task).unwrap_or(IpcNsHandle::ROOT);
        let allowed = critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            match inner.objects.iter().find(|(_, e)| e.object == object) {
                None => true,
                Some((_, e)) => task_ns == e.ns || task_ns == IpcNsHandle::ROOT,
            }
        });
        if !allowed {
            ringbuf::ringbuf_entry!(TRACE, Trace::Denied(0));
        }
        allowed
    }

    pub fn set_task_ns<B: IpcBindings<Task = O>>(
        &self,
        task: B::Task,
        ns: Option<IpcNsHandle>,
        bindings: &mut B,
    ) {
        bindings.set_ipc_namespace(task, ns);
    }

    pub fn get_task_ns<B: IpcBindings<Task = O>>(&self, task: B::Task, bindings: &B) -> Option<IpcNsHandle> {
        bindings.get_ipc_namespace(task)
    }

    /// Snapshot of every live IPC namespace handle, for introspection
    /// tooling. Bounded by `MAX_IPC_NAMESPACES`.
    pub fn namespaces(&self) -> impl Iterator<Item = IpcNsHandle> {
        let mut buf = [None; MAX_IPC_NAMESPACES];
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            for (slot, (index, generation, _)) in
                inner.namespaces.iter_with_generation().enumerate()
            {
                buf[slot] = Some(IpcNsHandle::new(index, generation));
            }
        });
        buf.into_iter().flatten()
    }

    /// Isolated constructor: ask `factory` to create a native object of
    /// `kind`, then register it in `ns` (root if the caller supplies none).
    /// Rolls the creation back if registration fails.
    pub fn create_isolated<F: IpcObjectFactory<Object = O>>(
        &self,
        ns: Option<IpcNsHandle>,
        kind: IpcObjectKind,
        name: &str,
        factory: &mut F,
    ) -> Result<O, Error> {
        let ns = ns.unwrap_or(IpcNsHandle::ROOT);
        let object = factory.create_object(kind)?;
        let id = self.register(ns, object, kind, name);
        if id.is_none() {
            factory.delete_object(object);
            return Err(Error::Capacity);
        }
        Ok(object)
    }
}

impl<O: Copy + Eq> Default for IpcNsRegistry<O> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeHost {
        ns: std::collections::HashMap<u32, IpcNsHandle>,
    }

    impl IpcBindings for FakeHost {
        type Task = u32;

        fn get_ipc_namespace(&self, task: u32) -> Option<IpcNsHandle> {
            self.ns.get(&task).copied()
        }
        fn set_ipc_namespace(&mut self, task: u32, ns: Option<IpcNsHandle>) {
            match ns {
                Some(ns) => {
                    self.ns.insert(task, ns);
                }
                None => {
                    self.ns.remove(&task);
                }
            }
        }
    }

    #[test]
    fn s5_cross_namespace_access_is_denied() {
        let reg: IpcNsRegistry<u32> = IpcNsRegistry::new();
        let mut host = FakeHost::default();
        let ns_a = reg.create("a").unwrap();
        let ns_b = reg.create("b").unwrap();
        let queue = 100u32;
        let id = reg.register(ns_a, queue, IpcObjectKind::Queue, "q");
        assert!(!id.is_none());

        host.set_ipc_namespace(1, Some(ns_b));
        assert!(!reg.check_access::<FakeHost>(1, queue, &host));

        host.set_ipc_namespace(2, Some(ns_a));
        assert!(reg.check_access::<FakeHost>(2, queue, &host));
    }

    #[test]
    fn task_with_no_namespace_binding_is_treated_as_root() {
        let reg: IpcNsRegistry<u32> = IpcNsRegistry::new();
        let host = FakeHost::default();
        let ns_a = reg.create("a").unwrap();
        let queue = 55u32;
        reg.register(ns_a, queue, IpcObjectKind::Queue, "q");

        // Task 9 never had set_ipc_namespace called on it at all, so
        // get_ipc_namespace returns None rather than Some(ROOT).
        assert_eq!(host.get_ipc_namespace(9), None);
        assert!(reg.check_access::<FakeHost>(9, queue, &host));
    }

    #[test]
    fn namespaces_includes_root_and_created_namespaces() {
        let reg: IpcNsRegistry<u32> = IpcNsRegistry::new();
        let a = reg.create("a").unwrap();
        let listed: Vec<_> = reg.namespaces().collect();
        assert!(listed.contains(&IpcNsHandle::ROOT));
        assert!(listed.contains(&a));
    }

    #[test]
    fn root_namespace_always_has_access() {
        let reg: IpcNsRegistry<u32> = IpcNsRegistry::new();
        let mut host = FakeHost::default();
        let ns_a = reg.create("a").unwrap();
        let queue = 7u32;
        reg.register(ns_a, queue, IpcObjectKind::Queue, "q");
        host.set_ipc_namespace(1, Some(IpcNsHandle::ROOT));
        assert!(reg.check_access::<FakeHost>(1, queue, &host));
    }

    #[test]
    fn unregistered_object_is_public() {
        let reg: IpcNsRegistry<u32> = IpcNsRegistry::new();
        let mut host = FakeHost::default();
        host.set_ipc_namespace(1, Some(IpcNsHandle::ROOT));
        assert!(reg.check_access::<FakeHost>(1, 42u32, &host));
    }

    #[test]
    fn property9_registration_past_capacity_returns_zero_sentinel() {
        let reg: IpcNsRegistry<u32> = IpcNsRegistry::new();
        let ns = reg.create("a").unwrap();
        for i in 0..MAX_IPC_OBJECTS_PER_NS {
            let id = reg.register(ns, i as u32, IpcObjectKind::Queue, "q");
            assert!(!id.is_none());
        }
        let overflow = reg.register(ns, 9999, IpcObjectKind::Queue, "q");
        assert!(overflow.is_none());
    }

    #[test]
    fn duplicate_registration_of_the_same_object_is_refused() {
        let reg: IpcNsRegistry<u32> = IpcNsRegistry::new();
        let ns = reg.create("a").unwrap();
        let id1 = reg.register(ns, 5u32, IpcObjectKind::Queue, "q");
        assert!(!id1.is_none());
        let id2 = reg.register(ns, 5u32, IpcObjectKind::Queue, "q2");
        assert!(id2.is_none());
    }

    #[test]
    fn unregister_then_find_returns_none() {
        let reg: IpcNsRegistry<u32> = IpcNsRegistry::new();
        let ns = reg.create("a").unwrap();
        let id = reg.register(ns, 3u32, IpcObjectKind::Queue, "q");
        assert_eq!(reg.find(id), Some(3u32));
        reg.unregister(3u32).unwrap();
        assert_eq!(reg.find(id), None);
    }

    #[test]
    fn delete_requires_no_registered_objects() {
        let reg: IpcNsRegistry<u32> = IpcNsRegistry::new();
        let ns = reg.create("a").unwrap();
        reg.register(ns, 1u32, IpcObjectKind::Queue, "q");
        assert_eq!(reg.delete(ns), Err(Error::NotPermitted));
        reg.unregister(1u32).unwrap();
        assert!(reg.delete(ns).is_ok());
    }

    struct FakeFactory;

    impl IpcObjectFactory for FakeFactory {
        type Object = u32;

        fn create_object(&mut self, _kind: IpcObjectKind) -> Result<u32, Error> {
            Ok(123)
        }
        fn delete_object(&mut self, _object: u32) {}
    }

    #[test]
    fn create_isolated_registers_into_the_given_namespace() {
        let reg: IpcNsRegistry<u32> = IpcNsRegistry::new();
        let ns = reg.create("a").unwrap();
        let mut factory = FakeFactory;
        let object = reg
            .create_isolated(Some(ns), IpcObjectKind::Mutex, "m", &mut factory)
            .unwrap();
        assert_eq!(object, 123);
        assert_eq!(reg.find(ObjectId(1)), Some(123));
    }
}
