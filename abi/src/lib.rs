// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared types between the container isolation core and whatever host
//! scheduler embeds it.
//!
//! Nothing in this crate owns memory beyond small fixed-size buffers: it
//! exists purely to give the core and its integrator a common vocabulary of
//! handles, sentinels, and error codes.

#![cfg_attr(not(test), no_std)]

use core::fmt;

pub mod config;

/// Unit of scheduler time. Both window duration and CPU quota are counted
/// in ticks.
pub type Tick = u64;

/// A task's identifier within a PID namespace. `0` means "no PID"; `1` is
/// the first assignable value.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
#[repr(transparent)]
pub struct VirtualPid(pub u32);

impl VirtualPid {
    /// Reserved value meaning "this task has not been assigned a PID".
    pub const NONE: Self = Self(0);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for VirtualPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A namespace-local IPC object id. `0` is the sentinel for "registration
/// failed" (§4.3); nonzero values are assigned monotonically.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct ObjectId(pub u32);

impl ObjectId {
    pub const NONE: Self = Self(0);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// CPU quota expressed in ticks permitted per accounting window.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct CpuQuota(pub u32);

impl CpuQuota {
    /// Sentinel disabling throttling entirely.
    pub const UNLIMITED: Self = Self(u32::MAX);

    pub fn is_unlimited(self) -> bool {
        self == Self::UNLIMITED
    }
}

/// Memory accounting value, in bytes.
pub type Bytes = u64;

/// Sentinel distinguishing "no limit" from a limit of zero bytes.
pub const MEM_UNLIMITED: Bytes = u64::MAX;

/// Tags the kind of native IPC object an [`IpcObjectKind`] entry wraps.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IpcObjectKind {
    Queue,
    Semaphore,
    Mutex,
    EventGroup,
}

/// The three error kinds the core ever surfaces (§7). Every public
/// operation either succeeds or returns one of these; there is no
/// subsystem-specific error type layered on top.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// No free slot in a fixed table. Never retried automatically.
    Capacity,
    /// Null/stale handle, wrong kind, or duplicate membership.
    InvalidArgument,
    /// Delete of a non-empty container, delete of root, or a failed
    /// access check.
    NotPermitted,
}

pub type Result<T> = core::result::Result<T, Error>;

/// A short, fixed-capacity, UTF-8 name. Used for cgroup and namespace
/// identities, which the spec bounds to `MAX_NAME_LEN_*` bytes so that no
/// allocator is required.
#[derive(Copy, Clone)]
pub struct Name<const N: usize> {
    bytes: [u8; N],
    len: u8,
}

impl<const N: usize> Name<N> {
    /// Builds a `Name` by copying as many bytes of `s` as fit, silently
    /// truncating at a UTF-8 boundary. Truncation only matters for
    /// debugging output; it never changes whether two names collide
    /// unless a caller already triggered truncation, which is a
    /// configuration choice we leave to callers of `create`.
    pub fn new(s: &str) -> Self {
        let mut bytes = [0u8; N];
        let mut len = s.len().min(N);
        while len > 0 && !s.is_char_boundary(len) {
            len -= 1;
        }
        bytes[..len].copy_from_slice(&s.as_bytes()[..len]);
        Name {
            bytes,
            len: len as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        // Safety/invariant: `bytes[..len]` was built from a valid `&str`
        // sliced at a char boundary in `new`.
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl<const N: usize> Default for Name<N> {
    fn default() -> Self {
        Name {
            bytes: [0u8; N],
            len: 0,
        }
    }
}

impl<const N: usize> fmt::Debug for Name<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const N: usize> PartialEq for Name<N> {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}
impl<const N: usize> Eq for Name<N> {}

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq)]
        pub struct $name {
            index: u16,
            generation: u16,
        }

        impl $name {
            /// Constructs a handle naming `index` at `generation`. Exposed
            /// so the core crate that owns the backing arena can mint
            /// handles for slots it just inserted; callers outside that
            /// arena have no legitimate way to know a slot's generation.
            pub fn new(index: usize, generation: u16) -> Self {
                $name {
                    index: index as u16,
                    generation,
                }
            }

            /// Slot-array index this handle names. Stable for the life of
            /// the slot, meaningless once the slot has been deleted and
            /// possibly reused (use the handle's `Eq` impl, which compares
            /// generation too, to detect that).
            pub fn index(&self) -> usize {
                self.index as usize
            }

            /// Generation of the slot this handle names, as of when the
            /// handle was issued. Registries use this to reject a handle
            /// whose slot has since been deleted and possibly reused.
            pub fn generation(&self) -> u16 {
                self.generation
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(
                    f,
                    concat!(stringify!($name), "({}, gen {})"),
                    self.index, self.generation
                )
            }
        }
    };
}

define_handle!(
    /// A stable reference to a cgroup slot. Invalidated when the cgroup is
    /// deleted.
    CgroupHandle
);
define_handle!(
    /// A stable reference to a PID namespace slot. [`PidNsHandle::ROOT`]
    /// names the distinguished root namespace.
    PidNsHandle
);

impl PidNsHandle {
    /// The root PID namespace is always slot 0, created once at registry
    /// construction and never deleted.
    pub const ROOT: Self = PidNsHandle {
        index: 0,
        generation: 0,
    };
}
define_handle!(
    /// A stable reference to an IPC namespace slot. [`IpcNsHandle::ROOT`]
    /// names the distinguished root namespace.
    IpcNsHandle
);

impl IpcNsHandle {
    /// The root IPC namespace is always slot 0, created once at registry
    /// construction and never deleted.
    pub const ROOT: Self = IpcNsHandle {
        index: 0,
        generation: 0,
    };
}
