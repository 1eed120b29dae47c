// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time capacity constants (§6).
//!
//! Every table the core owns is statically sized; there is no dynamic
//! growth. A deployment that needs different capacities forks these
//! constants, the same way a Hubris application forks `REGIONS_PER_TASK`
//! by rebuilding against a different `abi`.

/// Slot count of the cgroup table.
pub const MAX_CGROUPS: usize = 32;

/// Membership-map size backing cgroup task accounting.
pub const MAX_CGROUP_TASK_SLOTS: usize = MAX_CGROUPS * 8;

/// Default window length, in ticks, for a freshly created cgroup.
pub const CGROUP_WINDOW_DURATION_TICKS: crate::Tick = 1000;

/// Upper bound on `penalty_ticks_left`, expressed as a multiple of the
/// cgroup's window duration. See Open Question 1 in `SPEC_FULL.md`.
pub const MAX_PENALTY_WINDOWS: u64 = 4;

/// Slot count of the PID namespace table.
pub const MAX_PID_NAMESPACES: usize = 16;

/// Highest virtual PID assignable within one namespace.
pub const MAX_VIRTUAL_PID_PER_NS: usize = 256;

/// Slot count of the IPC namespace table.
pub const MAX_IPC_NAMESPACES: usize = 16;

/// Per-namespace cap enforced by `IpcNsRegistry::register`.
pub const MAX_IPC_OBJECTS_PER_NS: usize = 32;

/// Size of the single object-entry pool shared across all IPC
/// namespaces, per §4.3.
pub const MAX_IPC_OBJECT_POOL: usize = MAX_IPC_NAMESPACES * MAX_IPC_OBJECTS_PER_NS;

/// Upper bound on stored cgroup names, in bytes.
pub const MAX_NAME_LEN_CGROUP: usize = 16;

/// Upper bound on stored namespace/object debug names, in bytes.
pub const MAX_NAME_LEN_NS: usize = 16;
