// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small-footprint container isolation core for a cooperative real-time
//! scheduler: per-cgroup CPU/memory accounting, virtual PID translation,
//! and namespace-gated IPC access control, behind the four hooks a host
//! scheduler calls into (`on_tick`, `can_dispatch`, `on_switch_out`,
//! `on_task_delete`).
//!
//! Every table here is statically sized (see `abi::config`); there is no
//! allocator and no dynamic growth. The host owns task and IPC-object
//! representations and supplies accessors to them through the binding
//! traits in [`cgroup`], [`pidns`] and [`ipcns`]; this crate never stores a
//! task or object value it wasn't handed by the host.

#![cfg_attr(not(test), no_std)]

pub mod cgroup;
pub mod hooks;
pub mod ipcns;
pub mod pidns;
mod slots;

pub use cgroup::{CgroupBindings, CgroupEngine, Stats as CgroupStats};
pub use hooks::KernelHooks;
pub use ipcns::{IpcBindings, IpcNsRegistry, IpcObjectFactory};
pub use pidns::{PidBindings, PidNsRegistry, TaskFactory};
