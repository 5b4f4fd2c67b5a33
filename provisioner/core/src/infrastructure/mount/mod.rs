// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Node mount surface implementations

#[cfg(target_os = "linux")]
pub mod linux;
pub mod memory;

#[cfg(target_os = "linux")]
pub use linux::SystemMounter;
pub use memory::{InMemoryMounter, MountRecord};
