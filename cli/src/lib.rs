// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! AEGIS provisioner CLI library - exposes testable components
//!
//! # Architecture
//!
//! - **Layer:** Interface / Presentation Layer
//! - **Purpose:** Manifest loading, control plane wiring and subcommands

pub mod commands;
pub mod manifests;
pub mod runtime;
