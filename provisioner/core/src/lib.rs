// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! AEGIS Block-Storage Provisioner
//!
//! Turns volume claims into attached, mounted block devices while every cloud
//! call authenticates through a short-lived federated credential.
//!
//! # Architecture
//!
//! - **domain:** aggregates (claims, volumes, attachments), anti-corruption
//!   traits for the cloud API, the identity provider and the node mount surface
//! - **application:** credential broker, binder, and the claim, attach/detach
//!   and node mount controllers
//! - **infrastructure:** event bus, in-memory resource store, HTTP and
//!   simulated cloud backends, federation clients, mounters

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
