// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain layer: aggregates, value objects, and the anti-corruption traits
//! the controllers depend on.

pub mod attachment;
pub mod claim;
pub mod cloud;
pub mod config;
pub mod credential;
pub mod error;
pub mod events;
pub mod mount;
pub mod node;
pub mod repository;
pub mod storage_class;
pub mod volume;
