// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application layer: the credential broker, the cloud client facade, the
//! binder, and the controllers that reconcile claims, attachments and mounts.

pub mod attach_controller;
pub mod binder;
pub mod block_storage;
pub mod claim_controller;
pub mod claims;
pub mod controller;
pub mod credential_broker;
pub mod mount_agent;
pub mod work_queue;

#[cfg(test)]
pub(crate) mod test_support;
