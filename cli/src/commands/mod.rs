// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the provisioner CLI

pub mod config;
pub mod credentials;
pub mod run;

pub use self::config::ConfigCommand;
pub use self::credentials::CredentialsCommand;
pub use self::run::RunCommand;
