// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Federation adapters: identity token sources and token exchangers

pub mod local;
pub mod sources;
pub mod sts;

use std::sync::Arc;
use std::time::Duration;

use crate::domain::config::IdentityTokenConfig;
use crate::domain::credential::{CredentialError, IdentityTokenSource};

pub use local::LocalTokenExchanger;
pub use sources::{FileTokenSource, HttpTokenSource, StaticTokenSource};
pub use sts::{DiscoveryDocument, StsTokenExchanger};

/// Build the identity token source selected by configuration
pub fn build_token_source(
    config: &IdentityTokenConfig,
    request_timeout: Duration,
) -> Result<Arc<dyn IdentityTokenSource>, CredentialError> {
    match config {
        IdentityTokenConfig::File { path } => Ok(Arc::new(FileTokenSource::new(path.clone()))),
        IdentityTokenConfig::Http { url, headers } => Ok(Arc::new(HttpTokenSource::new(
            url.clone(),
            headers.clone(),
            request_timeout,
        )?)),
    }
}
