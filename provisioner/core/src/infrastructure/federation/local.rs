// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-process token exchanger for the simulated cloud
//!
//! Mints opaque access tokens with a fixed lifetime. Used by the dev control
//! plane and tests where no identity provider exists.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::credential::{
    CredentialError, ExchangedToken, IdentityToken, Principal, TokenExchanger,
};

pub struct LocalTokenExchanger {
    lifetime: Duration,
    exchanges: AtomicUsize,
}

impl LocalTokenExchanger {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            exchanges: AtomicUsize::new(0),
        }
    }

    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenExchanger for LocalTokenExchanger {
    async fn exchange(
        &self,
        principal: &Principal,
        _identity_token: &IdentityToken,
    ) -> Result<ExchangedToken, CredentialError> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        Ok(ExchangedToken {
            access_token: format!("local-{}-{}", principal.id, Uuid::new_v4()),
            expires_in: self.lifetime,
        })
    }
}
