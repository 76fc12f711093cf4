//! Payment gate.
//!
//! Admission control for monetized orchestrator operations. Signature
//! verification is a black-box collaborator returning valid/invalid; the
//! gate enforces the `[valid_after, valid_before)` window and nonce
//! anti-replay on top of it. The nonce store is entry-atomic, so
//! concurrent requests with the same nonce admit exactly one.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::types::{PaymentAuthorization, SweepError};

/// Black-box signature verifier.
pub trait PaymentVerifier: Send + Sync {
    fn verify(&self, auth: &PaymentAuthorization) -> bool;
}

/// Verifier for deployments without a payment requirement, and for tests.
pub struct AllowAllVerifier;

impl PaymentVerifier for AllowAllVerifier {
    fn verify(&self, _auth: &PaymentAuthorization) -> bool {
        true
    }
}

/// Admission gate consulted before any money-moving transition.
pub struct PaymentGate {
    verifier: Arc<dyn PaymentVerifier>,
    /// nonce key -> valid_before, kept for pruning. Replay after expiry is
    /// already rejected by the window check, so pruning is safe.
    nonces: DashMap<String, i64>,
    enabled: bool,
}

impl PaymentGate {
    pub fn new(verifier: Arc<dyn PaymentVerifier>, enabled: bool) -> Self {
        Self {
            verifier,
            nonces: DashMap::new(),
            enabled,
        }
    }

    /// Validate an authorization and claim its nonce.
    ///
    /// Checks run window -> signature -> nonce, so a rejected attempt
    /// never burns an unused nonce.
    pub fn admit(
        &self,
        auth: &PaymentAuthorization,
        now: DateTime<Utc>,
    ) -> Result<(), SweepError> {
        if !self.enabled {
            return Ok(());
        }

        let ts = now.timestamp();
        if ts < auth.valid_after || ts >= auth.valid_before {
            warn!(
                wallet = %auth.wallet,
                valid_after = auth.valid_after,
                valid_before = auth.valid_before,
                now = ts,
                "Authorization outside validity window"
            );
            return Err(SweepError::AuthorizationExpired);
        }

        if !self.verifier.verify(auth) {
            warn!(wallet = %auth.wallet, "Authorization signature rejected");
            return Err(SweepError::AuthorizationInvalid);
        }

        let key = format!("{}:{}", auth.wallet, auth.nonce);
        match self.nonces.entry(key) {
            Entry::Occupied(_) => {
                warn!(wallet = %auth.wallet, nonce = %auth.nonce, "Nonce replay rejected");
                Err(SweepError::NonceAlreadyUsed(auth.nonce.clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(auth.valid_before);
                debug!(wallet = %auth.wallet, nonce = %auth.nonce, "Authorization admitted");
                Ok(())
            }
        }
    }

    /// Drop nonces whose window has closed.
    pub fn prune_expired(&self, now: DateTime<Utc>) {
        let ts = now.timestamp();
        self.nonces.retain(|_, valid_before| *valid_before > ts);
    }

    #[cfg(test)]
    fn nonce_count(&self) -> usize {
        self.nonces.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
