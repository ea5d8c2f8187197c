//! Gate in front of the request signer
//!
//! Signing itself happens elsewhere. This module only decides whether a
//! signed request may be built right now and with which timestamp.

use crate::config::ApiCredentials;
use thiserror::Error;
use timesync::{ClockError, ClockSyncService};
use tracing::{debug, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GateError {
    #[error("No API credentials configured")]
    MissingCredentials,

    #[error("Clock error: {0}")]
    Clock(#[from] ClockError),
}

/// Inputs for signing one request
#[derive(Debug, Clone)]
pub struct SigningContext {
    pub credentials: ApiCredentials,
    /// Corrected Unix timestamp in milliseconds
    pub timestamp: i64,
}

pub struct SignedRequestGate {
    credentials: Option<ApiCredentials>,
    clock: ClockSyncService,
}

impl SignedRequestGate {
    pub fn new(credentials: Option<ApiCredentials>, clock: ClockSyncService) -> Self {
        Self { credentials, clock }
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn clock(&self) -> &ClockSyncService {
        &self.clock
    }

    /// Credentials plus a fresh timestamp.
    ///
    /// Fails before any I/O when no credentials are configured.
    pub async fn prepare(&self) -> Result<SigningContext, GateError> {
        let credentials = self.credentials.as_ref().ok_or(GateError::MissingCredentials)?;
        let timestamp = self.clock.signing_timestamp().await?;
        Ok(SigningContext {
            credentials: credentials.clone(),
            timestamp,
        })
    }

    /// Feed back a server error code; returns whether a clock correction started
    pub fn observe_error_code(&self, code: i64) -> bool {
        let correcting = self.clock.handle_error_code(code);
        if correcting {
            warn!("Server rejected request timestamp (code {}), resyncing clock", code);
        } else {
            debug!("Error code {} does not concern the clock", code);
        }
        correcting
    }
}
