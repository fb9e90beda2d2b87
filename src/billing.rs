//! Billing gate consulted before every agent iteration.
//!
//! The actual quota/subscription logic lives in an external service; the
//! driver only needs a can-run decision and a human-readable reason.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of a billing check for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingStatus {
    pub can_run: bool,
    pub message: String,
    /// Opaque subscription details, forwarded to clients unmodified.
    pub subscription: Option<Value>,
}

impl BillingStatus {
    pub fn allowed(message: impl Into<String>) -> Self {
        Self {
            can_run: true,
            message: message.into(),
            subscription: None,
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            can_run: false,
            message: message.into(),
            subscription: None,
        }
    }
}

/// Decides whether an account may run agent iterations right now.
#[async_trait]
pub trait BillingGate: Send + Sync {
    async fn check(&self, account_id: &str) -> BillingStatus;
}

/// Gate that always allows (local development, self-hosted deployments).
pub struct AlwaysAllow;

#[async_trait]
impl BillingGate for AlwaysAllow {
    async fn check(&self, _account_id: &str) -> BillingStatus {
        BillingStatus::allowed("billing checks disabled")
    }
}
