//! Per-collaborator call timeouts.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Upper bounds for each network-bound collaborator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// KMS wrap and unwrap
    #[serde(with = "millis")]
    pub kms: Duration,
    /// Key vault reads and writes
    #[serde(with = "millis")]
    pub key_vault: Duration,
    /// Document database calls
    #[serde(with = "millis")]
    pub database: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            kms: Duration::from_secs(10),
            key_vault: Duration::from_secs(5),
            database: Duration::from_secs(5),
        }
    }
}

impl Timeouts {
    /// Uses the same bound for every collaborator.
    #[must_use]
    pub const fn uniform(limit: Duration) -> Self {
        Self { kms: limit, key_vault: limit, database: limit }
    }
}

/// Runs `fut`, failing with the retryable [`Error::Timeout`] once `limit`
/// elapses. The inner output is returned untouched so callers map their own
/// collaborator errors.
pub(crate) async fn with_timeout<F: Future>(
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> Result<F::Output, Error> {
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        tracing::warn!(operation, timeout_ms = limit.as_millis(), "collaborator call timed out");
        Error::Timeout { operation, timeout: limit }
    })
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
