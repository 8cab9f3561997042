//! Test doubles shared by the unit tests.

use crate::error::KmsError;
use crate::kms::{KmsClient, KmsProviderKind, MasterKeyRef};
use secrecy::{ExposeSecret, SecretVec};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const MARKER: &[u8] = b"mock-wrapped:";

/// Local-provider KMS that "wraps" by tagging and reversing the key bytes.
#[derive(Debug, Default)]
pub struct MockKms {
    wraps: AtomicUsize,
    unwraps: AtomicUsize,
    /// 1-based number of the wrap call to fail, 0 for none
    fail_wrap: AtomicUsize,
    delay: Option<Duration>,
}

impl MockKms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_next_wrap(&self) {
        self.fail_wrap_number(self.wrap_calls() + 1);
    }

    pub fn fail_wrap_number(&self, call: usize) {
        self.fail_wrap.store(call, Ordering::SeqCst);
    }

    pub fn wrap_calls(&self) -> usize {
        self.wraps.load(Ordering::SeqCst)
    }

    pub fn unwrap_calls(&self) -> usize {
        self.unwraps.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait::async_trait]
impl KmsClient for MockKms {
    fn provider(&self) -> KmsProviderKind {
        KmsProviderKind::Local
    }

    async fn wrap(&self, _: &MasterKeyRef, dek: &SecretVec<u8>) -> Result<Vec<u8>, KmsError> {
        self.pause().await;
        let call = self.wraps.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_wrap.compare_exchange(call, 0, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            return Err(KmsError::WrapFailed("injected failure".into()));
        }
        let mut wrapped = MARKER.to_vec();
        wrapped.extend(dek.expose_secret().iter().rev());
        Ok(wrapped)
    }

    async fn unwrap(&self, _: &MasterKeyRef, wrapped: &[u8]) -> Result<SecretVec<u8>, KmsError> {
        self.pause().await;
        self.unwraps.fetch_add(1, Ordering::SeqCst);
        let body = wrapped
            .strip_prefix(MARKER)
            .ok_or_else(|| KmsError::UnwrapFailed("not wrapped by this KMS".into()))?;
        Ok(SecretVec::new(body.iter().rev().copied().collect()))
    }
}
