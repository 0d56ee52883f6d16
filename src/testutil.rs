// Test doubles shared by unit tests

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::RelayError;
use crate::token::CredentialSource;

/// Credential source returning a settable value and counting calls
#[derive(Clone, Default)]
pub struct StaticCredentialSource {
    value: Arc<Mutex<Option<String>>>,
    failing: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl StaticCredentialSource {
    pub fn new(value: &str) -> Self {
        let source = Self::default();
        source.set_value(value);
        source
    }

    /// A source that always fails
    pub fn failing() -> Self {
        let source = Self::default();
        source.set_failing(true);
        source
    }

    pub fn set_value(&self, value: &str) {
        *self.value.lock().unwrap() = Some(value.to_string());
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn current(&self) -> Result<String, RelayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RelayError::Acquisition("credential not present".to_string()));
        }
        self.value
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| RelayError::Acquisition("credential not present".to_string()))
    }
}

/// Wait until `check` holds, polling briefly
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    check()
}
