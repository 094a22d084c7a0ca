//! Per-run cancellation signals for runs being driven in this process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared between the executor (which registers in-flight runs) and
/// whoever asks for cancellation.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    signals: Arc<tokio::sync::Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run and return its cancel signal.
    pub async fn register(&self, run_id: &str) -> Arc<AtomicBool> {
        let signal = Arc::new(AtomicBool::new(false));
        self.signals
            .lock()
            .await
            .insert(run_id.to_string(), signal.clone());
        signal
    }

    /// Request cancellation. Returns false if the run is not in flight here.
    pub async fn request_cancel(&self, run_id: &str) -> bool {
        if let Some(signal) = self.signals.lock().await.get(run_id) {
            signal.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub async fn is_registered(&self, run_id: &str) -> bool {
        self.signals.lock().await.contains_key(run_id)
    }

    /// Unregister a run (called when its driver stops).
    pub async fn unregister(&self, run_id: &str) {
        self.signals.lock().await.remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_registered_run() {
        let registry = CancellationRegistry::new();
        let signal = registry.register("run-1").await;

        assert!(!signal.load(Ordering::SeqCst));
        assert!(registry.request_cancel("run-1").await);
        assert!(signal.load(Ordering::SeqCst));

        registry.unregister("run-1").await;
        assert!(!registry.is_registered("run-1").await);
        assert!(!registry.request_cancel("run-1").await);
    }
}
