// Ordered store writer
// A single task applies persisted writes in submission order

use tokio::sync::{mpsc, oneshot};

use super::{set_best_effort, SharedStore};

/// Keys and values written back to back as one unit
pub type WriteBatch = Vec<(&'static str, String)>;

struct WriteRequest {
    entries: WriteBatch,
    done: oneshot::Sender<bool>,
}

/// Completion of a persisted write
///
/// Await [`PersistCompletion::wait`] to know whether the value reached the
/// store; drop it to fire and forget.
pub struct PersistCompletion {
    rx: Option<oneshot::Receiver<bool>>,
}

impl PersistCompletion {
    /// Completion for a write that was never submitted
    pub fn skipped() -> Self {
        Self { rx: None }
    }

    /// `true` once every entry was written to the store
    pub async fn wait(self) -> bool {
        match self.rx {
            Some(rx) => rx.await.unwrap_or(false),
            None => false,
        }
    }
}

/// Handle on the store's writer task
///
/// Batches land in the order [`StoreWriter::submit`] was called, so the
/// store never ends up holding an older value than the last one submitted.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<WriteRequest>,
}

impl StoreWriter {
    /// Start the writer task; it exits once every handle is dropped
    pub fn spawn(store: SharedStore) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteRequest>();

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let mut written = true;
                for (key, value) in &request.entries {
                    written &= set_best_effort(store.as_ref(), key, value).await;
                }
                let _ = request.done.send(written);
            }
            tracing::debug!("Store writer stopped");
        });

        Self { tx }
    }

    /// Queue a batch behind every batch submitted before it
    pub fn submit(&self, entries: WriteBatch) -> PersistCompletion {
        let (done, rx) = oneshot::channel();
        if self.tx.send(WriteRequest { entries, done }).is_err() {
            tracing::warn!("Store writer is gone; write dropped");
            return PersistCompletion::skipped();
        }
        PersistCompletion { rx: Some(rx) }
    }
}
