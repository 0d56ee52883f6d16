// Orchestrator
// Owns the relay state and wires detection, guarding and delivery together

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::delivery::{Admission, DeliveryReceipt, RelayClient, SendGuard, SkipReason};
use crate::state::SharedState;
use crate::store::SharedStore;
use crate::token::{
    mask, non_empty, Candidate, CandidateOrigin, CandidateSender, ChangeDetector,
    CredentialEvent, CredentialSource, CredentialTarget,
};

/// Extra time a running delivery gets at shutdown beyond its own timeout
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

/// Tunables for the relay pipeline
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub target: CredentialTarget,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub delivery_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            target: CredentialTarget::new("instagram.com", "sessionid"),
            poll_interval: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            delivery_timeout: Duration::from_secs(30),
            queue_capacity: 32,
        }
    }
}

/// Result of a guarded delivery attempt
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered(DeliveryReceipt),
    Skipped(SkipReason),
    /// The attempt failed; the error was logged
    Failed,
}

/// Answer to an acquisition request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TokenResponse {
    fn success(token: String) -> Self {
        Self {
            ok: true,
            token: Some(token),
            error: None,
        }
    }

    fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            token: None,
            error: Some(error.into()),
        }
    }
}

/// Answer to a test-delivery request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryResponse {
    fn success() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Relay pipeline
///
/// Host events and poll ticks are two producers feeding one candidate
/// queue; a single consumer runs guarded deliveries one after another.
/// Forced deliveries run on the caller's task and never see the guard.
pub struct Orchestrator {
    state: Arc<SharedState>,
    source: Arc<dyn CredentialSource>,
    detector: ChangeDetector,
    guard: SendGuard,
    relay: RelayClient,
    candidates: CandidateSender,
    poll_interval: Duration,
    stopping: watch::Sender<bool>,
}

impl Orchestrator {
    /// Build the pipeline; the returned receiver feeds [`Orchestrator::spawn_consumer`]
    pub async fn new(
        store: SharedStore,
        source: Arc<dyn CredentialSource>,
        options: OrchestratorOptions,
    ) -> anyhow::Result<(Arc<Self>, mpsc::Receiver<Candidate>)> {
        let state = SharedState::load(store).await;
        let (candidates, rx) = CandidateSender::channel(options.queue_capacity);

        let relay = RelayClient::new(
            Arc::clone(&state),
            options.connect_timeout,
            options.delivery_timeout,
        )?;
        let guard = SendGuard::new(Arc::clone(&state));
        let detector = ChangeDetector::new(
            Arc::clone(&state),
            Arc::clone(&source),
            options.target,
            candidates.clone(),
        );

        let orchestrator = Arc::new(Self {
            state,
            source,
            detector,
            guard,
            relay,
            candidates,
            poll_interval: options.poll_interval,
            stopping: watch::channel(false).0,
        });

        Ok((orchestrator, rx))
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    /// Whether a guarded delivery is running
    pub fn is_sending(&self) -> bool {
        self.guard.is_sending()
    }

    /// Cached token, falling back to the store and then the live source
    ///
    /// Never fails: any error resolves to `None`. Concurrent cold callers
    /// may each query the source.
    pub async fn ensure_cached(&self) -> Option<String> {
        self.resolve(CandidateOrigin::Acquisition)
            .await
            .map(|(token, _)| token)
    }

    /// Resolve the token; the flag says whether a live acquisition queued a candidate
    async fn resolve(&self, origin: CandidateOrigin) -> Option<(String, bool)> {
        if let Some(entry) = self.state.cache().get().await {
            return Some((entry.token, false));
        }

        match self.source.current().await {
            Ok(token) => {
                let token = non_empty(Some(token))?;
                tracing::info!("Acquired credential from source: {}", mask(&token));
                self.state.cache().set(&token, true);
                let queued = self.candidates.emit(&token, origin);
                Some((token, queued))
            }
            Err(e) => {
                tracing::warn!("Credential acquisition failed: {}", e);
                None
            }
        }
    }

    /// Warm the cache and queue the start-up candidate
    pub async fn warm_up(&self) -> Option<String> {
        match self.resolve(CandidateOrigin::Startup).await {
            Some((token, queued)) => {
                if !queued {
                    self.candidates.emit(&token, CandidateOrigin::Startup);
                }
                Some(token)
            }
            None => {
                tracing::warn!("No credential available at start-up");
                None
            }
        }
    }

    /// Acquisition request from an external caller
    pub async fn request_token(&self) -> TokenResponse {
        match self.ensure_cached().await {
            Some(token) => TokenResponse::success(token),
            None => TokenResponse::failure("No credential available"),
        }
    }

    /// Test-delivery request: force-send the current token now
    pub async fn test_delivery(&self) -> DeliveryResponse {
        let Some(token) = self.ensure_cached().await else {
            return DeliveryResponse::failure("No credential available");
        };

        match self.relay.deliver_forced(&token).await {
            Ok(receipt) => {
                tracing::info!("Test delivery succeeded with status {}", receipt.status);
                DeliveryResponse::success()
            }
            Err(e) => {
                tracing::warn!("Test delivery failed: {}", e);
                DeliveryResponse::failure(e.to_string())
            }
        }
    }

    /// Host change notification
    pub fn handle_event(&self, event: &CredentialEvent) -> bool {
        self.detector.handle_event(event)
    }

    /// Guarded delivery; failures are logged, never returned
    pub async fn deliver_guarded(&self, token: &str) -> DeliveryOutcome {
        let permit = match self.guard.try_admit(token) {
            Admission::Admitted(permit) => permit,
            Admission::Rejected(reason) => {
                tracing::debug!("Skipping delivery of {}: {}", mask(token), reason);
                return DeliveryOutcome::Skipped(reason);
            }
        };

        let outcome = match self.relay.send(token).await {
            Ok(receipt) => DeliveryOutcome::Delivered(receipt),
            Err(e) => {
                tracing::warn!("Delivery of {} failed: {}", mask(token), e);
                DeliveryOutcome::Failed
            }
        };

        drop(permit);
        outcome
    }

    /// Drain the candidate queue, one guarded delivery at a time
    ///
    /// After [`Orchestrator::stop_consuming`] the consumer finishes the
    /// delivery it is running and exits without taking another candidate.
    pub fn spawn_consumer(self: &Arc<Self>, mut rx: mpsc::Receiver<Candidate>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut stopping = self.stopping.subscribe();
        tokio::spawn(async move {
            loop {
                if *stopping.borrow_and_update() {
                    break;
                }
                let candidate = tokio::select! {
                    biased;
                    _ = stopping.changed() => continue,
                    candidate = rx.recv() => match candidate {
                        Some(candidate) => candidate,
                        None => break,
                    },
                };
                tracing::debug!(
                    "Candidate {} from {}",
                    mask(&candidate.token),
                    candidate.origin
                );
                orchestrator.deliver_guarded(&candidate.token).await;
            }
            tracing::debug!("Candidate consumer stopped");
        })
    }

    /// Ask the consumer to stop once its current delivery is done
    pub fn stop_consuming(&self) {
        self.stopping.send_replace(true);
    }

    pub fn spawn_poller(&self) -> JoinHandle<()> {
        tokio::spawn(self.detector.clone().run_polling(self.poll_interval))
    }
}

/// Running pipeline: consumer and poller tasks
pub struct RelayService {
    orchestrator: Arc<Orchestrator>,
    consumer: JoinHandle<()>,
    poller: JoinHandle<()>,
    shutdown_grace: Duration,
}

impl RelayService {
    /// Build the pipeline, start its tasks and warm the cache
    pub async fn start(
        store: SharedStore,
        source: Arc<dyn CredentialSource>,
        options: OrchestratorOptions,
    ) -> anyhow::Result<Self> {
        let shutdown_grace = options.delivery_timeout + SHUTDOWN_SLACK;
        let (orchestrator, rx) = Orchestrator::new(store, source, options).await?;
        let consumer = orchestrator.spawn_consumer(rx);
        let poller = orchestrator.spawn_poller();
        orchestrator.warm_up().await;

        Ok(Self {
            orchestrator,
            consumer,
            poller,
            shutdown_grace,
        })
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }

    /// Stop polling, then let the running delivery finish before stopping the consumer
    ///
    /// A delivery still running after the delivery timeout plus a second is
    /// abandoned.
    pub async fn shutdown(self) {
        self.poller.abort();
        self.orchestrator.stop_consuming();

        let mut consumer = self.consumer;
        if tokio::time::timeout(self.shutdown_grace, &mut consumer)
            .await
            .is_err()
        {
            tracing::warn!(
                "Delivery still running after {:?}, abandoning it",
                self.shutdown_grace
            );
            consumer.abort();
        }
        tracing::info!("Relay pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryConfigStore, CACHED_TOKEN, LAST_DELIVERED_TOKEN, RELAY_ENDPOINT};
    use crate::testutil::{eventually, StaticCredentialSource};
    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;

    fn store_for(server: &ServerGuard) -> MemoryConfigStore {
        MemoryConfigStore::with_entries([(
            RELAY_ENDPOINT,
            format!("{}/api/v1/tokens", server.url()),
        )])
    }

    async fn orchestrator(
        store: &MemoryConfigStore,
        source: &StaticCredentialSource,
    ) -> (Arc<Orchestrator>, mpsc::Receiver<Candidate>) {
        Orchestrator::new(
            Arc::new(store.clone()),
            Arc::new(source.clone()),
            OrchestratorOptions::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_ensure_cached_memory_short_circuits() {
        let store = MemoryConfigStore::with_entries([(CACHED_TOKEN, "persisted")]);
        let source = StaticCredentialSource::new("live");
        let (orch, _rx) = orchestrator(&store, &source).await;
        orch.state().cache().set("memory", false);

        assert_eq!(orch.ensure_cached().await.as_deref(), Some("memory"));
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_ensure_cached_persisted_short_circuits_source() {
        let store = MemoryConfigStore::with_entries([(CACHED_TOKEN, "persisted")]);
        let source = StaticCredentialSource::new("live");
        let (orch, mut rx) = orchestrator(&store, &source).await;

        assert_eq!(orch.ensure_cached().await.as_deref(), Some("persisted"));
        assert_eq!(source.calls(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ensure_cached_falls_through_to_source() {
        let store = MemoryConfigStore::new();
        let source = StaticCredentialSource::new("live");
        let (orch, mut rx) = orchestrator(&store, &source).await;

        assert_eq!(orch.ensure_cached().await.as_deref(), Some("live"));
        assert_eq!(source.calls(), 1);
        assert_eq!(rx.try_recv().unwrap().origin, CandidateOrigin::Acquisition);
        assert!(
            eventually(|| store.snapshot().get(CACHED_TOKEN).map(String::as_str) == Some("live"))
                .await
        );
    }

    #[tokio::test]
    async fn test_ensure_cached_source_failure_is_none() {
        let store = MemoryConfigStore::new();
        let source = StaticCredentialSource::failing();
        let (orch, _rx) = orchestrator(&store, &source).await;

        assert_eq!(orch.ensure_cached().await, None);
        assert_eq!(
            orch.request_token().await,
            TokenResponse::failure("No credential available")
        );
    }

    #[tokio::test]
    async fn test_ensure_cached_with_unavailable_store_uses_source() {
        let store = MemoryConfigStore::new();
        store.set_unavailable(true);
        let source = StaticCredentialSource::new("live");
        let (orch, _rx) = orchestrator(&store, &source).await;

        assert_eq!(orch.ensure_cached().await.as_deref(), Some("live"));
        assert_eq!(orch.state().cache().peek().as_deref(), Some("live"));
    }

    #[tokio::test]
    async fn test_guarded_delivery_dedups_against_last_success() {
        let mut server = Server::new_async().await;
        let first = server
            .mock("POST", "/api/v1/tokens")
            .match_body(Matcher::PartialJson(json!({ "value": "SID1" })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("POST", "/api/v1/tokens")
            .match_body(Matcher::PartialJson(json!({ "value": "SID2" })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let store = store_for(&server);
        let (orch, _rx) = orchestrator(&store, &StaticCredentialSource::failing()).await;

        assert!(matches!(
            orch.deliver_guarded("SID1").await,
            DeliveryOutcome::Delivered(_)
        ));
        assert!(matches!(
            orch.deliver_guarded("SID1").await,
            DeliveryOutcome::Skipped(SkipReason::Duplicate)
        ));
        assert!(matches!(
            orch.deliver_guarded("SID2").await,
            DeliveryOutcome::Delivered(_)
        ));

        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_guarded_failure_is_absorbed_and_retried_later() {
        let mut server = Server::new_async().await;
        let failing = server
            .mock("POST", "/api/v1/tokens")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let store = store_for(&server);
        let (orch, _rx) = orchestrator(&store, &StaticCredentialSource::failing()).await;

        assert!(matches!(
            orch.deliver_guarded("SID1").await,
            DeliveryOutcome::Failed
        ));
        assert!(!orch.is_sending());
        assert!(store.snapshot().get(LAST_DELIVERED_TOKEN).is_none());
        failing.assert_async().await;

        failing.remove_async().await;
        let ok = server
            .mock("POST", "/api/v1/tokens")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        assert!(matches!(
            orch.deliver_guarded("SID1").await,
            DeliveryOutcome::Delivered(_)
        ));
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_candidates_deliver_once() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/tokens")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let store = store_for(&server);
        let (orch, _rx) = orchestrator(&store, &StaticCredentialSource::failing()).await;

        let (a, b) = tokio::join!(orch.deliver_guarded("SID1"), orch.deliver_guarded("SID1"));

        let delivered = [&a, &b]
            .iter()
            .filter(|o| matches!(o, DeliveryOutcome::Delivered(_)))
            .count();
        assert_eq!(delivered, 1);
        assert!([&a, &b].iter().any(|o| matches!(
            o,
            DeliveryOutcome::Skipped(SkipReason::InFlight | SkipReason::Duplicate)
        )));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_forced_delivery_bypasses_dedup_and_reports_errors() {
        let mut server = Server::new_async().await;
        let ok = server
            .mock("POST", "/api/v1/tokens")
            .with_status(200)
            .expect(2)
            .create_async()
            .await;

        let store = store_for(&server);
        let source = StaticCredentialSource::new("SID1");
        let (orch, _rx) = orchestrator(&store, &source).await;

        orch.deliver_guarded("SID1").await;
        assert!(orch.state().is_last_delivered("SID1"));

        orch.state().cache().set("SID1", false);
        assert_eq!(orch.test_delivery().await, DeliveryResponse::success());
        ok.assert_async().await;

        ok.remove_async().await;
        let _rejecting = server
            .mock("POST", "/api/v1/tokens")
            .with_status(403)
            .create_async()
            .await;

        let response = orch.test_delivery().await;
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("403"));
    }

    #[tokio::test]
    async fn test_forced_delivery_ignores_in_flight_slot() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/tokens")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let store = store_for(&server);
        let (orch, _rx) = orchestrator(&store, &StaticCredentialSource::failing()).await;
        orch.state().cache().set("SID1", false);

        let _held = match orch.guard.try_admit("SID9") {
            Admission::Admitted(permit) => permit,
            other => panic!("expected admission, got {:?}", other),
        };
        assert!(orch.is_sending());

        assert_eq!(orch.test_delivery().await, DeliveryResponse::success());
        assert!(orch.is_sending());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_test_delivery_without_token_fails() {
        let store = MemoryConfigStore::new();
        let (orch, _rx) = orchestrator(&store, &StaticCredentialSource::failing()).await;

        assert_eq!(
            orch.test_delivery().await,
            DeliveryResponse::failure("No credential available")
        );
    }

    #[tokio::test]
    async fn test_end_to_end_cold_start() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/tokens")
            .match_body(Matcher::PartialJson(json!({
                "service": "instagram",
                "key": "sessionid",
                "value": "SID1",
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let store = store_for(&server);
        let source = StaticCredentialSource::new("SID1");
        let (orch, rx) = orchestrator(&store, &source).await;
        let consumer = orch.spawn_consumer(rx);

        assert_eq!(orch.request_token().await, TokenResponse::success("SID1".to_string()));
        assert!(eventually(|| orch.state().is_last_delivered("SID1")).await);

        assert_eq!(orch.request_token().await, TokenResponse::success("SID1".to_string()));
        assert_eq!(source.calls(), 1);

        mock.assert_async().await;
        consumer.abort();
    }

    #[tokio::test]
    async fn test_host_event_flows_to_delivery() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/tokens")
            .match_body(Matcher::PartialJson(json!({ "value": "SID7" })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let store = store_for(&server);
        let (orch, rx) = orchestrator(&store, &StaticCredentialSource::failing()).await;
        let consumer = orch.spawn_consumer(rx);

        let event = CredentialEvent {
            domain: ".instagram.com".to_string(),
            name: "sessionid".to_string(),
            value: Some("SID7".to_string()),
            removed: false,
        };
        assert!(orch.handle_event(&event));
        assert!(orch.handle_event(&event));

        assert!(eventually(|| orch.state().is_last_delivered("SID7")).await);
        assert!(
            eventually(|| store.snapshot().get(CACHED_TOKEN).map(String::as_str) == Some("SID7"))
                .await
        );

        mock.assert_async().await;
        consumer.abort();
    }

    #[tokio::test]
    async fn test_warm_up_queues_single_startup_candidate() {
        let store = MemoryConfigStore::with_entries([(CACHED_TOKEN, "persisted")]);
        let (orch, mut rx) = orchestrator(&store, &StaticCredentialSource::failing()).await;

        assert_eq!(orch.warm_up().await.as_deref(), Some("persisted"));
        let candidate = rx.try_recv().unwrap();
        assert_eq!(candidate.origin, CandidateOrigin::Startup);
        assert!(rx.try_recv().is_err());

        let store = MemoryConfigStore::new();
        let (orch, mut rx) = orchestrator(&store, &StaticCredentialSource::new("live")).await;

        assert_eq!(orch.warm_up().await.as_deref(), Some("live"));
        assert_eq!(rx.try_recv().unwrap().origin, CandidateOrigin::Startup);
        assert!(rx.try_recv().is_err());
    }

    /// Collector that answers 200 only after `delay`
    async fn slow_collector(delay: Duration) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                request.extend_from_slice(&buf[..n]);
                                if request.ends_with(b"}") {
                                    break;
                                }
                            }
                        }
                    }
                    tokio::time::sleep(delay).await;
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        )
                        .await;
                });
            }
        });
        format!("http://{}/api/v1/tokens", addr)
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_delivery() {
        let endpoint = slow_collector(Duration::from_millis(300)).await;
        let store = MemoryConfigStore::with_entries([(RELAY_ENDPOINT, endpoint)]);

        let service = RelayService::start(
            Arc::new(store.clone()),
            Arc::new(StaticCredentialSource::new("SID1")),
            OrchestratorOptions::default(),
        )
        .await
        .unwrap();
        let orch = service.orchestrator();
        assert!(eventually(|| orch.is_sending()).await);

        service.shutdown().await;

        assert!(orch.state().is_last_delivered("SID1"));
        assert!(!orch.is_sending());
        assert_eq!(
            store.snapshot().get(LAST_DELIVERED_TOKEN).map(String::as_str),
            Some("SID1")
        );
    }

    #[tokio::test]
    async fn test_stopped_consumer_takes_no_more_candidates() {
        let store = MemoryConfigStore::new();
        let (orch, rx) = orchestrator(&store, &StaticCredentialSource::failing()).await;
        let consumer = orch.spawn_consumer(rx);

        orch.stop_consuming();
        consumer.await.unwrap();

        // The queue closed with the consumer, so the candidate goes nowhere
        assert!(!orch.handle_event(&CredentialEvent {
            domain: "instagram.com".to_string(),
            name: "sessionid".to_string(),
            value: Some("SID9".to_string()),
            removed: false,
        }));
        tokio::task::yield_now().await;
        assert!(!orch.state().is_last_delivered("SID9"));
    }
}
