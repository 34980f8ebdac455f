//! PairingOrchestrator - drives pairing attempts from request to teardown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::failure::panic_message;
use super::messages::{advisory_message, credentials_document, format_pairing_code};
use super::outcome::{AttemptOutcome, AttemptReport, PairingError, PairingResult};
use super::policy::PairingConfig;
use super::registry::{AttemptRegistry, SpawnedAttempt};
use super::responder::ResponseSlot;
use super::state::{LifecycleState, SessionAttempt, Termination};
use crate::client::{
    ClientConnector, Connection, ConnectionEvent, ConnectionEvents, DisconnectReason,
    ProtocolClient,
};
use crate::event_bus::{EventBus, EventKind};
use crate::identity::SessionIdentity;
use crate::store::{CredentialSink, SessionStore};

/// What `initiate` resolves to.
pub type PairingResponse = Result<PairingResult, PairingError>;

struct Inner {
    store: SessionStore,
    connector: Arc<dyn ClientConnector>,
    config: PairingConfig,
    events: Arc<EventBus>,
    registry: AttemptRegistry,
    reports: mpsc::UnboundedSender<AttemptReport>,
}

/// Runs one attempt per identity and reports every finished attempt.
///
/// Cloning is cheap; all clones share the same registry and report channel.
#[derive(Clone)]
pub struct PairingOrchestrator {
    inner: Arc<Inner>,
}

impl PairingOrchestrator {
    /// Build an orchestrator and the receiver its supervisor reads reports from.
    pub fn new(
        store: SessionStore,
        connector: Arc<dyn ClientConnector>,
        config: PairingConfig,
        events: Arc<EventBus>,
    ) -> (Self, mpsc::UnboundedReceiver<AttemptReport>) {
        let (reports, rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            inner: Arc::new(Inner {
                store,
                connector,
                config,
                events,
                registry: AttemptRegistry::new(),
                reports,
            }),
        };
        (orchestrator, rx)
    }

    /// Validate `phone_number`, start an attempt, and wait for its single response.
    pub async fn initiate(&self, phone_number: &str) -> PairingResponse {
        let identity = SessionIdentity::parse(phone_number)?;
        match self.start(identity).await {
            Ok(response) => response,
            Err(_) => Err(PairingError::Internal(
                "attempt ended without a response".to_string(),
            )),
        }
    }

    /// Start an attempt for `identity`, superseding any live one.
    ///
    /// The new attempt does not touch storage until the previous attempt for
    /// the same identity has fully stopped.
    pub fn start(&self, identity: SessionIdentity) -> oneshot::Receiver<PairingResponse> {
        let (slot, response) = ResponseSlot::channel();
        let slot = Arc::new(slot);
        let inner = Arc::clone(&self.inner);

        let (generation, previous) =
            self.inner
                .registry
                .replace(identity.clone(), |generation, waiting_on| {
                    let (finished_tx, finished) = watch::channel(false);
                    let driver = AttemptDriver {
                        inner: Arc::clone(&inner),
                        identity: identity.clone(),
                        generation,
                        slot: Arc::clone(&slot),
                        deadline: Instant::now(),
                        reconnects: 0,
                    };
                    let task = tokio::spawn(async move {
                        if let Some(mut previous) = waiting_on {
                            let _ = previous.wait_for(|stopped| *stopped).await.map(|_| ());
                        }
                        driver.run().await
                    });
                    let abort = task.abort_handle();
                    tokio::spawn(supervise(
                        inner,
                        identity.clone(),
                        generation,
                        task,
                        slot,
                        finished_tx,
                    ));
                    SpawnedAttempt {
                        task: abort,
                        finished,
                    }
                });

        match previous {
            Some(previous) => log::info!(
                "Pairing attempt {} for {} supersedes one started at {}",
                generation,
                identity,
                previous.created_at
            ),
            None => log::info!("Pairing attempt {} started for {}", generation, identity),
        }
        response
    }

    /// Snapshots of all live attempts.
    pub fn attempts(&self) -> Vec<SessionAttempt> {
        self.inner.registry.snapshots()
    }

    pub fn attempt(&self, identity: &SessionIdentity) -> Option<SessionAttempt> {
        self.inner.registry.get(identity)
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn config(&self) -> &PairingConfig {
        &self.inner.config
    }
}

/// Await an attempt task and turn however it ended into a report.
async fn supervise(
    inner: Arc<Inner>,
    identity: SessionIdentity,
    generation: u64,
    task: JoinHandle<AttemptOutcome>,
    slot: Arc<ResponseSlot<PairingResponse>>,
    finished: watch::Sender<bool>,
) {
    let outcome = match task.await {
        Ok(outcome) => outcome,
        Err(e) if e.is_cancelled() => {
            log::info!("Pairing attempt {} for {} superseded", generation, identity);
            slot.respond(Err(PairingError::Superseded));
            AttemptOutcome::Superseded
        }
        Err(e) => {
            let message = if e.is_panic() {
                panic_message(e.into_panic())
            } else {
                e.to_string()
            };
            log::error!(
                "Pairing attempt {} for {} crashed: {}",
                generation,
                identity,
                message
            );
            // Storage may already belong to a newer attempt.
            if inner.registry.is_current(&identity, generation) {
                inner.store.discard(&identity);
                let closed = LifecycleState::Closed(Termination::Failure);
                if let Some(snapshot) =
                    inner
                        .registry
                        .update(&identity, generation, |attempt| attempt.state = closed)
                {
                    inner.events.publish(EventKind::State, &snapshot);
                    inner.events.publish(EventKind::Closed, &snapshot);
                }
            }
            slot.respond(Err(PairingError::Internal(message.clone())));
            AttemptOutcome::Crashed(message)
        }
    };

    finished.send_replace(true);
    inner.registry.remove(&identity, generation);

    if inner
        .reports
        .send(AttemptReport { identity, outcome })
        .is_err()
    {
        log::debug!("No supervisor is listening for attempt reports");
    }
}

/// An open client plus the sink its credential updates go through.
struct LiveConnection {
    client: Box<dyn ProtocolClient>,
    events: ConnectionEvents,
    sink: CredentialSink,
    /// An open event already arrived while a pairing code was pending.
    opened: bool,
}

/// What the connection did while the attempt was waiting on it.
enum Step {
    Open,
    Closed(DisconnectReason),
    Expired,
}

/// State of a single running attempt.
struct AttemptDriver {
    inner: Arc<Inner>,
    identity: SessionIdentity,
    generation: u64,
    slot: Arc<ResponseSlot<PairingResponse>>,
    deadline: Instant,
    reconnects: u32,
}

impl AttemptDriver {
    async fn run(mut self) -> AttemptOutcome {
        self.deadline = Instant::now() + self.inner.config.attempt_timeout();
        let mut fresh = true;

        loop {
            self.transition(LifecycleState::Initializing);
            let mut connection = match self.initialize(fresh).await {
                Ok(connection) => connection,
                Err(error) => return self.fail(None, error).await,
            };
            fresh = false;

            let interrupted = if connection.sink.status().registered {
                None
            } else {
                self.transition(LifecycleState::AwaitingPairing);
                match self.await_pairing(&mut connection).await {
                    Ok(closed) => closed,
                    Err(error) => return self.fail(Some(connection), error).await,
                }
            };

            let step = match interrupted {
                Some(reason) => Step::Closed(reason),
                None => {
                    self.transition(LifecycleState::Connecting);
                    self.next_step(&mut connection).await
                }
            };
            match step {
                Step::Open => return self.transfer(connection).await,
                Step::Expired => return self.fail(Some(connection), PairingError::Timeout).await,
                Step::Closed(reason) if reason.is_logged_out() => {
                    let error = PairingError::Authentication(reason.to_string());
                    return self.fail(Some(connection), error).await;
                }
                Step::Closed(reason) => {
                    connection.client.close().await;
                    if let Err(error) = self.back_off(reason, &mut connection).await {
                        return self.fail(None, error).await;
                    }
                }
            }
        }
    }

    /// Open storage and connect. The first pass resets storage; reconnects
    /// reuse whatever the client persisted.
    async fn initialize(&self, fresh: bool) -> Result<LiveConnection, PairingError> {
        let store = &self.inner.store;
        let auth = if fresh {
            store.prepare(&self.identity)
        } else {
            store.load(&self.identity)
        }
        .map_err(|e| PairingError::Initialization(e.to_string()))?;

        let sink = auth.sink().clone();
        let options = &self.inner.config.client;
        let connect = time::timeout(
            options.connect_timeout,
            self.inner.connector.connect(auth, options),
        );

        match guarded(self.deadline, &sink, connect).await {
            None => Err(PairingError::Timeout),
            Some(Err(_)) => Err(PairingError::Initialization(format!(
                "connect timed out after {:?}",
                options.connect_timeout
            ))),
            Some(Ok(Err(e))) => Err(PairingError::Initialization(e.to_string())),
            Some(Ok(Ok(Connection { client, events }))) => Ok(LiveConnection {
                client,
                events,
                sink,
                opened: false,
            }),
        }
    }

    /// Request a pairing code and publish it.
    ///
    /// Only the first code ever reaches the caller; codes issued after a
    /// reconnect are visible through the registry and the event bus.
    ///
    /// Connection events keep flowing while the request is pending. A close
    /// abandons the request and is returned as `Ok(Some(reason))`; an open is
    /// remembered for [`Self::next_step`].
    async fn await_pairing(
        &self,
        connection: &mut LiveConnection,
    ) -> Result<Option<DisconnectReason>, PairingError> {
        let LiveConnection {
            client,
            events,
            sink,
            opened,
        } = connection;
        let client: &dyn ProtocolClient = &**client;
        let grace = self.inner.config.timings.pairing_grace;
        let request = async {
            time::sleep(grace).await;
            client.request_pairing_code(self.identity.digits()).await
        };
        tokio::pin!(request);

        let requested = loop {
            tokio::select! {
                biased;
                requested = guarded(self.deadline, sink, &mut request) => break requested,
                event = events.recv() => match event {
                    None => return Ok(Some(DisconnectReason::stream_ended())),
                    Some(ConnectionEvent::Connecting) => {
                        log::debug!("Connecting {}", self.identity);
                    }
                    Some(ConnectionEvent::Open) => {
                        log::info!("Connection open for {} before a pairing code", self.identity);
                        *opened = true;
                    }
                    Some(ConnectionEvent::Close(reason)) => {
                        log::info!(
                            "Connection closed for {} while awaiting its pairing code: {}",
                            self.identity,
                            reason
                        );
                        return Ok(Some(reason));
                    }
                },
            }
        };

        let raw = match requested {
            None => return Err(PairingError::Timeout),
            Some(Ok(raw)) => raw,
            Some(Err(e)) => {
                log::warn!("Pairing code request for {} rejected: {}", self.identity, e);
                return Err(PairingError::PairingCode {
                    reason: e.to_string(),
                });
            }
        };

        let code = format_pairing_code(&raw);
        log::info!("Pairing code for {}: {}", self.identity, code);
        if let Some(snapshot) = self.update(|attempt| attempt.pairing_code = Some(code.clone())) {
            self.inner.events.publish(EventKind::Code, &snapshot);
        }

        if !self.slot.respond(Ok(PairingResult::Pairing { pairing_code: code })) {
            log::info!(
                "Issued a fresh pairing code for {} after reconnecting",
                self.identity
            );
        }
        Ok(None)
    }

    /// Wait for the connection to open or close.
    async fn next_step(&self, connection: &mut LiveConnection) -> Step {
        if connection.opened {
            return Step::Open;
        }
        loop {
            match guarded(self.deadline, &connection.sink, connection.events.recv()).await {
                None => return Step::Expired,
                Some(None) => return Step::Closed(DisconnectReason::stream_ended()),
                Some(Some(ConnectionEvent::Connecting)) => {
                    log::debug!("Connecting {}", self.identity);
                }
                Some(Some(ConnectionEvent::Open)) => {
                    log::info!("Connection open for {}", self.identity);
                    return Step::Open;
                }
                Some(Some(ConnectionEvent::Close(reason))) => {
                    log::info!("Connection closed for {}: {}", self.identity, reason);
                    return Step::Closed(reason);
                }
            }
        }
    }

    /// Sleep before the next reconnect, or give up once the policy is spent.
    ///
    /// The closed connection is still watched while sleeping: a late
    /// logged-out close ends the attempt instead of reconnecting.
    async fn back_off(
        &mut self,
        reason: DisconnectReason,
        connection: &mut LiveConnection,
    ) -> Result<(), PairingError> {
        let policy = self.inner.config.reconnect.clone();
        if !policy.allows(self.reconnects) {
            return Err(PairingError::ReconnectsExhausted {
                attempts: self.reconnects,
                reason: reason.to_string(),
            });
        }

        let delay = policy.backoff(self.reconnects);
        self.reconnects += 1;
        let reconnects = self.reconnects;
        log::info!(
            "Reconnecting {} in {:?} (attempt {}/{})",
            self.identity,
            delay,
            reconnects,
            policy.max_attempts
        );
        self.update(|attempt| attempt.reconnects = reconnects);

        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        let mut listening = true;
        loop {
            tokio::select! {
                biased;
                slept = guarded(self.deadline, &connection.sink, &mut sleep) => {
                    return slept.ok_or(PairingError::Timeout);
                }
                event = connection.events.recv(), if listening => match event {
                    Some(ConnectionEvent::Close(reason)) if reason.is_logged_out() => {
                        log::info!("{} logged out while reconnecting: {}", self.identity, reason);
                        return Err(PairingError::Authentication(reason.to_string()));
                    }
                    Some(_) => {}
                    None => listening = false,
                },
            }
        }
    }

    /// Send the persisted credentials to the user's own address, then tear down.
    async fn transfer(&self, connection: LiveConnection) -> AttemptOutcome {
        self.transition(LifecycleState::Transferring);

        let delivered = self
            .deliver(connection.client.as_ref(), &connection.sink)
            .await;
        if let Err(error) = delivered {
            return self.fail(Some(connection), error).await;
        }

        connection.client.close().await;
        self.inner.store.discard(&self.identity);
        self.transition(LifecycleState::Closed(Termination::Success));
        log::info!("Credentials delivered for {}", self.identity);

        if self.slot.respond(Ok(PairingResult::Completed)) {
            log::info!("{} was already registered; no pairing code issued", self.identity);
        }
        AttemptOutcome::Delivered
    }

    async fn deliver(
        &self,
        client: &dyn ProtocolClient,
        sink: &CredentialSink,
    ) -> Result<(), PairingError> {
        let timings = &self.inner.config.timings;
        if !persisted_registered(sink, timings.settle).await {
            log::warn!(
                "Registered credentials for {} not acknowledged within {:?}; reading anyway",
                self.identity,
                timings.settle
            );
        }

        let data = self
            .inner
            .store
            .persisted_credentials(&self.identity)
            .map_err(|e| PairingError::Transfer(e.to_string()))?;
        let to = self.identity.address(&self.inner.config.client.user_domain);

        client
            .send_message(&to, credentials_document(data))
            .await
            .map_err(|e| PairingError::Transfer(e.to_string()))?;
        client
            .send_message(&to, advisory_message())
            .await
            .map_err(|e| PairingError::Transfer(e.to_string()))?;

        time::sleep(timings.post_transfer).await;
        Ok(())
    }

    /// Terminal failure: close, discard, and respond if nothing was sent yet.
    async fn fail(&self, connection: Option<LiveConnection>, error: PairingError) -> AttemptOutcome {
        if let Some(connection) = connection {
            connection.client.close().await;
        }
        self.inner.store.discard(&self.identity);
        self.transition(LifecycleState::Closed(Termination::Failure));
        log::warn!("Pairing attempt for {} failed: {}", self.identity, error);

        if !self.slot.respond(Err(error.clone())) {
            log::debug!(
                "Response for {} already sent; failure goes to the supervisor only",
                self.identity
            );
        }
        AttemptOutcome::Failed(error)
    }

    fn update<F>(&self, f: F) -> Option<SessionAttempt>
    where
        F: FnOnce(&mut SessionAttempt),
    {
        self.inner.registry.update(&self.identity, self.generation, f)
    }

    fn transition(&self, state: LifecycleState) {
        let Some(snapshot) = self.update(|attempt| attempt.state = state) else {
            return;
        };
        log::debug!("{} is now {:?}", self.identity, state);
        self.inner.events.publish(EventKind::State, &snapshot);
        if state.is_terminal() {
            self.inner.events.publish(EventKind::Closed, &snapshot);
        }
    }
}

/// Run `fut` unless the attempt deadline passes first.
///
/// Returns `None` on expiry.
async fn guarded<F: Future>(
    deadline: Instant,
    sink: &CredentialSink,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        output = fut => Some(output),
        _ = expired(deadline, sink) => None,
    }
}

/// Resolves at `deadline` unless registered credentials have been persisted,
/// in which case the deadline no longer applies.
async fn expired(deadline: Instant, sink: &CredentialSink) {
    time::sleep_until(deadline).await;
    if sink.status().registered {
        std::future::pending::<()>().await;
    }
}

/// Wait up to `settle` for the sink to acknowledge a registered save.
async fn persisted_registered(sink: &CredentialSink, settle: Duration) -> bool {
    let mut status = sink.subscribe();
    matches!(
        time::timeout(settle, status.wait_for(|status| status.registered))
            .await
            .map(|acknowledged| acknowledged.is_ok()),
        Ok(true)
    )
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::{FakeConnector, FakeController, DEFAULT_FAKE_CODE};
    use crate::client::{ClientError, ClientOptions, OutboundMessage};
    use crate::pairing::failure::is_fatal;
    use crate::pairing::ReconnectPolicy;
    use crate::store::{AuthState, Credentials};
    use async_trait::async_trait;
    use tempfile::TempDir;

    const NUMBER: &str = "0771234567";

    struct Harness {
        orchestrator: PairingOrchestrator,
        controller: FakeController,
        reports: mpsc::UnboundedReceiver<AttemptReport>,
        store: SessionStore,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        harness_with(PairingConfig::default())
    }

    fn harness_with(config: PairingConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let (connector, controller) = FakeConnector::new();
        let (orchestrator, reports) = PairingOrchestrator::new(
            store.clone(),
            Arc::new(connector),
            config,
            Arc::new(EventBus::new()),
        );
        Harness {
            orchestrator,
            controller,
            reports,
            store,
            _dir: dir,
        }
    }

    fn identity() -> SessionIdentity {
        SessionIdentity::parse(NUMBER).unwrap()
    }

    fn spawn_initiate(orchestrator: &PairingOrchestrator) -> JoinHandle<PairingResponse> {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.initiate(NUMBER).await })
    }

    async fn next_outcome(h: &mut Harness) -> AttemptOutcome {
        h.reports.recv().await.unwrap().outcome
    }

    mod scenarios {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn unregistered_number_receives_pairing_code() {
            let h = harness();

            let result = h.orchestrator.initiate(NUMBER).await;

            assert_eq!(
                result,
                Ok(PairingResult::Pairing {
                    pairing_code: "ABCD-1234".to_string()
                })
            );
            assert_eq!(h.controller.pairing_requests(), vec![NUMBER.to_string()]);
            assert!(h.store.exists(&identity()));
            let attempt = h.orchestrator.attempt(&identity()).unwrap();
            assert_eq!(attempt.pairing_code.as_deref(), Some("ABCD-1234"));
        }

        #[tokio::test(start_paused = true)]
        async fn registered_number_skips_pairing_and_delivers() {
            let mut h = harness();
            h.controller.register_on_connect();

            let pending = spawn_initiate(&h.orchestrator);
            h.controller.wait_for_connections(1).await;
            h.controller.emit(ConnectionEvent::Open);

            assert_eq!(pending.await.unwrap(), Ok(PairingResult::Completed));
            assert_eq!(next_outcome(&mut h).await, AttemptOutcome::Delivered);

            assert!(h.controller.pairing_requests().is_empty());
            let sent = h.controller.sent_messages();
            assert_eq!(sent.len(), 2);
            assert!(sent
                .iter()
                .all(|m| m.to == "0771234567@s.whatsapp.net"));
            assert!(matches!(sent[1].message, OutboundMessage::Text(_)));
            assert!(!h.store.exists(&identity()));
        }

        #[tokio::test(start_paused = true)]
        async fn rejected_pairing_code_fails_and_cleans_up() {
            let mut h = harness();
            h.controller
                .push_pairing_code(Err(ClientError::Rejected("rate-overlimit".into())));

            let error = h.orchestrator.initiate(NUMBER).await.unwrap_err();

            assert!(matches!(error, PairingError::PairingCode { .. }));
            assert_eq!(error.to_string(), "Failed to generate pairing code");
            assert!(matches!(
                next_outcome(&mut h).await,
                AttemptOutcome::Failed(PairingError::PairingCode { .. })
            ));
            assert!(!h.store.exists(&identity()));
            assert_eq!(h.controller.close_count(), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn no_registration_and_no_response_times_out() {
            let mut h = harness();
            h.controller.stall_pairing_codes();
            let started = Instant::now();

            let result = h.orchestrator.initiate(NUMBER).await;

            assert_eq!(result, Err(PairingError::Timeout));
            assert!(started.elapsed() >= Duration::from_secs(300));
            assert_eq!(
                next_outcome(&mut h).await,
                AttemptOutcome::Failed(PairingError::Timeout)
            );
            assert!(!h.store.exists(&identity()));
        }
    }

    mod lifecycle {
        use super::*;

        fn closed(status_code: u16, message: &str) -> ConnectionEvent {
            ConnectionEvent::Close(DisconnectReason::new(status_code, message))
        }

        #[tokio::test(start_paused = true)]
        async fn pairing_then_restart_delivers_credentials() {
            let mut h = harness();
            let mut events = h.orchestrator.event_bus().subscribe();

            h.orchestrator.initiate(NUMBER).await.unwrap();
            h.controller.register();
            h.controller.emit(ConnectionEvent::Close(DisconnectReason::new(
                DisconnectReason::RESTART_REQUIRED,
                "restart required",
            )));
            h.controller.wait_for_connections(2).await;
            h.controller.emit(ConnectionEvent::Open);

            assert_eq!(next_outcome(&mut h).await, AttemptOutcome::Delivered);

            // The reconnect reused the registered credentials.
            assert_eq!(h.controller.pairing_requests().len(), 1);
            let sent = h.controller.sent_messages();
            match &sent[0].message {
                OutboundMessage::Document { data, .. } => {
                    let creds: Credentials = serde_json::from_slice(data).unwrap();
                    assert!(creds.registered);
                }
                other => panic!("Expected credentials document, got {:?}", other),
            }
            assert!(!h.store.exists(&identity()));
            assert!(h.orchestrator.attempts().is_empty());

            let mut types = Vec::new();
            while let Ok(event) = events.try_recv() {
                types.push(event.event_type);
            }
            assert_eq!(types.first().unwrap(), "pairing:state:0771234567");
            assert!(types.contains(&"pairing:code:0771234567".to_string()));
            assert_eq!(types.last().unwrap(), "pairing:closed:0771234567");
        }

        #[tokio::test(start_paused = true)]
        async fn logged_out_close_never_reconnects() {
            let mut h = harness();

            h.orchestrator.initiate(NUMBER).await.unwrap();
            h.controller.emit(ConnectionEvent::Close(DisconnectReason::new(
                DisconnectReason::LOGGED_OUT,
                "logged out",
            )));

            assert!(matches!(
                next_outcome(&mut h).await,
                AttemptOutcome::Failed(PairingError::Authentication(_))
            ));
            assert_eq!(h.controller.connection_count(), 1);
            assert!(!h.store.exists(&identity()));
        }

        #[tokio::test(start_paused = true)]
        async fn transient_close_reconnects_after_backoff() {
            let h = harness();
            h.controller.push_pairing_code(Ok("ABCD1234".into()));
            h.controller.push_pairing_code(Ok("WXYZ5678".into()));

            let first = h.orchestrator.initiate(NUMBER).await.unwrap();
            let closed_at = Instant::now();
            h.controller.emit(ConnectionEvent::Close(DisconnectReason::new(
                DisconnectReason::CONNECTION_CLOSED,
                "Connection Closed",
            )));
            h.controller.wait_for_connections(2).await;

            assert!(closed_at.elapsed() >= Duration::from_secs(5));
            time::sleep(Duration::from_secs(3)).await;

            assert_eq!(
                first,
                PairingResult::Pairing {
                    pairing_code: "ABCD-1234".into()
                }
            );
            let attempt = h.orchestrator.attempt(&identity()).unwrap();
            assert_eq!(attempt.reconnects, 1);
            assert_eq!(attempt.pairing_code.as_deref(), Some("WXYZ-5678"));
            assert_eq!(h.controller.pairing_requests().len(), 2);
        }

        #[tokio::test(start_paused = true)]
        async fn reconnects_are_bounded() {
            let mut h = harness_with(PairingConfig {
                reconnect: ReconnectPolicy {
                    max_attempts: 1,
                    ..ReconnectPolicy::default()
                },
                ..PairingConfig::default()
            });
            let lost = || {
                ConnectionEvent::Close(DisconnectReason::new(
                    DisconnectReason::CONNECTION_LOST,
                    "Connection Lost",
                ))
            };

            h.orchestrator.initiate(NUMBER).await.unwrap();
            h.controller.emit(lost());
            h.controller.wait_for_connections(2).await;
            h.controller.emit(lost());

            match next_outcome(&mut h).await {
                AttemptOutcome::Failed(PairingError::ReconnectsExhausted { attempts, reason }) => {
                    assert_eq!(attempts, 1);
                    assert!(reason.contains("408"));
                }
                other => panic!("Expected exhausted reconnects, got {:?}", other),
            }
            assert!(!h.store.exists(&identity()));
        }

        #[tokio::test(start_paused = true)]
        async fn logged_out_while_awaiting_code_fails_immediately() {
            let mut h = harness();
            h.controller.stall_pairing_codes();
            let started = Instant::now();

            let pending = spawn_initiate(&h.orchestrator);
            h.controller.wait_for_connections(1).await;
            h.controller
                .emit(closed(DisconnectReason::LOGGED_OUT, "logged out"));

            assert!(matches!(
                pending.await.unwrap(),
                Err(PairingError::Authentication(_))
            ));
            assert!(matches!(
                next_outcome(&mut h).await,
                AttemptOutcome::Failed(PairingError::Authentication(_))
            ));
            assert!(started.elapsed() < Duration::from_secs(300));
            assert_eq!(h.controller.connection_count(), 1);
            assert_eq!(h.controller.close_count(), 1);
            assert!(!h.store.exists(&identity()));
        }

        #[tokio::test(start_paused = true)]
        async fn transient_close_while_awaiting_code_reconnects() {
            let h = harness();
            h.controller.stall_pairing_codes();

            let _pending = spawn_initiate(&h.orchestrator);
            h.controller.wait_for_connections(1).await;
            let closed_at = Instant::now();
            h.controller
                .emit(closed(DisconnectReason::CONNECTION_CLOSED, "Connection Closed"));
            h.controller.wait_for_connections(2).await;

            assert!(closed_at.elapsed() >= Duration::from_secs(5));
            assert!(closed_at.elapsed() < Duration::from_secs(300));
            assert_eq!(h.controller.connection_count(), 2);
            assert_eq!(h.orchestrator.attempt(&identity()).unwrap().reconnects, 1);

            // The first request was abandoned before its grace period ended.
            time::sleep(Duration::from_secs(3)).await;
            assert_eq!(h.controller.pairing_requests().len(), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn logged_out_during_backoff_never_reconnects() {
            let mut h = harness();

            h.orchestrator.initiate(NUMBER).await.unwrap();
            h.controller
                .emit(closed(DisconnectReason::CONNECTION_LOST, "Connection Lost"));
            time::sleep(Duration::from_secs(1)).await;
            assert_eq!(h.orchestrator.attempt(&identity()).unwrap().reconnects, 1);

            h.controller
                .emit(closed(DisconnectReason::LOGGED_OUT, "logged out"));

            assert!(matches!(
                next_outcome(&mut h).await,
                AttemptOutcome::Failed(PairingError::Authentication(_))
            ));
            time::sleep(Duration::from_secs(60)).await;
            assert_eq!(h.controller.connection_count(), 1);
            assert!(!h.store.exists(&identity()));
        }

        #[tokio::test(start_paused = true)]
        async fn close_at_deadline_yields_one_response() {
            let mut h = harness();
            h.controller.stall_pairing_codes();
            let deadline = Instant::now() + h.orchestrator.config().attempt_timeout();

            let pending = spawn_initiate(&h.orchestrator);
            h.controller.wait_for_connections(1).await;
            time::sleep_until(deadline).await;
            h.controller
                .emit(closed(DisconnectReason::LOGGED_OUT, "logged out"));

            let error = pending.await.unwrap().unwrap_err();
            assert!(matches!(
                error,
                PairingError::Timeout | PairingError::Authentication(_)
            ));
            assert_eq!(next_outcome(&mut h).await, AttemptOutcome::Failed(error));

            time::sleep(Duration::from_secs(60)).await;
            assert!(h.reports.try_recv().is_err());
            assert_eq!(h.controller.close_count(), 1);
            assert_eq!(h.controller.connection_count(), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn timeout_after_code_is_reported_only() {
            let mut h = harness();

            let started = Instant::now();
            assert!(h.orchestrator.initiate(NUMBER).await.is_ok());

            assert_eq!(
                next_outcome(&mut h).await,
                AttemptOutcome::Failed(PairingError::Timeout)
            );
            assert!(started.elapsed() >= Duration::from_secs(300));
            assert!(!h.store.exists(&identity()));
        }

        #[tokio::test(start_paused = true)]
        async fn registered_attempt_outlives_deadline() {
            let mut h = harness();
            h.controller.register_on_connect();

            let pending = spawn_initiate(&h.orchestrator);
            h.controller.wait_for_connections(1).await;
            time::sleep(Duration::from_secs(400)).await;
            h.controller.emit(ConnectionEvent::Open);

            assert_eq!(pending.await.unwrap(), Ok(PairingResult::Completed));
            assert_eq!(next_outcome(&mut h).await, AttemptOutcome::Delivered);
        }
    }

    mod failures {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn invalid_number_never_connects() {
            let h = harness();

            let result = h.orchestrator.initiate("12").await;

            assert!(matches!(result, Err(PairingError::Validation(_))));
            assert_eq!(h.controller.connection_count(), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn connect_failure_is_initialization_error() {
            let mut h = harness();
            h.controller
                .fail_next_connect(ClientError::Connect("refused".into()));

            let result = h.orchestrator.initiate(NUMBER).await;

            assert!(matches!(result, Err(PairingError::Initialization(_))));
            assert!(matches!(
                next_outcome(&mut h).await,
                AttemptOutcome::Failed(PairingError::Initialization(_))
            ));
            assert!(!h.store.exists(&identity()));
        }

        #[tokio::test(start_paused = true)]
        async fn send_failure_is_transfer_error() {
            let h = harness();
            h.controller.register_on_connect();
            h.controller.fail_sends(ClientError::Send("offline".into()));

            let pending = spawn_initiate(&h.orchestrator);
            h.controller.wait_for_connections(1).await;
            h.controller.emit(ConnectionEvent::Open);

            assert!(matches!(
                pending.await.unwrap(),
                Err(PairingError::Transfer(_))
            ));
            assert!(!h.store.exists(&identity()));
            assert_eq!(h.controller.close_count(), 1);
        }

        struct PanickingConnector;

        #[async_trait]
        impl ClientConnector for PanickingConnector {
            async fn connect(
                &self,
                _auth: AuthState,
                _options: &ClientOptions,
            ) -> Result<Connection, ClientError> {
                panic!("index out of bounds")
            }
        }

        #[tokio::test(start_paused = true)]
        async fn panicking_client_is_reported_as_crash() {
            let dir = TempDir::new().unwrap();
            let store = SessionStore::new(dir.path());
            let (orchestrator, mut reports) = PairingOrchestrator::new(
                store.clone(),
                Arc::new(PanickingConnector),
                PairingConfig::default(),
                Arc::new(EventBus::new()),
            );

            let result = orchestrator.initiate(NUMBER).await;

            assert_eq!(
                result,
                Err(PairingError::Internal("index out of bounds".into()))
            );
            let outcome = reports.recv().await.unwrap().outcome;
            assert_eq!(outcome, AttemptOutcome::Crashed("index out of bounds".into()));
            assert!(is_fatal(&outcome));
            assert!(!store.exists(&identity()));
        }
    }

    mod supersession {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn newer_request_takes_over() {
            let mut h = harness();

            let first = spawn_initiate(&h.orchestrator);
            h.controller.wait_for_connections(1).await;

            let second = h.orchestrator.initiate(NUMBER).await;

            assert_eq!(first.await.unwrap(), Err(PairingError::Superseded));
            assert_eq!(
                second,
                Ok(PairingResult::Pairing {
                    pairing_code: format_pairing_code(DEFAULT_FAKE_CODE)
                })
            );
            assert_eq!(next_outcome(&mut h).await, AttemptOutcome::Superseded);
            assert_eq!(h.controller.connection_count(), 2);
            assert_eq!(h.controller.pairing_requests().len(), 1);
            assert_eq!(h.orchestrator.attempts().len(), 1);
            assert!(h.store.exists(&identity()));
        }

        #[tokio::test(start_paused = true)]
        async fn other_identities_run_side_by_side() {
            let h = harness();

            let first = h.orchestrator.initiate(NUMBER).await;
            let second = h.orchestrator.initiate("0779999999").await;

            assert!(first.is_ok());
            assert!(second.is_ok());
            assert_eq!(h.orchestrator.attempts().len(), 2);
        }
    }
}
