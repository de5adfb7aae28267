//! QR-code account-linking handshake poller.
//!
//! A handshake starts `pending` and ends in exactly one of `authenticated`,
//! `failed` or `expired`. Each handshake id gets one polling task that asks
//! the server for the status on a fixed interval until a terminal status
//! comes back or the caller cancels.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use connectsuite_shared::{ClientError, HandshakeStatus, QrCodeResponse, SessionStatusResponse};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// The two REST calls a handshake needs.
#[async_trait]
pub trait HandshakeApi: Send + Sync + 'static {
    async fn generate_qr(&self) -> Result<QrCodeResponse, ClientError>;
    async fn session_status(&self, session_id: &str) -> Result<SessionStatusResponse, ClientError>;
}

/// Observable state of one handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeSession {
    pub session_id: String,
    pub status: HandshakeStatus,
    /// Phone number of the linked account once authenticated
    pub linked_identity: Option<String>,
    pub linked_name: Option<String>,
    /// Server message that came with the terminal status
    pub message: Option<String>,
}

impl HandshakeSession {
    fn pending(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            status: HandshakeStatus::Pending,
            linked_identity: None,
            linked_name: None,
            message: None,
        }
    }

    fn outcome(&self) -> Option<HandshakeOutcome> {
        match self.status {
            HandshakeStatus::Pending => None,
            HandshakeStatus::Authenticated => Some(HandshakeOutcome::Linked {
                phone_number: self.linked_identity.clone(),
                name: self.linked_name.clone(),
            }),
            status => Some(HandshakeOutcome::Failed {
                status,
                message: self.message.clone().unwrap_or_default(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeOutcome {
    Linked {
        phone_number: Option<String>,
        name: Option<String>,
    },
    Failed {
        status: HandshakeStatus,
        message: String,
    },
    /// Polling was stopped before a terminal status arrived
    Cancelled,
}

/// A view on one handshake's state.
pub struct HandshakeSubscription {
    state: watch::Receiver<HandshakeSession>,
}

impl HandshakeSubscription {
    pub fn current(&self) -> HandshakeSession {
        self.state.borrow().clone()
    }

    /// Wait for the handshake to finish.
    pub async fn outcome(&mut self) -> HandshakeOutcome {
        loop {
            if let Some(outcome) = self.state.borrow_and_update().outcome() {
                return outcome;
            }
            if self.state.changed().await.is_err() {
                // Every sender is gone: either a terminal value was the last
                // thing published, or the poll was cancelled.
                return self
                    .state
                    .borrow()
                    .outcome()
                    .unwrap_or(HandshakeOutcome::Cancelled);
            }
        }
    }
}

struct ActivePoll {
    state: Arc<watch::Sender<HandshakeSession>>,
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// How many finished handshakes are remembered for late `start` calls.
const FINISHED_LIMIT: usize = 64;

#[derive(Default)]
struct Registry {
    active: HashMap<String, ActivePoll>,
    finished: HashMap<String, HandshakeSession>,
    /// Finished ids, oldest first
    finished_order: VecDeque<String>,
}

impl Registry {
    fn remember(&mut self, session: HandshakeSession) {
        let id = session.session_id.clone();
        if self.finished.insert(id.clone(), session).is_none() {
            self.finished_order.push_back(id);
        }
        while self.finished_order.len() > FINISHED_LIMIT {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }

    fn forget_finished(&mut self) {
        self.finished.clear();
        self.finished_order.clear();
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns every handshake poll task. Dropping the poller cancels them all.
pub struct AuthPoller<A: HandshakeApi> {
    api: Arc<A>,
    interval: Duration,
    registry: Arc<Mutex<Registry>>,
}

impl<A: HandshakeApi> AuthPoller<A> {
    pub fn new(api: Arc<A>, interval: Duration) -> Self {
        Self {
            api,
            interval,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Ask the server for a QR code and start polling the handshake it opens.
    pub async fn initiate(&self) -> Result<(QrCodeResponse, HandshakeSubscription), ClientError> {
        let qr = self.api.generate_qr().await?;
        crate::log_info!("Handshake {} opened", qr.session_id);
        let subscription = self.start(&qr.session_id);
        Ok((qr, subscription))
    }

    /// Start polling `session_id`.
    ///
    /// A handshake that is already being polled is joined rather than
    /// polled twice; one that already finished is not polled again.
    pub fn start(&self, session_id: &str) -> HandshakeSubscription {
        let mut registry = lock(&self.registry);

        if let Some(poll) = registry.active.get(session_id) {
            crate::log_debug!("Handshake {} already polling", session_id);
            return HandshakeSubscription {
                state: poll.state.subscribe(),
            };
        }
        if let Some(done) = registry.finished.get(session_id) {
            let (_, state) = watch::channel(done.clone());
            return HandshakeSubscription { state };
        }

        let (sender, receiver) = watch::channel(HandshakeSession::pending(session_id));
        let state = Arc::new(sender);
        let cancelled = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(poll_loop(
            self.api.clone(),
            session_id.to_string(),
            self.interval,
            state.clone(),
            cancelled.clone(),
            self.registry.clone(),
        ));
        registry.active.insert(
            session_id.to_string(),
            ActivePoll {
                state,
                cancelled,
                task,
            },
        );
        crate::log_info!("Polling handshake {} every {:?}", session_id, self.interval);

        HandshakeSubscription { state: receiver }
    }

    /// Stop polling `session_id`. Any poll response still in flight is
    /// discarded. Returns false if nothing was polling.
    pub fn cancel(&self, session_id: &str) -> bool {
        let Some(poll) = lock(&self.registry).active.remove(session_id) else {
            return false;
        };
        poll.cancelled.store(true, Ordering::SeqCst);
        poll.task.abort();
        crate::log_info!("Handshake {} polling cancelled", session_id);
        true
    }

    /// Stop every poll and forget finished handshakes.
    pub fn cancel_all(&self) {
        let polls: Vec<_> = {
            let mut registry = lock(&self.registry);
            registry.forget_finished();
            registry.active.drain().collect()
        };
        for (session_id, poll) in polls {
            poll.cancelled.store(true, Ordering::SeqCst);
            poll.task.abort();
            crate::log_debug!("Handshake {} polling cancelled", session_id);
        }
    }

    pub fn is_polling(&self, session_id: &str) -> bool {
        lock(&self.registry).active.contains_key(session_id)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.registry).active.len()
    }

    pub fn finished_count(&self) -> usize {
        lock(&self.registry).finished.len()
    }
}

impl<A: HandshakeApi> Drop for AuthPoller<A> {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn poll_loop<A: HandshakeApi>(
    api: Arc<A>,
    session_id: String,
    every: Duration,
    state: Arc<watch::Sender<HandshakeSession>>,
    cancelled: Arc<AtomicBool>,
    registry: Arc<Mutex<Registry>>,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if cancelled.load(Ordering::SeqCst) {
            return;
        }

        let response = match api.session_status(&session_id).await {
            Ok(response) => response,
            Err(e) => {
                // Transient; the next tick may succeed.
                crate::log_debug!("Status poll for {} failed: {}", session_id, e);
                continue;
            }
        };

        let Some(status) = HandshakeStatus::from_wire(&response.status) else {
            crate::log_debug!(
                "Handshake {} reported unknown status '{}'",
                session_id,
                response.status
            );
            continue;
        };
        if !status.is_terminal() {
            continue;
        }

        let finished = HandshakeSession {
            session_id: session_id.clone(),
            status,
            linked_identity: response.phone_number,
            linked_name: response.name,
            message: Some(response.message),
        };
        if publish_terminal(&registry, &cancelled, &state, finished) {
            crate::log_info!("Handshake {} finished: {:?}", session_id, status);
        }
        return;
    }
}

/// Publish the terminal state unless the poll was cancelled first. Holding
/// the registry lock orders this against `cancel`.
fn publish_terminal(
    registry: &Mutex<Registry>,
    cancelled: &AtomicBool,
    state: &watch::Sender<HandshakeSession>,
    finished: HandshakeSession,
) -> bool {
    let mut registry = lock(registry);
    if cancelled.load(Ordering::SeqCst) {
        return false;
    }
    state.send_replace(finished.clone());
    registry.active.remove(&finished.session_id);
    registry.remember(finished);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    const EVERY: Duration = Duration::from_secs(2);

    /// Status source that plays back a script, then reports `pending`.
    #[derive(Default)]
    struct ScriptedApi {
        script: Mutex<VecDeque<Result<SessionStatusResponse, ClientError>>>,
        polls: AtomicUsize,
    }

    impl ScriptedApi {
        fn new(statuses: Vec<Result<&str, ClientError>>) -> Arc<Self> {
            let script = statuses
                .into_iter()
                .map(|s| s.map(|status| status_response(status)))
                .collect();
            Arc::new(Self {
                script: Mutex::new(script),
                polls: AtomicUsize::new(0),
            })
        }

        fn polls(&self) -> usize {
            self.polls.load(Ordering::SeqCst)
        }
    }

    fn status_response(status: &str) -> SessionStatusResponse {
        SessionStatusResponse {
            session_id: "hs-1".into(),
            status: status.into(),
            phone_number: (status == "authenticated").then(|| "15550001111".to_string()),
            name: (status == "authenticated").then(|| "Ana".to_string()),
            message: format!("session {status}"),
        }
    }

    #[async_trait]
    impl HandshakeApi for ScriptedApi {
        async fn generate_qr(&self) -> Result<QrCodeResponse, ClientError> {
            Ok(QrCodeResponse {
                session_id: "hs-1".into(),
                qr_code: "data:image/png;base64,AAAA".into(),
                status: "pending".into(),
                message: "Scan the QR code".into(),
            })
        }

        async fn session_status(&self, _session_id: &str) -> Result<SessionStatusResponse, ClientError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(status_response("pending")))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn authenticated_stops_polling_and_surfaces_identity() {
        let api = ScriptedApi::new(vec![Ok("pending"), Ok("pending"), Ok("authenticated")]);
        let poller = AuthPoller::new(api.clone(), EVERY);

        let mut sub = poller.start("hs-1");
        assert_eq!(sub.current().status, HandshakeStatus::Pending);

        let outcome = sub.outcome().await;
        assert_eq!(
            outcome,
            HandshakeOutcome::Linked {
                phone_number: Some("15550001111".into()),
                name: Some("Ana".into()),
            }
        );
        assert_eq!(api.polls(), 3);
        assert!(!poller.is_polling("hs-1"));

        tokio::time::sleep(EVERY * 10).await;
        assert_eq!(api.polls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_and_expired_surface_server_message() {
        for status in [HandshakeStatus::Failed, HandshakeStatus::Expired] {
            let wire = if status == HandshakeStatus::Failed { "failed" } else { "expired" };
            let api = ScriptedApi::new(vec![Ok("pending"), Ok(wire)]);
            let poller = AuthPoller::new(api.clone(), EVERY);

            let outcome = poller.start("hs-1").outcome().await;
            assert_eq!(
                outcome,
                HandshakeOutcome::Failed {
                    status,
                    message: format!("session {wire}"),
                }
            );

            tokio::time::sleep(EVERY * 5).await;
            assert_eq!(api.polls(), 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_poll_before_first_interval() {
        let api = ScriptedApi::new(vec![]);
        let poller = AuthPoller::new(api.clone(), EVERY);
        let _sub = poller.start("hs-1");

        tokio::time::sleep(EVERY / 2).await;
        assert_eq!(api.polls(), 0);
        tokio::time::sleep(EVERY).await;
        assert_eq!(api.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn starting_twice_keeps_one_timer() {
        let api = ScriptedApi::new(vec![]);
        let poller = AuthPoller::new(api.clone(), EVERY);

        let _first = poller.start("hs-1");
        let _second = poller.start("hs-1");
        assert_eq!(poller.active_count(), 1);

        tokio::time::sleep(EVERY * 3 + EVERY / 4).await;
        assert_eq!(api.polls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn joined_subscribers_see_the_same_outcome() {
        let api = ScriptedApi::new(vec![Ok("pending"), Ok("authenticated")]);
        let poller = AuthPoller::new(api.clone(), EVERY);

        let mut first = poller.start("hs-1");
        let mut second = poller.start("hs-1");

        let a = first.outcome().await;
        let b = second.outcome().await;
        assert_eq!(a, b);
        assert!(matches!(a, HandshakeOutcome::Linked { .. }));
        assert_eq!(api.polls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_errors_are_swallowed() {
        let api = ScriptedApi::new(vec![
            Err(ClientError::Network("blip".into())),
            Err(ClientError::Http { status: 502, body: "bad gateway".into() }),
            Ok("authenticated"),
        ]);
        let poller = AuthPoller::new(api.clone(), EVERY);

        let outcome = poller.start("hs-1").outcome().await;
        assert!(matches!(outcome, HandshakeOutcome::Linked { .. }));
        assert_eq!(api.polls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_status_keeps_polling() {
        let api = ScriptedApi::new(vec![Ok("qr_scanned"), Ok("expired")]);
        let poller = AuthPoller::new(api.clone(), EVERY);

        let outcome = poller.start("hs-1").outcome().await;
        assert!(matches!(
            outcome,
            HandshakeOutcome::Failed { status: HandshakeStatus::Expired, .. }
        ));
        assert_eq!(api.polls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent_and_stops_polling() {
        let api = ScriptedApi::new(vec![]);
        let poller = AuthPoller::new(api.clone(), EVERY);

        let mut sub = poller.start("hs-1");
        tokio::time::sleep(EVERY + EVERY / 4).await;
        assert_eq!(api.polls(), 1);

        assert!(poller.cancel("hs-1"));
        assert!(!poller.cancel("hs-1"));
        assert!(!poller.is_polling("hs-1"));

        assert_eq!(sub.outcome().await, HandshakeOutcome::Cancelled);
        tokio::time::sleep(EVERY * 5).await;
        assert_eq!(api.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_handshake_is_not_polled_again() {
        let api = ScriptedApi::new(vec![Ok("authenticated")]);
        let poller = AuthPoller::new(api.clone(), EVERY);
        poller.start("hs-1").outcome().await;

        let mut again = poller.start("hs-1");
        assert_eq!(again.current().status, HandshakeStatus::Authenticated);
        assert!(matches!(again.outcome().await, HandshakeOutcome::Linked { .. }));
        assert!(!poller.is_polling("hs-1"));

        tokio::time::sleep(EVERY * 5).await;
        assert_eq!(api.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_forgets_finished_handshakes() {
        let api = ScriptedApi::new(vec![Ok("authenticated"), Ok("authenticated")]);
        let poller = AuthPoller::new(api.clone(), EVERY);
        poller.start("hs-1").outcome().await;
        assert_eq!(poller.finished_count(), 1);

        poller.cancel_all();
        assert_eq!(poller.finished_count(), 0);

        let outcome = poller.start("hs-1").outcome().await;
        assert!(matches!(outcome, HandshakeOutcome::Linked { .. }));
        assert_eq!(api.polls(), 2);
    }

    #[test]
    fn finished_handshakes_are_bounded() {
        let mut registry = Registry::default();
        for i in 0..FINISHED_LIMIT + 10 {
            let mut done = HandshakeSession::pending(&format!("hs-{i}"));
            done.status = HandshakeStatus::Expired;
            registry.remember(done);
        }

        assert_eq!(registry.finished.len(), FINISHED_LIMIT);
        assert_eq!(registry.finished_order.len(), FINISHED_LIMIT);
        assert!(!registry.finished.contains_key("hs-0"));
        assert!(!registry.finished.contains_key("hs-9"));
        assert!(registry.finished.contains_key("hs-10"));
        assert!(registry.finished.contains_key(&format!("hs-{}", FINISHED_LIMIT + 9)));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_poller_cancels_everything() {
        let api = ScriptedApi::new(vec![]);
        let poller = AuthPoller::new(api.clone(), EVERY);
        let mut a = poller.start("hs-1");
        let mut b = poller.start("hs-2");
        drop(poller);

        assert_eq!(a.outcome().await, HandshakeOutcome::Cancelled);
        assert_eq!(b.outcome().await, HandshakeOutcome::Cancelled);
        tokio::time::sleep(EVERY * 5).await;
        assert_eq!(api.polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn initiate_generates_qr_then_polls_it() {
        let api = ScriptedApi::new(vec![Ok("authenticated")]);
        let poller = AuthPoller::new(api.clone(), EVERY);

        let (qr, mut sub) = poller.initiate().await.unwrap();
        assert_eq!(qr.session_id, "hs-1");
        assert!(poller.is_polling("hs-1"));
        assert!(matches!(sub.outcome().await, HandshakeOutcome::Linked { .. }));
    }
}
