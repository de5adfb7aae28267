//! Request correlator: routes replies back to the call that sent the request.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use connectsuite_shared::{ClientError, Envelope};
use serde_json::Value;
use tokio::sync::oneshot;

/// What a waiting caller eventually receives.
pub type Reply = Result<Value, ClientError>;

struct PendingRequest {
    created_at: DateTime<Utc>,
    waiter: oneshot::Sender<Reply>,
}

/// Owns every in-flight request, keyed by correlation id.
///
/// Each entry is removed exactly once: when a matching reply settles it,
/// when the caller gives up on it, or when the channel rejects everything on
/// teardown.
#[derive(Default)]
pub struct RequestCorrelator {
    pending: HashMap<String, PendingRequest>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh correlation id for a request of the given type.
    pub fn next_id(kind: &str) -> String {
        format!("{}_{}", kind, uuid::Uuid::new_v4().simple())
    }

    /// Register a request and hand back the receiver its reply arrives on.
    /// An id that is still pending cannot be registered again.
    pub fn register(&mut self, correlation_id: String) -> Result<oneshot::Receiver<Reply>, ClientError> {
        if self.pending.contains_key(&correlation_id) {
            return Err(ClientError::Validation(format!(
                "correlation id '{}' is already pending",
                correlation_id
            )));
        }
        let (waiter, rx) = oneshot::channel();
        self.pending.insert(
            correlation_id,
            PendingRequest {
                created_at: Utc::now(),
                waiter,
            },
        );
        Ok(rx)
    }

    /// Settle the pending request this envelope replies to.
    ///
    /// A 2xx status resolves with the envelope's `data`; anything else rejects
    /// with an auth error carrying the status and message. Returns `false`
    /// when the envelope has no id or the id is not pending, in which case
    /// the envelope is someone else's business.
    pub fn settle(&mut self, envelope: &Envelope) -> bool {
        let Some(id) = envelope.request_id() else {
            return false;
        };
        let Some(pending) = self.pending.remove(id) else {
            return false;
        };

        let reply = if envelope.is_success() {
            Ok(envelope.data.clone().unwrap_or(Value::Null))
        } else {
            Err(ClientError::Auth {
                status: envelope.status_code.unwrap_or(0),
                message: envelope
                    .message
                    .clone()
                    .unwrap_or_else(|| "request rejected".to_string()),
            })
        };

        // The caller may have stopped waiting; nothing to do then.
        let _ = pending.waiter.send(reply);
        true
    }

    /// Drop a pending request without settling it.
    pub fn cancel(&mut self, correlation_id: &str) -> bool {
        self.pending.remove(correlation_id).is_some()
    }

    /// Reject every pending request with `error`. Returns how many were rejected.
    pub fn reject_all(&mut self, error: ClientError) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            let _ = pending.waiter.send(Err(error.clone()));
        }
        count
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// When the given request was registered.
    pub fn pending_since(&self, correlation_id: &str) -> Option<DateTime<Utc>> {
        self.pending.get(correlation_id).map(|p| p.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use serde_json::json;

    fn ok_reply(id: &str, payload: Value) -> Envelope {
        Envelope::reply("login", id, 200, "ok", payload)
    }

    #[test]
    fn next_id_is_prefixed_and_unique() {
        let a = RequestCorrelator::next_id("login");
        let b = RequestCorrelator::next_id("login");
        assert!(a.starts_with("login_"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn settle_resolves_on_success_status() {
        let mut correlator = RequestCorrelator::new();
        let rx = correlator.register("r1".into()).unwrap();
        assert!(correlator.pending_since("r1").is_some());

        assert!(correlator.settle(&ok_reply("r1", json!({"session_id": "s"}))));
        assert_eq!(correlator.pending_count(), 0);

        let value = rx.await.unwrap().unwrap();
        assert_eq!(value["session_id"], "s");
    }

    #[tokio::test]
    async fn settle_rejects_with_auth_error() {
        let mut correlator = RequestCorrelator::new();
        let rx = correlator.register("r1".into()).unwrap();

        let reply = Envelope::reply("login", "r1", 401, "Invalid credentials", Value::Null);
        assert!(correlator.settle(&reply));

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            ClientError::Auth { status: 401, message: "Invalid credentials".into() }
        );
    }

    #[tokio::test]
    async fn missing_status_rejects() {
        let mut correlator = RequestCorrelator::new();
        let rx = correlator.register("r1".into()).unwrap();
        let mut reply = ok_reply("r1", Value::Null);
        reply.status_code = None;
        reply.message = None;
        assert!(correlator.settle(&reply));
        assert!(matches!(rx.await.unwrap(), Err(ClientError::Auth { status: 0, .. })));
    }

    #[test]
    fn unknown_or_missing_id_is_not_settled() {
        let mut correlator = RequestCorrelator::new();
        let _rx = correlator.register("r1".into()).unwrap();
        assert!(!correlator.settle(&ok_reply("other", Value::Null)));

        let push = Envelope {
            kind: "notification".into(),
            data: Some(json!({"text": "hi"})),
            session_id: None,
            status_code: Some(200),
            message: None,
        };
        assert!(!correlator.settle(&push));
        assert!(correlator.is_pending("r1"));
    }

    #[tokio::test]
    async fn settles_exactly_once() {
        let mut correlator = RequestCorrelator::new();
        let rx = correlator.register("r1".into()).unwrap();
        assert!(correlator.settle(&ok_reply("r1", json!("first"))));
        assert!(!correlator.settle(&ok_reply("r1", json!("second"))));
        let data = rx.await.unwrap().unwrap();
        assert_eq!(data["payload"], "first");
    }

    #[test]
    fn duplicate_pending_id_is_refused() {
        let mut correlator = RequestCorrelator::new();
        let _rx = correlator.register("r1".into()).unwrap();
        assert!(matches!(
            correlator.register("r1".into()),
            Err(ClientError::Validation(_))
        ));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn id_can_be_reused_after_settling() {
        let mut correlator = RequestCorrelator::new();
        let _rx = correlator.register("r1".into()).unwrap();
        correlator.settle(&ok_reply("r1", Value::Null));
        assert!(correlator.register("r1".into()).is_ok());
    }

    #[tokio::test]
    async fn reject_all_rejects_every_pending_request() {
        let mut correlator = RequestCorrelator::new();
        let receivers: Vec<_> = (0..4)
            .map(|i| correlator.register(format!("r{i}")).unwrap())
            .collect();

        let rejected = correlator.reject_all(ClientError::Network("torn down".into()));
        assert_eq!(rejected, 4);
        assert_eq!(correlator.pending_count(), 0);

        for rx in receivers {
            assert_eq!(
                rx.await.unwrap(),
                Err(ClientError::Network("torn down".into()))
            );
        }
    }

    #[tokio::test]
    async fn cancel_drops_waiter() {
        let mut correlator = RequestCorrelator::new();
        let rx = correlator.register("r1".into()).unwrap();
        assert!(correlator.cancel("r1"));
        assert!(!correlator.cancel("r1"));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn shuffled_replies_pair_with_their_own_requests() {
        for seed in 0..8u64 {
            let mut correlator = RequestCorrelator::new();
            let ids: Vec<String> = (0..16).map(|i| format!("req_{i}")).collect();
            let receivers: Vec<_> = ids
                .iter()
                .map(|id| correlator.register(id.clone()).unwrap())
                .collect();

            let mut order = ids.clone();
            order.shuffle(&mut rand::rngs::StdRng::seed_from_u64(seed));
            for id in &order {
                assert!(correlator.settle(&ok_reply(id, json!({"echo": id}))));
            }

            for (id, rx) in ids.iter().zip(receivers) {
                let data = rx.await.unwrap().unwrap();
                assert_eq!(data["echo"], id.as_str());
            }
        }
    }
}
