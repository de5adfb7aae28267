//! Bulk message dispatch.
//!
//! Scheduled mode turns a contact list into one [`Batch`] whose delays are a
//! running sum of random steps, and submits it in a single call. Immediate
//! mode sends each message in turn, paced, and tallies the results.

use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use connectsuite_shared::{
    Batch, BulkMessage, ClientError, Contact, ScheduledMessage, SendBulkRequest, SendBulkResponse,
    SendMessageRequest, SendMessageResponse,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::{NoExpand, Regex};
use uuid::Uuid;

/// Domain appended to bare phone numbers.
pub const RECIPIENT_DOMAIN: &str = "s.whatsapp.net";

static NAME_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\{name\}").unwrap());

/// The two REST calls dispatch needs.
#[async_trait]
pub trait DispatchApi: Send + Sync + 'static {
    async fn send_bulk(&self, req: &SendBulkRequest) -> Result<SendBulkResponse, ClientError>;
    async fn send_message(&self, req: &SendMessageRequest) -> Result<SendMessageResponse, ClientError>;
}

/// Replace every `{name}` (any case) with the contact's name, or its phone
/// when the name is missing or empty.
pub fn render_message(template: &str, contact: &Contact) -> String {
    let name = contact
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .unwrap_or(&contact.phone);
    NAME_PLACEHOLDER
        .replace_all(template, NoExpand(name))
        .into_owned()
}

/// The contact's own message if it has one, else the shared template.
pub fn effective_message(template: &str, contact: &Contact) -> String {
    let source = contact
        .message
        .as_deref()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or(template);
    render_message(source, contact)
}

pub fn recipient_address(phone: &str) -> String {
    if phone.contains('@') {
        phone.to_string()
    } else {
        format!("{phone}@{RECIPIENT_DOMAIN}")
    }
}

/// Inclusive bounds, in seconds, for the random step between two messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: u64,
    pub max: u64,
}

impl DelayRange {
    pub fn new(min: u64, max: u64) -> Result<Self, ClientError> {
        if min > max {
            return Err(ClientError::Validation(format!(
                "delay range is empty: min {min} > max {max}"
            )));
        }
        Ok(Self { min, max })
    }
}

/// Cumulative delays for `count` messages: the first is 0, each later one
/// adds an independent draw from `range` to its predecessor.
pub fn cumulative_delays<R: Rng + ?Sized>(count: usize, range: DelayRange, rng: &mut R) -> Vec<u64> {
    let mut delays = Vec::with_capacity(count);
    let mut total = 0u64;
    for index in 0..count {
        if index > 0 {
            total = total.saturating_add(rng.gen_range(range.min..=range.max));
        }
        delays.push(total);
    }
    delays
}

/// Build the batch for scheduled mode. Fails before anything is sent if the
/// contact list is empty or any contact would get a blank message.
pub fn build_batch<R: Rng + ?Sized>(
    template: &str,
    contacts: &[Contact],
    range: DelayRange,
    rng: &mut R,
) -> Result<Batch, ClientError> {
    if contacts.is_empty() {
        return Err(ClientError::Validation("no contacts to send to".into()));
    }
    let delays = cumulative_delays(contacts.len(), range, rng);

    let mut messages = Vec::with_capacity(contacts.len());
    for (sequence_number, (contact, delay_seconds)) in contacts.iter().zip(delays).enumerate() {
        let body = effective_message(template, contact);
        if body.trim().is_empty() {
            return Err(ClientError::Validation(format!(
                "no message for contact {}",
                contact.phone
            )));
        }
        messages.push(ScheduledMessage {
            recipient: recipient_address(&contact.phone),
            body,
            delay_seconds,
            sequence_number,
        });
    }

    Ok(Batch {
        batch_id: Uuid::new_v4().to_string(),
        messages,
        submitted_at: Utc::now(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One bulk submission; the server delivers on the computed schedule
    Scheduled(DelayRange),
    /// Sequential direct sends
    Immediate,
}

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Linked account the messages go out from
    pub session_name: String,
    pub template: String,
    pub contacts: Vec<Contact>,
    pub mode: DispatchMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedBatch {
    pub batch: Batch,
    /// Id the server assigned; delivery logs are filed under it
    pub remote_batch_id: String,
}

/// Result of one immediate-mode send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub sequence_number: usize,
    pub recipient: String,
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub success_count: usize,
    pub fail_count: usize,
    pub outcomes: Vec<SendOutcome>,
}

impl DispatchSummary {
    fn record(&mut self, outcome: SendOutcome) {
        if outcome.is_success() {
            self.success_count += 1;
        } else {
            self.fail_count += 1;
        }
        self.outcomes.push(outcome);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Scheduled(SubmittedBatch),
    Immediate(DispatchSummary),
}

pub struct BulkDispatchScheduler<A: DispatchApi> {
    api: Arc<A>,
    pacing: Duration,
    rng: Mutex<StdRng>,
}

impl<A: DispatchApi> BulkDispatchScheduler<A> {
    pub fn new(api: Arc<A>, pacing: Duration) -> Self {
        Self {
            api,
            pacing,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Fix the random source so schedules are reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchOutcome, ClientError> {
        if request.contacts.is_empty() {
            return Err(ClientError::Validation("no contacts to send to".into()));
        }
        if request.session_name.trim().is_empty() {
            return Err(ClientError::Validation("no account selected".into()));
        }

        match request.mode {
            DispatchMode::Scheduled(range) => {
                self.submit(request, range).await.map(DispatchOutcome::Scheduled)
            }
            DispatchMode::Immediate => self.send_each(request).await.map(DispatchOutcome::Immediate),
        }
    }

    async fn submit(&self, request: &DispatchRequest, range: DelayRange) -> Result<SubmittedBatch, ClientError> {
        let batch = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            build_batch(&request.template, &request.contacts, range, &mut *rng)?
        };

        let body = SendBulkRequest {
            session_name: request.session_name.clone(),
            messages: batch.messages.iter().map(BulkMessage::from).collect(),
        };
        let response = self.api.send_bulk(&body).await?;

        crate::log_info!(
            "Batch {} scheduled as {}: {} messages over {}s",
            batch.batch_id,
            response.batch_id,
            batch.messages.len(),
            batch.messages.last().map(|m| m.delay_seconds).unwrap_or(0)
        );
        Ok(SubmittedBatch {
            batch,
            remote_batch_id: response.batch_id,
        })
    }

    /// Send every message in order. A failed send is recorded and the run
    /// goes on, except a rejected credential: that ends the run with the
    /// error, since every later send would be rejected too.
    async fn send_each(&self, request: &DispatchRequest) -> Result<DispatchSummary, ClientError> {
        let mut summary = DispatchSummary::default();
        let mut sent_before = false;

        for (sequence_number, contact) in request.contacts.iter().enumerate() {
            let recipient = recipient_address(&contact.phone);
            let message = effective_message(&request.template, contact);

            if message.trim().is_empty() {
                crate::log_warn!("Skipping {}: no message", contact.phone);
                summary.record(SendOutcome {
                    sequence_number,
                    recipient,
                    error: Some("no message".into()),
                });
                continue;
            }

            if sent_before && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }
            sent_before = true;

            let req = SendMessageRequest {
                session_id: request.session_name.clone(),
                phone: recipient.clone(),
                message,
                reply: false,
            };
            let error = match self.api.send_message(&req).await {
                Ok(resp) if resp.success => None,
                Ok(resp) => Some(resp.error.unwrap_or(resp.message)),
                Err(e) if e.is_unauthorized() => {
                    crate::log_warn!(
                        "Send to {} rejected ({}), stopping after {} of {}",
                        contact.phone,
                        e,
                        summary.outcomes.len(),
                        request.contacts.len()
                    );
                    return Err(e);
                }
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = &error {
                crate::log_warn!("Send to {} failed: {}", contact.phone, reason);
            }
            summary.record(SendOutcome {
                sequence_number,
                recipient,
                error,
            });
        }

        crate::log_info!(
            "Immediate send finished: {} sent, {} failed",
            summary.success_count,
            summary.fail_count
        );
        Ok(summary)
    }
}
