//! Outbound payments with virtual channel fallback.
//!
//! A payment first goes out through the node's own `pay`. If that fails the
//! orchestrator asks its outgoing virtual channel partners, one at a time,
//! to pay the invoice for us. Partners answer asynchronously with a
//! `VirtualSendSuccess` or `VirtualSendFailure` message carrying the bolt11,
//! which is what correlates replies to the [`PendingPayment`].
//!
//! ```text
//! Started -> DirectAttempted -> VirtualAttempting(p1) -> VirtualAttempting(p2) ...
//!    |                                 |                        |
//!    +-> Succeeded                     +-> Succeeded / Failed   +-> ...
//! ```
//!
//! The caller gets a [`PaymentHandle`] which completes exactly once. The
//! pending entry is removed in the same critical section that decides the
//! outcome, so late or duplicated replies find nothing and are ignored.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};

use crate::core::provider::{PaymentProvider, PeerMessenger};
use crate::proto::messages::{InitVirtualSend, Message};
use crate::proto::primitives::{Msat, PaymentHash, Preimage};

const PREIMAGE_MISMATCH: &str = "preimage does not match payment hash";

/// Parameters of a `pay` call. Unset fields use the paying node's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub bolt11: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_msat: Option<Msat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub riskfactor: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxfee_msat: Option<Msat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_for: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxdelay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exemptfee_msat: Option<Msat>,
}

impl PaymentRequest {
    pub fn new(bolt11: impl Into<String>) -> Self {
        Self {
            bolt11: bolt11.into(),
            ..Default::default()
        }
    }

    /// Text fields travel as ascii in `InitVirtualSend`; anything else would
    /// be dropped by the partner.
    pub fn check_ascii(&self) -> Result<(), PaymentError> {
        if !self.bolt11.is_ascii() {
            return Err(PaymentError::NotAscii { field: "bolt11" });
        }
        if self.label.as_deref().is_some_and(|l| !l.is_ascii()) {
            return Err(PaymentError::NotAscii { field: "label" });
        }
        Ok(())
    }
}

impl From<&PaymentRequest> for InitVirtualSend {
    fn from(r: &PaymentRequest) -> Self {
        InitVirtualSend {
            bolt11: r.bolt11.clone(),
            amount_msat: r.amount_msat,
            label: r.label.clone(),
            riskfactor: r.riskfactor,
            maxfee_msat: r.maxfee_msat,
            retry_for: r.retry_for,
            maxdelay: r.maxdelay,
            exemptfee_msat: r.exemptfee_msat,
        }
    }
}

impl From<InitVirtualSend> for PaymentRequest {
    fn from(m: InitVirtualSend) -> Self {
        PaymentRequest {
            bolt11: m.bolt11,
            amount_msat: m.amount_msat,
            label: m.label,
            riskfactor: m.riskfactor,
            maxfee_msat: m.maxfee_msat,
            retry_for: m.retry_for,
            maxdelay: m.maxdelay,
            exemptfee_msat: m.exemptfee_msat,
        }
    }
}

/// One failed step of a payment, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum AttemptError {
    #[error("direct payment failed: {message}")]
    Direct { message: String },
    #[error("could not reach virtual channel partner {peer}: {message}")]
    Transport { peer: PublicKey, message: String },
    #[error("virtual channel partner {peer} failed to pay: {reason}")]
    Rejected { peer: PublicKey, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    #[error("a payment for this invoice is already in flight")]
    AlreadyPending,
    #[error("{field} must be ascii text")]
    NotAscii { field: &'static str },
    #[error("payment failed after {} attempts", .errors.len())]
    Exhausted { errors: Vec<AttemptError> },
    #[error("payment was dropped before it completed")]
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentSuccess {
    pub preimage: Preimage,
    /// The partner that paid for us, `None` if we paid directly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partner: Option<PublicKey>,
}

pub type PaymentResult = Result<PaymentSuccess, PaymentError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Started,
    DirectAttempted,
    VirtualAttempting { peer: PublicKey },
    Succeeded,
    Failed,
}

impl std::fmt::Display for PaymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentState::Started => write!(f, "started"),
            PaymentState::DirectAttempted => write!(f, "direct_attempted"),
            PaymentState::VirtualAttempting { peer } => write!(f, "virtual_attempting({})", peer),
            PaymentState::Succeeded => write!(f, "succeeded"),
            PaymentState::Failed => write!(f, "failed"),
        }
    }
}

/// What to do when a partner answers with `VirtualSendFailure`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Try the next partner, like for a partner we could not reach.
    #[default]
    AdvanceOnRejection,
    /// Fail the payment on the first rejection.
    StopOnRejection,
}

/// An in-flight payment.
pub struct PendingPayment {
    request: PaymentRequest,
    /// A partner's preimage must hash to this.
    payment_hash: PaymentHash,
    candidates: VecDeque<PublicKey>,
    errors: Vec<AttemptError>,
    state: PaymentState,
    completion: oneshot::Sender<PaymentResult>,
}

impl PendingPayment {
    fn new(
        request: PaymentRequest,
        payment_hash: PaymentHash,
        candidates: Vec<PublicKey>,
        completion: oneshot::Sender<PaymentResult>,
    ) -> Self {
        Self {
            request,
            payment_hash,
            candidates: candidates.into(),
            errors: vec![],
            state: PaymentState::Started,
            completion,
        }
    }

    fn awaiting(&self) -> Option<PublicKey> {
        match self.state {
            PaymentState::VirtualAttempting { peer } => Some(peer),
            _ => None,
        }
    }

    // Both terminal transitions consume the payment, so it can only be
    // completed once.
    fn succeed(mut self, success: PaymentSuccess) {
        self.state = PaymentState::Succeeded;
        log::info!(
            "Payment of {} {}",
            self.request.bolt11,
            match success.partner {
                Some(p) => format!("paid by virtual channel partner {}", p),
                None => "paid directly".to_string(),
            }
        );
        // The receiver is gone if the caller stopped waiting.
        let _ = self.completion.send(Ok(success));
    }

    fn fail(mut self) {
        self.state = PaymentState::Failed;
        log::info!(
            "Payment of {} failed after {} attempts",
            self.request.bolt11,
            self.errors.len()
        );
        let _ = self.completion.send(Err(PaymentError::Exhausted {
            errors: self.errors,
        }));
    }
}

impl std::fmt::Debug for PendingPayment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingPayment")
            .field("request", &self.request)
            .field("payment_hash", &self.payment_hash)
            .field("candidates", &self.candidates)
            .field("errors", &self.errors)
            .field("state", &self.state)
            .field("completion", &"<oneshot::Sender>")
            .finish()
    }
}

/// Completes once the payment succeeded or ran out of partners.
#[derive(Debug)]
pub struct PaymentHandle {
    rx: oneshot::Receiver<PaymentResult>,
}

impl PaymentHandle {
    pub async fn wait(self) -> PaymentResult {
        self.rx.await.unwrap_or(Err(PaymentError::Dropped))
    }
}

pub struct PaymentOrchestrator {
    /// In-flight payments keyed by bolt11.
    pending: Mutex<HashMap<String, PendingPayment>>,
    payer: Arc<dyn PaymentProvider>,
    messenger: Arc<dyn PeerMessenger>,
    policy: FallbackPolicy,
}

impl PaymentOrchestrator {
    pub fn new(
        payer: Arc<dyn PaymentProvider>,
        messenger: Arc<dyn PeerMessenger>,
        policy: FallbackPolicy,
    ) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            payer,
            messenger,
            policy,
        }
    }

    /// Starts a payment of an invoice committing to `payment_hash`. The
    /// direct attempt and, if needed, the first virtual send happen before
    /// this returns; the rest of the fallback is driven by incoming replies.
    pub async fn start_payment(
        &self,
        request: PaymentRequest,
        payment_hash: PaymentHash,
        candidates: Vec<PublicKey>,
    ) -> Result<PaymentHandle, PaymentError> {
        request.check_ascii()?;
        let key = request.bolt11.clone();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(&key) {
                return Err(PaymentError::AlreadyPending);
            }
            pending.insert(
                key.clone(),
                PendingPayment::new(request.clone(), payment_hash, candidates, tx),
            );
        }

        // No lock held while paying.
        let direct = self.payer.pay(&request).await;

        let mut pending = self.pending.lock().await;
        match direct {
            Ok(preimage) => {
                if let Some(payment) = pending.remove(&key) {
                    payment.succeed(PaymentSuccess {
                        preimage,
                        partner: None,
                    });
                }
            }
            Err(e) => {
                log::debug!("Direct payment of {} failed: {:#}", key, e);
                if let Some(payment) = pending.get_mut(&key) {
                    payment.errors.push(AttemptError::Direct {
                        message: format!("{:#}", e),
                    });
                    payment.state = PaymentState::DirectAttempted;
                }
                drop(pending);
                self.attempt_virtual_send(&key).await;
            }
        }

        Ok(PaymentHandle { rx })
    }

    /// Hands the payment to the next partner. Partners we can not reach are
    /// recorded and skipped; once none are left the payment fails.
    async fn attempt_virtual_send(&self, key: &str) {
        loop {
            let (peer, message) = {
                let mut pending = self.pending.lock().await;
                let Some(payment) = pending.get_mut(key) else {
                    return;
                };
                match payment.candidates.pop_front() {
                    Some(peer) => {
                        payment.state = PaymentState::VirtualAttempting { peer };
                        let message = Message::InitVirtualSend((&payment.request).into());
                        (peer, message)
                    }
                    None => {
                        if let Some(payment) = pending.remove(key) {
                            payment.fail();
                        }
                        return;
                    }
                }
            };

            log::debug!("Asking virtual channel partner {} to pay {}", peer, key);
            let Err(e) = self.messenger.send_message(&peer, &message).await else {
                return;
            };

            let mut pending = self.pending.lock().await;
            let Some(payment) = pending.get_mut(key) else {
                return;
            };
            payment.errors.push(AttemptError::Transport {
                peer,
                message: format!("{:#}", e),
            });
        }
    }

    /// Handles a `VirtualSendSuccess` from `peer`. Returns `false` if no
    /// payment was waiting on `peer` for this invoice. A preimage that does
    /// not match the invoice counts as a rejection by `peer`.
    pub async fn on_virtual_send_success(
        &self,
        peer: &PublicKey,
        bolt11: &str,
        preimage: Preimage,
    ) -> bool {
        let payment = {
            let mut pending = self.pending.lock().await;
            if !Self::is_awaiting(&pending, bolt11, peer) {
                return false;
            }
            let expected = pending.get(bolt11).map(|p| p.payment_hash);
            if expected != Some(preimage.payment_hash()) {
                drop(pending);
                log::warn!(
                    "Virtual channel partner {} sent a preimage for {} that does not match its payment hash",
                    peer,
                    bolt11
                );
                return self
                    .on_virtual_send_failure(peer, bolt11, Some(PREIMAGE_MISMATCH.to_string()))
                    .await;
            }
            pending.remove(bolt11)
        };

        match payment {
            Some(payment) => {
                payment.succeed(PaymentSuccess {
                    preimage,
                    partner: Some(*peer),
                });
                true
            }
            None => false,
        }
    }

    /// Handles a `VirtualSendFailure` from `peer`. Returns `false` if no
    /// payment was waiting on `peer` for this invoice.
    pub async fn on_virtual_send_failure(
        &self,
        peer: &PublicKey,
        bolt11: &str,
        reason: Option<String>,
    ) -> bool {
        {
            let mut pending = self.pending.lock().await;
            if !Self::is_awaiting(&pending, bolt11, peer) {
                return false;
            }
            if let Some(payment) = pending.get_mut(bolt11) {
                payment.errors.push(AttemptError::Rejected {
                    peer: *peer,
                    reason: reason.unwrap_or_else(|| "no reason given".to_string()),
                });
            }
            if self.policy == FallbackPolicy::StopOnRejection {
                if let Some(payment) = pending.remove(bolt11) {
                    payment.fail();
                }
                return true;
            }
        }

        self.attempt_virtual_send(bolt11).await;
        true
    }

    fn is_awaiting(
        pending: &HashMap<String, PendingPayment>,
        bolt11: &str,
        peer: &PublicKey,
    ) -> bool {
        match pending.get(bolt11).and_then(|p| p.awaiting()) {
            Some(awaited) if awaited == *peer => true,
            Some(awaited) => {
                log::warn!(
                    "Ignoring reply for {} from {}, waiting on {}",
                    bolt11,
                    peer,
                    awaited
                );
                false
            }
            None => {
                log::debug!("Ignoring reply for {} from {}, nothing pending", bolt11, peer);
                false
            }
        }
    }

    pub async fn state(&self, bolt11: &str) -> Option<PaymentState> {
        self.pending.lock().await.get(bolt11).map(|p| p.state)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
