//! Decides what to do with an incoming HTLC.
//!
//! If a trusted peer announced the preimage for the HTLC's payment hash we
//! settle it on the peer's behalf, provided the invoice is still valid and
//! the HTLC pays enough. Everything else is left to lightningd.

use std::sync::Arc;

use bytes::BufMut;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::ledger::{ReceiveLedger, ReceiveRecord};
use crate::proto::primitives::{Msat, PaymentHash, Preimage};

/// BOLT #4 `PERM|15`.
pub const INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS: u16 = 0x4000 | 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HtlcDecision {
    /// Settle with the stored preimage.
    Resolve { preimage: Preimage },
    /// Fail back with an encoded BOLT #4 failure message.
    Fail { failure_message: Vec<u8> },
    /// Not ours, let lightningd handle it.
    Continue,
}

#[derive(Debug, Error)]
enum DecisionError {
    #[error("stored preimage does not hash to {0}")]
    PreimageMismatch(PaymentHash),
    #[error("invoice expiry overflows")]
    ExpiryOverflow,
    #[error("clock is before the unix epoch")]
    ClockBeforeEpoch,
}

/// Builds the `incorrect_or_unknown_payment_details` failure message:
/// `u16 code || u64 htlc_msat || u32 height`.
pub fn incorrect_or_unknown_payment_details(htlc_msat: Msat, height: u32) -> Vec<u8> {
    let mut b = Vec::with_capacity(14);
    b.put_u16(INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS);
    b.put_u64(htlc_msat.msat());
    b.put_u32(height);
    b
}

pub struct HtlcDecisionEngine {
    ledger: Arc<ReceiveLedger>,
}

impl HtlcDecisionEngine {
    pub fn new(ledger: Arc<ReceiveLedger>) -> Self {
        Self { ledger }
    }

    /// Never fails: an internal fault is logged and treated as `Continue`
    /// so that this plugin can not stall lightningd's settlement.
    pub async fn decide(
        &self,
        payment_hash: PaymentHash,
        offered: Msat,
        current_height: u32,
        now: DateTime<Utc>,
    ) -> HtlcDecision {
        let Some(record) = self.ledger.lookup(&payment_hash).await else {
            return HtlcDecision::Continue;
        };

        match evaluate(&record, payment_hash, offered, current_height, now) {
            Ok(decision) => decision,
            Err(e) => {
                log::warn!(
                    "Failed to evaluate htlc for payment_hash {}, passing it on: {}",
                    payment_hash,
                    e
                );
                HtlcDecision::Continue
            }
        }
    }
}

fn evaluate(
    record: &ReceiveRecord,
    payment_hash: PaymentHash,
    offered: Msat,
    current_height: u32,
    now: DateTime<Utc>,
) -> Result<HtlcDecision, DecisionError> {
    if record.preimage.payment_hash() != payment_hash {
        return Err(DecisionError::PreimageMismatch(payment_hash));
    }

    let expires_at = record
        .terms
        .expires_at()
        .ok_or(DecisionError::ExpiryOverflow)?;
    let now = u64::try_from(now.timestamp()).map_err(|_| DecisionError::ClockBeforeEpoch)?;

    let fail = HtlcDecision::Fail {
        failure_message: incorrect_or_unknown_payment_details(offered, current_height),
    };

    if now >= expires_at {
        log::info!(
            "Rejecting htlc for payment_hash {}: invoice expired at {}",
            payment_hash,
            expires_at
        );
        return Ok(fail);
    }

    if let Some(amount) = record.terms.amount_msat {
        if offered < amount {
            log::info!(
                "Rejecting htlc for payment_hash {}: offered {} < invoice amount {}",
                payment_hash,
                offered,
                amount
            );
            return Ok(fail);
        }
    }

    log::info!(
        "Resolving htlc for payment_hash {} on behalf of a virtual channel",
        payment_hash
    );
    Ok(HtlcDecision::Resolve {
        preimage: record.preimage,
    })
}
