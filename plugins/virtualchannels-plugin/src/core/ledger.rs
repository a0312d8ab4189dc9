//! Pending receive obligations, keyed by payment hash.
//!
//! Records are written when a trusted peer hands us the preimage for one of
//! its invoices and read by the HTLC decision path. Nothing is ever evicted:
//! expired or already settled records stay until the process exits, so the
//! ledger grows with every announced invoice.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::proto::primitives::{Msat, PaymentHash, Preimage};

/// The parts of a decoded invoice the decision engine checks against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceTerms {
    pub payment_hash: PaymentHash,
    /// `None` for amountless invoices.
    pub amount_msat: Option<Msat>,
    /// Unix timestamp the invoice was issued at.
    pub created_at: u64,
    /// Seconds after `created_at` the invoice stays payable.
    pub expiry: u64,
}

impl InvoiceTerms {
    /// Unix timestamp at which the invoice expires, `None` on overflow.
    pub fn expires_at(&self) -> Option<u64> {
        self.created_at.checked_add(self.expiry)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRecord {
    pub preimage: Preimage,
    pub bolt11: String,
    pub terms: InvoiceTerms,
}

#[derive(Debug, Default)]
pub struct ReceiveLedger {
    records: Mutex<HashMap<PaymentHash, ReceiveRecord>>,
}

impl ReceiveLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `record`, replacing any earlier one for the same hash. Peers
    /// may re-announce an invoice, the latest announcement wins.
    pub async fn record_receive(&self, payment_hash: PaymentHash, record: ReceiveRecord) {
        let mut records = self.records.lock().await;
        if records.insert(payment_hash, record).is_some() {
            log::debug!("Replaced receive record for payment_hash {}", payment_hash);
        }
    }

    pub async fn lookup(&self, payment_hash: &PaymentHash) -> Option<ReceiveRecord> {
        self.records.lock().await.get(payment_hash).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}
