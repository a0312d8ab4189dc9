use anyhow::Result;
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;

use crate::core::ledger::InvoiceTerms;
use crate::core::payment::PaymentRequest;
use crate::proto::messages::Message;
use crate::proto::primitives::{Msat, Preimage};

/// The node's own payment primitive.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Pays an invoice and returns the preimage proving it.
    async fn pay(&self, request: &PaymentRequest) -> Result<Preimage>;
}

/// Delivers protocol messages to peers.
#[async_trait]
pub trait PeerMessenger: Send + Sync {
    /// Fails synchronously if the message could not be handed to the peer,
    /// e.g. because it is not connected.
    async fn send_message(&self, peer: &PublicKey, message: &Message) -> Result<()>;
}

#[async_trait]
pub trait PeerProvider: Send + Sync {
    async fn is_connected(&self, peer: &PublicKey) -> Result<bool>;
}

#[async_trait]
pub trait InvoiceProvider: Send + Sync {
    async fn decode_invoice(&self, bolt11: &str) -> Result<InvoiceTerms>;

    /// Creates an invoice committing to `preimage` and returns its bolt11.
    async fn create_invoice(
        &self,
        amount: Msat,
        label: &str,
        description: &str,
        preimage: &Preimage,
    ) -> Result<String>;
}
