use crate::{
    core::ledger::InvoiceTerms,
    core::payment::PaymentRequest,
    core::provider::{InvoiceProvider, PaymentProvider, PeerMessenger, PeerProvider},
    proto::messages::Message,
    proto::primitives::{Msat, PaymentHash, Preimage},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use cln_rpc::ClnRpc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Invoices without an explicit expiry are valid for an hour.
const DEFAULT_INVOICE_EXPIRY: u64 = 3600;

#[derive(Clone)]
pub struct ClnApiRpc {
    rpc_path: PathBuf,
}

impl ClnApiRpc {
    pub fn new(rpc_path: PathBuf) -> Self {
        Self { rpc_path }
    }

    async fn create_rpc(&self) -> Result<ClnRpc> {
        ClnRpc::new(&self.rpc_path).await
    }
}

// -------------------------------------------------------------------------
// Requests and responses of the lightningd methods we call
// -------------------------------------------------------------------------

/// `pay` parameters. lightningd takes the fee limits as `maxfee` and
/// `exemptfee`, both in msat.
#[derive(Debug, Serialize)]
struct PayRequest<'a> {
    bolt11: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    amount_msat: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    riskfactor: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    maxfee: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_for: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    maxdelay: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exemptfee: Option<u64>,
}

impl<'a> From<&'a PaymentRequest> for PayRequest<'a> {
    fn from(r: &'a PaymentRequest) -> Self {
        PayRequest {
            bolt11: &r.bolt11,
            amount_msat: r.amount_msat.map(|a| a.msat()),
            label: r.label.as_deref(),
            riskfactor: r.riskfactor,
            maxfee: r.maxfee_msat.map(|a| a.msat()),
            retry_for: r.retry_for,
            maxdelay: r.maxdelay,
            exemptfee: r.exemptfee_msat.map(|a| a.msat()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PayResponse {
    payment_preimage: Preimage,
}

#[derive(Debug, Serialize)]
struct SendCustomMsgRequest {
    node_id: String,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct SendCustomMsgResponse {
    #[allow(unused)]
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListPeersRequest {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ListPeersResponse {
    peers: Vec<ListPeersPeer>,
}

#[derive(Debug, Deserialize)]
struct ListPeersPeer {
    connected: bool,
}

#[derive(Debug, Serialize)]
struct DecodeRequest<'a> {
    string: &'a str,
}

#[derive(Debug, Deserialize)]
struct DecodeResponse {
    valid: bool,
    payment_hash: Option<PaymentHash>,
    amount_msat: Option<Msat>,
    created_at: Option<u64>,
    expiry: Option<u64>,
}

#[derive(Debug, Serialize)]
struct InvoiceRequest<'a> {
    amount_msat: u64,
    label: &'a str,
    description: &'a str,
    preimage: String,
}

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
    bolt11: String,
}

#[async_trait]
impl PaymentProvider for ClnApiRpc {
    async fn pay(&self, request: &PaymentRequest) -> Result<Preimage> {
        log::debug!("Calling pay for {}", request.bolt11);
        let mut rpc = self.create_rpc().await?;
        let res: PayResponse = rpc
            .call_raw("pay", &PayRequest::from(request))
            .await
            .map_err(anyhow::Error::new)
            .with_context(|| "calling pay")?;
        Ok(res.payment_preimage)
    }
}

#[async_trait]
impl PeerMessenger for ClnApiRpc {
    async fn send_message(&self, peer: &PublicKey, message: &Message) -> Result<()> {
        let mut rpc = self.create_rpc().await?;
        let _: SendCustomMsgResponse = rpc
            .call_raw(
                "sendcustommsg",
                &SendCustomMsgRequest {
                    node_id: peer.to_string(),
                    msg: message.to_hex(),
                },
            )
            .await
            .map_err(anyhow::Error::new)
            .with_context(|| format!("calling sendcustommsg to {}", peer))?;
        Ok(())
    }
}

#[async_trait]
impl PeerProvider for ClnApiRpc {
    async fn is_connected(&self, peer: &PublicKey) -> Result<bool> {
        let mut rpc = self.create_rpc().await?;
        let res: ListPeersResponse = rpc
            .call_raw(
                "listpeers",
                &ListPeersRequest {
                    id: peer.to_string(),
                },
            )
            .await
            .map_err(anyhow::Error::new)
            .with_context(|| "calling listpeers")?;
        Ok(res.peers.iter().any(|p| p.connected))
    }
}

#[async_trait]
impl InvoiceProvider for ClnApiRpc {
    async fn decode_invoice(&self, bolt11: &str) -> Result<InvoiceTerms> {
        let mut rpc = self.create_rpc().await?;
        let res: DecodeResponse = rpc
            .call_raw("decode", &DecodeRequest { string: bolt11 })
            .await
            .map_err(anyhow::Error::new)
            .with_context(|| "calling decode")?;
        terms_from_decode(res)
    }

    async fn create_invoice(
        &self,
        amount: Msat,
        label: &str,
        description: &str,
        preimage: &Preimage,
    ) -> Result<String> {
        let mut rpc = self.create_rpc().await?;
        let res: InvoiceResponse = rpc
            .call_raw(
                "invoice",
                &InvoiceRequest {
                    amount_msat: amount.msat(),
                    label,
                    description,
                    preimage: preimage.to_hex(),
                },
            )
            .await
            .map_err(anyhow::Error::new)
            .with_context(|| "calling invoice")?;
        Ok(res.bolt11)
    }
}

fn terms_from_decode(res: DecodeResponse) -> Result<InvoiceTerms> {
    if !res.valid {
        anyhow::bail!("invoice is not valid");
    }
    let payment_hash = res
        .payment_hash
        .context("decoded string is not a bolt11 invoice")?;
    let created_at = res.created_at.context("invoice has no creation time")?;
    Ok(InvoiceTerms {
        payment_hash,
        amount_msat: res.amount_msat,
        created_at,
        expiry: res.expiry.unwrap_or(DEFAULT_INVOICE_EXPIRY),
    })
}
