//! Hook and RPC method handlers registered with lightningd.
//!
//! Handlers translate between lightningd's JSON and the service; no
//! protocol logic lives here.

use crate::core::payment::{PaymentError, PaymentRequest};
use crate::core::service::VirtualChannelService;
use crate::model::{CustomMsgHook, HtlcAcceptedRequest, HtlcAcceptedResponse};
use crate::proto::primitives::Msat;
use anyhow::{anyhow, Context};
use bitcoin::secp256k1::PublicKey;
use cln_plugin::Plugin;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Clone)]
pub struct State {
    pub service: Arc<VirtualChannelService>,
}

impl State {
    pub fn new(service: Arc<VirtualChannelService>) -> Self {
        Self { service }
    }
}

// ============================================================================
// Hooks
// ============================================================================

pub async fn on_htlc_accepted(p: Plugin<State>, v: Value) -> Result<Value, anyhow::Error> {
    let hook: HtlcAcceptedRequest = match serde_json::from_value(v) {
        Ok(hook) => hook,
        Err(e) => {
            warn!("Could not parse htlc_accepted payload, passing it on: {}", e);
            return Ok(serde_json::to_value(HtlcAcceptedResponse::continue_())?);
        }
    };
    let htlc = hook.htlc;

    let decision = p
        .state()
        .service
        .decide_htlc(htlc.payment_hash, htlc.amount_msat, htlc.current_height())
        .await;
    debug!("htlc for payment_hash {}: {:?}", htlc.payment_hash, decision);

    Ok(serde_json::to_value(HtlcAcceptedResponse::from(decision))?)
}

/// Always lets lightningd continue. Our messages are handled on a separate
/// task since answering an `InitVirtualSend` means paying an invoice.
pub async fn on_custommsg(p: Plugin<State>, v: Value) -> Result<Value, anyhow::Error> {
    let continue_response = Ok(json!({
      "result": "continue"
    }));

    let msg: CustomMsgHook = match serde_json::from_value(v) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("invalid custommsg: {}", e);
            return continue_response;
        }
    };
    let peer = match PublicKey::from_str(&msg.peer_id) {
        Ok(peer) => peer,
        Err(e) => {
            warn!("invalid peer_id {} in custommsg: {}", msg.peer_id, e);
            return continue_response;
        }
    };

    let service = p.state().service.clone();
    tokio::spawn(async move {
        if let Some(reply) = service.handle_peer_message(peer, &msg.payload).await {
            if let Err(e) = service.send_reply(&reply).await {
                warn!("Failed to send reply to {}: {:#}", reply.peer, e);
            }
        }
    });

    continue_response
}

// ============================================================================
// RPC methods
// ============================================================================

/// lightningd passes parameters either by name or by position.
fn parse_params<T: DeserializeOwned>(v: Value, names: &[&str]) -> Result<T, anyhow::Error> {
    let v = match v {
        Value::Array(values) => {
            if values.len() > names.len() {
                return Err(anyhow!("too many parameters, expected {:?}", names));
            }
            Value::Object(
                names
                    .iter()
                    .zip(values)
                    .map(|(name, value)| (name.to_string(), value))
                    .collect(),
            )
        }
        v => v,
    };
    serde_json::from_value(v).with_context(|| format!("invalid parameters, expected {:?}", names))
}

#[derive(Debug, Deserialize)]
struct OpenParams {
    peer_id: PublicKey,
}

pub async fn on_virtualchannel_open(p: Plugin<State>, v: Value) -> Result<Value, anyhow::Error> {
    let params: OpenParams = parse_params(v, &["peer_id"])?;
    p.state()
        .service
        .open_incoming_trust(params.peer_id)
        .await?;
    Ok(json!({ "peer_id": params.peer_id }))
}

pub async fn on_virtualchannel_list(p: Plugin<State>, _v: Value) -> Result<Value, anyhow::Error> {
    let listing = p.state().service.list_channels().await;
    Ok(serde_json::to_value(listing)?)
}

pub async fn on_virtualpay(p: Plugin<State>, v: Value) -> Result<Value, anyhow::Error> {
    let request: PaymentRequest = parse_params(
        v,
        &[
            "bolt11",
            "amount_msat",
            "label",
            "riskfactor",
            "maxfee_msat",
            "retry_for",
            "maxdelay",
            "exemptfee_msat",
        ],
    )?;
    let bolt11 = request.bolt11.clone();

    let handle = p.state().service.start_payment(request).await?;
    match handle.wait().await {
        Ok(success) => Ok(json!({
            "bolt11": bolt11,
            "payment_preimage": success.preimage,
            "partner": success.partner,
        })),
        Err(PaymentError::Exhausted { errors }) => Err(anyhow!(
            "payment of {} failed after {} attempts: {}",
            bolt11,
            errors.len(),
            serde_json::to_string(&errors)?
        )),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
struct InvoiceParams {
    amount_msat: Msat,
    label: String,
    description: String,
}

pub async fn on_virtualinvoice(p: Plugin<State>, v: Value) -> Result<Value, anyhow::Error> {
    let params: InvoiceParams = parse_params(v, &["amount_msat", "label", "description"])?;
    let invoice = p
        .state()
        .service
        .create_virtual_invoice(params.amount_msat, &params.label, &params.description)
        .await?;
    Ok(serde_json::to_value(invoice)?)
}
