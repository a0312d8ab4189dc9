use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::htlc::HtlcDecision;
use crate::proto::primitives::{Msat, PaymentHash};

#[derive(Debug, Deserialize)]
#[allow(unused)]
pub struct Htlc {
    pub id: Option<u64>,
    pub amount_msat: Msat,
    pub cltv_expiry: u32,
    pub cltv_expiry_relative: i64,
    pub payment_hash: PaymentHash,
}

impl Htlc {
    /// Block height lightningd evaluated the HTLC at.
    pub fn current_height(&self) -> u32 {
        let height = i64::from(self.cltv_expiry) - self.cltv_expiry_relative;
        height.clamp(0, i64::from(u32::MAX)) as u32
    }
}

/// The part of the `htlc_accepted` payload we look at. The onion and
/// forwarding fields are left to lightningd.
#[derive(Debug, Deserialize)]
pub struct HtlcAcceptedRequest {
    pub htlc: Htlc,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct HtlcAcceptedResponse {
    pub result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "to_hex")]
    pub failure_message: Option<Vec<u8>>,
}

impl HtlcAcceptedResponse {
    pub fn continue_() -> Self {
        Self {
            result: "continue",
            payment_key: None,
            failure_message: None,
        }
    }
}

impl From<HtlcDecision> for HtlcAcceptedResponse {
    fn from(decision: HtlcDecision) -> Self {
        match decision {
            HtlcDecision::Resolve { preimage } => Self {
                result: "resolve",
                payment_key: Some(preimage.to_hex()),
                failure_message: None,
            },
            HtlcDecision::Fail { failure_message } => Self {
                result: "fail",
                payment_key: None,
                failure_message: Some(failure_message),
            },
            HtlcDecision::Continue => Self::continue_(),
        }
    }
}

/// Payload of the `custommsg` hook. `payload` carries the message type
/// followed by the message body.
#[derive(Debug, Deserialize)]
pub struct CustomMsgHook {
    pub peer_id: String,
    #[serde(deserialize_with = "from_hex")]
    pub payload: Vec<u8>,
}

/// Deserializes a lowercase hex string to a `Vec<u8>`.
pub fn from_hex<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    String::deserialize(deserializer)
        .and_then(|string| hex::decode(string).map_err(|err| Error::custom(err.to_string())))
}

pub fn to_hex<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match bytes {
        Some(data) => serializer.serialize_str(&hex::encode(data)),
        None => serializer.serialize_none(),
    }
}
