//! Wire messages of the virtual channel protocol.
//!
//! Every message is a 2 byte big-endian type followed by a TLV stream. The
//! types live in the odd custom range so that peers without this plugin
//! simply drop them.

use bytes::BufMut;
use thiserror::Error;

use crate::core::tlv::{read_tu64, TlvError, TlvStream};
use crate::proto::primitives::{Msat, Preimage};

pub const INIT_VIRTUAL_CHANNEL_TYPE: u16 = 0xFFA7;
pub const INIT_VIRTUAL_RECEIVE_TYPE: u16 = 0xFFA9;
pub const INIT_VIRTUAL_SEND_TYPE: u16 = 0xFFAF;
pub const VIRTUAL_SEND_SUCCESS_TYPE: u16 = 0xFFB1;
pub const VIRTUAL_SEND_FAILURE_TYPE: u16 = 0xFFB3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("message is shorter than its type prefix")]
    MissingType,
    #[error("malformed tlv stream: {0}")]
    Tlv(#[from] TlvError),
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("unknown even field type {0}")]
    UnknownEvenField(u64),
    #[error("field {field} must be {expected} bytes, got {actual}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("field {0} is not ascii text")]
    NotAscii(&'static str),
}

/// A peer announces that it trusts us: we may ask it to send or receive on
/// our behalf from now on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitVirtualChannel;

/// A peer hands us the preimage of one of its invoices so we can settle
/// HTLCs paying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitVirtualReceive {
    pub preimage: Preimage,
    pub bolt11: String,
}

/// Payment parameters forwarded to a partner that should pay `bolt11` for us.
/// Unset fields fall back to the partner's `pay` defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitVirtualSend {
    pub bolt11: String,
    pub amount_msat: Option<Msat>,
    pub label: Option<String>,
    pub riskfactor: Option<u64>,
    pub maxfee_msat: Option<Msat>,
    pub retry_for: Option<u64>,
    pub maxdelay: Option<u64>,
    pub exemptfee_msat: Option<Msat>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualSendSuccess {
    pub bolt11: String,
    pub preimage: Preimage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualSendFailure {
    pub bolt11: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    InitVirtualChannel(InitVirtualChannel),
    InitVirtualReceive(InitVirtualReceive),
    InitVirtualSend(InitVirtualSend),
    VirtualSendSuccess(VirtualSendSuccess),
    VirtualSendFailure(VirtualSendFailure),
}

/// Escapes everything outside ascii so free-form text, such as a host error,
/// can be carried in a text field.
pub fn ascii_text(s: &str) -> String {
    if s.is_ascii() {
        return s.to_string();
    }
    s.chars()
        .map(|c| {
            if c.is_ascii() {
                c.to_string()
            } else {
                c.escape_unicode().to_string()
            }
        })
        .collect()
}

impl Message {
    pub fn message_type(&self) -> u16 {
        match self {
            Message::InitVirtualChannel(_) => INIT_VIRTUAL_CHANNEL_TYPE,
            Message::InitVirtualReceive(_) => INIT_VIRTUAL_RECEIVE_TYPE,
            Message::InitVirtualSend(_) => INIT_VIRTUAL_SEND_TYPE,
            Message::VirtualSendSuccess(_) => VIRTUAL_SEND_SUCCESS_TYPE,
            Message::VirtualSendFailure(_) => VIRTUAL_SEND_FAILURE_TYPE,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut s = TlvStream::new();
        match self {
            Message::InitVirtualChannel(_) => {}
            Message::InitVirtualReceive(m) => {
                s.set_bytes(0, m.preimage.as_bytes());
                s.set_bytes(2, m.bolt11.as_bytes());
            }
            Message::InitVirtualSend(m) => {
                s.set_bytes(0, m.bolt11.as_bytes());
                if let Some(v) = m.amount_msat {
                    s.set_tu64(2, v.msat());
                }
                if let Some(v) = &m.label {
                    s.set_bytes(4, v.as_bytes());
                }
                if let Some(v) = m.riskfactor {
                    s.set_tu64(6, v);
                }
                if let Some(v) = m.maxfee_msat {
                    s.set_tu64(8, v.msat());
                }
                if let Some(v) = m.retry_for {
                    s.set_tu64(10, v);
                }
                if let Some(v) = m.maxdelay {
                    s.set_tu64(12, v);
                }
                if let Some(v) = m.exemptfee_msat {
                    s.set_tu64(14, v.msat());
                }
            }
            Message::VirtualSendSuccess(m) => {
                s.set_bytes(0, m.bolt11.as_bytes());
                s.set_bytes(2, m.preimage.as_bytes());
            }
            Message::VirtualSendFailure(m) => {
                s.set_bytes(0, m.bolt11.as_bytes());
                if let Some(v) = &m.reason {
                    s.set_bytes(2, v.as_bytes());
                }
            }
        }

        let mut b = Vec::new();
        b.put_u16(self.message_type());
        b.extend_from_slice(&s.to_bytes());
        b
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.encode())
    }

    /// Decodes a raw custom message.
    ///
    /// Returns `Ok(None)` if the type is not one of ours, so callers can let
    /// other handlers deal with it.
    pub fn decode(bytes: &[u8]) -> Result<Option<Message>, DecodeError> {
        if bytes.len() < 2 {
            return Err(DecodeError::MissingType);
        }
        let typ = u16::from_be_bytes([bytes[0], bytes[1]]);
        let known = [
            INIT_VIRTUAL_CHANNEL_TYPE,
            INIT_VIRTUAL_RECEIVE_TYPE,
            INIT_VIRTUAL_SEND_TYPE,
            VIRTUAL_SEND_SUCCESS_TYPE,
            VIRTUAL_SEND_FAILURE_TYPE,
        ];
        if !known.contains(&typ) {
            return Ok(None);
        }

        let fields = Fields::parse(&bytes[2..])?;
        let msg = match typ {
            INIT_VIRTUAL_CHANNEL_TYPE => {
                fields.finish(&[])?;
                Message::InitVirtualChannel(InitVirtualChannel)
            }
            INIT_VIRTUAL_RECEIVE_TYPE => {
                fields.finish(&[0, 2])?;
                Message::InitVirtualReceive(InitVirtualReceive {
                    preimage: fields.required_preimage(0, "preimage")?,
                    bolt11: fields.required_text(2, "bolt11")?,
                })
            }
            INIT_VIRTUAL_SEND_TYPE => {
                fields.finish(&[0, 2, 4, 6, 8, 10, 12, 14])?;
                Message::InitVirtualSend(InitVirtualSend {
                    bolt11: fields.required_text(0, "bolt11")?,
                    amount_msat: fields.tu64(2)?.map(Msat),
                    label: fields.text(4, "label")?,
                    riskfactor: fields.tu64(6)?,
                    maxfee_msat: fields.tu64(8)?.map(Msat),
                    retry_for: fields.tu64(10)?,
                    maxdelay: fields.tu64(12)?,
                    exemptfee_msat: fields.tu64(14)?.map(Msat),
                })
            }
            VIRTUAL_SEND_SUCCESS_TYPE => {
                fields.finish(&[0, 2])?;
                Message::VirtualSendSuccess(VirtualSendSuccess {
                    bolt11: fields.required_text(0, "bolt11")?,
                    preimage: fields.required_preimage(2, "preimage")?,
                })
            }
            _ => {
                fields.finish(&[0, 2])?;
                Message::VirtualSendFailure(VirtualSendFailure {
                    bolt11: fields.required_text(0, "bolt11")?,
                    reason: fields.text(2, "reason")?,
                })
            }
        };
        Ok(Some(msg))
    }
}

struct Fields(TlvStream);

impl Fields {
    fn parse(b: &[u8]) -> Result<Self, DecodeError> {
        Ok(Fields(TlvStream::from_bytes(b)?))
    }

    /// Rejects unknown even fields; unknown odd fields are skipped.
    fn finish(&self, known: &[u64]) -> Result<(), DecodeError> {
        let TlvStream(entries) = &self.0;
        match entries
            .iter()
            .find(|e| e.typ % 2 == 0 && !known.contains(&e.typ))
        {
            Some(e) => Err(DecodeError::UnknownEvenField(e.typ)),
            None => Ok(()),
        }
    }

    fn tu64(&self, typ: u64) -> Result<Option<u64>, DecodeError> {
        self.0
            .get(typ)
            .map(|e| read_tu64(&e.value))
            .transpose()
            .map_err(DecodeError::from)
    }

    fn text(&self, typ: u64, name: &'static str) -> Result<Option<String>, DecodeError> {
        match self.0.get(typ) {
            None => Ok(None),
            Some(e) if e.value.is_ascii() => {
                Ok(Some(String::from_utf8_lossy(&e.value).into_owned()))
            }
            Some(_) => Err(DecodeError::NotAscii(name)),
        }
    }

    fn required_text(&self, typ: u64, name: &'static str) -> Result<String, DecodeError> {
        self.text(typ, name)?.ok_or(DecodeError::MissingField(name))
    }

    fn required_preimage(&self, typ: u64, name: &'static str) -> Result<Preimage, DecodeError> {
        let e = self.0.get(typ).ok_or(DecodeError::MissingField(name))?;
        Preimage::from_slice(&e.value).ok_or(DecodeError::InvalidLength {
            field: name,
            expected: 32,
            actual: e.value.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOLT11: &str = "lnbcrt90u1pjtestinvoice";

    fn all_variants() -> Vec<Message> {
        vec![
            Message::InitVirtualChannel(InitVirtualChannel),
            Message::InitVirtualReceive(InitVirtualReceive {
                preimage: Preimage([0xab; 32]),
                bolt11: BOLT11.to_string(),
            }),
            Message::InitVirtualSend(InitVirtualSend {
                bolt11: BOLT11.to_string(),
                ..Default::default()
            }),
            Message::InitVirtualSend(InitVirtualSend {
                bolt11: BOLT11.to_string(),
                amount_msat: Some(Msat(9_000_000)),
                label: Some("coffee".to_string()),
                riskfactor: Some(10),
                maxfee_msat: Some(Msat(5_000)),
                retry_for: Some(60),
                maxdelay: Some(2016),
                exemptfee_msat: Some(Msat(u64::MAX)),
            }),
            Message::VirtualSendSuccess(VirtualSendSuccess {
                bolt11: BOLT11.to_string(),
                preimage: Preimage([7; 32]),
            }),
            Message::VirtualSendFailure(VirtualSendFailure {
                bolt11: BOLT11.to_string(),
                reason: Some("no route".to_string()),
            }),
            Message::VirtualSendFailure(VirtualSendFailure {
                bolt11: BOLT11.to_string(),
                reason: None,
            }),
        ]
    }

    #[test]
    fn test_every_variant_decodes_to_itself() {
        for msg in all_variants() {
            let decoded = Message::decode(&msg.encode()).unwrap();
            assert_eq!(decoded, Some(msg));
        }
    }

    #[test]
    fn test_type_prefix_is_big_endian() {
        let raw = Message::InitVirtualChannel(InitVirtualChannel).encode();
        assert_eq!(raw, vec![0xff, 0xa7]);
        let raw = Message::VirtualSendFailure(VirtualSendFailure {
            bolt11: "x".to_string(),
            reason: None,
        })
        .encode();
        assert_eq!(raw, vec![0xff, 0xb3, 0x00, 0x01, b'x']);
    }

    #[test]
    fn test_unknown_type_is_no_match() {
        let mut raw = vec![0xde, 0xad];
        raw.extend_from_slice(&[1, 2, 3, 4, 5]);
        assert_eq!(Message::decode(&raw), Ok(None));
    }

    #[test]
    fn test_too_short_is_an_error() {
        assert_eq!(Message::decode(&[]), Err(DecodeError::MissingType));
        assert_eq!(Message::decode(&[0xff]), Err(DecodeError::MissingType));
    }

    #[test]
    fn test_truncated_messages_never_decode() {
        for msg in all_variants() {
            let raw = msg.encode();
            for cut in 0..raw.len() {
                match Message::decode(&raw[..cut]) {
                    // Cutting exactly at a field boundary may drop an
                    // optional trailing field, which is a different but
                    // valid message. Anything else must fail.
                    Ok(Some(other)) => assert_ne!(other, msg),
                    Ok(None) => panic!("truncated {:?} lost its type", msg),
                    Err(_) => {}
                }
            }
        }
    }

    #[test]
    fn test_unset_optional_fields_are_omitted() {
        let msg = Message::InitVirtualSend(InitVirtualSend {
            bolt11: "b".to_string(),
            amount_msat: None,
            label: None,
            ..Default::default()
        });
        let raw = msg.encode();
        // type + a single bolt11 record
        assert_eq!(raw, vec![0xff, 0xaf, 0x00, 0x01, b'b']);

        match Message::decode(&raw).unwrap() {
            Some(Message::InitVirtualSend(m)) => {
                assert_eq!(m.amount_msat, None);
                assert_eq!(m.riskfactor, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_zero_amount_is_distinct_from_unset() {
        let msg = Message::InitVirtualSend(InitVirtualSend {
            bolt11: "b".to_string(),
            amount_msat: Some(Msat(0)),
            ..Default::default()
        });
        let raw = msg.encode();
        // Zero is a present record with an empty value.
        assert_eq!(raw, vec![0xff, 0xaf, 0x00, 0x01, b'b', 0x02, 0x00]);
        assert_eq!(Message::decode(&raw).unwrap(), Some(msg));
    }

    #[test]
    fn test_wrong_preimage_length() {
        let mut raw = vec![0xff, 0xb1];
        raw.extend_from_slice(&[0x00, 0x01, b'b']);
        raw.extend_from_slice(&[0x02, 0x03, 1, 2, 3]);
        assert_eq!(
            Message::decode(&raw),
            Err(DecodeError::InvalidLength {
                field: "preimage",
                expected: 32,
                actual: 3
            })
        );
    }

    #[test]
    fn test_missing_required_field() {
        // VirtualSendSuccess with only a preimage
        let mut raw = vec![0xff, 0xb1, 0x02, 0x20];
        raw.extend_from_slice(&[0u8; 32]);
        assert_eq!(
            Message::decode(&raw),
            Err(DecodeError::MissingField("bolt11"))
        );
    }

    #[test]
    fn test_unknown_fields() {
        // Odd unknown field is skipped.
        let raw = vec![0xff, 0xa7, 0x01, 0x01, 0xaa];
        assert_eq!(
            Message::decode(&raw),
            Ok(Some(Message::InitVirtualChannel(InitVirtualChannel)))
        );
        // Even unknown field is rejected.
        let raw = vec![0xff, 0xa7, 0x02, 0x01, 0xaa];
        assert_eq!(Message::decode(&raw), Err(DecodeError::UnknownEvenField(2)));
    }

    #[test]
    fn test_non_ascii_text_is_rejected() {
        let raw = vec![0xff, 0xb3, 0x00, 0x02, 0xc3, 0xa9];
        assert_eq!(Message::decode(&raw), Err(DecodeError::NotAscii("bolt11")));
    }

    #[test]
    fn test_hex_encoding() {
        let msg = Message::InitVirtualChannel(InitVirtualChannel);
        assert_eq!(msg.to_hex(), "ffa7");
    }

    #[test]
    fn test_escaped_reason_round_trips() {
        assert_eq!(ascii_text("plain text\n"), "plain text\n");
        assert_eq!(ascii_text("für"), "f\\u{fc}r");

        let msg = Message::VirtualSendFailure(VirtualSendFailure {
            bolt11: BOLT11.to_string(),
            reason: Some(ascii_text("kein Weg gefunden: Zeitüberschreitung")),
        });
        assert_eq!(Message::decode(&msg.encode()), Ok(Some(msg)));
    }
}
