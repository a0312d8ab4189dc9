use bitcoin::hashes::{sha256, Hash};
use serde::{
    de::{Error, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};

// lightningd renders amounts either as plain integers or with this suffix.
const MSAT_SUFFIX: &str = "msat";

/// A monetary amount in millisatoshis. Serializes as a plain integer and
/// accepts both `1000` and `"1000msat"` on the way in, matching what
/// lightningd emits in hooks and RPC responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Msat(pub u64);

impl Msat {
    pub fn msat(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for Msat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}msat", self.0)
    }
}

impl Serialize for Msat {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

struct MsatVisitor;

impl<'de> Visitor<'de> for MsatVisitor {
    type Value = Msat;

    fn expecting(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
        formatter.write_str("an integer or a string formatted as '<numeric_value>msat'")
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: Error,
    {
        Ok(Msat(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: Error,
    {
        u64::try_from(v)
            .map(Msat)
            .map_err(|_| Error::invalid_value(serde::de::Unexpected::Signed(v), &self))
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: Error,
    {
        let digits = value.strip_suffix(MSAT_SUFFIX).unwrap_or(value);
        digits.parse::<u64>().map(Msat).map_err(|e| {
            Error::custom(format!(
                "Failed to parse '{}' as u64 (from '{}'): {}",
                digits, value, e
            ))
        })
    }
}

impl<'de> Deserialize<'de> for Msat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(MsatVisitor)
    }
}

/// Parse a 64 character hex string into 32 bytes.
pub fn parse_hash32(hex_str: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_str).ok()?;
    bytes.try_into().ok()
}

macro_rules! hex_bytes32 {
    ($name:ident, $what:literal) => {
        impl $name {
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                <[u8; 32]>::try_from(bytes).ok().map($name)
            }

            pub fn from_hex(hex_str: &str) -> Option<Self> {
                parse_hash32(hex_str).map($name)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                $name::from_hex(&s)
                    .ok_or_else(|| Error::custom(format!("{} must be 32 hex encoded bytes", $what)))
            }
        }
    };
}

/// The secret whose disclosure settles a payment.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Preimage(pub [u8; 32]);

hex_bytes32!(Preimage, "preimage");

impl Preimage {
    /// The payment hash committing to this preimage.
    pub fn payment_hash(&self) -> PaymentHash {
        PaymentHash(sha256::Hash::hash(&self.0).to_byte_array())
    }
}

// Keep secrets out of debug logs.
impl std::fmt::Debug for Preimage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Preimage({}..)", &self.to_hex()[..8])
    }
}

/// SHA256 commitment to a [`Preimage`], identifying a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaymentHash(pub [u8; 32]);

hex_bytes32!(PaymentHash, "payment_hash");
