//! BOLT #1 style type-length-value streams.
//!
//! Types and lengths are BigSize varints, values are raw bytes. Unlike the
//! hook-side TLV payloads lightningd hands us, these streams come straight
//! off the wire from a peer, so every read is bounds checked and returns a
//! [`TlvError`] instead of panicking.

use bytes::{Buf, BufMut};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TlvError {
    #[error("unexpected end of stream while reading {0}")]
    Truncated(&'static str),
    #[error("non-minimal bigsize encoding")]
    NonMinimalBigSize,
    #[error("tlv type {current} does not follow {previous}")]
    NotIncreasing { previous: u64, current: u64 },
    #[error("non-minimal tu64 encoding")]
    NonMinimalTu64,
    #[error("tu64 value is {0} bytes long")]
    Tu64TooLong(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvEntry {
    pub typ: u64,
    pub value: Vec<u8>,
}

/// An ordered set of TLV records, sorted by type with no duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvStream(pub Vec<TlvEntry>);

impl TlvStream {
    pub fn new() -> Self {
        Self(vec![])
    }

    pub fn get(&self, typ: u64) -> Option<&TlvEntry> {
        self.0.iter().find(|e| e.typ == typ)
    }

    /// Inserts or replaces the record of type `typ`, keeping the stream sorted.
    pub fn set_bytes<T>(&mut self, typ: u64, val: T)
    where
        T: AsRef<[u8]>,
    {
        let value = val.as_ref().to_vec();
        match self.0.binary_search_by_key(&typ, |e| e.typ) {
            Ok(i) => self.0[i].value = value,
            Err(i) => self.0.insert(i, TlvEntry { typ, value }),
        }
    }

    pub fn set_tu64(&mut self, typ: u64, val: u64) {
        let mut b = bytes::BytesMut::new();
        b.put_tu64(val);
        self.set_bytes(typ, b)
    }

    /// Parses a complete stream. Types must be strictly increasing.
    pub fn from_bytes(mut b: &[u8]) -> Result<Self, TlvError> {
        let mut entries: Vec<TlvEntry> = vec![];
        while b.has_remaining() {
            let typ = b.try_get_bigsize("type")?;
            if let Some(last) = entries.last() {
                if typ <= last.typ {
                    return Err(TlvError::NotIncreasing {
                        previous: last.typ,
                        current: typ,
                    });
                }
            }
            let len = b.try_get_bigsize("length")?;
            if (b.remaining() as u64) < len {
                return Err(TlvError::Truncated("value"));
            }
            let value = b[..len as usize].to_vec();
            b.advance(len as usize);
            entries.push(TlvEntry { typ, value });
        }
        Ok(TlvStream(entries))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = bytes::BytesMut::new();
        for e in self.0.iter() {
            b.put_bigsize(e.typ);
            b.put_bigsize(e.value.len() as u64);
            b.put_slice(&e.value);
        }
        b.to_vec()
    }
}

/// Decodes a truncated big-endian u64 occupying the whole of `value`.
pub fn read_tu64(value: &[u8]) -> Result<u64, TlvError> {
    if value.len() > 8 {
        return Err(TlvError::Tu64TooLong(value.len()));
    }
    if value.first() == Some(&0) {
        return Err(TlvError::NonMinimalTu64);
    }
    Ok(value.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Fallible reads of the Lightning wire primitives.
pub trait ProtoBuf: Buf {
    fn try_get_bigsize(&mut self, what: &'static str) -> Result<u64, TlvError> {
        if !self.has_remaining() {
            return Err(TlvError::Truncated(what));
        }
        let (width, min) = match self.get_u8() {
            0xfd => (2, 0xfd),
            0xfe => (4, 0x1_0000),
            0xff => (8, 0x1_0000_0000),
            v => return Ok(v.into()),
        };
        if self.remaining() < width {
            return Err(TlvError::Truncated(what));
        }
        let v = match width {
            2 => self.get_u16().into(),
            4 => self.get_u32().into(),
            _ => self.get_u64(),
        };
        if v < min {
            return Err(TlvError::NonMinimalBigSize);
        }
        Ok(v)
    }
}

impl ProtoBuf for &[u8] {}

pub trait ProtoBufMut: BufMut {
    fn put_bigsize(&mut self, v: u64) {
        match v {
            0..=0xfc => self.put_u8(v as u8),
            0xfd..=0xffff => {
                self.put_u8(0xfd);
                self.put_u16(v as u16);
            }
            0x1_0000..=0xffff_ffff => {
                self.put_u8(0xfe);
                self.put_u32(v as u32);
            }
            v => {
                self.put_u8(0xff);
                self.put_u64(v);
            }
        }
    }

    /// Writes `u` big-endian without leading zero bytes; zero is empty.
    fn put_tu64(&mut self, u: u64) {
        let b = u.to_be_bytes();
        let skip = (u.leading_zeros() / 8) as usize;
        self.put_slice(&b[skip..]);
    }
}

impl ProtoBufMut for bytes::BytesMut {}
impl ProtoBufMut for Vec<u8> {}
