//! Bencode encoding and decoding, the serialization used by KRPC messages and routing table
//! snapshots.
//!
//! Four types are supported: integers (`i42e`), byte strings (`4:spam`), lists (`l...e`) and
//! dictionaries (`d...e`) with byte string keys. Dictionaries are backed by a [`BTreeMap`] so
//! keys are always encoded in sorted order.
//!
//! [`BTreeMap`]: std::collections::BTreeMap

mod decode;
mod encode;
mod value;

use thiserror::Error;

pub use decode::decode;
pub use encode::encode;
pub use value::Value;
pub(crate) use value::dict;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid byte string length")]
    InvalidLength,

    #[error("unexpected byte {0:#04x} at offset {1}")]
    UnexpectedByte(u8, usize),

    #[error("dictionary keys must be byte strings")]
    NonStringKey,

    #[error("trailing data after value")]
    TrailingData,

    #[error("nesting too deep")]
    NestingTooDeep,
}
