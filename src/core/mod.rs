//! Foundational and often-reused types.

pub(crate) mod bucket;
pub(crate) mod contact;
pub(crate) mod id;
pub mod message;
pub(crate) mod routing_table;
pub(crate) mod traits;
pub(crate) mod transaction;
