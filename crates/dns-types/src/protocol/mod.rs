//! The DNS message model, its wire codec, and the canonical text
//! rendering of resource records.

pub mod deserialise;
pub mod presentation;
pub mod serialise;
pub mod types;
