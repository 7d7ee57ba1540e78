//! Spec serializer & fingerprinter (§4.1).
//!
//! [`value`] models the tagged-sum argument representation; [`canonical`]
//! turns any `serde_json::Value` (including the plain JSON a [`value::Value`]
//! lowers to) into the canonical byte form the fingerprint is computed over.

pub mod canonical;
pub mod value;

pub use canonical::{canonical_json, fingerprint};
pub use value::Value;
