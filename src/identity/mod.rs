//! Identity Store (C1): durable device registry, baselines, policies, and
//! trust history (spec §4.1).

pub mod store;

pub use store::{derive_fingerprint, IdentityStore};
