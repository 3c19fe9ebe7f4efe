//! Zero-Trust control plane core for a small IoT LAN.
//!
//! See each module for its corresponding component (spec §2 C1-C13).

pub mod admission;
pub mod anomaly;
pub mod attestation;
pub mod ca;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod flows;
pub mod identity;
pub mod mac;
pub mod orchestration;
pub mod policy;
pub mod profiling;
pub mod session;
pub mod supervisor;
pub mod trust;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use supervisor::{Collaborators, Supervisor};
