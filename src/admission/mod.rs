//! Pending Admission Queue (C3) and Admission Service (C4) — spec §4.3, §4.4.

pub mod queue;
pub mod service;

pub use queue::{EnqueueOutcome, PendingQueue};
pub use service::{AdmissionService, LinkLayerEventSource, NullLinkLayerEventSource};
