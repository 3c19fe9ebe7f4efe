//! External collaborator capabilities (spec §6, §9).
//!
//! The source probes for optional imports with `hasattr`; here each
//! collaborator is an explicit trait with a null-object default so presence
//! is a Supervisor-startup configuration decision rather than runtime
//! reflection.

pub mod honeypot;
pub mod ml_predictor;
pub mod rule_installer;

pub use honeypot::{HoneypotLogSource, NullHoneypotSource};
pub use ml_predictor::{MlPredictor, MlPrediction, NullMlPredictor};
pub use rule_installer::{NullRuleInstaller, RuleInstaller};
