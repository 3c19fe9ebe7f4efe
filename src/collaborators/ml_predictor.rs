//! ML attack classifier contract (spec §6). Advisory: absence is not an error.

use async_trait::async_trait;

/// Context handed to the predictor for one observed packet/flow.
#[derive(Debug, Clone, Default)]
pub struct PacketContext {
    pub device_id: Option<String>,
    pub protocol: String,
    pub pps: f64,
    pub bps: f64,
}

/// A prediction from the external ML attack classifier.
#[derive(Debug, Clone)]
pub struct MlPrediction {
    pub is_attack: bool,
    pub attack_type: Option<String>,
    pub confidence: f64,
}

/// The ML attack classifier the core consults but does not train.
///
/// Confidence above 0.8 is treated as a high-severity security alert
/// (spec §6).
#[async_trait]
pub trait MlPredictor: Send + Sync {
    async fn predict(&self, context: &PacketContext) -> MlPrediction;
}

/// Used when no classifier is deployed; never flags an attack.
#[derive(Debug, Default)]
pub struct NullMlPredictor;

#[async_trait]
impl MlPredictor for NullMlPredictor {
    async fn predict(&self, _context: &PacketContext) -> MlPrediction {
        MlPrediction {
            is_attack: false,
            attack_type: None,
            confidence: 0.0,
        }
    }
}

/// Threshold above which a prediction is treated as a high-severity alert.
pub const ATTACK_CONFIDENCE_THRESHOLD: f64 = 0.8;
