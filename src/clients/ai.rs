use futures_util::future::BoxFuture;

use crate::error::BotResult;

/// Calibrated output of the (injected) AI analysis fan-out. The core only
/// sees numbers and costs; prompts, models and transport live outside.
#[derive(Debug, Clone, PartialEq)]
pub struct AiEstimate {
    pub p_ai_cal: f64,
    pub dispute_risk: f64,
    pub tier1_fallback: bool,
    pub model_key: String,
    pub actual_cost_usd: f64,
}

pub trait AiAnalyst: Send + Sync {
    /// Worst-case USD for one analysis, from pinned token prices and caps in
    /// the signed manifest; reserved before the call goes out.
    fn worst_case_usd(&self) -> f64;
    fn model_key(&self) -> String;
    fn analyze(
        &self,
        market_id: String,
        snapshot_hash: String,
        correlation_id: String,
    ) -> BoxFuture<'static, BotResult<AiEstimate>>;
}
