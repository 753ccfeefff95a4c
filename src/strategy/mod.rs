pub mod calibration;
pub mod decision;
pub mod risk;

#[allow(unused_imports)]
pub use decision::{Decision, DecisionInputs, DecisionVerdict, Friction};
#[allow(unused_imports)]
pub use risk::RiskManager;
