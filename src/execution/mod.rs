pub mod engine;
pub mod gate;
pub mod paper;

#[allow(unused_imports)]
pub use engine::{ExecutionEngine, PendingResolution, SubmitReport};
#[allow(unused_imports)]
pub use gate::{check_pre_exec, GateInputs};
#[allow(unused_imports)]
pub use paper::PaperEngine;
