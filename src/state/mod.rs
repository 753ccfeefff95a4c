pub mod arming;
pub mod bot_state;
pub mod coordinator;
pub mod machine;
pub mod orders;

#[allow(unused_imports)]
pub use bot_state::{BotState, StateStore, TradingState};
#[allow(unused_imports)]
pub use coordinator::{Coordinator, WsView};
#[allow(unused_imports)]
pub use machine::{Blocker, StateMachine};
