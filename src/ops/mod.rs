pub mod alerts;
pub mod logging;
pub mod shutdown;

#[allow(unused_imports)]
pub use alerts::{Alert, AlertKind, AlertRouter, AlertSink, ChannelSink};
#[allow(unused_imports)]
pub use shutdown::{channel, Shutdown, ShutdownTrigger};
