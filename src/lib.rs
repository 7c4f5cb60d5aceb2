pub mod event;
pub mod layout;
pub mod routing_log;
pub mod scene;
pub mod session;
pub mod topology;

pub use event::{NormalizeError, RoutingEvent};
pub use routing_log::{RoutingLog, RoutingRecord};
pub use scene::{DisplayMode, Scene};
pub use session::SessionController;
pub use topology::{ModelRegistry, TopologyConfig};
