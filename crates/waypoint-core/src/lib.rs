pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::ExecutionConfig;
pub use error::{Result, WaypointError};
pub use event::{drain_ready, EventBus};
pub use types::*;
