pub mod alerts;
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod heartbeat;
pub mod recovery;
pub mod scheduler;
pub mod storage;
pub mod thresholds;
pub mod validator;

pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_PORT: u16 = 40417;

pub use alerts::*;
pub use audit::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use event_bus::*;
pub use heartbeat::*;
pub use recovery::*;
pub use scheduler::*;
pub use storage::*;
pub use thresholds::*;
pub use validator::*;
