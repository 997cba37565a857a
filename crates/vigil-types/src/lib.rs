pub mod session;
pub mod watchdog;

pub use session::*;
pub use watchdog::*;
