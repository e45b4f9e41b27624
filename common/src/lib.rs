//! Helpers shared by the FX3 host driver and its tools.

mod logger;
mod timeout;

pub use logger::{file_level, output_level, setup_logging};
pub use timeout::Timeout;
