pub mod common;
pub mod logging;

pub use common::{confirm_overwrite, OutputArgs, TrackingArgs};
pub use logging::init_logging;
