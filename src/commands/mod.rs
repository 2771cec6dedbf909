pub mod logging;
pub mod preview;
