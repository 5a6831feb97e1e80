//! # virtjrpc common
//!
//! Bootstrap code shared by the virtjrpc binaries.

pub mod logging;

pub use logging::init_logging;
