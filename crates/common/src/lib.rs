//! Common utilities for usb-target
//!
//! This crate provides functionality shared between the topology core and the
//! inspection tool: error handling, logging setup, and test fixtures that
//! describe realistic devices without touching hardware.

pub mod error;
pub mod logging;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::{setup_logging, setup_test_logging};
