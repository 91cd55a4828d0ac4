//! Common utilities shared across Meridian proxy crates.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
