//! Common types for the session resilience gateway

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
