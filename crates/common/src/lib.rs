//! Types shared by the Immersive Alarm crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{REDACTED, Secret};
