//! Core constants, error types and clock helpers shared by every layer.

mod clock;
mod constants;
mod error;

pub use clock::*;
pub use constants::*;
pub use error::*;
