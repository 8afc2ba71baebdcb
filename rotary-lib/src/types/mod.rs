#![allow(unreachable_pub)]

mod error;
mod outcome;

pub use error::ErrorKind;
pub use outcome::Outcome;

/// The rotary `Result` type
pub type Result<T> = std::result::Result<T, crate::ErrorKind>;
