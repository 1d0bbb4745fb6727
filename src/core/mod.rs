//! Core types: constants, errors, options and transport traits.

pub mod config;
pub mod constants;
pub mod error;
pub mod traits;

pub use config::*;
pub use error::*;
pub use traits::*;
