//! # Ferry Platform
//!
//! Core platform types for the Ferry deployment toolkit.
//!
//! This crate provides the unified error types (`FerryError`, `FerryResult`)
//! shared by every Ferry crate.
//!
//! # Examples
//!
//! ```
//! use ferry_platform::{FerryError, FerryResult};
//!
//! fn example_function() -> FerryResult<String> {
//!     Ok("Hello, Ferry!".to_string())
//! }
//!
//! # fn main() -> FerryResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Ferry!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{FerryError, FerryResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
