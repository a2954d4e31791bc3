//! # Strand Platform
//!
//! Shared types for the Strand session transport.
//!
//! This crate provides the unified error type (`StrandError`) and the
//! result alias (`StrandResult`) used by every protocol component.
//!
//! # Examples
//!
//! ```
//! use strand_platform::{StrandError, StrandResult};
//!
//! fn example_function() -> StrandResult<String> {
//!     Ok("Hello, Strand!".to_string())
//! }
//!
//! # fn main() -> StrandResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Strand!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{StrandError, StrandResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
