//! # conch platform
//!
//! Types shared by the conch crates.
//!
//! This crate provides:
//! - Unified error types (`ConchError`, `ConchResult`)
//! - The cryptographic capability traits (`CryptoBackend`, `BlockTransform`)
//!
//! # Examples
//!
//! ```
//! use conch_platform::{ConchError, ConchResult};
//!
//! fn check_length(len: u32) -> ConchResult<u32> {
//!     if len == 0 {
//!         return Err(ConchError::Framing("zero packet length".to_string()));
//!     }
//!     Ok(len)
//! }
//!
//! # fn main() -> ConchResult<()> {
//! assert_eq!(check_length(16)?, 16);
//! assert!(check_length(0).is_err());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{ConchError, ConchResult};
pub use traits::{BlockTransform, CipherDirection, CipherMode, CryptoBackend, DigestAlgorithm};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
