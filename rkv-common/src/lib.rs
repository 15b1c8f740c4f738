// rkv-common - Shared types and protocol definitions for RowKV
//
// This crate defines the framed request/reply protocol spoken between the
// client and the row store, plus the row codec and filter grammar.

pub mod codec;
pub mod error;
pub mod filter;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use filter::{Comparator, FilterError, FilterSpec};
pub use protocol::*;
pub use types::*;
