// Thin re-export module: implementation lives in `blockchain/core/`, split
// into the block model, ledger state, validator identity and application.

pub mod core;
pub use self::core::*;
