//! Database module: row models and SQL repositories.
//!
//! - `model`: typed rows returned by repositories.
//! - `repo`: SQL-only functions for the identity map, the delivery log and
//!   the retry outbox.
//!
//! The content store tables live in the same database but are owned by
//! `crate::store`.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{IdentityMapping, LogRow, RetryTask};
