//! # warmpool-id
//!
//! Opaque instance IDs for the warm pool.
//!
//! ## Design Principles
//!
//! - IDs are generated by the pool manager; the platform's own identifier is
//!   a separate attribute
//! - IDs have exactly one canonical string representation with strict parsing
//! - IDs roundtrip through their text form (parse → format → parse)
//!
//! ## ID Format
//!
//! An ID is 128 random bits rendered with the ULID text layout: 26 lowercase
//! Crockford base32 characters.
//!
//! Example: `01hv4z2wqxkjnm8gpqy6vbkc3d`
//!
//! Unlike a time-ordered ULID, every bit comes from the OS random number
//! generator, so two pool managers creating instances in the same millisecond
//! cannot collide by construction. The alphabet has no `-`, which keeps the
//! ID a single segment inside an instance name.

mod error;
mod types;

pub use error::IdError;
pub use types::*;
