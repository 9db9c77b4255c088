//! # warmpool-naming
//!
//! The instance name is the only persisted record of where an instance is in
//! its lifecycle. This crate owns the mapping between that name and the
//! `(id, phase, version)` triple it carries.
//!
//! ## Name Format
//!
//! `{prefix}-{id}-{version}{suffix}`
//!
//! | Phase    | Suffix | Example                               |
//! |----------|--------|---------------------------------------|
//! | Building | `b`    | `cf-01hv4z2wqxkjnm8gpqy6vbkc3d-001b`  |
//! | Idle     | `i`    | `cf-01hv4z2wqxkjnm8gpqy6vbkc3d-001i`  |
//! | Claimed  | (none) | `cf-01hv4z2wqxkjnm8gpqy6vbkc3d-001`   |
//!
//! The version segment is digits only, so the trailing phase suffix is never
//! ambiguous. Names that do not match exactly are foreign: the pool never
//! counts them and never touches them.

mod codec;
mod error;
mod phase;
mod version;

pub use codec::{InstanceName, NameCodec};
pub use error::NameError;
pub use phase::Phase;
pub use version::VersionTag;
