//! Volume store internals
//!
//! Leaves first: `allocator` and `catalog` know nothing of each other,
//! `volume` composes them over an `arena`, and `image` persists a volume
//! using the records in `header` and the keystream in `obfuscation`.

pub mod allocator;
pub mod arena;
pub mod catalog;
pub mod config;
pub mod error;
pub mod header;
pub mod image;
pub mod obfuscation;
pub mod validation;
pub mod volume;
