//! Prototype sharing between Lua sub-interpreters
//!
//! Structurally identical functions compiled by different interpreters are
//! collapsed onto one canonical prototype, reference counted per
//! registration. Entries live in an arena addressed by [`ProtoHandle`]s and
//! are found through 64 hash chains keyed by a [`ProtoKey`].

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod key;
pub mod registry;

pub use crate::key::{BUCKET_COUNT, ProtoKey, code_hash};
pub use crate::registry::{
    CodeCompare, ProtoHandle, ProtoRegistry, RegistryConfig, RegistryStats, SharedProto,
    SharedRegistry,
};
