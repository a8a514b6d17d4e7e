//! Lua sub-interpreters for a host Lua state
//!
//! A [`SubInterpreter`] owns an independent Lua state. Code runs inside it
//! to completion; results are deep-copied back into the host by the
//! [`marshal`] module, and compiled chunks can be registered with a shared
//! prototype registry. [`module`] exposes the same operations to Lua as
//! the `vmp` module.

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod error;
pub mod interpreter;
pub mod marshal;
pub mod module;

pub use crate::error::{Result, VmpError};
pub use crate::interpreter::{DEFAULT_CHUNK_NAME, InterpreterOptions, SubInterpreter};
pub use crate::marshal::{MAX_COPY_DEPTH, MarshalStats, Marshaller, PLACEHOLDER, copy_value};
pub use crate::module::{ScriptInterpreter, install, open_vmp};
