//! Lua 5.4 prototype persistence
//!
//! Dumps compiled function prototypes into a chunk format whose code
//! blocks are zlib-compressed and XOR-scrambled with per-function time
//! keys, and whose strings are scrambled and written once per chunk.
//! Loads such chunks back, and converts to and from the stock Lua 5.4
//! chunk layout produced by the host runtime.

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod codec;
pub mod core;
pub mod error;

// Re-export commonly used types
pub use crate::codec::{
    DumpOptions, DumpStats, dump, dump_to_vec, dump_with, read_standard, read_standard_slice, undump,
    undump_slice, write_standard, write_standard_to_vec,
};
pub use crate::core::{
    AbsLineInfo, ByteStr, Constant, Instruction, LocVar, MAX_NESTING_DEPTH, OwnerTag, Ownership, Proto,
    Upvaldesc,
};
pub use crate::error::{BytecodeError, FormatFault, Result};
