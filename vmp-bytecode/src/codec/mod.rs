//! Chunk encoding: primitives, string tables, code blocks, headers, and the
//! two function-record layouts (encrypted and stock Lua 5.4).

pub mod code;
pub mod dump;
pub mod header;
pub mod keys;
pub mod luac;
pub mod primitives;
pub mod strings;
pub mod undump;

pub use self::dump::{DumpOptions, DumpStats, dump, dump_to_vec, dump_with};
pub use self::keys::{ClockKeys, KeySource, SeededKeys, TimeKey};
pub use self::luac::{read_standard, read_standard_slice, write_standard, write_standard_to_vec};
pub use self::undump::{undump, undump_slice};
