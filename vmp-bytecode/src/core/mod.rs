pub mod proto;

// Re-export core types
pub use self::proto::{
    AbsLineInfo, ByteStr, Constant, Instruction, LocVar, MAX_NESTING_DEPTH, MAX_SHORT_STRING_LEN, OwnerTag,
    Ownership, Proto, Upvaldesc,
};
