//! In-memory layout of a compiled Lua function prototype

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// A single VM instruction word
pub type Instruction = u32;

/// Longest string Lua keeps as a short (interned) string
pub const MAX_SHORT_STRING_LEN: usize = 40;

/// Deepest function nesting a loader accepts; the root is depth 0
pub const MAX_NESTING_DEPTH: usize = 200;

/// Immutable, cheaply clonable byte string.
///
/// Lua strings are arbitrary bytes, so prototypes never assume UTF-8.
/// Clones share one buffer; [`ByteStr::ptr_eq`] tells clones apart from
/// equal strings that were allocated separately.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteStr(Arc<[u8]>);

impl ByteStr {
    pub fn new(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when both handles point at the same allocation
    pub fn ptr_eq(a: &ByteStr, b: &ByteStr) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl Borrow<[u8]> for ByteStr {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for ByteStr {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes())
    }
}

impl From<&[u8]> for ByteStr {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes)
    }
}

impl From<Vec<u8>> for ByteStr {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }
}

impl fmt::Debug for ByteStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for ByteStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Entry of a prototype's constant table
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(ByteStr),
}

impl Constant {
    pub const TAG_NIL: u8 = 0x00;
    pub const TAG_FALSE: u8 = 0x01;
    pub const TAG_TRUE: u8 = 0x11;
    pub const TAG_INT: u8 = 0x03;
    pub const TAG_FLOAT: u8 = 0x13;
    pub const TAG_SHORT_STR: u8 = 0x04;
    pub const TAG_LONG_STR: u8 = 0x14;

    /// Variant tag as written in a chunk
    pub fn tag(&self) -> u8 {
        match self {
            Constant::Nil => Self::TAG_NIL,
            Constant::Bool(false) => Self::TAG_FALSE,
            Constant::Bool(true) => Self::TAG_TRUE,
            Constant::Int(_) => Self::TAG_INT,
            Constant::Float(_) => Self::TAG_FLOAT,
            Constant::Str(s) if s.len() <= MAX_SHORT_STRING_LEN => Self::TAG_SHORT_STR,
            Constant::Str(_) => Self::TAG_LONG_STR,
        }
    }
}

/// Upvalue descriptor
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Upvaldesc {
    /// Debug name; absent when stripped
    pub name: Option<ByteStr>,
    /// Whether the upvalue lives in the enclosing function's stack
    pub instack: u8,
    /// Register or upvalue index in the enclosing function
    pub idx: u8,
    pub kind: u8,
}

/// Local variable debug record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocVar {
    pub varname: Option<ByteStr>,
    pub startpc: u32,
    pub endpc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsLineInfo {
    pub pc: u32,
    pub line: u32,
}

/// Tag identifying which sub-interpreter registered a shared prototype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct OwnerTag(pub u64);

impl fmt::Display for OwnerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Sharing state of a prototype.
///
/// Only the sharing registry moves a prototype between these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ownership {
    #[default]
    Exclusive,
    Shared { count: u32, owner: OwnerTag },
}

/// A compiled function prototype and its nested children.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Proto {
    /// Chunk name; `None` only when inherited from the parent
    pub source: Option<ByteStr>,
    pub linedefined: u32,
    pub lastlinedefined: u32,
    pub numparams: u8,
    pub is_vararg: bool,
    pub maxstacksize: u8,
    /// Opaque tag bytes carried through the encrypted format untouched
    pub mode: u8,
    pub magic: u32,
    pub data: u64,
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub upvalues: Vec<Upvaldesc>,
    pub protos: Vec<Proto>,
    // Debug information
    pub lineinfo: Vec<i8>,
    pub abslineinfo: Vec<AbsLineInfo>,
    pub locvars: Vec<LocVar>,
    pub ownership: Ownership,
}

impl Proto {
    /// Size of the instruction stream in bytes
    pub fn code_bytes(&self) -> usize {
        self.code.len() * std::mem::size_of::<Instruction>()
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.ownership, Ownership::Shared { .. })
    }

    /// Number of prototypes in this tree, root included
    pub fn function_count(&self) -> usize {
        let mut count = 0;
        let mut pending = vec![self];
        while let Some(p) = pending.pop() {
            count += 1;
            pending.extend(p.protos.iter());
        }
        count
    }

    /// Whether any function in the tree carries debug information
    pub fn has_debug_info(&self) -> bool {
        !self.lineinfo.is_empty()
            || !self.abslineinfo.is_empty()
            || !self.locvars.is_empty()
            || self.upvalues.iter().any(|u| u.name.is_some())
            || self.protos.iter().any(Proto::has_debug_info)
    }

    /// Copy of the tree as it reads back from a stripped chunk: no source
    /// names, no debug arrays, no upvalue names.
    pub fn stripped(&self) -> Proto {
        let mut copy = self.clone();
        copy.strip_in_place();
        copy
    }

    fn strip_in_place(&mut self) {
        self.source = None;
        self.lineinfo.clear();
        self.abslineinfo.clear();
        self.locvars.clear();
        for upval in &mut self.upvalues {
            upval.name = None;
        }
        for child in &mut self.protos {
            child.strip_in_place();
        }
    }
}
