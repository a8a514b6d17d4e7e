//! Structural fingerprint of a prototype

use vmp_bytecode::{ByteStr, Instruction, Proto};

const FNV_OFFSET: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

/// Number of chains in the registry
pub const BUCKET_COUNT: usize = 64;

/// Order-sensitive 32-bit hash of an instruction stream
pub fn code_hash(code: &[Instruction]) -> u32 {
    code.iter()
        .fold(FNV_OFFSET, |h, &w| (h ^ w).wrapping_mul(FNV_PRIME))
}

fn mix(h: u32, word: u32) -> u32 {
    (h ^ word).wrapping_mul(FNV_PRIME)
}

/// What two prototypes must agree on to be considered the same function.
///
/// The instruction stream is represented only by its byte length and
/// [`code_hash`]; two different streams with equal length and hash produce
/// equal keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtoKey {
    pub source: Option<ByteStr>,
    pub linedefined: u32,
    pub lastlinedefined: u32,
    pub numparams: u8,
    pub is_vararg: bool,
    pub maxstacksize: u8,
    pub code_bytes: usize,
    pub code_hash: u32,
}

impl ProtoKey {
    pub fn of(proto: &Proto) -> Self {
        Self {
            source: proto.source.clone(),
            linedefined: proto.linedefined,
            lastlinedefined: proto.lastlinedefined,
            numparams: proto.numparams,
            is_vararg: proto.is_vararg,
            maxstacksize: proto.maxstacksize,
            code_bytes: proto.code_bytes(),
            code_hash: code_hash(&proto.code),
        }
    }

    /// FNV fold of every field; the source contributes its content
    pub fn fingerprint(&self) -> u32 {
        let source = self
            .source
            .as_ref()
            .map(|s| {
                s.as_bytes()
                    .iter()
                    .fold(FNV_OFFSET, |h, &b| mix(h, b as u32))
            })
            .unwrap_or(0);
        [
            source,
            self.linedefined,
            self.lastlinedefined,
            self.numparams as u32,
            self.is_vararg as u32,
            self.maxstacksize as u32,
            self.code_bytes as u32,
            self.code_hash,
        ]
        .into_iter()
        .fold(FNV_OFFSET, mix)
    }

    pub fn bucket(&self) -> usize {
        self.fingerprint() as usize % BUCKET_COUNT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_code_hash_order_sensitive() {
        assert_eq!(code_hash(&[]), FNV_OFFSET);
        assert_ne!(code_hash(&[1, 2]), code_hash(&[2, 1]));
    }

    #[test]
    fn test_source_compared_by_content() {
        let a = Proto {
            source: Some(ByteStr::from("=a")),
            code: vec![7, 8, 9],
            ..Proto::default()
        };
        let mut b = a.clone();
        b.source = Some(ByteStr::from("=a"));

        assert_eq!(ProtoKey::of(&a), ProtoKey::of(&b));
        assert_eq!(ProtoKey::of(&a).bucket(), ProtoKey::of(&b).bucket());
        assert!(ProtoKey::of(&a).bucket() < BUCKET_COUNT);
    }

    #[test]
    fn test_shape_changes_key() {
        let a = Proto {
            code: vec![1],
            ..Proto::default()
        };
        let mut b = a.clone();
        b.maxstacksize = 3;
        assert_ne!(ProtoKey::of(&a), ProtoKey::of(&b));
    }
}
