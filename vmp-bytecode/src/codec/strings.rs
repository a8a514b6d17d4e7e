//! Per-call string tables for dump and undump
//!
//! Each distinct string is written once, XOR-scrambled with the key of the
//! function record it first appears in. Later occurrences, in any function
//! of the same chunk, are written as `(0, index)` with 1-based indexes.
//! `(0, 0)` stands for an absent string.

use std::io::{Read, Write};

use ahash::AHashMap;

use crate::codec::keys::TimeKey;
use crate::codec::primitives::{BlockReader, BlockWriter};
use crate::core::ByteStr;
use crate::error::{FormatFault, Result};

/// Writer side: string content to emission index
#[derive(Debug, Default)]
pub struct InternTable {
    index: AHashMap<ByteStr, usize>,
    reused: usize,
}

impl InternTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write<W: Write>(&mut self, out: &mut BlockWriter<W>, s: Option<&ByteStr>, key: TimeKey) {
        let Some(s) = s else {
            out.write_size(0);
            out.write_size(0);
            return;
        };
        if let Some(&idx) = self.index.get(s.as_bytes()) {
            self.reused += 1;
            out.write_size(0);
            out.write_size(idx);
            return;
        }
        let mut scrambled = s.as_bytes().to_vec();
        key.apply(&mut scrambled);
        out.write_size(s.len() + 1);
        out.write_block(&scrambled);

        let next = self.index.len() + 1;
        self.index.insert(s.clone(), next);
    }

    /// Strings written in full so far
    pub fn fresh_count(&self) -> usize {
        self.index.len()
    }

    /// Strings written as a back-reference so far
    pub fn reused_count(&self) -> usize {
        self.reused
    }
}

/// Reader side: strings in emission order
#[derive(Debug, Default)]
pub struct LoadedStrings {
    strings: Vec<ByteStr>,
}

impl LoadedStrings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read<R: Read>(&mut self, input: &mut BlockReader<R>, key: TimeKey) -> Result<Option<ByteStr>> {
        let size = input.read_size()?;
        if size == 0 {
            let idx = input.read_size()?;
            if idx == 0 {
                return Ok(None);
            }
            return match self.strings.get(idx - 1) {
                Some(s) => Ok(Some(s.clone())),
                None => Err(input.fault(FormatFault::InvalidStringIndex)),
            };
        }
        let mut bytes = input.read_vec(size - 1)?;
        key.apply(&mut bytes);
        let s = ByteStr::from(bytes);
        self.strings.push(s.clone());
        Ok(Some(s))
    }

    /// Read a string that may not be absent
    pub fn read_required<R: Read>(&mut self, input: &mut BlockReader<R>, key: TimeKey) -> Result<ByteStr> {
        self.read(input, key)?
            .ok_or_else(|| input.fault(FormatFault::NullConstantString))
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}
