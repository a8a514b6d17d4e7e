//! Chunk preamble
//!
//! ```text
//! signature(4) | version(1) | format(1) | key(8) | scrambled data(6)
//!   | instruction width(1) | integer width(1) | number width(1)
//!   | integer probe(8) | number probe(8)
//! ```
//!
//! The low nibble of the version byte is noise taken from the key and is
//! never checked on load.

use std::io::{Read, Write};

use crate::codec::keys::TimeKey;
use crate::codec::primitives::{BlockReader, BlockWriter};
use crate::core::Instruction;
use crate::error::{FormatFault, Result};

/// Leading bytes of every binary chunk (`ESC "Lua"`)
pub const SIGNATURE: &[u8; 4] = b"\x1bLua";
/// Lua 5.4
pub const VERSION: u8 = 0x54;
pub const FORMAT: u8 = 0;
/// Conversion-detection bytes, stored scrambled
pub const LUAC_DATA: &[u8; 6] = b"\x19\x93\r\n\x1a\n";
pub const LUAC_INT: i64 = 0x5678;
pub const LUAC_NUM: f64 = 370.5;

pub const INSTRUCTION_WIDTH: u8 = std::mem::size_of::<Instruction>() as u8;
pub const INTEGER_WIDTH: u8 = std::mem::size_of::<i64>() as u8;
pub const NUMBER_WIDTH: u8 = std::mem::size_of::<f64>() as u8;

/// Offset of the version byte
pub const VERSION_OFFSET: usize = SIGNATURE.len();
/// Offset of the scrambled conversion-detection block
pub const SCRAMBLED_DATA_OFFSET: usize = SIGNATURE.len() + 2 + TimeKey::SIZE;

fn scrambled_data(key: TimeKey) -> [u8; 6] {
    let mut data = *LUAC_DATA;
    key.reversed().apply(&mut data);
    data
}

pub fn write_header<W: Write>(out: &mut BlockWriter<W>, key: TimeKey) {
    out.write_block(SIGNATURE);
    out.write_byte((VERSION & 0xf0) | (key.value() % 16) as u8);
    out.write_byte(FORMAT);
    out.write_u64(key.value());
    out.write_block(&scrambled_data(key));
    write_widths(out);
}

/// Validate a header and return the dump key it carries.
pub fn check_header<R: Read>(input: &mut BlockReader<R>) -> Result<TimeKey> {
    check_signature(input)?;
    let _version = input.read_byte()?;
    if input.read_byte()? != FORMAT {
        return Err(input.fault(FormatFault::FormatMismatch));
    }
    let key = TimeKey::new(input.read_u64()?);
    let mut data = [0u8; 6];
    input.read_block(&mut data)?;
    key.reversed().apply(&mut data);
    if &data != LUAC_DATA {
        return Err(input.fault(FormatFault::Corrupted));
    }
    check_widths(input)?;
    Ok(key)
}

pub(crate) fn check_signature<R: Read>(input: &mut BlockReader<R>) -> Result<()> {
    let mut sig = [0u8; 4];
    input.read_block(&mut sig)?;
    if &sig != SIGNATURE {
        return Err(input.fault(FormatFault::NotBinaryChunk));
    }
    Ok(())
}

/// Width markers and probe values, shared with the standard layout
pub(crate) fn write_widths<W: Write>(out: &mut BlockWriter<W>) {
    out.write_byte(INSTRUCTION_WIDTH);
    out.write_byte(INTEGER_WIDTH);
    out.write_byte(NUMBER_WIDTH);
    out.write_integer(LUAC_INT);
    out.write_number(LUAC_NUM);
}

pub(crate) fn check_widths<R: Read>(input: &mut BlockReader<R>) -> Result<()> {
    for (expected, what) in [
        (INSTRUCTION_WIDTH, "Instruction"),
        (INTEGER_WIDTH, "lua_Integer"),
        (NUMBER_WIDTH, "lua_Number"),
    ] {
        if input.read_byte()? != expected {
            return Err(input.fault(FormatFault::SizeMismatch(what)));
        }
    }
    if input.read_integer()? != LUAC_INT {
        return Err(input.fault(FormatFault::IntegerFormatMismatch));
    }
    if input.read_number()? != LUAC_NUM {
        return Err(input.fault(FormatFault::FloatFormatMismatch));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const KEY: TimeKey = TimeKey::new(0x0000_0000_6543_210b);

    fn header() -> Vec<u8> {
        let mut out = BlockWriter::new(Vec::new());
        write_header(&mut out, KEY);
        out.finish().unwrap()
    }

    fn check(bytes: &[u8]) -> Result<TimeKey> {
        check_header(&mut BlockReader::new(bytes, "t"))
    }

    #[test]
    fn test_header_layout() {
        let bytes = header();
        assert_eq!(bytes.len(), SCRAMBLED_DATA_OFFSET + 6 + 3 + 16);
        assert_eq!(&bytes[..4], SIGNATURE);
        assert_eq!(bytes[VERSION_OFFSET], 0x5b);
        assert_ne!(&bytes[SCRAMBLED_DATA_OFFSET..SCRAMBLED_DATA_OFFSET + 6], LUAC_DATA);
        assert_eq!(check(&bytes).unwrap(), KEY);
    }

    #[test]
    fn test_version_nibble_unchecked() {
        let mut bytes = header();
        bytes[VERSION_OFFSET] ^= 0x0f;
        assert_eq!(check(&bytes).unwrap(), KEY);
    }

    #[rstest]
    #[case(0, FormatFault::NotBinaryChunk)]
    #[case(VERSION_OFFSET + 1, FormatFault::FormatMismatch)]
    #[case(SCRAMBLED_DATA_OFFSET, FormatFault::Corrupted)]
    #[case(SCRAMBLED_DATA_OFFSET + 5, FormatFault::Corrupted)]
    #[case(SCRAMBLED_DATA_OFFSET + 6, FormatFault::SizeMismatch("Instruction"))]
    #[case(SCRAMBLED_DATA_OFFSET + 8, FormatFault::SizeMismatch("lua_Number"))]
    #[case(SCRAMBLED_DATA_OFFSET + 9, FormatFault::IntegerFormatMismatch)]
    #[case(SCRAMBLED_DATA_OFFSET + 17, FormatFault::FloatFormatMismatch)]
    fn test_tampered_header(#[case] offset: usize, #[case] fault: FormatFault) {
        let mut bytes = header();
        bytes[offset] ^= 0x40;
        assert_eq!(check(&bytes).unwrap_err().fault(), Some(&fault));
    }

    #[test]
    fn test_short_header_truncated() {
        let bytes = header();
        let err = check(&bytes[..SCRAMBLED_DATA_OFFSET + 2]).unwrap_err();
        assert_eq!(err.fault(), Some(&FormatFault::Truncated));
    }
}
