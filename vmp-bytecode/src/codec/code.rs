//! Compressed and scrambled instruction blocks
//!
//! Layout: `count: int | compressed_len: size | key: 8 bytes | payload`.
//! The payload is the zlib stream of the native instruction bytes, XORed
//! with the block's own key.

use std::io::{Read, Write};

use byteorder::{ByteOrder, NativeEndian};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::codec::keys::TimeKey;
use crate::codec::primitives::{BlockReader, BlockWriter};
use crate::core::Instruction;
use crate::error::{BytecodeError, FormatFault, Result};

const INSTRUCTION_SIZE: usize = std::mem::size_of::<Instruction>();

pub fn write_code<W: Write>(out: &mut BlockWriter<W>, code: &[Instruction], key: TimeKey) -> Result<()> {
    let mut raw = vec![0u8; code.len() * INSTRUCTION_SIZE];
    NativeEndian::write_u32_into(code, &mut raw);

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&raw)
        .map_err(|e| BytecodeError::Compression(e.to_string()))?;
    let mut payload = encoder
        .finish()
        .map_err(|e| BytecodeError::Compression(e.to_string()))?;
    key.apply(&mut payload);

    out.write_int(code.len() as u32);
    out.write_size(payload.len());
    out.write_u64(key.value());
    out.write_block(&payload);
    Ok(())
}

pub fn read_code<R: Read>(input: &mut BlockReader<R>) -> Result<Vec<Instruction>> {
    let count = input.read_int()? as usize;
    let compressed_len = input.read_size()?;
    let key = TimeKey::new(input.read_u64()?);
    let mut payload = input.read_vec(compressed_len)?;
    key.apply(&mut payload);

    let expected = count * INSTRUCTION_SIZE;
    let mut raw = Vec::new();
    // One byte past the expected size is enough to notice an oversized stream
    let inflated = ZlibDecoder::new(&payload[..])
        .take(expected as u64 + 1)
        .read_to_end(&mut raw);
    if inflated.is_err() || raw.len() != expected {
        return Err(input.fault(FormatFault::DecompressionFailed));
    }

    let mut code = vec![0; count];
    NativeEndian::read_u32_into(&raw, &mut code);
    Ok(code)
}
