//! Byte-level writers and readers shared by every chunk format

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, NativeEndian, ReadBytesExt};

use crate::error::{BytecodeError, FormatFault, Result};

/// Maximum bytes a `usize` needs in 7-bit groups
const SIZE_BUF_LEN: usize = (usize::BITS as usize + 6) / 7;

/// Largest value accepted where the chunk stores a C `int`
pub const INT_LIMIT: usize = i32::MAX as usize;

/// Encode `x` as 7-bit groups, most significant first, with the top bit
/// set on the final byte only.
pub fn encode_size(mut x: usize) -> ([u8; SIZE_BUF_LEN], usize) {
    let mut buf = [0u8; SIZE_BUF_LEN];
    let mut n = 0;
    loop {
        n += 1;
        buf[SIZE_BUF_LEN - n] = (x & 0x7f) as u8;
        x >>= 7;
        if x == 0 {
            break;
        }
    }
    buf[SIZE_BUF_LEN - 1] |= 0x80;
    (buf, SIZE_BUF_LEN - n)
}

/// Chunk writer over any `io::Write`.
///
/// After the first failed write every later write is skipped; the error
/// is reported once by [`BlockWriter::finish`].
pub struct BlockWriter<W: Write> {
    sink: W,
    status: Option<io::Error>,
    written: usize,
}

impl<W: Write> BlockWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            status: None,
            written: 0,
        }
    }

    pub fn write_block(&mut self, bytes: &[u8]) {
        if self.status.is_some() || bytes.is_empty() {
            return;
        }
        match self.sink.write_all(bytes) {
            Ok(()) => self.written += bytes.len(),
            Err(err) => self.status = Some(err),
        }
    }

    pub fn write_byte(&mut self, byte: u8) {
        self.write_block(&[byte]);
    }

    pub fn write_size(&mut self, x: usize) {
        let (buf, start) = encode_size(x);
        self.write_block(&buf[start..]);
    }

    pub fn write_int(&mut self, x: u32) {
        self.write_size(x as usize);
    }

    pub fn write_integer(&mut self, x: i64) {
        let mut buf = [0u8; 8];
        NativeEndian::write_i64(&mut buf, x);
        self.write_block(&buf);
    }

    pub fn write_number(&mut self, x: f64) {
        let mut buf = [0u8; 8];
        NativeEndian::write_f64(&mut buf, x);
        self.write_block(&buf);
    }

    pub fn write_u64(&mut self, x: u64) {
        let mut buf = [0u8; 8];
        NativeEndian::write_u64(&mut buf, x);
        self.write_block(&buf);
    }

    pub fn has_failed(&self) -> bool {
        self.status.is_some()
    }

    /// Bytes successfully handed to the sink
    pub fn bytes_written(&self) -> usize {
        self.written
    }

    /// Flush and surface the first write failure, if any.
    pub fn finish(mut self) -> Result<W> {
        if let Some(err) = self.status.take() {
            return Err(BytecodeError::Io(err));
        }
        self.sink.flush()?;
        Ok(self.sink)
    }
}

/// Chunk reader over any `io::Read`; faults carry the chunk's display name.
pub struct BlockReader<R: Read> {
    source: R,
    chunk: String,
}

impl<R: Read> BlockReader<R> {
    pub fn new(source: R, chunk: impl Into<String>) -> Self {
        Self {
            source,
            chunk: chunk.into(),
        }
    }

    pub fn chunk_name(&self) -> &str {
        &self.chunk
    }

    /// Build the error for `fault` in this chunk
    pub fn fault(&self, fault: FormatFault) -> BytecodeError {
        BytecodeError::Format {
            chunk: self.chunk.clone(),
            fault,
        }
    }

    fn map_io(&self, err: io::Error) -> BytecodeError {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            self.fault(FormatFault::Truncated)
        } else {
            BytecodeError::Io(err)
        }
    }

    pub fn read_block(&mut self, buf: &mut [u8]) -> Result<()> {
        self.source.read_exact(buf).map_err(|e| self.map_io(e))
    }

    /// Read exactly `len` bytes without trusting `len` for the allocation
    pub fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        let read = (&mut self.source).take(len as u64).read_to_end(&mut bytes);
        read.map_err(|e| self.map_io(e))?;
        if bytes.len() != len {
            return Err(self.fault(FormatFault::Truncated));
        }
        Ok(bytes)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        self.source.read_u8().map_err(|e| self.map_io(e))
    }

    /// Inverse of [`encode_size`], refusing values that reach past `limit`
    pub fn read_unsigned(&mut self, limit: usize) -> Result<usize> {
        let limit = limit >> 7;
        let mut x: usize = 0;
        loop {
            let b = self.read_byte()?;
            if x >= limit {
                return Err(self.fault(FormatFault::IntegerOverflow));
            }
            x = (x << 7) | (b & 0x7f) as usize;
            if b & 0x80 != 0 {
                return Ok(x);
            }
        }
    }

    pub fn read_size(&mut self) -> Result<usize> {
        self.read_unsigned(usize::MAX)
    }

    pub fn read_int(&mut self) -> Result<u32> {
        Ok(self.read_unsigned(INT_LIMIT)? as u32)
    }

    pub fn read_integer(&mut self) -> Result<i64> {
        self.source
            .read_i64::<NativeEndian>()
            .map_err(|e| self.map_io(e))
    }

    pub fn read_number(&mut self) -> Result<f64> {
        self.source
            .read_f64::<NativeEndian>()
            .map_err(|e| self.map_io(e))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.source
            .read_u64::<NativeEndian>()
            .map_err(|e| self.map_io(e))
    }
}
