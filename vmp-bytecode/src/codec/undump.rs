//! Encrypted chunk back to a prototype tree

use std::io::Read;

use tracing::{debug, trace};

use crate::codec::code::read_code;
use crate::codec::header::check_header;
use crate::codec::keys::TimeKey;
use crate::codec::primitives::BlockReader;
use crate::codec::strings::LoadedStrings;
use crate::core::{AbsLineInfo, ByteStr, Constant, LocVar, MAX_NESTING_DEPTH, Proto, Upvaldesc};
use crate::error::{FormatFault, Result, chunk_display_name};

/// Load a chunk written by [`dump`](crate::codec::dump::dump).
///
/// `chunk_name` only labels errors; `@file` and `=name` lose their prefix.
pub fn undump<R: Read>(source: R, chunk_name: &str) -> Result<Proto> {
    let mut undumper = Undumper {
        input: BlockReader::new(source, chunk_display_name(chunk_name)),
        strings: LoadedStrings::new(),
    };
    let header_key = check_header(&mut undumper.input)?;
    trace!(key = header_key.value(), "chunk header accepted");

    // closure upvalue count, recomputed from the root prototype on use
    let _ = undumper.input.read_byte()?;
    let proto = undumper.function(None, 0)?;
    debug!(
        chunk = undumper.input.chunk_name(),
        functions = proto.function_count(),
        strings = undumper.strings.len(),
        "undumped chunk"
    );
    Ok(proto)
}

pub fn undump_slice(bytes: &[u8], chunk_name: &str) -> Result<Proto> {
    undump(bytes, chunk_name)
}

struct Undumper<R: Read> {
    input: BlockReader<R>,
    strings: LoadedStrings,
}

impl<R: Read> Undumper<R> {
    fn string(&mut self, key: TimeKey) -> Result<Option<ByteStr>> {
        self.strings.read(&mut self.input, key)
    }

    fn count(&mut self) -> Result<usize> {
        Ok(self.input.read_int()? as usize)
    }

    fn function(&mut self, parent_source: Option<&ByteStr>, depth: usize) -> Result<Proto> {
        if depth > MAX_NESTING_DEPTH {
            return Err(self.input.fault(FormatFault::NestedTooDeep));
        }
        let key = TimeKey::new(self.input.read_u64()?);
        let source = match self.string(key)? {
            Some(s) => Some(s),
            None => parent_source.cloned(),
        };
        let mut f = Proto {
            source,
            linedefined: self.input.read_int()?,
            lastlinedefined: self.input.read_int()?,
            numparams: self.input.read_byte()?,
            is_vararg: self.input.read_byte()? != 0,
            maxstacksize: self.input.read_byte()?,
            mode: self.input.read_byte()?,
            magic: self.input.read_int()?,
            data: self.input.read_u64()?,
            code: read_code(&mut self.input)?,
            ..Proto::default()
        };
        self.constants(&mut f, key)?;
        self.upvalues(&mut f)?;
        let n = self.count()?;
        f.protos.reserve(n.min(1024));
        for _ in 0..n {
            let child = self.function(f.source.as_ref(), depth + 1)?;
            f.protos.push(child);
        }
        self.debug(&mut f, key)?;
        Ok(f)
    }

    fn constants(&mut self, f: &mut Proto, key: TimeKey) -> Result<()> {
        let n = self.count()?;
        for _ in 0..n {
            let tag = self.input.read_byte()?;
            let k = match tag {
                Constant::TAG_NIL => Constant::Nil,
                Constant::TAG_FALSE => Constant::Bool(false),
                Constant::TAG_TRUE => Constant::Bool(true),
                Constant::TAG_FLOAT => Constant::Float(self.input.read_number()?),
                Constant::TAG_INT => Constant::Int(self.input.read_integer()?),
                Constant::TAG_SHORT_STR | Constant::TAG_LONG_STR => {
                    Constant::Str(self.strings.read_required(&mut self.input, key)?)
                }
                other => return Err(self.input.fault(FormatFault::UnknownConstantTag(other))),
            };
            f.constants.push(k);
        }
        Ok(())
    }

    fn upvalues(&mut self, f: &mut Proto) -> Result<()> {
        let n = self.count()?;
        for _ in 0..n {
            f.upvalues.push(Upvaldesc {
                name: None,
                instack: self.input.read_byte()?,
                idx: self.input.read_byte()?,
                kind: self.input.read_byte()?,
            });
        }
        Ok(())
    }

    fn debug(&mut self, f: &mut Proto, key: TimeKey) -> Result<()> {
        let n = self.count()?;
        f.lineinfo = self.input.read_vec(n)?.into_iter().map(|b| b as i8).collect();

        let n = self.count()?;
        for _ in 0..n {
            f.abslineinfo.push(AbsLineInfo {
                pc: self.input.read_int()?,
                line: self.input.read_int()?,
            });
        }

        let n = self.count()?;
        for _ in 0..n {
            f.locvars.push(LocVar {
                varname: self.string(key)?,
                startpc: self.input.read_int()?,
                endpc: self.input.read_int()?,
            });
        }

        // A non-zero count means one name per upvalue descriptor
        if self.count()? != 0 {
            for i in 0..f.upvalues.len() {
                f.upvalues[i].name = self.string(key)?;
            }
        }
        Ok(())
    }
}
