//! Prototype tree to encrypted chunk

use std::io::Write;

use tracing::debug;

use crate::codec::code::write_code;
use crate::codec::header::write_header;
use crate::codec::keys::{ClockKeys, KeySource, TimeKey};
use crate::codec::primitives::BlockWriter;
use crate::codec::strings::InternTable;
use crate::core::{ByteStr, Constant, Proto};
use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpOptions {
    /// Drop source names and all debug information
    pub strip: bool,
}

impl DumpOptions {
    pub fn stripped() -> Self {
        Self { strip: true }
    }
}

/// Counters reported by a finished dump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpStats {
    pub functions: usize,
    /// Strings written out in full
    pub fresh_strings: usize,
    /// Strings written as a back-reference
    pub reused_strings: usize,
    pub bytes: usize,
}

/// Dump `proto` to `sink` with clock-derived keys.
pub fn dump<W: Write>(proto: &Proto, sink: W, options: DumpOptions) -> Result<DumpStats> {
    dump_with(proto, sink, options, &mut ClockKeys::new())
}

pub fn dump_to_vec(proto: &Proto, options: DumpOptions) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    dump(proto, &mut bytes, options)?;
    Ok(bytes)
}

/// Dump with an explicit key source.
pub fn dump_with<W: Write, K: KeySource>(
    proto: &Proto,
    sink: W,
    options: DumpOptions,
    keys: &mut K,
) -> Result<DumpStats> {
    let header_key = keys.next_key();
    let mut dumper = Dumper {
        out: BlockWriter::new(sink),
        strings: InternTable::new(),
        keys,
        strip: options.strip,
        functions: 0,
    };
    write_header(&mut dumper.out, header_key);
    dumper.out.write_byte(proto.upvalues.len() as u8);
    dumper.function(proto, None)?;

    let stats = DumpStats {
        functions: dumper.functions,
        fresh_strings: dumper.strings.fresh_count(),
        reused_strings: dumper.strings.reused_count(),
        bytes: dumper.out.bytes_written(),
    };
    dumper.out.finish()?;
    debug!(
        functions = stats.functions,
        fresh_strings = stats.fresh_strings,
        reused_strings = stats.reused_strings,
        bytes = stats.bytes,
        strip = options.strip,
        "dumped chunk"
    );
    Ok(stats)
}

struct Dumper<'k, W: Write, K: KeySource> {
    out: BlockWriter<W>,
    strings: InternTable,
    keys: &'k mut K,
    strip: bool,
    functions: usize,
}

impl<W: Write, K: KeySource> Dumper<'_, W, K> {
    fn string(&mut self, s: Option<&ByteStr>, key: TimeKey) {
        self.strings.write(&mut self.out, s, key);
    }

    fn function(&mut self, f: &Proto, parent_source: Option<&ByteStr>) -> Result<()> {
        self.functions += 1;
        let key = self.keys.next_key();
        self.out.write_u64(key.value());

        let same_as_parent = match (&f.source, parent_source) {
            (Some(s), Some(p)) => ByteStr::ptr_eq(s, p),
            (None, _) => true,
            _ => false,
        };
        if self.strip || same_as_parent {
            self.string(None, key);
        } else {
            self.string(f.source.as_ref(), key);
        }
        self.out.write_int(f.linedefined);
        self.out.write_int(f.lastlinedefined);
        self.out.write_byte(f.numparams);
        self.out.write_byte(f.is_vararg as u8);
        self.out.write_byte(f.maxstacksize);
        self.out.write_byte(f.mode);
        self.out.write_int(f.magic);
        self.out.write_u64(f.data);
        write_code(&mut self.out, &f.code, self.keys.next_key())?;
        self.constants(f, key);
        self.upvalues(f);
        self.out.write_int(f.protos.len() as u32);
        for child in &f.protos {
            self.function(child, f.source.as_ref())?;
        }
        self.debug(f, key);
        Ok(())
    }

    fn constants(&mut self, f: &Proto, key: TimeKey) {
        self.out.write_int(f.constants.len() as u32);
        for k in &f.constants {
            self.out.write_byte(k.tag());
            match k {
                Constant::Float(n) => self.out.write_number(*n),
                Constant::Int(i) => self.out.write_integer(*i),
                Constant::Str(s) => self.string(Some(s), key),
                Constant::Nil | Constant::Bool(_) => {}
            }
        }
    }

    fn upvalues(&mut self, f: &Proto) {
        self.out.write_int(f.upvalues.len() as u32);
        for upval in &f.upvalues {
            self.out.write_byte(upval.instack);
            self.out.write_byte(upval.idx);
            self.out.write_byte(upval.kind);
        }
    }

    fn debug(&mut self, f: &Proto, key: TimeKey) {
        if self.strip {
            for _ in 0..4 {
                self.out.write_int(0);
            }
            return;
        }
        self.out.write_int(f.lineinfo.len() as u32);
        let lines: Vec<u8> = f.lineinfo.iter().map(|&d| d as u8).collect();
        self.out.write_block(&lines);

        self.out.write_int(f.abslineinfo.len() as u32);
        for abs in &f.abslineinfo {
            self.out.write_int(abs.pc);
            self.out.write_int(abs.line);
        }

        self.out.write_int(f.locvars.len() as u32);
        for var in &f.locvars {
            self.string(var.varname.as_ref(), key);
            self.out.write_int(var.startpc);
            self.out.write_int(var.endpc);
        }

        self.out.write_int(f.upvalues.len() as u32);
        for upval in &f.upvalues {
            self.string(upval.name.as_ref(), key);
        }
    }
}
