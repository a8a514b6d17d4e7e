//! Stock Lua 5.4 binary chunks
//!
//! Prototypes compiled by the host runtime arrive in this layout (from
//! `string.dump` or `Function::dump`), and restored prototypes can be
//! handed back to unmodified Lua tooling in it. There is no scrambling,
//! no compression, no string reuse, and no mode/magic/data fields.

use std::io::{Read, Write};

use crate::codec::header::{FORMAT, LUAC_DATA, SIGNATURE, VERSION, check_signature, check_widths, write_widths};
use crate::codec::primitives::{BlockReader, BlockWriter};
use crate::core::{AbsLineInfo, ByteStr, Constant, LocVar, MAX_NESTING_DEPTH, Proto, Upvaldesc};
use crate::error::{FormatFault, Result, chunk_display_name};

/// Parse a standard chunk into a prototype tree.
///
/// Nested functions that inherit their parent's source share the parent's
/// string, so writing the tree back reproduces the input exactly.
pub fn read_standard<R: Read>(source: R, chunk_name: &str) -> Result<Proto> {
    let mut input = BlockReader::new(source, chunk_display_name(chunk_name));
    check_signature(&mut input)?;
    if input.read_byte()? != VERSION {
        return Err(input.fault(FormatFault::VersionMismatch));
    }
    if input.read_byte()? != FORMAT {
        return Err(input.fault(FormatFault::FormatMismatch));
    }
    let mut data = [0u8; 6];
    input.read_block(&mut data)?;
    if &data != LUAC_DATA {
        return Err(input.fault(FormatFault::Corrupted));
    }
    check_widths(&mut input)?;
    let _ = input.read_byte()?;
    load_function(&mut input, None, 0)
}

pub fn read_standard_slice(bytes: &[u8], chunk_name: &str) -> Result<Proto> {
    read_standard(bytes, chunk_name)
}

/// Write `proto` as a standard chunk.
pub fn write_standard<W: Write>(proto: &Proto, sink: W, strip: bool) -> Result<()> {
    let mut out = BlockWriter::new(sink);
    out.write_block(SIGNATURE);
    out.write_byte(VERSION);
    out.write_byte(FORMAT);
    out.write_block(LUAC_DATA);
    write_widths(&mut out);
    out.write_byte(proto.upvalues.len() as u8);
    dump_function(&mut out, proto, None, strip);
    out.finish()?;
    Ok(())
}

pub fn write_standard_to_vec(proto: &Proto, strip: bool) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    write_standard(proto, &mut bytes, strip)?;
    Ok(bytes)
}

fn dump_string<W: Write>(out: &mut BlockWriter<W>, s: Option<&ByteStr>) {
    match s {
        None => out.write_size(0),
        Some(s) => {
            out.write_size(s.len() + 1);
            out.write_block(s.as_bytes());
        }
    }
}

fn dump_function<W: Write>(out: &mut BlockWriter<W>, f: &Proto, parent_source: Option<&ByteStr>, strip: bool) {
    let inherited = match (&f.source, parent_source) {
        (Some(s), Some(p)) => ByteStr::ptr_eq(s, p),
        (None, _) => true,
        _ => false,
    };
    dump_string(out, if strip || inherited { None } else { f.source.as_ref() });
    out.write_int(f.linedefined);
    out.write_int(f.lastlinedefined);
    out.write_byte(f.numparams);
    out.write_byte(f.is_vararg as u8);
    out.write_byte(f.maxstacksize);

    out.write_int(f.code.len() as u32);
    for &ins in &f.code {
        out.write_block(&ins.to_ne_bytes());
    }

    out.write_int(f.constants.len() as u32);
    for k in &f.constants {
        out.write_byte(k.tag());
        match k {
            Constant::Float(n) => out.write_number(*n),
            Constant::Int(i) => out.write_integer(*i),
            Constant::Str(s) => dump_string(out, Some(s)),
            Constant::Nil | Constant::Bool(_) => {}
        }
    }

    out.write_int(f.upvalues.len() as u32);
    for upval in &f.upvalues {
        out.write_byte(upval.instack);
        out.write_byte(upval.idx);
        out.write_byte(upval.kind);
    }

    out.write_int(f.protos.len() as u32);
    for child in &f.protos {
        dump_function(out, child, f.source.as_ref(), strip);
    }

    if strip {
        for _ in 0..4 {
            out.write_int(0);
        }
        return;
    }
    out.write_int(f.lineinfo.len() as u32);
    let lines: Vec<u8> = f.lineinfo.iter().map(|&d| d as u8).collect();
    out.write_block(&lines);
    out.write_int(f.abslineinfo.len() as u32);
    for abs in &f.abslineinfo {
        out.write_int(abs.pc);
        out.write_int(abs.line);
    }
    out.write_int(f.locvars.len() as u32);
    for var in &f.locvars {
        dump_string(out, var.varname.as_ref());
        out.write_int(var.startpc);
        out.write_int(var.endpc);
    }
    out.write_int(f.upvalues.len() as u32);
    for upval in &f.upvalues {
        dump_string(out, upval.name.as_ref());
    }
}

fn load_string<R: Read>(input: &mut BlockReader<R>) -> Result<Option<ByteStr>> {
    match input.read_size()? {
        0 => Ok(None),
        size => Ok(Some(ByteStr::from(input.read_vec(size - 1)?))),
    }
}

fn load_function<R: Read>(
    input: &mut BlockReader<R>,
    parent_source: Option<&ByteStr>,
    depth: usize,
) -> Result<Proto> {
    if depth > MAX_NESTING_DEPTH {
        return Err(input.fault(FormatFault::NestedTooDeep));
    }
    let source = load_string(input)?.or_else(|| parent_source.cloned());
    let mut f = Proto {
        source,
        linedefined: input.read_int()?,
        lastlinedefined: input.read_int()?,
        numparams: input.read_byte()?,
        is_vararg: input.read_byte()? != 0,
        maxstacksize: input.read_byte()?,
        ..Proto::default()
    };

    let n = input.read_int()? as usize;
    let raw = input.read_vec(n * 4)?;
    f.code = raw
        .chunks_exact(4)
        .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
        .collect();

    let n = input.read_int()?;
    for _ in 0..n {
        let k = match input.read_byte()? {
            Constant::TAG_NIL => Constant::Nil,
            Constant::TAG_FALSE => Constant::Bool(false),
            Constant::TAG_TRUE => Constant::Bool(true),
            Constant::TAG_FLOAT => Constant::Float(input.read_number()?),
            Constant::TAG_INT => Constant::Int(input.read_integer()?),
            Constant::TAG_SHORT_STR | Constant::TAG_LONG_STR => match load_string(input)? {
                Some(s) => Constant::Str(s),
                None => return Err(input.fault(FormatFault::NullConstantString)),
            },
            other => return Err(input.fault(FormatFault::UnknownConstantTag(other))),
        };
        f.constants.push(k);
    }

    let n = input.read_int()?;
    for _ in 0..n {
        f.upvalues.push(Upvaldesc {
            name: None,
            instack: input.read_byte()?,
            idx: input.read_byte()?,
            kind: input.read_byte()?,
        });
    }

    let n = input.read_int()?;
    for _ in 0..n {
        let child = load_function(input, f.source.as_ref(), depth + 1)?;
        f.protos.push(child);
    }

    let n = input.read_int()? as usize;
    f.lineinfo = input.read_vec(n)?.into_iter().map(|b| b as i8).collect();
    let n = input.read_int()?;
    for _ in 0..n {
        f.abslineinfo.push(AbsLineInfo {
            pc: input.read_int()?,
            line: input.read_int()?,
        });
    }
    let n = input.read_int()?;
    for _ in 0..n {
        f.locvars.push(LocVar {
            varname: load_string(input)?,
            startpc: input.read_int()?,
            endpc: input.read_int()?,
        });
    }
    if input.read_int()? != 0 {
        for upval in &mut f.upvalues {
            upval.name = load_string(input)?;
        }
    }
    Ok(f)
}
