use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use mlua::{Lua, Value};
use tracing::info;

use vmp_bytecode::{
    DumpOptions, DumpStats, Proto, dump, read_standard_slice, undump_slice,
    write_standard_to_vec,
};
use vmp_interp::{InterpreterOptions, SubInterpreter};

/// Extension given to encrypted chunks when no output is named
pub const CHUNK_EXTENSION: &str = "vmpc";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Encrypted Lua chunks and sub-interpreters", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Compile a Lua source file into an encrypted chunk
    Dump {
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Where to write the chunk (default: FILE with a .vmpc extension)
        #[arg(short = 'o', long = "output", value_name = "FILE")]
        output: Option<PathBuf>,

        /// Leave out source names and debug information
        #[arg(long)]
        strip: bool,
    },

    /// Print the function tree of an encrypted chunk
    Inspect {
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// Turn an encrypted chunk back into a standard Lua 5.4 chunk
    Restore {
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Where to write the chunk (default: FILE with a .luac extension)
        #[arg(short = 'o', long = "output", value_name = "FILE")]
        output: Option<PathBuf>,

        #[arg(long)]
        strip: bool,
    },

    /// Run code inside a fresh sub-interpreter and print its results
    Exec {
        /// Execute the provided code
        #[arg(short = 'e', long = "exec", value_name = "CODE", conflicts_with = "file")]
        code: Option<String>,

        /// Execute code from the provided file
        #[arg(short = 'f', long = "file", value_name = "FILE")]
        file: Option<PathBuf>,

        /// Report sub-interpreter errors at warn level
        #[arg(long)]
        debug: bool,

        /// Register compiled chunks with a prototype registry
        #[arg(long = "share-proto")]
        share_proto: bool,
    },
}

/// Compile `source` with the host runtime and lift the result into a [`Proto`].
pub fn compile(source: &[u8], chunk_name: &str) -> Result<Proto> {
    let lua = Lua::new();
    let func = lua
        .load(source)
        .set_name(chunk_name)
        .into_function()
        .map_err(|err| anyhow!("{err}"))
        .with_context(|| format!("cannot compile {chunk_name}"))?;
    Ok(read_standard_slice(&func.dump(false), chunk_name)?)
}

pub fn dump_source(source: &[u8], chunk_name: &str, strip: bool) -> Result<(Vec<u8>, DumpStats)> {
    let proto = compile(source, chunk_name)?;
    let mut bytes = Vec::new();
    let stats = dump(&proto, &mut bytes, DumpOptions { strip })?;
    Ok((bytes, stats))
}

/// Encrypted chunk back to the host runtime's own format
pub fn restore_chunk(chunk: &[u8], chunk_name: &str, strip: bool) -> Result<Vec<u8>> {
    let proto = undump_slice(chunk, chunk_name)?;
    Ok(write_standard_to_vec(&proto, strip)?)
}

/// One line per function, children indented under their parent
pub fn describe(proto: &Proto) -> String {
    let mut out = String::new();
    describe_into(&mut out, proto, 0, None);
    out
}

fn describe_into(out: &mut String, proto: &Proto, level: usize, inherited: Option<&str>) {
    let source = proto.source.as_ref().map(|s| s.to_string_lossy());
    let shown = source.as_deref().or(inherited).unwrap_or("?");
    let kind = if level == 0 { "main" } else { "function" };
    let _ = writeln!(
        out,
        "{:indent$}{kind} <{shown}:{},{}> params={}{} stack={} instructions={} constants={} upvalues={} locals={} functions={}",
        "",
        proto.linedefined,
        proto.lastlinedefined,
        proto.numparams,
        if proto.is_vararg { "+" } else { "" },
        proto.maxstacksize,
        proto.code.len(),
        proto.constants.len(),
        proto.upvalues.len(),
        proto.locvars.len(),
        proto.protos.len(),
        indent = level * 2,
    );
    for child in &proto.protos {
        describe_into(out, child, level + 1, Some(shown));
    }
}

/// Lua-style rendering of a result value
pub fn render(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => render_number(*n),
        Value::String(s) => s.to_string_lossy().to_string(),
        other => other.type_name().to_string(),
    }
}

/// Significant digits Lua prints for a float (`%.14g`)
const NUMBER_DIGITS: i32 = 14;

/// A float the way Lua's `tostring` writes it: `%.14g`, plus `.0` when
/// the result would otherwise read as an integer.
pub fn render_number(n: f64) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let text = format_general(n);
    if text.bytes().all(|b| b == b'-' || b.is_ascii_digit()) {
        text + ".0"
    } else {
        text
    }
}

fn format_general(n: f64) -> String {
    // rounding to the target digits first fixes the exponent
    let sci = format!("{:.*e}", (NUMBER_DIGITS - 1) as usize, n);
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    if (-4..NUMBER_DIGITS).contains(&exp) {
        let fixed = format!("{:.*}", (NUMBER_DIGITS - 1 - exp) as usize, n);
        trim_fraction(&fixed).to_string()
    } else {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_fraction(mantissa), exp.abs())
    }
}

fn trim_fraction(digits: &str) -> &str {
    if digits.contains('.') {
        digits.trim_end_matches('0').trim_end_matches('.')
    } else {
        digits
    }
}

/// Run `code` in a new sub-interpreter; results are rendered one per line.
pub fn exec_code(code: &[u8], chunk_name: Option<&str>, debug: bool, share_proto: bool) -> Result<Vec<String>> {
    let host = Lua::new();
    let mut options = InterpreterOptions::default().debug(debug).share_proto(share_proto);
    if let Some(name) = chunk_name {
        options = options.chunk_name(name);
    }
    let mut vm = SubInterpreter::new(options).map_err(|err| anyhow!("{err}"))?;
    let results = vm.exec(&host, code).map_err(|err| anyhow!("{err}"))?;
    if share_proto {
        info!(registered = vm.registered().len(), "prototypes shared");
    }
    Ok(results.into_iter().map(|v| render(&v)).collect())
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("cannot write {}", path.display()))
}

pub fn run<W: Write>(args: Args, out: &mut W) -> Result<()> {
    match args.command {
        Command::Dump { input, output, strip } => {
            let source = read_input(&input)?;
            let (bytes, stats) = dump_source(&source, &format!("@{}", input.display()), strip)?;
            let output = output.unwrap_or_else(|| input.with_extension(CHUNK_EXTENSION));
            write_output(&output, &bytes)?;
            info!(functions = stats.functions, bytes = stats.bytes, "chunk written");
            writeln!(out, "{} -> {} ({} bytes)", input.display(), output.display(), stats.bytes)?;
        }
        Command::Inspect { input } => {
            let chunk = read_input(&input)?;
            let proto = undump_slice(&chunk, &input.display().to_string())?;
            write!(out, "{}", describe(&proto))?;
        }
        Command::Restore { input, output, strip } => {
            let chunk = read_input(&input)?;
            let bytes = restore_chunk(&chunk, &input.display().to_string(), strip)?;
            let output = output.unwrap_or_else(|| input.with_extension("luac"));
            write_output(&output, &bytes)?;
            writeln!(out, "{} -> {} ({} bytes)", input.display(), output.display(), bytes.len())?;
        }
        Command::Exec { code, file, debug, share_proto } => {
            let results = match (code, file) {
                (Some(code), _) => exec_code(code.as_bytes(), None, debug, share_proto)?,
                (None, Some(path)) => {
                    let code = read_input(&path)?;
                    let name = format!("@{}", path.display());
                    exec_code(&code, Some(&name), debug, share_proto)?
                }
                (None, None) => bail!("nothing to execute: pass --exec or --file"),
            };
            for line in results {
                writeln!(out, "{line}")?;
            }
        }
    }
    Ok(())
}
