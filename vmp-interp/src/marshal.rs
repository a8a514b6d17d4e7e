//! Deep copy of values between two independent Lua states
//!
//! Scalars and strings copy by value. Tables copy their metatable first and
//! then every pair, into fresh tables, with no cycle detection. Anything
//! nested deeper than [`MAX_COPY_DEPTH`] arrives as nil. Native functions
//! are looked up by their global path (`print`, `string.format`) and bound
//! to the function at the same path on the other side; other functions,
//! userdata and threads arrive as [`PLACEHOLDER`].

use ahash::AHashMap;
use mlua::{Function, Lua, MultiValue, Table, Value};
use tracing::trace;

/// Deepest nesting level that is still copied
pub const MAX_COPY_DEPTH: usize = 10;

/// Stand-in for values that cannot be copied
pub const PLACEHOLDER: &str = "[vmp: value cannot cross interpreter boundary]";

/// What one marshaller did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarshalStats {
    pub tables: usize,
    /// Values dropped for exceeding the depth bound
    pub truncated: usize,
    pub placeholders: usize,
    /// Native functions bound on the destination side
    pub natives: usize,
}

/// Copies values from `src` into `dst`.
///
/// Nested tables are filled from an explicit worklist, so deep structures
/// do not grow the Rust call stack.
pub struct Marshaller<'a> {
    src: &'a Lua,
    dst: &'a Lua,
    natives: Option<AHashMap<usize, String>>,
    pending: Vec<(Table, Table, usize)>,
    stats: MarshalStats,
}

impl<'a> Marshaller<'a> {
    pub fn new(src: &'a Lua, dst: &'a Lua) -> Self {
        Self {
            src,
            dst,
            natives: None,
            pending: Vec::new(),
            stats: MarshalStats::default(),
        }
    }

    pub fn stats(&self) -> MarshalStats {
        self.stats
    }

    pub fn copy(&mut self, value: Value) -> mlua::Result<Value> {
        let root = self.shallow(value, 0)?;
        while let Some((from, to, depth)) = self.pending.pop() {
            self.fill(from, to, depth)?;
        }
        Ok(root)
    }

    pub fn copy_multi(&mut self, values: MultiValue) -> mlua::Result<MultiValue> {
        let mut copied = Vec::with_capacity(values.len());
        for value in values {
            copied.push(self.copy(value)?);
        }
        Ok(MultiValue::from_vec(copied))
    }

    /// Copy one value; tables come back empty and are queued for filling.
    fn shallow(&mut self, value: Value, depth: usize) -> mlua::Result<Value> {
        if depth > MAX_COPY_DEPTH {
            if !value.is_nil() {
                self.stats.truncated += 1;
            }
            return Ok(Value::Nil);
        }
        let copied = match value {
            Value::Nil => Value::Nil,
            Value::Boolean(b) => Value::Boolean(b),
            Value::Integer(i) => Value::Integer(i),
            Value::Number(n) => Value::Number(n),
            Value::String(s) => Value::String(self.dst.create_string(&*s.as_bytes())?),
            Value::Table(from) => {
                let to = self.dst.create_table()?;
                self.stats.tables += 1;
                self.pending.push((from, to.clone(), depth));
                Value::Table(to)
            }
            Value::Function(f) if is_native(&f) => match self.rebind(&f)? {
                Some(bound) => {
                    self.stats.natives += 1;
                    Value::Function(bound)
                }
                None => self.placeholder("unresolved native function")?,
            },
            other => self.placeholder(other.type_name())?,
        };
        Ok(copied)
    }

    fn fill(&mut self, from: Table, to: Table, depth: usize) -> mlua::Result<()> {
        if let Some(mt) = from.metatable() {
            if let Value::Table(copy) = self.shallow(Value::Table(mt), depth + 1)? {
                to.set_metatable(Some(copy));
            }
        }
        let pairs = from
            .pairs::<Value, Value>()
            .collect::<mlua::Result<Vec<_>>>()?;
        for (k, v) in pairs {
            let key = self.shallow(k, depth + 1)?;
            if key.is_nil() {
                continue;
            }
            let value = self.shallow(v, depth + 1)?;
            to.raw_set(key, value)?;
        }
        Ok(())
    }

    fn placeholder(&mut self, kind: &str) -> mlua::Result<Value> {
        trace!(kind, "value replaced by placeholder");
        self.stats.placeholders += 1;
        Ok(Value::String(self.dst.create_string(PLACEHOLDER)?))
    }

    fn rebind(&mut self, f: &Function) -> mlua::Result<Option<Function>> {
        if self.natives.is_none() {
            self.natives = Some(native_paths(self.src)?);
        }
        let addr = Value::Function(f.clone()).to_pointer() as usize;
        let Some(path) = self.natives.as_ref().and_then(|n| n.get(&addr)) else {
            return Ok(None);
        };
        resolve_native(self.dst, path)
    }
}

/// Copy `value` from `src` into `dst`
pub fn copy_value(src: &Lua, dst: &Lua, value: Value) -> mlua::Result<Value> {
    Marshaller::new(src, dst).copy(value)
}

pub fn is_native(f: &Function) -> bool {
    f.info().what == "C"
}

/// Native functions reachable from globals, by address: `name` for global
/// functions and `lib.name` for functions inside global tables.
pub fn native_paths(lua: &Lua) -> mlua::Result<AHashMap<usize, String>> {
    let mut paths = AHashMap::new();
    for pair in lua.globals().pairs::<Value, Value>() {
        let (key, value) = pair?;
        let Value::String(name) = key else { continue };
        let Ok(name) = name.to_str().map(|s| s.to_string()) else {
            continue;
        };
        match value {
            Value::Function(ref f) if is_native(f) => {
                paths.entry(value.to_pointer() as usize).or_insert(name);
            }
            Value::Table(lib) if name != "_G" => {
                for field in lib.pairs::<Value, Value>() {
                    let (key, value) = field?;
                    let (Value::String(field_name), Value::Function(f)) = (&key, &value) else {
                        continue;
                    };
                    if !is_native(f) {
                        continue;
                    }
                    if let Ok(field_name) = field_name.to_str() {
                        paths
                            .entry(value.to_pointer() as usize)
                            .or_insert_with(|| format!("{name}.{}", &*field_name));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(paths)
}

/// Native function at `path` among `lua`'s globals
pub fn resolve_native(lua: &Lua, path: &str) -> mlua::Result<Option<Function>> {
    let mut current = Value::Table(lua.globals());
    for part in path.split('.') {
        current = match current {
            Value::Table(t) => t.raw_get(part)?,
            _ => return Ok(None),
        };
    }
    match current {
        Value::Function(f) if is_native(&f) => Ok(Some(f)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_native_paths_cover_libraries() {
        let lua = Lua::new();
        let paths = native_paths(&lua).unwrap();
        let print: Value = lua.globals().get("print").unwrap();
        assert_eq!(
            paths.get(&(print.to_pointer() as usize)).map(String::as_str),
            Some("print")
        );
        assert!(paths.values().any(|p| p == "string.format"));
    }

    #[test]
    fn test_resolve_native_rejects_script_functions() {
        let lua = Lua::new();
        lua.load("mylib = { f = function() end }").exec().unwrap();
        assert!(resolve_native(&lua, "mylib.f").unwrap().is_none());
        assert!(resolve_native(&lua, "missing.f").unwrap().is_none());
        assert!(resolve_native(&lua, "table.insert").unwrap().is_some());
    }

    #[test]
    fn test_scalars_copy_by_value() {
        let (a, b) = (Lua::new(), Lua::new());
        let mut m = Marshaller::new(&a, &b);
        let s = a.create_string(&b"bin\0ary"[..]).unwrap();

        assert_eq!(m.copy(Value::Integer(7)).unwrap(), Value::Integer(7));
        assert_eq!(m.copy(Value::Boolean(true)).unwrap(), Value::Boolean(true));
        let Value::String(copied) = m.copy(Value::String(s)).unwrap() else {
            panic!("expected a string");
        };
        assert_eq!(&*copied.as_bytes(), b"bin\0ary");
        assert_eq!(m.stats(), MarshalStats::default());
    }
}
