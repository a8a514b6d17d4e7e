//! The `vmp` module as seen from Lua
//!
//! ```lua
//! local env = vmp.create{ open_libs = true, debug_mode = false, share_proto = true }
//! env:exec("x = 40")
//! print(env:exec("return x + 2"))   --> 42
//! env:close()
//! ```

use mlua::{Lua, MetaMethod, Table, UserData, UserDataMethods, Value};

use vmp_bytecode::OwnerTag;
use vmp_share::{ProtoRegistry, RegistryConfig, SharedRegistry};

use crate::interpreter::{InterpreterOptions, SubInterpreter};
use crate::marshal::{MAX_COPY_DEPTH, PLACEHOLDER};

/// A [`SubInterpreter`] owned by a Lua value; collected with it.
pub struct ScriptInterpreter(pub SubInterpreter);

impl UserData for ScriptInterpreter {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method_mut("exec", |lua, this, code: mlua::String| {
            Ok(this.0.exec(lua, &*code.as_bytes())?)
        });
        methods.add_method_mut("dostring", |lua, this, code: mlua::String| {
            Ok(this.0.exec(lua, &*code.as_bytes())?)
        });
        methods.add_method_mut("dofile", |lua, this, path: String| {
            Ok(this.0.dofile(lua, path)?)
        });
        methods.add_method_mut("set", |lua, this, (name, value): (String, Value)| {
            Ok(this.0.set_global(lua, &name, value)?)
        });
        methods.add_method("get", |lua, this, name: String| {
            Ok(this.0.get_global(lua, &name)?)
        });
        methods.add_method_mut("import", |lua, this, name: String| {
            Ok(this.0.import(lua, &name)?)
        });
        methods.add_method_mut("require", |lua, this, name: String| {
            Ok(this.0.require(lua, &name)?)
        });
        methods.add_method_mut("sdebug", |_, this, enable: bool| {
            Ok(this.0.set_debug(enable)?)
        });
        methods.add_method_mut("sprotoshare", |_, this, enable: bool| {
            Ok(this.0.set_proto_share(enable)?)
        });
        methods.add_method("gprotoshare", |_, this, ()| Ok(this.0.proto_share_enabled()));
        methods.add_method_mut("setowner", |_, this, owner: i64| {
            Ok(this.0.set_owner(OwnerTag(owner as u64))?)
        });
        methods.add_method("owner", |_, this, ()| Ok(this.0.owner().0 as i64));
        methods.add_method_mut("close", |_, this, ()| {
            this.0.close();
            Ok(())
        });
        methods.add_method("isclosed", |_, this, ()| Ok(this.0.is_closed()));

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.0.to_string()));
    }
}

fn options_from_table(opts: Option<Table>, shared: &SharedRegistry) -> mlua::Result<InterpreterOptions> {
    let mut options = InterpreterOptions::default();
    let Some(t) = opts else {
        return Ok(options);
    };
    if let Some(open) = t.get::<Option<bool>>("open_libs")? {
        options.open_libs = open;
    }
    options.debug = t.get::<Option<bool>>("debug_mode")?.unwrap_or(false);
    options.share_proto = t.get::<Option<bool>>("share_proto")?.unwrap_or(false);
    if t.get::<Option<bool>>("shared_registry")?.unwrap_or(false) {
        options = options.registry(shared.clone());
    }
    if let Some(name) = t.get::<Option<String>>("chunk_name")? {
        options.chunk_name = name;
    }
    if let Some(owner) = t.get::<Option<i64>>("owner")? {
        options.owner = Some(OwnerTag(owner as u64));
    }
    Ok(options)
}

/// Build the `vmp` module table.
///
/// Instances created with `shared_registry = true` share one registry per
/// module table; everything else gets a private registry on demand.
pub fn open_vmp(lua: &Lua) -> mlua::Result<Table> {
    let registry = ProtoRegistry::shared(RegistryConfig::default());
    let vmp = lua.create_table()?;

    let create_registry = registry.clone();
    vmp.set(
        "create",
        lua.create_function(move |_, opts: Option<Table>| {
            let options = options_from_table(opts, &create_registry)?;
            Ok(ScriptInterpreter(SubInterpreter::new(options)?))
        })?,
    )?;

    vmp.set(
        "stats",
        lua.create_function(move |lua, ()| {
            let stats = registry.lock().stats();
            let t = lua.create_table()?;
            t.set("entries", stats.entries)?;
            t.set("refs", stats.total_refs)?;
            t.set("hits", stats.hits)?;
            t.set("misses", stats.misses)?;
            Ok(t)
        })?,
    )?;

    vmp.set("MAX_COPY_DEPTH", MAX_COPY_DEPTH)?;
    vmp.set("PLACEHOLDER", PLACEHOLDER)?;
    Ok(vmp)
}

/// Install the module as the global `vmp` and in `package.loaded`.
pub fn install(lua: &Lua) -> mlua::Result<Table> {
    let vmp = open_vmp(lua)?;
    let globals = lua.globals();
    globals.set("vmp", vmp.clone())?;
    if let Ok(package) = globals.get::<Table>("package") {
        package.get::<Table>("loaded")?.set("vmp", vmp.clone())?;
    }
    Ok(vmp)
}
