//! Isolated Lua sub-interpreters

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mlua::{
    FromLuaMulti, Function, IntoLuaMulti, Lua, LuaOptions, MaybeSend, MultiValue, StdLib, Value,
};
use tracing::{debug, warn};

use vmp_bytecode::{OwnerTag, Proto, read_standard_slice};
use vmp_share::{CodeCompare, ProtoHandle, ProtoRegistry, RegistryConfig, SharedRegistry};

use crate::error::{Result, VmpError, error_message};
use crate::marshal::Marshaller;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Chunk name used by [`SubInterpreter::exec`] unless configured otherwise
pub const DEFAULT_CHUNK_NAME: &str = "=vmp";

/// Construction options for a [`SubInterpreter`]
#[derive(Debug, Clone)]
pub struct InterpreterOptions {
    /// Open the standard libraries in the new state
    pub open_libs: bool,
    /// Log failures at warn level instead of debug
    pub debug: bool,
    /// Register every compiled chunk with a prototype registry
    pub share_proto: bool,
    /// Registry to share; a private one is created when `None`
    pub registry: Option<SharedRegistry>,
    pub code_compare: CodeCompare,
    pub chunk_name: String,
    /// Owner tag for registrations; defaults to the instance id
    pub owner: Option<OwnerTag>,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            open_libs: true,
            debug: false,
            share_proto: false,
            registry: None,
            code_compare: CodeCompare::default(),
            chunk_name: DEFAULT_CHUNK_NAME.to_string(),
            owner: None,
        }
    }
}

impl InterpreterOptions {
    pub fn open_libs(mut self, open: bool) -> Self {
        self.open_libs = open;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn share_proto(mut self, share: bool) -> Self {
        self.share_proto = share;
        self
    }

    /// Share prototypes through `registry`; implies `share_proto`
    pub fn registry(mut self, registry: SharedRegistry) -> Self {
        self.registry = Some(registry);
        self.share_proto = true;
        self
    }

    pub fn code_compare(mut self, compare: CodeCompare) -> Self {
        self.code_compare = compare;
        self
    }

    pub fn chunk_name(mut self, name: impl Into<String>) -> Self {
        self.chunk_name = name.into();
        self
    }

    pub fn owner(mut self, owner: OwnerTag) -> Self {
        self.owner = Some(owner);
        self
    }
}

/// One chunk registered by this instance, kept so it can be released
#[derive(Debug)]
struct Registration {
    handle: ProtoHandle,
    proto: Proto,
}

#[derive(Debug)]
struct ShareState {
    registry: SharedRegistry,
    registered: Vec<Registration>,
}

impl ShareState {
    fn new(registry: SharedRegistry) -> Self {
        Self {
            registry,
            registered: Vec::new(),
        }
    }

    fn register(&mut self, func: &Function, chunk_name: &str, owner: OwnerTag) -> Result<()> {
        let mut proto = read_standard_slice(&func.dump(false), chunk_name)?;
        let mut registry = self.registry.lock();
        let shared = registry.get(&mut proto, owner);
        // one reference per distinct prototype, however often it runs
        if self.registered.iter().any(|reg| reg.handle == shared.handle) {
            registry.release(&mut proto);
            return Ok(());
        }
        drop(registry);
        debug!(chunk = chunk_name, hit = shared.hit, %owner, "chunk registered for sharing");
        self.registered.push(Registration {
            handle: shared.handle,
            proto,
        });
        Ok(())
    }

    fn release_all(&mut self) {
        if self.registered.is_empty() {
            return;
        }
        let mut registry = self.registry.lock();
        for mut reg in self.registered.drain(..) {
            registry.release(&mut reg.proto);
        }
    }
}

/// A fully independent Lua state driven from a host state.
///
/// Results and errors never leave the instance as references: results are
/// copied into the host with a [`Marshaller`], errors are turned into
/// strings. After [`SubInterpreter::close`] every call fails with
/// [`VmpError::Closed`].
pub struct SubInterpreter {
    id: u64,
    lua: Option<Lua>,
    debug: bool,
    owner: OwnerTag,
    chunk_name: String,
    code_compare: CodeCompare,
    share: Option<ShareState>,
}

impl SubInterpreter {
    pub fn new(options: InterpreterOptions) -> Result<Self> {
        let lua = if options.open_libs {
            Lua::new()
        } else {
            Lua::new_with(StdLib::NONE, LuaOptions::default())?
        };
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let share = match (options.registry, options.share_proto) {
            (Some(registry), _) => Some(ShareState::new(registry)),
            (None, true) => Some(ShareState::new(ProtoRegistry::shared(RegistryConfig {
                code_compare: options.code_compare,
            }))),
            (None, false) => None,
        };
        debug!(id, open_libs = options.open_libs, share_proto = share.is_some(), "sub-interpreter created");
        Ok(Self {
            id,
            lua: Some(lua),
            debug: options.debug,
            owner: options.owner.unwrap_or(OwnerTag(id)),
            chunk_name: options.chunk_name,
            code_compare: options.code_compare,
            share,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The instance's own Lua state
    pub fn lua(&self) -> Result<&Lua> {
        self.lua.as_ref().ok_or(VmpError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.lua.is_none()
    }

    fn report(&self, err: VmpError) -> VmpError {
        if self.debug {
            warn!(id = self.id, error = %err, "sub-interpreter call failed");
        } else {
            debug!(id = self.id, error = %err, "sub-interpreter call failed");
        }
        err
    }

    /// Compile and run `code`, copying its results into `host`.
    pub fn exec(&mut self, host: &Lua, code: impl AsRef<[u8]>) -> Result<MultiValue> {
        let name = self.chunk_name.clone();
        self.run(host, code.as_ref(), &name)
    }

    /// Like [`exec`](Self::exec) for the contents of a file.
    pub fn dofile(&mut self, host: &Lua, path: impl AsRef<Path>) -> Result<MultiValue> {
        let path = path.as_ref();
        let code = std::fs::read(path).map_err(|source| VmpError::Io {
            path: path.to_path_buf(),
            source,
        });
        let code = match code {
            Ok(code) => code,
            Err(err) => return Err(self.report(err)),
        };
        self.run(host, &code, &format!("@{}", path.display()))
    }

    fn run(&mut self, host: &Lua, code: &[u8], chunk_name: &str) -> Result<MultiValue> {
        let lua = self.lua.as_ref().ok_or(VmpError::Closed)?;
        let func = match lua.load(code).set_name(chunk_name).into_function() {
            Ok(func) => func,
            Err(err) => return Err(self.report(VmpError::Load(error_message(&err)))),
        };
        if let Some(share) = self.share.as_mut() {
            share.register(&func, chunk_name, self.owner)?;
        }
        let results = match func.call::<MultiValue>(()) {
            Ok(results) => results,
            Err(err) => return Err(self.report(VmpError::Runtime(error_message(&err)))),
        };
        Ok(Marshaller::new(lua, host).copy_multi(results)?)
    }

    /// Copy `value` from `host` into the global `name`.
    pub fn set_global(&mut self, host: &Lua, name: &str, value: Value) -> Result<()> {
        let lua = self.lua()?;
        let copied = Marshaller::new(host, lua).copy(value)?;
        lua.globals().set(name, copied)?;
        Ok(())
    }

    /// Copy the global `name` into `host`.
    pub fn get_global(&self, host: &Lua, name: &str) -> Result<Value> {
        let lua = self.lua()?;
        let value: Value = lua.globals().get(name)?;
        Ok(Marshaller::new(lua, host).copy(value)?)
    }

    /// Install `func` as the global `name` inside the instance.
    ///
    /// A native host function reachable under the same global name is
    /// marshalled onto this one, in both directions.
    pub fn register_native<A, R, F>(&mut self, name: &str, func: F) -> Result<()>
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&Lua, A) -> mlua::Result<R> + MaybeSend + 'static,
    {
        let lua = self.lua()?;
        lua.globals().set(name, lua.create_function(func)?)?;
        debug!(id = self.id, name, "native registered");
        Ok(())
    }

    /// `require` a module in `host` and install a copy as the global `name`.
    pub fn import(&mut self, host: &Lua, name: &str) -> Result<()> {
        let module = require_in(host, name)?;
        self.set_global(host, name, module)
    }

    /// `require` a module inside the instance and copy it into `host`.
    pub fn require(&mut self, host: &Lua, name: &str) -> Result<Value> {
        let lua = self.lua()?;
        let module = match require_in(lua, name) {
            Ok(module) => module,
            Err(err) => return Err(self.report(err)),
        };
        Ok(Marshaller::new(lua, host).copy(module)?)
    }

    pub fn set_debug(&mut self, debug: bool) -> Result<()> {
        if self.is_closed() {
            return Err(VmpError::Closed);
        }
        self.debug = debug;
        Ok(())
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug
    }

    pub fn set_owner(&mut self, owner: OwnerTag) -> Result<()> {
        if self.is_closed() {
            return Err(VmpError::Closed);
        }
        self.owner = owner;
        Ok(())
    }

    pub fn owner(&self) -> OwnerTag {
        self.owner
    }

    pub fn proto_share_enabled(&self) -> bool {
        self.share.is_some()
    }

    /// Turn prototype sharing on with a private registry, or off.
    ///
    /// Turning it off releases everything this instance registered.
    pub fn set_proto_share(&mut self, enable: bool) -> Result<()> {
        if self.is_closed() {
            return Err(VmpError::Closed);
        }
        if enable {
            if self.share.is_none() {
                let registry = ProtoRegistry::shared(RegistryConfig {
                    code_compare: self.code_compare,
                });
                self.share = Some(ShareState::new(registry));
            }
        } else if let Some(mut share) = self.share.take() {
            share.release_all();
        }
        Ok(())
    }

    /// Share prototypes through `registry` from now on.
    pub fn attach_registry(&mut self, registry: SharedRegistry) -> Result<()> {
        if self.is_closed() {
            return Err(VmpError::Closed);
        }
        if let Some(mut share) = self.share.take() {
            share.release_all();
        }
        self.share = Some(ShareState::new(registry));
        Ok(())
    }

    pub fn registry(&self) -> Option<&SharedRegistry> {
        self.share.as_ref().map(|s| &s.registry)
    }

    /// Handles of every chunk this instance has registered
    pub fn registered(&self) -> Vec<ProtoHandle> {
        self.share
            .as_ref()
            .map(|s| s.registered.iter().map(|r| r.handle).collect())
            .unwrap_or_default()
    }

    /// Canonical prototypes behind this instance's registrations
    pub fn shared_protos(&self) -> Vec<Arc<Proto>> {
        let Some(share) = self.share.as_ref() else {
            return Vec::new();
        };
        let registry = share.registry.lock();
        share
            .registered
            .iter()
            .filter_map(|r| registry.resolve(r.handle))
            .collect()
    }

    /// Release registrations and shut the Lua state down. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut share) = self.share.take() {
            share.release_all();
        }
        if self.lua.take().is_some() {
            debug!(id = self.id, "sub-interpreter closed");
        }
    }
}

impl Drop for SubInterpreter {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for SubInterpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VMP: debug={}, proto_share={}, owner={}",
            self.debug as u8,
            self.share.is_some() as u8,
            self.owner
        )
    }
}

impl fmt::Debug for SubInterpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubInterpreter")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("debug", &self.debug)
            .field("owner", &self.owner)
            .field("proto_share", &self.share.is_some())
            .finish()
    }
}

fn require_in(lua: &Lua, name: &str) -> Result<Value> {
    let module_error = |message: String| VmpError::Module {
        name: name.to_string(),
        message,
    };
    let require = match lua.globals().get::<Value>("require")? {
        Value::Function(f) => f,
        _ => return Err(module_error("require is not available".to_string())),
    };
    require
        .call::<Value>(name)
        .map_err(|err| module_error(error_message(&err)))
}
