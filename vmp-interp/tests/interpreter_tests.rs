use std::path::PathBuf;

use mlua::{Lua, MultiValue, Value};
use pretty_assertions::assert_eq;
use rstest::rstest;

use vmp_bytecode::{ByteStr, OwnerTag};
use vmp_interp::{InterpreterOptions, SubInterpreter, VmpError};
use vmp_share::{CodeCompare, ProtoRegistry, RegistryConfig};

fn sub() -> SubInterpreter {
    SubInterpreter::new(InterpreterOptions::default()).unwrap()
}

fn values(values: MultiValue) -> Vec<Value> {
    values.into_iter().collect()
}

fn single(values: MultiValue) -> Value {
    let mut values = self::values(values);
    assert_eq!(values.len(), 1, "expected exactly one result");
    values.remove(0)
}

fn as_string(value: Value) -> String {
    match value {
        Value::String(s) => s.to_str().unwrap().to_string(),
        other => panic!("expected string, got {other:?}"),
    }
}

fn temp_script(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("vmp-{}-{name}", std::process::id()));
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_exec_returns_copied_results() {
    let host = Lua::new();
    let mut vm = sub();

    let values = values(vm.exec(&host, "return 1 + 1, 'two', { 3 }").unwrap());
    assert_eq!(values.len(), 3);
    assert_eq!(values[0], Value::Integer(2));
    assert_eq!(as_string(values[1].clone()), "two");
    let Value::Table(t) = &values[2] else {
        panic!("expected table");
    };
    assert_eq!(t.get::<i64>(1).unwrap(), 3);
}

#[test]
fn test_state_persists_between_calls() {
    let host = Lua::new();
    let mut vm = sub();
    assert!(vm.exec(&host, "x = 40").unwrap().is_empty());
    assert_eq!(single(vm.exec(&host, "return x + 2").unwrap()), Value::Integer(42));
}

#[test]
fn test_states_are_isolated() {
    let host = Lua::new();
    host.globals().set("secret", 1).unwrap();
    let mut a = sub();
    let mut b = sub();

    a.exec(&host, "shared = 'a'").unwrap();
    assert_eq!(single(a.exec(&host, "return secret").unwrap()), Value::Nil);
    assert_eq!(single(b.exec(&host, "return shared").unwrap()), Value::Nil);
    assert_eq!(host.globals().get::<Value>("shared").unwrap(), Value::Nil);
}

#[test]
fn test_runtime_error_leaves_instance_usable() {
    let host = Lua::new();
    let mut vm = sub();

    let err = vm.exec(&host, "error('boom')").unwrap_err();
    let VmpError::Runtime(message) = &err else {
        panic!("expected runtime error, got {err:?}");
    };
    assert!(message.contains("vmp:1:"), "{message}");
    assert!(message.contains("boom"), "{message}");

    assert_eq!(as_string(single(vm.exec(&host, "return 'alive'").unwrap())), "alive");
}

#[test]
fn test_syntax_error_reported_as_load() {
    let host = Lua::new();
    let mut vm = sub();
    let err = vm.exec(&host, "return +").unwrap_err();
    assert!(matches!(err, VmpError::Load(_)), "{err:?}");
}

#[test]
fn test_custom_chunk_name() {
    let host = Lua::new();
    let mut vm = SubInterpreter::new(InterpreterOptions::default().chunk_name("=sandbox")).unwrap();
    let err = vm.exec(&host, "error('x')").unwrap_err();
    assert!(err.to_string().starts_with("sandbox:1:"), "{err}");
}

#[test]
fn test_closed_instance_rejects_calls() {
    let host = Lua::new();
    let mut vm = sub();
    vm.close();
    vm.close();

    assert!(vm.is_closed());
    assert!(matches!(vm.exec(&host, "return 1"), Err(VmpError::Closed)));
    assert!(matches!(vm.get_global(&host, "x"), Err(VmpError::Closed)));
    assert!(matches!(vm.set_global(&host, "x", Value::Nil), Err(VmpError::Closed)));
    assert!(matches!(vm.require(&host, "string"), Err(VmpError::Closed)));
    assert!(matches!(vm.set_proto_share(true), Err(VmpError::Closed)));
    assert!(matches!(vm.set_debug(true), Err(VmpError::Closed)));
    assert!(matches!(vm.set_owner(OwnerTag(7)), Err(VmpError::Closed)));
    assert!(vm.lua().is_err());
}

#[test]
fn test_without_libs() {
    let host = Lua::new();
    let mut vm = SubInterpreter::new(InterpreterOptions::default().open_libs(false)).unwrap();
    let values = values(vm.exec(&host, "return print, string, 1 + 2").unwrap());
    assert_eq!(values, vec![Value::Nil, Value::Nil, Value::Integer(3)]);
}

#[test]
fn test_dofile() {
    let host = Lua::new();
    let mut vm = sub();
    let path = temp_script("ok.lua", "local a, b = 20, 22\nreturn a + b\n");
    assert_eq!(single(vm.dofile(&host, &path).unwrap()), Value::Integer(42));

    let failing = temp_script("fail.lua", "\nerror('from file')\n");
    let err = vm.dofile(&host, &failing).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("fail.lua:2:"), "{message}");

    std::fs::remove_file(path).unwrap();
    std::fs::remove_file(failing).unwrap();
}

#[test]
fn test_dofile_missing() {
    let host = Lua::new();
    let mut vm = sub();
    let err = vm.dofile(&host, "/nonexistent/vmp/script.lua").unwrap_err();
    assert!(matches!(err, VmpError::Io { .. }), "{err:?}");
}

#[test]
fn test_globals_copied_both_ways() {
    let host = Lua::new();
    let mut vm = sub();
    let config: mlua::Table = host.load("return { name = 'demo', limits = { max = 3 } }").eval().unwrap();

    vm.set_global(&host, "config", Value::Table(config.clone())).unwrap();
    vm.exec(&host, "config.limits.max = config.limits.max + 1").unwrap();

    let Value::Table(back) = vm.get_global(&host, "config").unwrap() else {
        panic!("expected table");
    };
    assert_eq!(back.get::<String>("name").unwrap(), "demo");
    let limits: mlua::Table = back.get("limits").unwrap();
    assert_eq!(limits.get::<i64>("max").unwrap(), 4);

    // the host's own table was never touched
    let host_limits: mlua::Table = config.get("limits").unwrap();
    assert_eq!(host_limits.get::<i64>("max").unwrap(), 3);
}

#[test]
fn test_import_host_module() {
    let host = Lua::new();
    host.load("package.loaded.settings = { name = 'demo', fmt = string.format, depth = { one = 1 } }")
        .exec()
        .unwrap();
    let mut vm = sub();

    vm.import(&host, "settings").unwrap();
    let code = "return settings.name, settings.depth.one, settings.fmt('%s!', 'x')";
    let values = values(vm.exec(&host, code).unwrap());
    assert_eq!(as_string(values[0].clone()), "demo");
    assert_eq!(values[1], Value::Integer(1));
    assert_eq!(as_string(values[2].clone()), "x!");
}

#[test]
fn test_require_inside_instance() {
    let host = Lua::new();
    let mut vm = sub();

    let Value::Table(string_lib) = vm.require(&host, "string").unwrap() else {
        panic!("expected table");
    };
    let format: Value = string_lib.get("format").unwrap();
    let host_format: Value = host.load("return string.format").eval().unwrap();
    assert_eq!(format.to_pointer(), host_format.to_pointer());

    let err = vm.require(&host, "no.such.module").unwrap_err();
    let VmpError::Module { name, .. } = &err else {
        panic!("expected module error, got {err:?}");
    };
    assert_eq!(name, "no.such.module");
}

#[test]
fn test_registered_natives_bind_across() {
    let host = Lua::new();
    let double = Value::Function(host.create_function(|_, x: i64| Ok(x * 2)).unwrap());
    host.globals().set("double", double.clone()).unwrap();
    let mut vm = sub();
    vm.register_native("double", |_, x: i64| Ok(x * 2)).unwrap();

    vm.set_global(&host, "twice", double.clone()).unwrap();
    let results = values(vm.exec(&host, "return twice(21), twice == double").unwrap());
    assert_eq!(results, vec![Value::Integer(42), Value::Boolean(true)]);

    let back = vm.get_global(&host, "double").unwrap();
    assert_eq!(back.to_pointer(), double.to_pointer());
}

#[test]
fn test_instances_share_one_registry() {
    let host = Lua::new();
    let registry = ProtoRegistry::shared(RegistryConfig::default());
    let code = "local function add(a, b) return a + b end return add(1, 2)";

    let mut first = SubInterpreter::new(InterpreterOptions::default().registry(registry.clone())).unwrap();
    let mut second = SubInterpreter::new(InterpreterOptions::default().registry(registry.clone())).unwrap();
    assert_eq!(single(first.exec(&host, code).unwrap()), Value::Integer(3));
    assert_eq!(single(second.exec(&host, code).unwrap()), Value::Integer(3));

    let handle = first.registered()[0];
    assert_eq!(second.registered(), vec![handle]);
    {
        let registry = registry.lock();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.refcount(handle), Some(2));
        assert_eq!(registry.owner(handle), Some(first.owner()));
        let stats = registry.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    let canonical = &first.shared_protos()[0];
    assert_eq!(canonical.source, Some(ByteStr::from("=vmp")));
    assert_eq!(canonical.protos.len(), 1);

    first.close();
    assert_eq!(registry.lock().refcount(handle), Some(1));
    drop(second);
    assert!(registry.lock().is_empty());
    assert_eq!(registry.lock().refcount(handle), None);
}

#[test]
fn test_different_chunks_get_separate_entries() {
    let host = Lua::new();
    let registry = ProtoRegistry::shared(RegistryConfig::default());
    let mut vm = SubInterpreter::new(InterpreterOptions::default().registry(registry.clone())).unwrap();

    vm.exec(&host, "return 1").unwrap();
    vm.exec(&host, "return 2").unwrap();
    vm.exec(&host, "return 1").unwrap();

    let registry = registry.lock();
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.stats().total_refs, 2);
}

#[test]
fn test_repeated_exec_holds_one_reference() {
    let host = Lua::new();
    let registry = ProtoRegistry::shared(RegistryConfig::default());
    let mut vm = SubInterpreter::new(InterpreterOptions::default().registry(registry.clone())).unwrap();

    for _ in 0..1000 {
        vm.exec(&host, "return 1").unwrap();
    }
    let handles = vm.registered();
    assert_eq!(handles.len(), 1);
    assert_eq!(registry.lock().refcount(handles[0]), Some(1));

    vm.close();
    assert!(registry.lock().is_empty());
}

#[test]
fn test_failed_load_registers_nothing() {
    let host = Lua::new();
    let registry = ProtoRegistry::shared(RegistryConfig::default());
    let mut vm = SubInterpreter::new(InterpreterOptions::default().registry(registry.clone())).unwrap();

    assert!(vm.exec(&host, "return (").is_err());
    assert!(registry.lock().is_empty());
    assert!(vm.registered().is_empty());
}

#[test]
fn test_toggling_proto_share_releases() {
    let host = Lua::new();
    let mut vm = sub();
    assert!(!vm.proto_share_enabled());
    vm.exec(&host, "return 1").unwrap();
    assert!(vm.registry().is_none());

    vm.set_proto_share(true).unwrap();
    vm.set_proto_share(true).unwrap();
    vm.exec(&host, "return 1").unwrap();
    let registry = vm.registry().unwrap().clone();
    assert_eq!(registry.lock().len(), 1);

    vm.set_proto_share(false).unwrap();
    assert!(!vm.proto_share_enabled());
    assert!(registry.lock().is_empty());
    assert!(vm.registered().is_empty());
}

#[test]
fn test_attach_registry_moves_registrations() {
    let host = Lua::new();
    let mut vm = SubInterpreter::new(InterpreterOptions::default().share_proto(true)).unwrap();
    vm.exec(&host, "return 1").unwrap();
    let private = vm.registry().unwrap().clone();

    let shared = ProtoRegistry::shared(RegistryConfig {
        code_compare: CodeCompare::Bytes,
    });
    vm.attach_registry(shared.clone()).unwrap();
    assert!(private.lock().is_empty());
    assert!(shared.lock().is_empty());

    vm.exec(&host, "return 1").unwrap();
    assert_eq!(shared.lock().len(), 1);
}

#[test]
fn test_registration_tagged_with_owner() {
    let host = Lua::new();
    let registry = ProtoRegistry::shared(RegistryConfig::default());
    let mut vm = SubInterpreter::new(
        InterpreterOptions::default()
            .registry(registry.clone())
            .owner(OwnerTag(0xfeed)),
    )
    .unwrap();
    vm.exec(&host, "return 1").unwrap();
    let handle = vm.registered()[0];
    assert_eq!(registry.lock().owner(handle), Some(OwnerTag(0xfeed)));
}

#[rstest]
#[case(false, false, 0x2a, "VMP: debug=0, proto_share=0, owner=0x2a")]
#[case(true, false, 0x2a, "VMP: debug=1, proto_share=0, owner=0x2a")]
#[case(false, true, 0xff, "VMP: debug=0, proto_share=1, owner=0xff")]
fn test_display(#[case] debug: bool, #[case] share: bool, #[case] owner: u64, #[case] expected: &str) {
    let mut vm = sub();
    vm.set_debug(debug).unwrap();
    vm.set_proto_share(share).unwrap();
    vm.set_owner(OwnerTag(owner)).unwrap();
    assert_eq!(vm.to_string(), expected);
}

#[test]
fn test_ids_are_unique() {
    let (a, b) = (sub(), sub());
    assert_ne!(a.id(), b.id());
    assert_eq!(a.owner(), OwnerTag(a.id()));
}
