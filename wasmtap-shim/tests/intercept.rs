//! End-to-end interception tests against real guest instances. Fixture
//! guests are assembled from WAT and exercise the full path: loader ->
//! scanner -> wrapped callable -> marshal bridge -> original import.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use wasmtime::{Caller, Engine, Extern, Instance, Result, Store, Val, bail};

use wasmtap_shim::marshal::{self, MarshalBridge, MarshalError, SharedSlot};
use wasmtap_shim::{
    HookContext, ImportTable, InterceptingLoader, Loader, ModuleLoader, RelayAddress, ShimConfig,
};

const SOCKET_GUEST: &str = r#"
(module
  (import "env" "_SocketCreate" (func $create (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "scratch_alloc") (param i32) (result i32)
    i32.const 1024)
  (func (export "open_socket") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    call $create))
"#;

const REQUEST_GUEST: &str = r#"
(module
  (import "env" "_JS_WebRequest_Create" (func $create (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "scratch_alloc") (param i32) (result i32)
    i32.const 1024)
  (func (export "create_request") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    call $create))
"#;

const TRACE_GUEST: &str = r#"
(module
  (import "env" "_JS_Log_Dump" (func $dump (param i32)))
  (memory (export "memory") 1)
  (func (export "scratch_alloc") (param i32) (result i32)
    i32.const 1024)
  (func (export "log_dump") (param i32)
    local.get 0
    call $dump))
"#;

const BRIDGE_GUEST: &str = r#"
(module
  (import "env" "probe" (func $probe))
  (memory (export "memory") 1)
  (func (export "scratch_alloc") (param i32) (result i32)
    i32.const 2048)
  (func (export "run_probe")
    call $probe))
"#;

const URL_PTR: i32 = 4096;
const ARG_PTR: i32 = 4256;

fn config(interception: bool, http: bool) -> ShimConfig {
    ShimConfig {
        interception_enabled: interception,
        http_interception_enabled: http,
        ..ShimConfig::default()
    }
}

fn relay() -> RelayAddress {
    RelayAddress::new("relay.test:48897", "http://relay.test:48897")
}

/// Instantiates `wat` with a recording original for `symbol`, then calls
/// `entry` with a URL and a second pointer argument planted in guest
/// memory. Returns what the original saw plus the guest-visible result.
fn run_two_arg_guest(
    wat: &str,
    symbol: &str,
    entry: &str,
    url: &str,
    second_arg: &str,
    cfg: &ShimConfig,
) -> (Vec<(String, String, i32)>, i32) {
    let engine = Engine::default();
    let mut store = Store::new(&engine, ());

    let seen: Arc<Mutex<Vec<(String, String, i32)>>> = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let original = wasmtime::Func::wrap(
        &mut store,
        move |mut caller: Caller<'_, ()>, url_ptr: i32, arg_ptr: i32| -> i32 {
            let memory = caller
                .get_export("memory")
                .and_then(Extern::into_memory)
                .expect("guest memory");
            let url = marshal::read_cstr(&memory, &caller, url_ptr as u32).expect("url");
            let arg = marshal::read_cstr(&memory, &caller, arg_ptr as u32).expect("second arg");
            record.lock().expect("lock").push((url, arg, arg_ptr));
            7
        },
    );

    let mut imports = ImportTable::new();
    imports.define("env", symbol, original);

    let loader = InterceptingLoader::new(
        ModuleLoader::new(engine.clone()),
        HookContext::new(cfg, relay()),
    );
    let instance = loader
        .instantiate(&mut store, wat.as_bytes(), &mut imports)
        .expect("instantiate");

    let memory = instance.get_memory(&mut store, "memory").expect("memory");
    let mut planted = url.as_bytes().to_vec();
    planted.push(0);
    memory.write(&mut store, URL_PTR as usize, &planted).expect("plant url");
    let mut arg = second_arg.as_bytes().to_vec();
    arg.push(0);
    memory.write(&mut store, ARG_PTR as usize, &arg).expect("plant arg");

    let result = instance
        .get_typed_func::<(i32, i32), i32>(&mut store, entry)
        .expect("entry export")
        .call(&mut store, (URL_PTR, ARG_PTR))
        .expect("guest call");

    let seen = seen.lock().expect("lock").clone();
    (seen, result)
}

#[test]
fn socket_url_rewritten_through_relay() {
    let (seen, result) = run_two_arg_guest(
        SOCKET_GUEST,
        "_SocketCreate",
        "open_socket",
        "example.org/ws",
        "binary",
        &config(true, false),
    );
    assert_eq!(seen.len(), 1);
    let (url, protocols, protocols_ptr) = &seen[0];
    assert_eq!(url, "ws://relay.test:48897/socket?example.org/ws");
    assert_eq!(protocols, "binary");
    assert_eq!(*protocols_ptr, ARG_PTR);
    assert_eq!(result, 7);
}

#[test]
fn socket_url_untouched_when_interception_disabled() {
    let (seen, result) = run_two_arg_guest(
        SOCKET_GUEST,
        "_SocketCreate",
        "open_socket",
        "example.org/ws",
        "binary",
        &config(false, false),
    );
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "example.org/ws");
    assert_eq!(result, 7);
}

#[test]
fn request_url_rewritten_when_both_flags_set() {
    let (seen, _) = run_two_arg_guest(
        REQUEST_GUEST,
        "_JS_WebRequest_Create",
        "create_request",
        "api.example.com/v1",
        "GET",
        &config(true, true),
    );
    assert_eq!(seen.len(), 1);
    let (url, method, method_ptr) = &seen[0];
    assert_eq!(url, "http://relay.test:48897/request?api.example.com/v1");
    assert_eq!(method, "GET");
    assert_eq!(*method_ptr, ARG_PTR);
}

#[test]
fn request_url_untouched_without_http_flag() {
    let (seen, _) = run_two_arg_guest(
        REQUEST_GUEST,
        "_JS_WebRequest_Create",
        "create_request",
        "api.example.com/v1",
        "GET",
        &config(true, false),
    );
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "api.example.com/v1");
}

#[test]
fn trace_hook_calls_through_with_identical_arguments() {
    let engine = Engine::default();
    let mut store = Store::new(&engine, ());

    let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let original = wasmtime::Func::wrap(&mut store, move |ptr: i32| {
        record.lock().expect("lock").push(ptr);
    });

    let mut imports = ImportTable::new();
    imports.define("env", "_JS_Log_Dump", original);

    let loader = InterceptingLoader::new(
        ModuleLoader::new(engine.clone()),
        HookContext::new(&config(false, false), relay()),
    );
    let instance = loader
        .instantiate(&mut store, TRACE_GUEST.as_bytes(), &mut imports)
        .expect("instantiate");

    let memory = instance.get_memory(&mut store, "memory").expect("memory");
    memory.write(&mut store, URL_PTR as usize, b"dump line\0").expect("plant");

    instance
        .get_typed_func::<i32, ()>(&mut store, "log_dump")
        .expect("entry export")
        .call(&mut store, URL_PTR)
        .expect("guest call");

    assert_eq!(*seen.lock().expect("lock"), [URL_PTR]);
}

#[test]
fn streaming_entry_point_scans_too() {
    let engine = Engine::default();
    let mut store = Store::new(&engine, ());

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let original = wasmtime::Func::wrap(
        &mut store,
        move |mut caller: Caller<'_, ()>, url_ptr: i32, _protocols_ptr: i32| -> i32 {
            let memory = caller
                .get_export("memory")
                .and_then(Extern::into_memory)
                .expect("guest memory");
            let url = marshal::read_cstr(&memory, &caller, url_ptr as u32).expect("url");
            record.lock().expect("lock").push(url);
            1
        },
    );

    let mut imports = ImportTable::new();
    imports.define("env", "_SocketCreate", original);

    let loader = InterceptingLoader::new(
        ModuleLoader::new(engine.clone()),
        HookContext::new(&config(true, false), relay()),
    );
    let mut source = SOCKET_GUEST.as_bytes();
    let instance = loader
        .instantiate_streaming(&mut store, &mut source, &mut imports)
        .expect("instantiate");

    let memory = instance.get_memory(&mut store, "memory").expect("memory");
    memory.write(&mut store, URL_PTR as usize, b"example.org/ws\0").expect("plant");

    instance
        .get_typed_func::<(i32, i32), i32>(&mut store, "open_socket")
        .expect("entry export")
        .call(&mut store, (URL_PTR, 0))
        .expect("guest call");

    assert_eq!(
        *seen.lock().expect("lock"),
        ["ws://relay.test:48897/socket?example.org/ws"]
    );
}

/// Stand-in loader that records delegation and inspects the table it was
/// handed. A wrapped callable fails when invoked outside a guest frame
/// (no memory export in scope), a bare one succeeds; that difference is
/// how the probe tells whether scanning already happened.
struct ProbeLoader {
    calls: Arc<AtomicUsize>,
    wrapped_seen: Arc<AtomicBool>,
}

impl Loader<()> for ProbeLoader {
    fn instantiate(
        &self,
        store: &mut Store<()>,
        _bytes: &[u8],
        imports: &mut ImportTable,
    ) -> Result<Instance> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let entry = imports.get("env", "_SocketCreate").expect("table entry");
        let Extern::Func(func) = entry else {
            panic!("entry is not a function");
        };
        let func = *func;
        let mut results = [Val::I32(0)];
        let outcome = func.call(&mut *store, &[Val::I32(0), Val::I32(0)], &mut results);
        self.wrapped_seen.store(outcome.is_err(), Ordering::SeqCst);
        bail!("inner loader failure")
    }

    fn instantiate_streaming(
        &self,
        store: &mut Store<()>,
        _source: &mut dyn std::io::Read,
        imports: &mut ImportTable,
    ) -> Result<Instance> {
        self.instantiate(store, &[], imports)
    }
}

#[test]
fn scan_happens_once_before_delegation_and_errors_pass_through() {
    let engine = Engine::default();
    let mut store = Store::new(&engine, ());

    let mut imports = ImportTable::new();
    imports.define(
        "env",
        "_SocketCreate",
        wasmtime::Func::wrap(&mut store, |_: i32, _: i32| -> i32 { 7 }),
    );

    let calls = Arc::new(AtomicUsize::new(0));
    let wrapped_seen = Arc::new(AtomicBool::new(false));
    let probe = ProbeLoader {
        calls: Arc::clone(&calls),
        wrapped_seen: Arc::clone(&wrapped_seen),
    };
    let loader = InterceptingLoader::new(probe, HookContext::new(&config(true, false), relay()));

    let err = loader
        .instantiate(&mut store, b"unused", &mut imports)
        .expect_err("inner error must propagate");
    assert!(err.to_string().contains("inner loader failure"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(wrapped_seen.load(Ordering::SeqCst));
}

#[test]
fn disabled_hooks_leave_the_original_callable_in_place() {
    let engine = Engine::default();
    let mut store = Store::new(&engine, ());

    let mut imports = ImportTable::new();
    imports.define(
        "env",
        "_SocketCreate",
        wasmtime::Func::wrap(&mut store, |_: i32, _: i32| -> i32 { 7 }),
    );

    let calls = Arc::new(AtomicUsize::new(0));
    let wrapped_seen = Arc::new(AtomicBool::new(true));
    let probe = ProbeLoader {
        calls: Arc::clone(&calls),
        wrapped_seen: Arc::clone(&wrapped_seen),
    };
    let loader = InterceptingLoader::new(probe, HookContext::new(&config(false, false), relay()));

    let _ = loader
        .instantiate(&mut store, b"unused", &mut imports)
        .expect_err("probe always fails");
    assert!(!wrapped_seen.load(Ordering::SeqCst), "entry must be untouched");
}

#[test]
fn bridge_round_trip_and_slot_discipline() {
    let engine = Engine::default();
    let mut store = Store::new(&engine, ());

    let outcomes: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&outcomes);
    let slot = SharedSlot::new();
    let probe = wasmtime::Func::wrap(&mut store, move |mut caller: Caller<'_, ()>| {
        let bridge = MarshalBridge::from_caller(&mut caller, &slot).expect("bridge");
        let text = "wss://game.example/ws?sid=42";
        let guard = bridge.write_string(&mut caller, text).expect("first write");
        let back = bridge.read_string(&caller, guard.ptr()).expect("read back");
        sink.lock().expect("lock").push(("roundtrip".to_string(), back == text));

        let busy = bridge.write_string(&mut caller, "second");
        sink.lock()
            .expect("lock")
            .push(("busy".to_string(), busy.err() == Some(MarshalError::SlotBusy)));

        drop(guard);
        let reusable = bridge.write_string(&mut caller, "third").is_ok();
        sink.lock().expect("lock").push(("reusable".to_string(), reusable));
    });

    let mut imports = ImportTable::new();
    imports.define("env", "probe", probe);

    let loader = ModuleLoader::new(engine.clone());
    let instance = loader
        .instantiate(&mut store, BRIDGE_GUEST.as_bytes(), &mut imports)
        .expect("instantiate");

    instance
        .get_typed_func::<(), ()>(&mut store, "run_probe")
        .expect("entry export")
        .call(&mut store, ())
        .expect("guest call");

    let outcomes = outcomes.lock().expect("lock").clone();
    for (label, ok) in &outcomes {
        assert!(*ok, "check failed: {label}");
    }
    assert_eq!(outcomes.len(), 3);
}
