use std::collections::{HashMap, VecDeque};
use std::env;
use std::fs;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, connect};
use url::Url;
use wasmtime::{
    Cache, Caller, Config, Engine, Extern, Func, FuncType, Instance, Linker, Memory, OptLevel,
    Store, Val,
};
use wasmtime_wasi::p1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder, p1};

use wasmtap_shim::marshal::read_cstr;
use wasmtap_shim::relay::DEFAULT_RELAY_HOST;
use wasmtap_shim::{
    HookContext, ImportTable, InterceptingLoader, Loader, ModuleLoader, RelayAddress, ShimConfig,
    debug_log,
};

const SOCKET_READABLE: i32 = 1;
const SOCKET_WRITABLE: i32 = 1 << 1;
const SOCKET_ERROR: i32 = 1 << 2;

struct HostState {
    wasi: WasiP1Ctx,
    websockets: WebSocketManager,
    requests: RequestManager,
}

struct WebSocketManager {
    next_id: i32,
    sockets: HashMap<i32, WebSocketEntry>,
}

struct WebSocketEntry {
    socket: tungstenite::WebSocket<MaybeTlsStream<TcpStream>>,
    queue: VecDeque<Vec<u8>>,
    closed: bool,
}

impl WebSocketManager {
    fn new() -> Self {
        Self {
            next_id: 1,
            sockets: HashMap::new(),
        }
    }

    fn insert(&mut self, socket: tungstenite::WebSocket<MaybeTlsStream<TcpStream>>) -> i32 {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);
        self.sockets.insert(
            id,
            WebSocketEntry {
                socket,
                queue: VecDeque::new(),
                closed: false,
            },
        );
        id
    }

    fn remove(&mut self, id: i32) -> Option<WebSocketEntry> {
        self.sockets.remove(&id)
    }

    fn get_mut(&mut self, id: i32) -> Option<&mut WebSocketEntry> {
        self.sockets.get_mut(&id)
    }
}

/// Request creation is registered, not executed: the relay tunnels the
/// actual transfer, so the host only tracks what the guest asked for.
struct RequestManager {
    next_id: i32,
    requests: HashMap<i32, PendingRequest>,
}

struct PendingRequest {
    url: String,
    method: String,
}

impl RequestManager {
    fn new() -> Self {
        Self {
            next_id: 1,
            requests: HashMap::new(),
        }
    }

    fn insert(&mut self, url: String, method: String) -> i32 {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);
        let entry = PendingRequest { url, method };
        debug_log(|| format!("request #{id} registered: {} {}", entry.method, entry.url));
        self.requests.insert(id, entry);
        id
    }
}

fn host_memory(caller: &mut Caller<'_, HostState>) -> Result<Memory, i32> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or(libc::EFAULT)
}

fn read_bytes(
    caller: &mut Caller<'_, HostState>,
    memory: &Memory,
    ptr: i32,
    len: i32,
) -> Result<Vec<u8>, i32> {
    if len < 0 {
        return Err(libc::EINVAL);
    }
    if ptr == 0 && len > 0 {
        return Err(libc::EFAULT);
    }
    let mut buf = vec![0u8; len as usize];
    memory
        .read(&mut *caller, ptr as usize, &mut buf)
        .map_err(|_| libc::EFAULT)?;
    Ok(buf)
}

fn write_bytes(
    caller: &mut Caller<'_, HostState>,
    memory: &Memory,
    ptr: i32,
    bytes: &[u8],
) -> Result<(), i32> {
    memory
        .write(&mut *caller, ptr as usize, bytes)
        .map_err(|_| libc::EFAULT)
}

fn write_u32(
    caller: &mut Caller<'_, HostState>,
    memory: &Memory,
    ptr: i32,
    val: u32,
) -> Result<(), i32> {
    write_bytes(caller, memory, ptr, &val.to_le_bytes())
}

fn map_io_error(err: &std::io::Error) -> i32 {
    if let Some(code) = err.raw_os_error() {
        return code;
    }
    match err.kind() {
        std::io::ErrorKind::WouldBlock => libc::EWOULDBLOCK,
        std::io::ErrorKind::ConnectionRefused => libc::ECONNREFUSED,
        std::io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        _ => libc::EIO,
    }
}

fn map_ws_error(err: &tungstenite::Error) -> i32 {
    match err {
        tungstenite::Error::Io(io_err) => map_io_error(io_err),
        tungstenite::Error::Url(_) => libc::EINVAL,
        tungstenite::Error::Http(_) => libc::ECONNREFUSED,
        tungstenite::Error::Tls(_) => libc::EIO,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => libc::EPIPE,
        _ => libc::EIO,
    }
}

fn ws_set_nonblocking(
    ws: &mut tungstenite::WebSocket<MaybeTlsStream<TcpStream>>,
) -> std::io::Result<()> {
    match ws.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            stream.set_nonblocking(true)?;
        }
        MaybeTlsStream::Rustls(stream) => {
            stream.get_ref().set_nonblocking(true)?;
        }
        _ => {}
    }
    Ok(())
}

fn ws_get_mut(state: &mut HostState, handle: i32) -> Result<&mut WebSocketEntry, i32> {
    if handle <= 0 {
        return Err(libc::EBADF);
    }
    state.websockets.get_mut(handle).ok_or(libc::EBADF)
}

fn drain_incoming(entry: &mut WebSocketEntry) -> Result<(), i32> {
    if entry.closed {
        return Ok(());
    }
    loop {
        match entry.socket.read() {
            Ok(Message::Binary(bytes)) => {
                entry.queue.push_back(bytes.to_vec());
            }
            Ok(Message::Text(text)) => {
                entry.queue.push_back(text.as_bytes().to_vec());
            }
            Ok(Message::Ping(payload)) => {
                let _ = entry.socket.send(Message::Pong(payload));
            }
            Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Ok(Message::Close(_)) => {
                entry.closed = true;
                break;
            }
            Err(tungstenite::Error::Io(err)) if err.kind() == std::io::ErrorKind::WouldBlock => {
                break;
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                entry.closed = true;
                break;
            }
            Err(err) => {
                entry.closed = true;
                return Err(map_ws_error(&err));
            }
        }
        if entry.queue.len() >= 64 {
            break;
        }
    }
    Ok(())
}

/// The original implementations of the guest's networking and logging
/// imports. These are what the shim wraps; the shim only ever changes the
/// URL argument of `_SocketCreate` and `_JS_WebRequest_Create`.
fn define_baseline_imports(store: &mut Store<HostState>, imports: &mut ImportTable) {
    let socket_create = Func::wrap(
        &mut *store,
        |mut caller: Caller<'_, HostState>, url_ptr: i32, protocols_ptr: i32| -> i32 {
            let memory = match host_memory(&mut caller) {
                Ok(mem) => mem,
                Err(errno) => return -errno,
            };
            let url = match read_cstr(&memory, &caller, url_ptr as u32) {
                Ok(val) => val,
                Err(_) => return -libc::EFAULT,
            };
            let protocols = if protocols_ptr != 0 {
                read_cstr(&memory, &caller, protocols_ptr as u32).ok()
            } else {
                None
            };
            let parsed = match Url::parse(&url) {
                Ok(val) => val,
                Err(_) => return -libc::EINVAL,
            };
            if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
                return -libc::EINVAL;
            }
            let (mut socket, _) = match connect(parsed.as_str()) {
                Ok(val) => val,
                Err(err) => return -map_ws_error(&err),
            };
            if let Err(err) = ws_set_nonblocking(&mut socket) {
                return -map_io_error(&err);
            }
            let handle = caller.data_mut().websockets.insert(socket);
            debug_log(|| format!("_SocketCreate #{handle} {url} protocols {protocols:?}"));
            handle
        },
    );
    imports.define("env", "_SocketCreate", socket_create);

    let socket_state = Func::wrap(
        &mut *store,
        |mut caller: Caller<'_, HostState>, handle: i32| -> i32 {
            let entry = match ws_get_mut(caller.data_mut(), handle) {
                Ok(entry) => entry,
                Err(errno) => return -errno,
            };
            if entry.queue.is_empty() {
                if let Err(errno) = drain_incoming(entry) {
                    return -errno;
                }
            }
            let mut state = 0;
            if !entry.queue.is_empty() {
                state |= SOCKET_READABLE;
            }
            if entry.closed {
                state |= SOCKET_ERROR;
            } else {
                state |= SOCKET_WRITABLE;
            }
            state
        },
    );
    imports.define("env", "_SocketState", socket_state);

    let socket_send = Func::wrap(
        &mut *store,
        |mut caller: Caller<'_, HostState>, handle: i32, data_ptr: i32, len: i32| -> i32 {
            let memory = match host_memory(&mut caller) {
                Ok(mem) => mem,
                Err(errno) => return -errno,
            };
            let payload = match read_bytes(&mut caller, &memory, data_ptr, len) {
                Ok(buf) => buf,
                Err(errno) => return -errno,
            };
            let entry = match ws_get_mut(caller.data_mut(), handle) {
                Ok(entry) => entry,
                Err(errno) => return -errno,
            };
            if entry.closed {
                return -libc::EPIPE;
            }
            match entry.socket.send(Message::Binary(payload.into())) {
                Ok(_) => 0,
                Err(tungstenite::Error::Io(err))
                    if err.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    -libc::EWOULDBLOCK
                }
                Err(err) => {
                    entry.closed = true;
                    -map_ws_error(&err)
                }
            }
        },
    );
    imports.define("env", "_SocketSend", socket_send);

    let socket_recv = Func::wrap(
        &mut *store,
        |mut caller: Caller<'_, HostState>,
         handle: i32,
         buf_ptr: i32,
         buf_cap: i32,
         out_len_ptr: i32|
         -> i32 {
            let memory = match host_memory(&mut caller) {
                Ok(mem) => mem,
                Err(errno) => return -errno,
            };
            if out_len_ptr == 0 {
                return -libc::EFAULT;
            }
            if buf_cap < 0 {
                return -libc::EINVAL;
            }
            let cap = buf_cap as usize;

            let (pending, needed_len, closed) = {
                let mut pending: Option<Vec<u8>> = None;
                let mut needed_len: Option<usize> = None;
                let entry = match ws_get_mut(caller.data_mut(), handle) {
                    Ok(entry) => entry,
                    Err(errno) => return -errno,
                };
                if entry.queue.is_empty() && !entry.closed {
                    if let Err(errno) = drain_incoming(entry) {
                        return -errno;
                    }
                }
                if let Some(front) = entry.queue.front() {
                    if front.len() > cap {
                        needed_len = Some(front.len());
                    } else {
                        pending = entry.queue.pop_front();
                    }
                }
                (pending, needed_len, entry.closed)
            };

            if let Some(len) = needed_len {
                let _ = write_u32(&mut caller, &memory, out_len_ptr, len as u32);
                return -libc::ENOMEM;
            }
            if let Some(bytes) = pending {
                if write_bytes(&mut caller, &memory, buf_ptr, &bytes).is_err() {
                    return -libc::EFAULT;
                }
                let _ = write_u32(&mut caller, &memory, out_len_ptr, bytes.len() as u32);
                return 0;
            }
            let _ = write_u32(&mut caller, &memory, out_len_ptr, 0);
            if closed { 0 } else { -libc::EWOULDBLOCK }
        },
    );
    imports.define("env", "_SocketRecv", socket_recv);

    let socket_close = Func::wrap(
        &mut *store,
        |mut caller: Caller<'_, HostState>, handle: i32| -> i32 {
            let entry = match caller.data_mut().websockets.remove(handle) {
                Some(entry) => entry,
                None => return -libc::EBADF,
            };
            if entry.closed {
                return 0;
            }
            let mut socket = entry.socket;
            let _ = socket.close(None);
            0
        },
    );
    imports.define("env", "_SocketClose", socket_close);

    let request_create = Func::wrap(
        &mut *store,
        |mut caller: Caller<'_, HostState>, url_ptr: i32, method_ptr: i32| -> i32 {
            let memory = match host_memory(&mut caller) {
                Ok(mem) => mem,
                Err(errno) => return -errno,
            };
            let url = match read_cstr(&memory, &caller, url_ptr as u32) {
                Ok(val) => val,
                Err(_) => return -libc::EFAULT,
            };
            let method = if method_ptr != 0 {
                read_cstr(&memory, &caller, method_ptr as u32).unwrap_or_default()
            } else {
                String::new()
            };
            caller.data_mut().requests.insert(url, method)
        },
    );
    imports.define("env", "_JS_WebRequest_Create", request_create);

    let log_dump = Func::wrap(
        &mut *store,
        |mut caller: Caller<'_, HostState>, ptr: i32| {
            if let Ok(memory) = host_memory(&mut caller) {
                if let Ok(text) = read_cstr(&memory, &caller, ptr as u32) {
                    eprintln!("[guest] {text}");
                }
            }
        },
    );
    imports.define("env", "_JS_Log_Dump", log_dump);

    let log_stack_trace = Func::wrap(
        &mut *store,
        |mut caller: Caller<'_, HostState>, ptr: i32| {
            if let Ok(memory) = host_memory(&mut caller) {
                if let Ok(text) = read_cstr(&memory, &caller, ptr as u32) {
                    eprintln!("[guest stack] {text}");
                }
            }
        },
    );
    imports.define("env", "_JS_Log_StackTrace", log_stack_trace);

    // The host carries no script engine; evaluation requests are surfaced
    // for diagnostics and otherwise ignored.
    let eval_js = Func::wrap(
        &mut *store,
        |mut caller: Caller<'_, HostState>, ptr: i32| {
            if let Ok(memory) = host_memory(&mut caller) {
                if let Ok(source) = read_cstr(&memory, &caller, ptr as u32) {
                    debug_log(|| format!("eval request ignored: {source}"));
                }
            }
        },
    );
    imports.define("env", "_JS_Eval_EvalJS", eval_js);
}

fn build_engine() -> Result<Engine> {
    let mut config = Config::new();
    let max_stack = env::var("WASMTAP_MAX_STACK")
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .filter(|val| *val > 0)
        .unwrap_or(8 * 1024 * 1024);
    config.max_wasm_stack(max_stack);
    let cache_toggle = env::var("WASMTAP_CACHE").ok();
    if cache_toggle.as_deref() != Some("0") {
        let cache_path = env::var("WASMTAP_CACHE_CONFIG").ok();
        if cache_toggle.as_deref() == Some("1") || cache_path.is_some() {
            let cache = match cache_path.as_deref() {
                Some(path) => Cache::from_file(Some(Path::new(path)))?,
                None => Cache::from_file(None)?,
            };
            config.cache(Some(cache));
            debug_log(|| "compilation cache enabled".to_string());
        }
    }
    if matches!(env::var("WASMTAP_COMPILE_FAST").as_deref(), Ok("1")) {
        config.cranelift_opt_level(OptLevel::None);
        debug_log(|| "opt level set to none".to_string());
    }
    Ok(Engine::new(&config)?)
}

fn resolve_wasm_path(arg: Option<String>) -> Result<PathBuf> {
    let candidates = [arg, env::var("WASMTAP_WASM_PATH").ok()]
        .into_iter()
        .flatten()
        .map(PathBuf::from)
        .collect::<Vec<_>>();
    for candidate in candidates {
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    let local = PathBuf::from("guest.wasm");
    if local.exists() {
        return Ok(local);
    }
    bail!("guest module not found (arg, WASMTAP_WASM_PATH, or ./guest.wasm)");
}

fn resolve_config_path() -> PathBuf {
    env::var("WASMTAP_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"))
}

fn resolve_relay() -> RelayAddress {
    match env::var("WASMTAP_RELAY") {
        Ok(host) if !host.is_empty() => RelayAddress::from_host(host),
        _ => RelayAddress::from_host(DEFAULT_RELAY_HOST),
    }
}

fn build_wasi_ctx() -> Result<WasiP1Ctx> {
    let mut builder = WasiCtxBuilder::new();
    builder.inherit_stdio();
    builder.inherit_env();
    builder.inherit_args();
    builder.preopened_dir(".", ".", DirPerms::all(), FilePerms::all())?;
    Ok(builder.build_p1())
}

fn alloc_results(ty: &FuncType) -> Result<Vec<Val>> {
    let mut results = Vec::new();
    for val_ty in ty.results() {
        let Some(val) = Val::default_for_ty(&val_ty) else {
            bail!("unsupported entry return type: {val_ty:?}");
        };
        results.push(val);
    }
    Ok(results)
}

fn run_entry(store: &mut Store<HostState>, instance: &Instance) -> Result<()> {
    for name in ["_start", "main"] {
        let Some(func) = instance.get_func(&mut *store, name) else {
            continue;
        };
        let ty = func.ty(&*store);
        if ty.params().len() != 0 {
            bail!("entry export {name} takes arguments; unsupported");
        }
        debug_log(|| format!("calling {name}"));
        let mut results = alloc_results(&ty)?;
        func.call(&mut *store, &[], &mut results)?;
        debug_log(|| format!("{name} returned"));
        return Ok(());
    }
    bail!("guest exports neither _start nor main");
}

fn main() -> Result<()> {
    debug_log(|| "starting".to_string());
    let mut args = env::args().skip(1);
    let arg = match args.next() {
        Some(flag) if flag == "-h" || flag == "--help" => {
            eprintln!("usage: wasmtap-host [guest.wasm]");
            return Ok(());
        }
        other => other,
    };

    let wasm_path = resolve_wasm_path(arg)?;
    let config = ShimConfig::load(&resolve_config_path())?;
    debug_log(|| {
        format!(
            "config: interception={} http={}",
            config.interception_enabled, config.http_interception_enabled
        )
    });
    let relay = resolve_relay();

    let engine = build_engine()?;
    let mut store = Store::new(
        &engine,
        HostState {
            wasi: build_wasi_ctx()?,
            websockets: WebSocketManager::new(),
            requests: RequestManager::new(),
        },
    );

    let mut base = Linker::new(&engine);
    p1::add_to_linker_sync(&mut base, |state: &mut HostState| &mut state.wasi)?;

    let mut imports = ImportTable::new();
    define_baseline_imports(&mut store, &mut imports);

    let loader = InterceptingLoader::new(
        ModuleLoader::with_base(engine.clone(), base),
        HookContext::new(&config, relay),
    );

    let bytes =
        fs::read(&wasm_path).with_context(|| format!("read guest module {wasm_path:?}"))?;
    debug_log(|| format!("instantiating {wasm_path:?}"));
    let instance = loader.instantiate(&mut store, &bytes, &mut imports)?;
    run_entry(&mut store, &instance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_sequential() {
        let mut requests = RequestManager::new();
        let first = requests.insert("a.example/1".to_string(), "GET".to_string());
        let second = requests.insert("a.example/2".to_string(), "POST".to_string());
        assert_eq!((first, second), (1, 2));
        assert_eq!(requests.requests.len(), 2);
        assert_eq!(requests.requests[&second].method, "POST");
    }
}
