//! Replacement callables for hooked imports.
//!
//! A wrapper is built per table entry from the original callable and the
//! hook kind, reusing the original's own function type so guest call sites
//! see an identical signature. Redirect wrappers transform the URL argument
//! only; the return value is always the original's, unmodified.

use wasmtime::{Caller, Extern, Func, FuncType, Store, Val, format_err};

use crate::config::ShimConfig;
use crate::debug_log;
use crate::marshal::{self, MarshalBridge, SharedSlot};
use crate::relay::RelayAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Call through and log decoded arguments and results.
    Trace,
    /// Reroute a `(urlPtr, protocolsPtr)` connection call to the relay.
    ConnectionRedirect,
    /// Reroute a `(urlPtr, methodPtr)` request-creation call to the relay.
    RequestRedirect,
}

/// Well-known import symbols and what they get replaced with. The names
/// are part of the guest ABI and must match exactly.
pub const HOOK_REGISTRY: &[(&str, HookKind)] = &[
    ("_JS_Eval_EvalJS", HookKind::Trace),
    ("_JS_Log_Dump", HookKind::Trace),
    ("_JS_Log_StackTrace", HookKind::Trace),
    ("_SocketCreate", HookKind::ConnectionRedirect),
    ("_JS_WebRequest_Create", HookKind::RequestRedirect),
];

pub fn hook_for(symbol: &str) -> Option<HookKind> {
    HOOK_REGISTRY
        .iter()
        .find(|(name, _)| *name == symbol)
        .map(|(_, kind)| *kind)
}

/// Immutable context threaded into every wrapper: the two interception
/// flags, the relay target, and the bridge's shared scratch slot. Built
/// once from the loaded configuration; wrappers never consult global state.
#[derive(Clone)]
pub struct HookContext {
    interception_enabled: bool,
    http_interception_enabled: bool,
    relay: RelayAddress,
    slot: SharedSlot,
}

impl HookContext {
    pub fn new(config: &ShimConfig, relay: RelayAddress) -> Self {
        Self {
            interception_enabled: config.interception_enabled,
            http_interception_enabled: config.http_interception_enabled,
            relay,
            slot: SharedSlot::new(),
        }
    }

    /// Whether `kind` intercepts under the current flags. Consulted at
    /// wrap time: a disabled category leaves the original entry untouched,
    /// so it never sees a single call.
    pub fn is_active(&self, kind: HookKind) -> bool {
        match kind {
            HookKind::Trace => true,
            HookKind::ConnectionRedirect => self.interception_enabled,
            HookKind::RequestRedirect => {
                self.interception_enabled && self.http_interception_enabled
            }
        }
    }

    pub fn slot(&self) -> &SharedSlot {
        &self.slot
    }
}

/// Build the replacement callable for `original`.
pub fn wrap<T: 'static>(
    store: &mut Store<T>,
    symbol: &str,
    original: Func,
    kind: HookKind,
    ctx: &HookContext,
) -> Func {
    let ty = original.ty(&*store);
    match kind {
        HookKind::Trace => wrap_trace(store, ty, symbol.to_string(), original),
        HookKind::ConnectionRedirect => {
            wrap_redirect(store, ty, symbol.to_string(), original, ctx.clone(), Rewrite::Socket)
        }
        HookKind::RequestRedirect => {
            wrap_redirect(store, ty, symbol.to_string(), original, ctx.clone(), Rewrite::Request)
        }
    }
}

#[derive(Clone, Copy)]
enum Rewrite {
    Socket,
    Request,
}

fn wrap_trace<T: 'static>(
    store: &mut Store<T>,
    ty: FuncType,
    symbol: String,
    original: Func,
) -> Func {
    Func::new(store, ty, move |mut caller: Caller<'_, T>, params, results| {
        original.call(&mut caller, params, results)?;
        debug_log(|| {
            let args = describe_args(&mut caller, params);
            format!("{symbol}({args}) -> {results:?}")
        });
        Ok(())
    })
}

fn wrap_redirect<T: 'static>(
    store: &mut Store<T>,
    ty: FuncType,
    symbol: String,
    original: Func,
    ctx: HookContext,
    rewrite: Rewrite,
) -> Func {
    Func::new(store, ty, move |mut caller: Caller<'_, T>, params, results| {
        let bridge = MarshalBridge::from_caller(&mut caller, &ctx.slot)?;
        let url_ptr = params
            .first()
            .and_then(Val::i32)
            .ok_or_else(|| format_err!("{symbol}: first argument is not a pointer"))?;
        let url = bridge.read_string(&caller, url_ptr as u32)?;
        let rerouted = match rewrite {
            Rewrite::Socket => ctx.relay.socket_url(&url),
            Rewrite::Request => ctx.relay.request_url(&url),
        };
        let guard = bridge.write_string(&mut caller, &rerouted)?;
        let mut call_args = params.to_vec();
        call_args[0] = Val::I32(guard.ptr() as i32);
        original.call(&mut caller, &call_args, results)?;
        debug_log(|| format!("{symbol}: {url} -> {rerouted}, result {results:?}"));
        // The pointer was consumed by the call above; the guard frees the
        // slot before control returns to the guest.
        drop(guard);
        Ok(())
    })
}

/// Render parameters for trace output. `i32` values that point at a
/// decodable guest string are shown with their text; anything else is
/// shown raw. Decode failures here are diagnostic only and never raised.
fn describe_args<T>(caller: &mut Caller<'_, T>, params: &[Val]) -> String {
    let memory = caller
        .get_export(marshal::MEMORY_EXPORT)
        .and_then(Extern::into_memory);
    params
        .iter()
        .map(|val| match (val, &memory) {
            (Val::I32(ptr), Some(memory)) => {
                match marshal::read_cstr(memory, &*caller, *ptr as u32) {
                    Ok(text) => format!("{ptr} {text:?}"),
                    Err(_) => format!("{ptr}"),
                }
            }
            _ => format!("{val:?}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_maps_known_symbols() {
        assert_eq!(hook_for("_SocketCreate"), Some(HookKind::ConnectionRedirect));
        assert_eq!(hook_for("_JS_WebRequest_Create"), Some(HookKind::RequestRedirect));
        assert_eq!(hook_for("_JS_Log_Dump"), Some(HookKind::Trace));
        assert_eq!(hook_for("_SocketSend"), None);
    }

    #[test]
    fn activity_follows_flags() {
        let relay = RelayAddress::default();
        let off = HookContext::new(&ShimConfig::default(), relay.clone());
        assert!(off.is_active(HookKind::Trace));
        assert!(!off.is_active(HookKind::ConnectionRedirect));
        assert!(!off.is_active(HookKind::RequestRedirect));

        let sockets_only = HookContext::new(
            &ShimConfig {
                interception_enabled: true,
                ..ShimConfig::default()
            },
            relay.clone(),
        );
        assert!(sockets_only.is_active(HookKind::ConnectionRedirect));
        assert!(!sockets_only.is_active(HookKind::RequestRedirect));

        let both = HookContext::new(
            &ShimConfig {
                interception_enabled: true,
                http_interception_enabled: true,
                ..ShimConfig::default()
            },
            relay,
        );
        assert!(both.is_active(HookKind::RequestRedirect));
    }
}
