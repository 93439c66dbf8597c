//! Module-load interception and network redirection for wasm guests.
//!
//! The shim sits between a wasm loading facility and the import table each
//! instantiation attempt supplies. Every attempt is scanned for well-known
//! host symbols; matching entries are swapped for wrapped callables that
//! reroute outbound connection targets through a local relay before calling
//! the original implementation. Untouched entries pass through exactly as
//! supplied. String traffic between host and guest flows through a
//! single-slot marshal bridge backed by one guest adapter export.

use std::env;

pub mod config;
pub mod hooks;
pub mod interceptor;
pub mod marshal;
pub mod relay;
pub mod scanner;

pub use config::ShimConfig;
pub use hooks::{HOOK_REGISTRY, HookContext, HookKind};
pub use interceptor::{InterceptingLoader, Loader, ModuleLoader};
pub use marshal::{MarshalBridge, MarshalError, SharedSlot, SlotGuard};
pub use relay::RelayAddress;
pub use scanner::{ImportTable, scan_imports};

pub fn debug_log<F: FnOnce() -> String>(message: F) {
    if env::var("WASMTAP_DEBUG").is_ok() {
        eprintln!("[wasmtap] {}", message());
    }
}
