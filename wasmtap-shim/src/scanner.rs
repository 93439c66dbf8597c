//! Import-table scanning.
//!
//! The table is the dictionary of named host externs an instantiation
//! attempt supplies; the loader resolves module imports against it.
//! Scanning inspects every function entry's symbol name against the hook
//! registry and substitutes wrapped callables in place. Namespaces are
//! opaque and dynamically named, so matching is by symbol name alone.

use std::collections::BTreeMap;

use wasmtime::{Extern, Store};

use crate::debug_log;
use crate::hooks::{self, HookContext};

#[derive(Default)]
pub struct ImportTable {
    entries: BTreeMap<(String, String), Extern>,
}

impl ImportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, namespace: &str, symbol: &str, item: impl Into<Extern>) {
        self.entries
            .insert((namespace.to_string(), symbol.to_string()), item.into());
    }

    pub fn get(&self, namespace: &str, symbol: &str) -> Option<&Extern> {
        self.entries
            .iter()
            .find(|((ns, name), _)| ns == namespace && name == symbol)
            .map(|(_, item)| item)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &Extern)> {
        self.entries
            .iter()
            .map(|((ns, name), item)| (ns.as_str(), name.as_str(), item))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Replace registry-matching function entries with wrapped callables.
/// Pure in-place mutation; the count of replaced entries is returned for
/// diagnostics only. A table without any registry symbol is normal and
/// comes back untouched.
pub fn scan_imports<T: 'static>(
    store: &mut Store<T>,
    table: &mut ImportTable,
    ctx: &HookContext,
) -> usize {
    let mut replaced = 0;
    for ((namespace, symbol), entry) in table.entries.iter_mut() {
        let Some(kind) = hooks::hook_for(symbol) else {
            continue;
        };
        if !ctx.is_active(kind) {
            continue;
        }
        let Extern::Func(original) = entry else {
            continue;
        };
        let original = *original;
        debug_log(|| format!("hooking {namespace}/{symbol} ({kind:?})"));
        *entry = Extern::Func(hooks::wrap(store, symbol, original, kind, ctx));
        replaced += 1;
    }
    replaced
}
