//! Instantiation interception.
//!
//! Explicit composition instead of patched globals: `ModuleLoader` is the
//! wasmtime-backed loading facility with both entry points (raw bytes and
//! streaming), and `InterceptingLoader` wraps any loader so that every
//! instantiation attempt has its import table scanned synchronously before
//! the inner entry point runs. The inner result, success or failure,
//! passes through unmodified.

use std::io::Read;

use wasmtime::error::Context;
use wasmtime::{Engine, Instance, Linker, Module, Result, Store, bail};

use crate::debug_log;
use crate::hooks::HookContext;
use crate::scanner::{ImportTable, scan_imports};

/// A module-instantiation facility. Both entry points take the module
/// source and the caller-supplied import table; the table is consumed
/// during the call and not retained.
pub trait Loader<T> {
    /// Compile from raw bytes, then instantiate.
    fn instantiate(
        &self,
        store: &mut Store<T>,
        bytes: &[u8],
        imports: &mut ImportTable,
    ) -> Result<Instance>;

    /// Drain `source`, then compile and instantiate.
    fn instantiate_streaming(
        &self,
        store: &mut Store<T>,
        source: &mut dyn Read,
        imports: &mut ImportTable,
    ) -> Result<Instance>;
}

/// The underlying loader. Imports resolve from the table first, then from
/// the optional base linker; the base covers namespaces the table does not
/// (WASI and similar), which are never part of scanning.
pub struct ModuleLoader<T> {
    engine: Engine,
    base: Option<Linker<T>>,
}

impl<T> ModuleLoader<T> {
    pub fn new(engine: Engine) -> Self {
        Self { engine, base: None }
    }

    pub fn with_base(engine: Engine, base: Linker<T>) -> Self {
        Self {
            engine,
            base: Some(base),
        }
    }

    fn instantiate_module(
        &self,
        store: &mut Store<T>,
        module: &Module,
        imports: &mut ImportTable,
    ) -> Result<Instance> {
        let mut externs = Vec::with_capacity(module.imports().len());
        for import in module.imports() {
            let namespace = import.module();
            let symbol = import.name();
            if let Some(item) = imports.get(namespace, symbol) {
                externs.push(item.clone());
                continue;
            }
            if let Some(base) = &self.base {
                if let Some(item) = base.get(&mut *store, namespace, symbol) {
                    externs.push(item);
                    continue;
                }
            }
            bail!("unresolved import {namespace}/{symbol}");
        }
        Instance::new(&mut *store, module, &externs).context("instantiate module")
    }
}

impl<T> Loader<T> for ModuleLoader<T> {
    fn instantiate(
        &self,
        store: &mut Store<T>,
        bytes: &[u8],
        imports: &mut ImportTable,
    ) -> Result<Instance> {
        let module = Module::new(&self.engine, bytes).context("compile module")?;
        self.instantiate_module(store, &module, imports)
    }

    fn instantiate_streaming(
        &self,
        store: &mut Store<T>,
        source: &mut dyn Read,
        imports: &mut ImportTable,
    ) -> Result<Instance> {
        let mut bytes = Vec::new();
        source
            .read_to_end(&mut bytes)
            .context("read module stream")?;
        let module = Module::new(&self.engine, &bytes).context("compile module")?;
        self.instantiate_module(store, &module, imports)
    }
}

/// Wraps a loader so every instantiation attempt is scanned first. The
/// interceptor is stateless: calls are independent, nothing about the
/// table is retained, and it may run any number of times.
pub struct InterceptingLoader<L> {
    inner: L,
    hooks: HookContext,
}

impl<L> InterceptingLoader<L> {
    pub fn new(inner: L, hooks: HookContext) -> Self {
        Self { inner, hooks }
    }
}

impl<T: 'static, L: Loader<T>> Loader<T> for InterceptingLoader<L> {
    fn instantiate(
        &self,
        store: &mut Store<T>,
        bytes: &[u8],
        imports: &mut ImportTable,
    ) -> Result<Instance> {
        let replaced = scan_imports(store, imports, &self.hooks);
        debug_log(|| format!("instantiate: hooked {replaced} of {} imports", imports.len()));
        self.inner.instantiate(store, bytes, imports)
    }

    fn instantiate_streaming(
        &self,
        store: &mut Store<T>,
        source: &mut dyn Read,
        imports: &mut ImportTable,
    ) -> Result<Instance> {
        let replaced = scan_imports(store, imports, &self.hooks);
        debug_log(|| format!("instantiate_streaming: hooked {replaced} of {} imports", imports.len()));
        self.inner.instantiate_streaming(store, source, imports)
    }
}
