//! Host/guest string transfer.
//!
//! The guest exposes one adapter export, `scratch_alloc(len) -> ptr`,
//! returning the address of a reusable scratch region of at least `len`
//! bytes. Strings cross the boundary NUL-terminated. Because the scratch
//! region is a single slot, at most one bridge-produced pointer may be
//! valid at a time: a write acquires the slot and returns a guard, and the
//! slot stays unavailable until the guard drops. Acquiring while a guard is
//! live is reported as `SlotBusy` instead of silently clobbering the
//! previous pointer.

use std::fmt;
use std::sync::{Arc, Mutex};

use wasmtime::{AsContext, Caller, Extern, Func, Memory, Val};

pub const MEMORY_EXPORT: &str = "memory";
pub const ADAPTER_EXPORT: &str = "scratch_alloc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    MemoryMissing,
    AdapterMissing,
    AdapterFailed(String),
    OutOfBounds(u32),
    Unterminated(u32),
    InvalidUtf8(u32),
    SlotBusy,
}

impl fmt::Display for MarshalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshalError::MemoryMissing => write!(f, "guest does not export linear memory"),
            MarshalError::AdapterMissing => {
                write!(f, "guest does not export adapter `{ADAPTER_EXPORT}`")
            }
            MarshalError::AdapterFailed(reason) => write!(f, "adapter call failed: {reason}"),
            MarshalError::OutOfBounds(ptr) => write!(f, "pointer {ptr:#x} out of bounds"),
            MarshalError::Unterminated(ptr) => {
                write!(f, "string at {ptr:#x} runs past end of memory")
            }
            MarshalError::InvalidUtf8(ptr) => write!(f, "string at {ptr:#x} is not UTF-8"),
            MarshalError::SlotBusy => {
                write!(f, "scratch slot already holds an unconsumed pointer")
            }
        }
    }
}

impl std::error::Error for MarshalError {}

#[derive(Debug, Default)]
struct MarshalSlot {
    live: bool,
}

/// Handle to the one-deep allocation arena, shared by every wrapped
/// callable built from the same hook context.
#[derive(Clone, Default)]
pub struct SharedSlot(Arc<Mutex<MarshalSlot>>);

impl SharedSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self) -> Result<(), MarshalError> {
        let mut slot = self.0.lock().map_err(|_| MarshalError::SlotBusy)?;
        if slot.live {
            return Err(MarshalError::SlotBusy);
        }
        slot.live = true;
        Ok(())
    }

    fn release(&self) {
        if let Ok(mut slot) = self.0.lock() {
            slot.live = false;
        }
    }
}

/// A bridge-produced pointer into guest memory. Single-use: the scratch
/// slot is held until this guard drops, and a second write in the interim
/// fails rather than invalidating the pointer behind the caller's back.
pub struct SlotGuard {
    ptr: u32,
    slot: SharedSlot,
}

impl SlotGuard {
    pub fn ptr(&self) -> u32 {
        self.ptr
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slot.release();
    }
}

/// String transfer primitive, resolved per invocation. The guest's memory
/// and adapter export only exist once the module is running, so resolution
/// happens from the live call context rather than at wrap time.
pub struct MarshalBridge {
    memory: Memory,
    adapter: Func,
    slot: SharedSlot,
}

impl MarshalBridge {
    pub fn from_caller<T>(
        caller: &mut Caller<'_, T>,
        slot: &SharedSlot,
    ) -> Result<Self, MarshalError> {
        let memory = caller
            .get_export(MEMORY_EXPORT)
            .and_then(Extern::into_memory)
            .ok_or(MarshalError::MemoryMissing)?;
        let adapter = caller
            .get_export(ADAPTER_EXPORT)
            .and_then(Extern::into_func)
            .ok_or(MarshalError::AdapterMissing)?;
        Ok(Self {
            memory,
            adapter,
            slot: slot.clone(),
        })
    }

    /// Decode the NUL-terminated string at `ptr`. Guest-supplied pointers
    /// are read freely; reads never touch the slot.
    pub fn read_string<S: AsContext>(&self, ctx: &S, ptr: u32) -> Result<String, MarshalError> {
        read_cstr(&self.memory, ctx, ptr)
    }

    /// Encode `value` into the scratch slot and return its address. Fails
    /// with `SlotBusy` while a previously returned guard is still alive.
    pub fn write_string<T>(
        &self,
        caller: &mut Caller<'_, T>,
        value: &str,
    ) -> Result<SlotGuard, MarshalError> {
        self.slot.acquire()?;
        match self.write_to_scratch(caller, value) {
            Ok(ptr) => Ok(SlotGuard {
                ptr,
                slot: self.slot.clone(),
            }),
            Err(err) => {
                self.slot.release();
                Err(err)
            }
        }
    }

    fn write_to_scratch<T>(
        &self,
        caller: &mut Caller<'_, T>,
        value: &str,
    ) -> Result<u32, MarshalError> {
        let bytes = value.as_bytes();
        let len = bytes.len() as i32 + 1;
        let mut results = [Val::I32(0)];
        self.adapter
            .call(&mut *caller, &[Val::I32(len)], &mut results)
            .map_err(|err| MarshalError::AdapterFailed(err.to_string()))?;
        let ptr = results[0]
            .i32()
            .ok_or_else(|| MarshalError::AdapterFailed("non-i32 scratch address".to_string()))?
            as u32;
        self.memory
            .write(&mut *caller, ptr as usize, bytes)
            .map_err(|_| MarshalError::OutOfBounds(ptr))?;
        self.memory
            .write(&mut *caller, ptr as usize + bytes.len(), &[0])
            .map_err(|_| MarshalError::OutOfBounds(ptr))?;
        Ok(ptr)
    }
}

/// Decode a NUL-terminated UTF-8 string from guest memory at `ptr`.
pub fn read_cstr<S: AsContext>(
    memory: &Memory,
    ctx: &S,
    ptr: u32,
) -> Result<String, MarshalError> {
    let data = memory.data(ctx);
    let start = ptr as usize;
    if start >= data.len() {
        return Err(MarshalError::OutOfBounds(ptr));
    }
    let tail = &data[start..];
    let nul = tail
        .iter()
        .position(|byte| *byte == 0)
        .ok_or(MarshalError::Unterminated(ptr))?;
    std::str::from_utf8(&tail[..nul])
        .map(str::to_owned)
        .map_err(|_| MarshalError::InvalidUtf8(ptr))
}
