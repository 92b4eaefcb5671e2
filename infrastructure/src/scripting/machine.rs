//! The Lua machine — concrete implementation of `ScriptMachinePort`.
//!
//! One machine owns one Lua 5.3 state. Top-level operations are
//! serialized across threads and run the same prologue: refuse if
//! disposed, drain pending handle releases, reset the instruction
//! governor. An operation invoked from the thread already running engine
//! code (a host callback calling back in) nests instead of blocking and
//! keeps the outer call's accounting. Operations that execute script code
//! go through a protected-call wrapper that preserves the engine-side
//! error value, and retry once after a full GC cycle when the memory
//! ceiling is hit.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use ember_application::{MachineLimits, ScriptError, ScriptMachinePort};
use ember_domain::{ArgList, CoroutineHandle, FunctionHandle, Value};
use mlua::{
    ChunkMode, Error as LuaError, Function as LuaFunction, Lua, LuaOptions, MultiValue,
    RegistryKey, StdLib, ThreadStatus, Value as LuaValue,
};
use tracing::debug;

use super::bridge::{Bridge, ReleaseQueue};
use super::governor::{self, Governor};
use super::marshal;
use super::sandbox;
use super::trampoline::{self, ContinuationStore};

static NEXT_MACHINE_ID: AtomicU64 = AtomicU64::new(0);

/// Scripts cannot opt into binary chunks when bytecode loading is off;
/// the original `load` is captured as an upvalue and the mode forced to
/// text.
const TEXT_ONLY_LOAD: &str = r#"
local rawload = load
load = function(chunk, name, _, env)
    return rawload(chunk, name, "t", env)
end
"#;

/// Machine state shared with the marshaller and the trampoline.
pub(crate) struct MachineState {
    pub(crate) limits: MachineLimits,
    pub(crate) releaser: Arc<ReleaseQueue>,
    pub(crate) bridge: Bridge,
    pub(crate) governor: Arc<Governor>,
    pub(crate) continuations: ContinuationStore,
    pub(crate) shim: RegistryKey,
    gc_callback: Mutex<Option<Box<dyn Fn() + Send>>>,
}

/// Which thread currently owns the machine's entry, and how deep.
struct EntryState {
    owner: Option<ThreadId>,
    depth: u32,
}

/// Releases one level of entry on drop; frees the machine at depth 0.
struct EntryGuard<'a> {
    machine: &'a LuaMachine,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        let mut entries = self.machine.lock_entries();
        entries.depth -= 1;
        if entries.depth == 0 {
            entries.owner = None;
            self.machine.entry_freed.notify_one();
        }
    }
}

/// A sandboxed Lua 5.3 execution machine.
///
/// Single-threaded and cooperative: top-level operations from other
/// threads queue on the machine, while a port call from inside a running
/// host callback nests on the owning thread, so callbacks may call back
/// into any operation. Handle drops may happen on any thread; they only
/// enqueue a release that the machine drains on its next top-level
/// operation.
pub struct LuaMachine {
    lua: Lua,
    entries: Mutex<EntryState>,
    entry_freed: Condvar,
    state: Arc<MachineState>,
    /// `pcall` captured at startup, immune to script reassignment.
    protected: RegistryKey,
    disposed: AtomicBool,
}

impl LuaMachine {
    pub fn new(limits: MachineLimits) -> Result<Self, ScriptError> {
        let machine_id = NEXT_MACHINE_ID.fetch_add(1, Ordering::Relaxed) + 1;

        // Binary chunk loading requires the unsafe constructor; the stdlib
        // set stays the safe one either way.
        let lua = if limits.allow_bytecode {
            unsafe { Lua::unsafe_new_with(StdLib::ALL_SAFE, LuaOptions::default()) }
        } else {
            Lua::new()
        };

        if limits.memory_ceiling > 0 {
            lua.set_memory_limit(limits.memory_ceiling)
                .map_err(|e| ScriptError::Engine(e.to_string()))?;
        }
        if !limits.allow_bytecode {
            lua.load(TEXT_ONLY_LOAD)
                .set_name("=load_guard")
                .exec()
                .map_err(|e| translate_error(&e))?;
        }

        let governor = Arc::new(Governor::new(&limits));
        governor::install_hook(&lua, &governor);

        let bridge = Bridge::new(&lua, machine_id).map_err(|e| translate_error(&e))?;

        let shim_factory: LuaFunction = lua
            .load(trampoline::SHIM_SOURCE)
            .set_name("=trampoline")
            .eval()
            .map_err(|e| translate_error(&e))?;
        let shim = lua
            .create_registry_value(shim_factory)
            .map_err(|e| translate_error(&e))?;

        let pcall: LuaFunction = lua
            .globals()
            .get("pcall")
            .map_err(|e| translate_error(&e))?;
        let protected = lua
            .create_registry_value(pcall)
            .map_err(|e| translate_error(&e))?;

        debug!(machine_id, allow_bytecode = limits.allow_bytecode, "machine created");

        Ok(Self {
            lua,
            entries: Mutex::new(EntryState {
                owner: None,
                depth: 0,
            }),
            entry_freed: Condvar::new(),
            state: Arc::new(MachineState {
                limits,
                releaser: Arc::new(ReleaseQueue::default()),
                bridge,
                governor,
                continuations: ContinuationStore::default(),
                shim,
                gc_callback: Mutex::new(None),
            }),
            protected,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn machine_id(&self) -> u64 {
        self.state.bridge.machine_id()
    }

    /// Host hook consulted when the memory ceiling is hit, before the
    /// retry. Typically drops host-side caches holding engine handles.
    pub fn set_gc_callback(&self, callback: impl Fn() + Send + 'static) {
        let mut slot = match self.state.gc_callback.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(Box::new(callback));
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, EntryState> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Common prologue of every operation. An entry from the thread that
    /// already owns the machine (a port call inside a host callback)
    /// nests; other threads wait for the machine to free up. The release
    /// drain and the governor reset happen only at depth 0, so a nested
    /// call shares the outer call's instruction accounting.
    fn enter(&self) -> Result<EntryGuard<'_>, ScriptError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ScriptError::Disposed);
        }
        let me = thread::current().id();
        let mut entries = self.lock_entries();
        if entries.owner == Some(me) {
            entries.depth += 1;
            drop(entries);
            return Ok(EntryGuard { machine: self });
        }
        while entries.owner.is_some() {
            entries = match self.entry_freed.wait(entries) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        entries.owner = Some(me);
        entries.depth = 1;
        drop(entries);

        self.state
            .bridge
            .drain_released(&self.lua, &self.state.releaser);
        self.state.governor.reset();
        Ok(EntryGuard { machine: self })
    }

    /// Epilogue for executing operations: a script that swallowed the
    /// fatal timeout still fails.
    fn finish<R>(&self, result: Result<R, ScriptError>) -> Result<R, ScriptError> {
        if self.state.governor.is_fatal() {
            self.state.continuations.clear();
            return Err(ScriptError::Timeout { fatal: true });
        }
        result
    }

    /// Run `op`, and on allocator exhaustion run a full GC cycle plus the
    /// host GC callback, then retry once.
    fn with_memory_retry<R>(
        &self,
        lua: &Lua,
        mut op: impl FnMut(&Lua) -> Result<R, ScriptError>,
    ) -> Result<R, ScriptError> {
        match op(lua) {
            Err(ScriptError::OutOfMemory) => {
                debug!("memory ceiling exhausted, collecting and retrying once");
                lua.gc_collect().map_err(|e| translate_error(&e))?;
                let callback = match self.state.gc_callback.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(callback) = &*callback {
                    callback();
                }
                op(lua)
            }
            other => other,
        }
    }

    /// Protected call preserving the engine-side error value.
    fn protected_call(
        &self,
        lua: &Lua,
        function: LuaFunction,
        args: MultiValue,
    ) -> Result<ArgList, ScriptError> {
        let protect: LuaFunction = lua
            .registry_value(&self.protected)
            .map_err(|e| translate_error(&e))?;
        let mut full = args.into_vec();
        full.insert(0, LuaValue::Function(function));
        let results = protect
            .call::<MultiValue>(MultiValue::from_vec(full))
            .map_err(|e| translate_error(&e))?;
        let mut values = results.into_vec();
        if matches!(values.first(), Some(LuaValue::Boolean(true))) {
            values.remove(0);
            marshal::multi_to_args(lua, &self.state, MultiValue::from_vec(values))
                .map_err(|e| translate_error(&e))
        } else {
            let cause = values.into_iter().nth(1).unwrap_or(LuaValue::Nil);
            Err(self.error_from_value(lua, cause))
        }
    }

    fn error_from_value(&self, lua: &Lua, cause: LuaValue) -> ScriptError {
        if let LuaValue::Error(e) = cause {
            return translate_error(&e);
        }
        match marshal::from_lua(lua, &self.state, cause) {
            Ok(value) => {
                // Allocator failure inside pcall surfaces as this message;
                // the status code does not cross the value boundary.
                if let Value::Str(s) = &value
                    && s.contains("not enough memory")
                {
                    return ScriptError::OutOfMemory;
                }
                ScriptError::runtime(value)
            }
            Err(e) => translate_error(&e),
        }
    }
}

impl ScriptMachinePort for LuaMachine {
    fn call(&self, function: &FunctionHandle, args: &ArgList) -> Result<ArgList, ScriptError> {
        let _entry = self.enter()?;
        let result = self.with_memory_retry(&self.lua, |lua| {
            let target = marshal::engine_function(lua, &self.state, function)
                .map_err(|e| translate_error(&e))?;
            let engine_args = marshal::args_to_multi(lua, &self.state, args)
                .map_err(|e| translate_error(&e))?;
            self.protected_call(lua, target, engine_args)
        });
        self.finish(result)
    }

    fn do_string(&self, source: &str, chunk_name: &str) -> Result<ArgList, ScriptError> {
        let _entry = self.enter()?;
        let result = self.with_memory_retry(&self.lua, |lua| {
            let chunk = lua
                .load(source)
                .set_name(chunk_name)
                .into_function()
                .map_err(|e| translate_error(&e))?;
            self.protected_call(lua, chunk, MultiValue::new())
        });
        self.finish(result)
    }

    fn load_string(
        &self,
        source: &[u8],
        chunk_name: &str,
        binary: bool,
    ) -> Result<FunctionHandle, ScriptError> {
        let _entry = self.enter()?;
        if binary && !self.state.limits.allow_bytecode {
            return Err(ScriptError::Compile(
                "binary chunk loading is disabled".to_string(),
            ));
        }
        self.with_memory_retry(&self.lua, |lua| {
            let mode = if binary {
                ChunkMode::Binary
            } else {
                ChunkMode::Text
            };
            let function = lua
                .load(source)
                .set_name(chunk_name)
                .set_mode(mode)
                .into_function()
                .map_err(|e| translate_error(&e))?;
            self.state
                .bridge
                .function_handle(lua, function, &self.state.releaser)
                .map_err(|e| translate_error(&e))
        })
    }

    fn precompile(
        &self,
        source: &str,
        chunk_name: &str,
        strip: bool,
    ) -> Result<Vec<u8>, ScriptError> {
        let _entry = self.enter()?;
        self.with_memory_retry(&self.lua, |lua| {
            let function = lua
                .load(source)
                .set_name(chunk_name)
                .into_function()
                .map_err(|e| translate_error(&e))?;
            Ok(function.dump(strip))
        })
    }

    fn set_global(&self, name: &str, value: &Value) -> Result<(), ScriptError> {
        let _entry = self.enter()?;
        self.with_memory_retry(&self.lua, |lua| {
            let engine_value =
                marshal::to_lua(lua, &self.state, value).map_err(|e| translate_error(&e))?;
            lua.globals()
                .set(name, engine_value)
                .map_err(|e| translate_error(&e))
        })
    }

    fn get_global(&self, name: &str) -> Result<Value, ScriptError> {
        let _entry = self.enter()?;
        let value: LuaValue = self
            .lua
            .globals()
            .get(name)
            .map_err(|e| translate_error(&e))?;
        marshal::from_lua(&self.lua, &self.state, value).map_err(|e| translate_error(&e))
    }

    fn clear_global(&self, name: &str) -> Result<(), ScriptError> {
        let _entry = self.enter()?;
        self.lua
            .globals()
            .set(name, LuaValue::Nil)
            .map_err(|e| translate_error(&e))
    }

    fn create_coroutine(
        &self,
        function: &FunctionHandle,
    ) -> Result<CoroutineHandle, ScriptError> {
        let _entry = self.enter()?;
        self.with_memory_retry(&self.lua, |lua| {
            let target = marshal::engine_function(lua, &self.state, function)
                .map_err(|e| translate_error(&e))?;
            let thread = lua.create_thread(target).map_err(|e| translate_error(&e))?;
            self.state
                .bridge
                .coroutine_handle(lua, thread, &self.state.releaser)
                .map_err(|e| translate_error(&e))
        })
    }

    fn resume(
        &self,
        coroutine: &CoroutineHandle,
        args: &ArgList,
    ) -> Result<ArgList, ScriptError> {
        let _entry = self.enter()?;
        let result = self.with_memory_retry(&self.lua, |lua| {
            let thread = marshal::engine_thread(lua, &self.state, coroutine)
                .map_err(|e| translate_error(&e))?;
            if thread.status() != ThreadStatus::Resumable {
                return Err(ScriptError::runtime_msg("cannot resume dead coroutine"));
            }
            let engine_args = marshal::args_to_multi(lua, &self.state, args)
                .map_err(|e| translate_error(&e))?;
            let results = thread
                .resume::<MultiValue>(engine_args)
                .map_err(|e| translate_error(&e))?;
            marshal::multi_to_args(lua, &self.state, results).map_err(|e| translate_error(&e))
        });
        self.finish(result)
    }

    fn is_finished(&self, coroutine: &CoroutineHandle) -> Result<bool, ScriptError> {
        let _entry = self.enter()?;
        let thread = marshal::engine_thread(&self.lua, &self.state, coroutine)
            .map_err(|e| translate_error(&e))?;
        Ok(matches!(
            thread.status(),
            ThreadStatus::Finished | ThreadStatus::Error
        ))
    }

    fn collect_garbage(&self) -> Result<(), ScriptError> {
        let _entry = self.enter()?;
        self.lua.gc_collect().map_err(|e| translate_error(&e))
    }

    fn remove_unsafe_globals(&self) -> Result<(), ScriptError> {
        let _entry = self.enter()?;
        sandbox::strip_unsafe_globals(&self.lua).map_err(|e| translate_error(&e))
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.continuations.clear();
        self.state.bridge.clear_host_maps();
        debug!(machine_id = self.state.bridge.machine_id(), "machine disposed");
    }
}

/// Map an mlua error onto the port's taxonomy. Typed errors raised by the
/// governor, the trampoline or the marshaller are recovered by downcast;
/// plain engine errors fall through to their closest category.
pub(crate) fn translate_error(error: &LuaError) -> ScriptError {
    if let Some(script) = error.downcast_ref::<ScriptError>() {
        return script.clone();
    }
    match error {
        LuaError::SyntaxError { message, .. } => ScriptError::Compile(message.clone()),
        LuaError::MemoryError(_) => ScriptError::OutOfMemory,
        LuaError::CallbackError { cause, .. } => translate_error(cause),
        LuaError::RuntimeError(message) => ScriptError::runtime_msg(message.clone()),
        other => ScriptError::Engine(other.to_string()),
    }
}
