//! Scripting machine port — interface to the embedded execution engine.
//!
//! This port abstracts the machine so hosts (and the CLI) don't depend on
//! mlua. The infrastructure layer provides the real Lua-backed machine; a
//! no-op implementation is always available for hosts built without
//! scripting support.

use ember_domain::{ArgList, CoroutineHandle, FunctionHandle, Value};
use tracing::warn;

use crate::error::ScriptError;

/// Port for a single scripting machine instance.
///
/// A machine is single-threaded and cooperative: operations from other
/// threads are serialized, and a host callback invoked by the engine may
/// call back into any operation on its own thread. Every top-level
/// operation drains pending handle releases before touching the engine.
pub trait ScriptMachinePort: Send {
    /// Call an engine function under protection, returning its results.
    fn call(&self, function: &FunctionHandle, args: &ArgList) -> Result<ArgList, ScriptError>;

    /// Compile and run a source chunk, returning its results.
    fn do_string(&self, source: &str, chunk_name: &str) -> Result<ArgList, ScriptError>;

    /// Compile a chunk into a callable unit without running it. `binary`
    /// requests bytecode loading and is honored only when the machine was
    /// created with bytecode loading allowed.
    fn load_string(
        &self,
        source: &[u8],
        chunk_name: &str,
        binary: bool,
    ) -> Result<FunctionHandle, ScriptError>;

    /// Compile a chunk and serialize it back to engine bytecode.
    fn precompile(&self, source: &str, chunk_name: &str, strip: bool)
    -> Result<Vec<u8>, ScriptError>;

    fn set_global(&self, name: &str, value: &Value) -> Result<(), ScriptError>;

    fn get_global(&self, name: &str) -> Result<Value, ScriptError>;

    fn clear_global(&self, name: &str) -> Result<(), ScriptError>;

    /// Spawn an engine-level coroutine running `function`. The thread is
    /// anchored until the returned handle is released.
    fn create_coroutine(&self, function: &FunctionHandle)
    -> Result<CoroutineHandle, ScriptError>;

    /// Resume a coroutine with `args`, returning the values it yields or
    /// returns. Resuming a finished coroutine is a runtime error.
    fn resume(&self, coroutine: &CoroutineHandle, args: &ArgList)
    -> Result<ArgList, ScriptError>;

    /// Whether the coroutine has run to completion (or died with an error).
    fn is_finished(&self, coroutine: &CoroutineHandle) -> Result<bool, ScriptError>;

    /// Run a full engine garbage-collection cycle.
    fn collect_garbage(&self) -> Result<(), ScriptError>;

    /// Strip the globals that reach outside the sandbox.
    fn remove_unsafe_globals(&self) -> Result<(), ScriptError>;

    /// Tear the machine down; subsequent operations fail with `Disposed`.
    fn dispose(&self);
}

/// No-op machine used when scripting support is absent. Operations that
/// must produce an engine value fail with `Disposed`; the rest succeed
/// silently.
pub struct NoScriptMachine;

impl ScriptMachinePort for NoScriptMachine {
    fn call(&self, _function: &FunctionHandle, _args: &ArgList) -> Result<ArgList, ScriptError> {
        warn!("scripting support is absent; engine call dropped");
        Err(ScriptError::Disposed)
    }

    fn do_string(&self, _source: &str, _chunk_name: &str) -> Result<ArgList, ScriptError> {
        Ok(ArgList::empty())
    }

    fn load_string(
        &self,
        _source: &[u8],
        chunk_name: &str,
        _binary: bool,
    ) -> Result<FunctionHandle, ScriptError> {
        warn!(chunk_name, "scripting support is absent; chunk not loaded");
        Err(ScriptError::Disposed)
    }

    fn precompile(
        &self,
        _source: &str,
        chunk_name: &str,
        _strip: bool,
    ) -> Result<Vec<u8>, ScriptError> {
        warn!(chunk_name, "scripting support is absent; chunk not compiled");
        Err(ScriptError::Disposed)
    }

    fn set_global(&self, _name: &str, _value: &Value) -> Result<(), ScriptError> {
        Ok(())
    }

    fn get_global(&self, _name: &str) -> Result<Value, ScriptError> {
        Ok(Value::Nil)
    }

    fn clear_global(&self, _name: &str) -> Result<(), ScriptError> {
        Ok(())
    }

    fn create_coroutine(
        &self,
        _function: &FunctionHandle,
    ) -> Result<CoroutineHandle, ScriptError> {
        warn!("scripting support is absent; coroutine not created");
        Err(ScriptError::Disposed)
    }

    fn resume(
        &self,
        _coroutine: &CoroutineHandle,
        _args: &ArgList,
    ) -> Result<ArgList, ScriptError> {
        warn!("scripting support is absent; coroutine not resumed");
        Err(ScriptError::Disposed)
    }

    fn is_finished(&self, _coroutine: &CoroutineHandle) -> Result<bool, ScriptError> {
        Ok(true)
    }

    fn collect_garbage(&self) -> Result<(), ScriptError> {
        Ok(())
    }

    fn remove_unsafe_globals(&self) -> Result<(), ScriptError> {
        Ok(())
    }

    fn dispose(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_script_machine_globals_are_noop() {
        let machine = NoScriptMachine;
        machine.set_global("x", &Value::Int(1)).unwrap();
        assert_eq!(machine.get_global("x").unwrap(), Value::Nil);
        machine.clear_global("x").unwrap();
    }

    #[test]
    fn test_no_script_machine_do_string_is_empty() {
        let machine = NoScriptMachine;
        assert!(machine.do_string("return 1", "chunk").unwrap().is_empty());
    }

    #[test]
    fn test_no_script_machine_engine_ops_fail() {
        let machine = NoScriptMachine;
        assert!(matches!(
            machine.load_string(b"return 1", "chunk", false),
            Err(ScriptError::Disposed)
        ));
        assert!(matches!(
            machine.precompile("return 1", "chunk", false),
            Err(ScriptError::Disposed)
        ));
    }
}
