//! Callback trampoline.
//!
//! The engine's native calling convention is synchronous, so a host
//! callback that wants to yield or to call back into the engine cannot just
//! return values. Every [`HostCallback`] is wrapped in a Lua-side shim plus
//! a Rust dispatch function. The dispatch function runs host code and
//! encodes its [`CallbackOutcome`] as a tagged tuple; the shim loops on the
//! tag, performing the yield or the protected call itself. The loop lives
//! in Lua and every dispatch returns before the next step begins, so a
//! chain of a thousand async calls leaves the native stack flat.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

use ember_application::ScriptError;
use ember_domain::{ArgList, CallbackOutcome, Continuation, HostCallback};
use mlua::{
    Error as LuaError, Function as LuaFunction, Lua, MultiValue, Value as LuaValue, Variadic,
};
use tracing::error;

use super::machine::MachineState;
use super::marshal;

/// Shim factory: called once per wrapped callback with its dispatch
/// function, returns the engine-callable closure.
///
/// Dispatch protocol: `dispatch(0, nil, ...)` invokes the callback,
/// `dispatch(1, id, ...)` feeds values to the pending continuation `id`,
/// `dispatch(2, id)` discards it. Dispatch returns `0, results...` for a
/// return, `1, id|nil, results...` for a yield and `2, id|nil, target,
/// args...` for an async call.
pub(crate) const SHIM_SOURCE: &str = r#"
return function(dispatch)
    local pack, unpack = table.pack, table.unpack
    local pcall, error, yield = pcall, error, coroutine.yield
    return function(...)
        local r = pack(dispatch(0, nil, ...))
        while true do
            local tag = r[1]
            if tag == 0 then
                return unpack(r, 2, r.n)
            elseif tag == 1 then
                local id = r[2]
                if id == nil then
                    return yield(unpack(r, 3, r.n))
                end
                local resumed = pack(yield(unpack(r, 3, r.n)))
                r = pack(dispatch(1, id, unpack(resumed, 1, resumed.n)))
            else
                local id, target = r[2], r[3]
                local call = pack(pcall(target, unpack(r, 4, r.n)))
                if not call[1] then
                    if id ~= nil then
                        dispatch(2, id)
                    end
                    error(call[2], 0)
                end
                if id == nil then
                    return unpack(call, 2, call.n)
                end
                r = pack(dispatch(1, id, unpack(call, 2, call.n)))
            end
        end
    end
end
"#;

const OP_INVOKE: u32 = 0;
const OP_RESUME: u32 = 1;
const OP_DISCARD: u32 = 2;

/// Continuations pending a resume or an async-call result. An id is issued
/// once, consumed exactly once, and never reused.
#[derive(Default)]
pub(crate) struct ContinuationStore {
    next: AtomicU64,
    pending: Mutex<HashMap<u64, Continuation>>,
}

impl ContinuationStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Continuation>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn register(&self, continuation: Continuation) -> u64 {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(id, continuation);
        id
    }

    /// Look up and remove atomically, so an id cannot run twice.
    pub(crate) fn take(&self, id: u64) -> Option<Continuation> {
        self.lock().remove(&id)
    }

    pub(crate) fn discard(&self, id: u64) {
        self.lock().remove(&id);
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.lock().len()
    }
}

/// Wrap a host callback into an engine-callable function running through
/// the machine's shim.
pub(crate) fn make_callback_function(
    lua: &Lua,
    state: &Arc<MachineState>,
    callback: HostCallback,
) -> mlua::Result<LuaFunction> {
    let dispatch = {
        let state = Arc::clone(state);
        lua.create_function(
            move |lua, (op, id, args): (u32, Option<u64>, Variadic<LuaValue>)| {
                dispatch(lua, &state, &callback, op, id, args)
            },
        )?
    };
    let factory: LuaFunction = lua.registry_value(&state.shim)?;
    factory.call::<LuaFunction>(dispatch)
}

fn dispatch(
    lua: &Lua,
    state: &Arc<MachineState>,
    callback: &HostCallback,
    op: u32,
    id: Option<u64>,
    args: Variadic<LuaValue>,
) -> mlua::Result<MultiValue> {
    let outcome = match op {
        OP_INVOKE => callback.invoke(host_args(lua, state, args)?),
        OP_RESUME => {
            let id = id.ok_or_else(|| {
                LuaError::external(ScriptError::Engine("missing continuation id".to_string()))
            })?;
            let continuation = state.continuations.take(id).ok_or_else(|| {
                LuaError::external(ScriptError::Engine(format!(
                    "continuation {id} already consumed"
                )))
            })?;
            continuation(host_args(lua, state, args)?)
        }
        OP_DISCARD => {
            if let Some(id) = id {
                state.continuations.discard(id);
            }
            return Ok(MultiValue::new());
        }
        other => {
            return Err(LuaError::external(ScriptError::Engine(format!(
                "unknown dispatch op {other}"
            ))));
        }
    };

    match outcome {
        Ok(outcome) => encode_outcome(lua, state, outcome),
        Err(fault) => {
            error!(fault = %fault, "host callback failed");
            Err(LuaError::external(ScriptError::Host(
                fault.message().to_string(),
            )))
        }
    }
}

fn host_args(
    lua: &Lua,
    state: &Arc<MachineState>,
    args: Variadic<LuaValue>,
) -> mlua::Result<ArgList> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args.into_iter() {
        values.push(marshal::from_lua(lua, state, arg)?);
    }
    Ok(ArgList::from_values(values))
}

fn encode_outcome(
    lua: &Lua,
    state: &Arc<MachineState>,
    outcome: CallbackOutcome,
) -> mlua::Result<MultiValue> {
    let mut encoded: Vec<LuaValue> = Vec::new();
    match outcome {
        CallbackOutcome::Return(values) => {
            encoded.push(LuaValue::Integer(0));
            push_args(lua, state, &values, &mut encoded)?;
        }
        CallbackOutcome::Yield { results, then } => {
            encoded.push(LuaValue::Integer(1));
            encoded.push(continuation_id(state, then));
            push_args(lua, state, &results, &mut encoded)?;
        }
        CallbackOutcome::Call {
            function,
            args,
            then,
        } => {
            let target = marshal::engine_function(lua, state, &function)?;
            encoded.push(LuaValue::Integer(2));
            encoded.push(continuation_id(state, then));
            encoded.push(LuaValue::Function(target));
            push_args(lua, state, &args, &mut encoded)?;
        }
    }
    Ok(MultiValue::from_vec(encoded))
}

fn continuation_id(state: &Arc<MachineState>, then: Option<Continuation>) -> LuaValue {
    match then {
        Some(continuation) => LuaValue::Integer(state.continuations.register(continuation) as i64),
        None => LuaValue::Nil,
    }
}

fn push_args(
    lua: &Lua,
    state: &Arc<MachineState>,
    args: &ArgList,
    out: &mut Vec<LuaValue>,
) -> mlua::Result<()> {
    for value in args.iter() {
        out.push(marshal::to_lua(lua, state, value)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_domain::CallbackFault;

    fn noop() -> Continuation {
        Box::new(|_args| Ok(CallbackOutcome::ret(ArgList::empty())))
    }

    #[test]
    fn test_continuation_consumed_exactly_once() {
        let store = ContinuationStore::default();
        let id = store.register(noop());
        assert!(store.take(id).is_some());
        assert!(store.take(id).is_none());
    }

    #[test]
    fn test_continuation_ids_are_unique() {
        let store = ContinuationStore::default();
        let a = store.register(noop());
        let b = store.register(noop());
        assert_ne!(a, b);
        assert_eq!(store.pending_count(), 2);
    }

    #[test]
    fn test_discard_drops_pending_continuation() {
        let store = ContinuationStore::default();
        let id = store.register(Box::new(|_| Err(CallbackFault::new("must never run"))));
        store.discard(id);
        assert_eq!(store.pending_count(), 0);
    }
}
