//! Value marshalling between the host model and the engine.
//!
//! Host → engine is unconditional (host tables are acyclic by
//! construction). Engine → host guards against cyclic tables with a
//! transient seen-set keyed by engine table identity: a table reached a
//! second time converts to nil. Engine strings copy out: valid UTF-8
//! becomes `Str`, anything else `Bytes`, both independent of the engine's
//! collector.

use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::Arc;

use ember_application::ScriptError;
use ember_domain::{
    ArgList, ByteString, CoroutineHandle, FunctionHandle, HostObjectRef, RawPtr, TableRef, Value,
};
use mlua::{
    Error as LuaError, Function as LuaFunction, LightUserData, Lua, MultiValue,
    Table as LuaTable, Thread as LuaThread, Value as LuaValue,
};
use tracing::debug;

use super::bridge::OBJECT_ID_KEY;
use super::machine::MachineState;
use super::trampoline;

pub(crate) fn to_lua(
    lua: &Lua,
    state: &Arc<MachineState>,
    value: &Value,
) -> mlua::Result<LuaValue> {
    match value {
        Value::Nil => Ok(LuaValue::Nil),
        Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        Value::Int(i) => Ok(LuaValue::Integer(*i)),
        Value::Float(f) => Ok(LuaValue::Number(*f)),
        Value::Str(s) => Ok(LuaValue::String(lua.create_string(s)?)),
        Value::Bytes(b) => Ok(LuaValue::String(lua.create_string(b.as_bytes())?)),
        Value::Table(t) => table_to_lua(lua, state, t),
        Value::Object(o) => push_object(lua, state, o),
        Value::Function(h) => Ok(LuaValue::Function(engine_function(lua, state, h)?)),
        Value::Coroutine(h) => Ok(LuaValue::Thread(engine_thread(lua, state, h)?)),
        Value::Callback(cb) => Ok(LuaValue::Function(trampoline::make_callback_function(
            lua,
            state,
            cb.clone(),
        )?)),
        Value::Pointer(p) => Ok(LuaValue::LightUserData(LightUserData(p.0 as *mut c_void))),
    }
}

pub(crate) fn from_lua(
    lua: &Lua,
    state: &Arc<MachineState>,
    value: LuaValue,
) -> mlua::Result<Value> {
    let mut seen = HashSet::new();
    convert(lua, state, value, &mut seen)
}

fn convert(
    lua: &Lua,
    state: &Arc<MachineState>,
    value: LuaValue,
    seen: &mut HashSet<usize>,
) -> mlua::Result<Value> {
    match value {
        LuaValue::Nil => Ok(Value::Nil),
        LuaValue::Boolean(b) => Ok(Value::Bool(b)),
        LuaValue::Integer(i) => Ok(Value::Int(i)),
        LuaValue::Number(n) => Ok(Value::Float(n)),
        LuaValue::String(s) => {
            let bytes = s.as_bytes();
            match std::str::from_utf8(&bytes) {
                Ok(text) => Ok(Value::Str(text.to_string())),
                Err(_) => Ok(Value::Bytes(ByteString::from(&bytes[..]))),
            }
        }
        LuaValue::Table(t) => table_from_lua(lua, state, t, seen),
        LuaValue::Function(f) => Ok(Value::Function(state.bridge.function_handle(
            lua,
            f,
            &state.releaser,
        )?)),
        LuaValue::Thread(t) => Ok(Value::Coroutine(state.bridge.coroutine_handle(
            lua,
            t,
            &state.releaser,
        )?)),
        LuaValue::LightUserData(p) => Ok(Value::Pointer(RawPtr(p.0 as usize))),
        LuaValue::Error(e) => Err(*e),
        other => {
            debug!(kind = other.type_name(), "opaque engine value converts to nil");
            Ok(Value::Nil)
        }
    }
}

fn table_from_lua(
    lua: &Lua,
    state: &Arc<MachineState>,
    table: LuaTable,
    seen: &mut HashSet<usize>,
) -> mlua::Result<Value> {
    // Host-object proxies marshal back to the original reference.
    let marker: LuaValue = table.raw_get(OBJECT_ID_KEY)?;
    if let LuaValue::Integer(id) = marker
        && let Some(object) = state.bridge.object_for_id(id as u64)
    {
        return Ok(Value::Object(object));
    }

    let identity = table.to_pointer() as usize;
    if !seen.insert(identity) {
        return Ok(Value::Nil);
    }

    let out = TableRef::new();
    for pair in table.pairs::<LuaValue, LuaValue>() {
        let (key, value) = pair?;
        let key = convert(lua, state, key, seen)?;
        // A key that collapsed to nil (cyclic table) cannot be stored.
        if key.is_nil() {
            continue;
        }
        let value = convert(lua, state, value, seen)?;
        out.set(key, value).map_err(LuaError::external)?;
    }
    Ok(Value::Table(out))
}

fn table_to_lua(lua: &Lua, state: &Arc<MachineState>, table: &TableRef) -> mlua::Result<LuaValue> {
    let out = lua.create_table()?;
    for (key, value) in table.entries() {
        out.raw_set(to_lua(lua, state, &key)?, to_lua(lua, state, &value)?)?;
    }
    Ok(LuaValue::Table(out))
}

/// Push a host object as its engine-side proxy table. O(1) when the proxy
/// is still anchored; otherwise the proxy is rebuilt under the same id.
fn push_object(
    lua: &Lua,
    state: &Arc<MachineState>,
    object: &HostObjectRef,
) -> mlua::Result<LuaValue> {
    if let Some(existing) = state.bridge.value_for_object(lua, object)? {
        return Ok(existing);
    }

    let proxy = lua.create_table()?;
    let id = state.bridge.store_object_and_value(
        lua,
        object,
        &LuaValue::Table(proxy.clone()),
        false,
    )?;
    proxy.raw_set(OBJECT_ID_KEY, id)?;

    if let Some(class) = object.class() {
        let methods = lua.create_table()?;
        for (name, callback) in class.methods() {
            methods.set(
                name.as_str(),
                trampoline::make_callback_function(lua, state, callback.clone())?,
            )?;
        }
        let metatable = lua.create_table()?;
        metatable.set("__index", methods)?;
        proxy.set_metatable(Some(metatable));
    }
    Ok(LuaValue::Table(proxy))
}

/// Resolve a function handle to the anchored engine function, rejecting
/// handles from other machines and handles whose anchor is gone.
pub(crate) fn engine_function(
    lua: &Lua,
    state: &Arc<MachineState>,
    handle: &FunctionHandle,
) -> mlua::Result<LuaFunction> {
    if handle.machine_id() != state.bridge.machine_id() {
        return Err(LuaError::external(ScriptError::ForeignHandle));
    }
    match state.bridge.value_for_id(lua, handle.id())? {
        Some(LuaValue::Function(f)) => Ok(f),
        _ => Err(LuaError::external(ScriptError::StaleHandle(handle.id()))),
    }
}

/// Thread counterpart of [`engine_function`].
pub(crate) fn engine_thread(
    lua: &Lua,
    state: &Arc<MachineState>,
    handle: &CoroutineHandle,
) -> mlua::Result<LuaThread> {
    if handle.machine_id() != state.bridge.machine_id() {
        return Err(LuaError::external(ScriptError::ForeignHandle));
    }
    match state.bridge.value_for_id(lua, handle.id())? {
        Some(LuaValue::Thread(t)) => Ok(t),
        _ => Err(LuaError::external(ScriptError::StaleHandle(handle.id()))),
    }
}

pub(crate) fn args_to_multi(
    lua: &Lua,
    state: &Arc<MachineState>,
    args: &ArgList,
) -> mlua::Result<MultiValue> {
    let mut values = Vec::with_capacity(args.len());
    for value in args.iter() {
        values.push(to_lua(lua, state, value)?);
    }
    Ok(MultiValue::from_vec(values))
}

pub(crate) fn multi_to_args(
    lua: &Lua,
    state: &Arc<MachineState>,
    values: MultiValue,
) -> mlua::Result<ArgList> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        out.push(from_lua(lua, state, value)?);
    }
    Ok(ArgList::from_values(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::LuaMachine;
    use ember_application::{MachineLimits, ScriptMachinePort};

    fn machine() -> LuaMachine {
        LuaMachine::new(MachineLimits::unrestricted()).unwrap()
    }

    #[test]
    fn test_cyclic_engine_table_converts_to_nil() {
        let m = machine();
        let results = m
            .do_string("local t = { tag = 1 } t.inner = t return t", "cycle")
            .unwrap();
        let table = results.first();
        let table = table.as_table().unwrap();
        assert_eq!(table.get(&Value::Str("tag".into())), Value::Int(1));
        assert_eq!(table.get(&Value::Str("inner".into())), Value::Nil);
    }

    #[test]
    fn test_non_utf8_engine_string_becomes_bytes() {
        let m = machine();
        let results = m.do_string(r#"return "\xff\xfe""#, "bytes").unwrap();
        match results.first() {
            Value::Bytes(b) => assert_eq!(b.as_bytes(), &[0xff, 0xfe]),
            other => panic!("expected bytes, got {other:?}"),
        }
    }

    #[test]
    fn test_utf8_engine_string_becomes_str() {
        let m = machine();
        let results = m.do_string("return 'héllo'", "text").unwrap();
        assert_eq!(results.first(), Value::Str("héllo".into()));
    }

    #[test]
    fn test_pointer_crosses_as_light_userdata() {
        let m = machine();
        m.set_global("p", &Value::Pointer(RawPtr(0x1234))).unwrap();
        let kind = m.do_string("return type(p)", "ptr").unwrap();
        assert_eq!(kind.first(), Value::Str("userdata".into()));
        assert_eq!(m.get_global("p").unwrap(), Value::Pointer(RawPtr(0x1234)));
    }

    #[test]
    fn test_host_table_roundtrip_preserves_structure() {
        let m = machine();
        let table = TableRef::new();
        table.insert(Value::Int(10)).unwrap();
        table.insert(Value::Int(20)).unwrap();
        table
            .set(Value::Str("name".into()), Value::Str("ember".into()))
            .unwrap();
        m.set_global("t", &Value::Table(table.clone())).unwrap();

        let len = m.do_string("return #t", "len").unwrap();
        assert_eq!(len.first(), Value::Int(2));

        let back = m.get_global("t").unwrap();
        assert!(back.deep_equals(&Value::Table(table)));
    }
}
