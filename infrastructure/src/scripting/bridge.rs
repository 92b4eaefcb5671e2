//! Anchor bridge between the host's reference counts and the engine's GC.
//!
//! Engine values surfaced to the host are pinned in anchor tables keyed by
//! an id that is issued once per machine lifetime and never reused. Host
//! objects anchor weakly (`__mode = "v"`): the engine may collect an unused
//! proxy and the bridge rebuilds it on the next push, keeping the same id.
//! Functions and threads behind host handles anchor strongly until the
//! handle's release is drained. A weak-keyed reverse table maps engine
//! values back to their id so re-marshalling the same function yields the
//! same handle identity.
//!
//! Handle drops may happen on any thread; they only touch the
//! [`ReleaseQueue`]. The engine-side tables are mutated exclusively by the
//! machine's own thread, which drains the queue before every operation.
//! All anchor bookkeeping runs with the memory ceiling lifted so the bridge
//! cannot be starved by the sandbox it implements.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use ember_domain::{
    CoroutineHandle, FunctionHandle, HandleReleaser, HostObjectRef, WeakCoroutineHandle,
    WeakFunctionHandle,
};
use mlua::{Lua, RegistryKey, Table as LuaTable, Value as LuaValue};
use tracing::warn;

/// Reserved key carrying the anchor id inside a host-object proxy table.
pub(crate) const OBJECT_ID_KEY: &str = "__host_id";

/// Thread-safe sink for anchor ids released by handle drops.
#[derive(Default)]
pub(crate) struct ReleaseQueue {
    pending: Mutex<Vec<u64>>,
}

impl ReleaseQueue {
    pub(crate) fn take(&self) -> Vec<u64> {
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *pending)
    }

    /// Weak reference handed to handles so a handle outliving its machine
    /// degrades to a no-op on drop.
    pub(crate) fn weak(self: &Arc<Self>) -> Weak<dyn HandleReleaser> {
        let strong: Arc<dyn HandleReleaser> = Arc::clone(self) as Arc<dyn HandleReleaser>;
        Arc::downgrade(&strong)
    }
}

impl HandleReleaser for ReleaseQueue {
    fn release(&self, id: u64) {
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending.push(id);
    }
}

struct BridgeState {
    next_id: u64,
    by_id: HashMap<u64, HostObjectRef>,
    by_object: HashMap<usize, u64>,
    functions: HashMap<u64, WeakFunctionHandle>,
    coroutines: HashMap<u64, WeakCoroutineHandle>,
}

/// Per-machine anchor bookkeeping.
pub(crate) struct Bridge {
    machine_id: u64,
    weak_anchors: RegistryKey,
    strong_anchors: RegistryKey,
    reverse: RegistryKey,
    state: Mutex<BridgeState>,
}

impl Bridge {
    pub(crate) fn new(lua: &Lua, machine_id: u64) -> mlua::Result<Self> {
        let weak = lua.create_table()?;
        let weak_mt = lua.create_table()?;
        weak_mt.set("__mode", "v")?;
        weak.set_metatable(Some(weak_mt));

        let strong = lua.create_table()?;

        let reverse = lua.create_table()?;
        let reverse_mt = lua.create_table()?;
        reverse_mt.set("__mode", "k")?;
        reverse.set_metatable(Some(reverse_mt));

        Ok(Self {
            machine_id,
            weak_anchors: lua.create_registry_value(weak)?,
            strong_anchors: lua.create_registry_value(strong)?,
            reverse: lua.create_registry_value(reverse)?,
            state: Mutex::new(BridgeState {
                next_id: 0,
                by_id: HashMap::new(),
                by_object: HashMap::new(),
                functions: HashMap::new(),
                coroutines: HashMap::new(),
            }),
        })
    }

    pub(crate) fn machine_id(&self) -> u64 {
        self.machine_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BridgeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn anchor_value(
        &self,
        lua: &Lua,
        id: u64,
        value: &LuaValue,
        permanent: bool,
    ) -> mlua::Result<()> {
        unmetered(lua, || {
            let weak: LuaTable = lua.registry_value(&self.weak_anchors)?;
            weak.raw_set(id, value.clone())?;
            if permanent {
                let strong: LuaTable = lua.registry_value(&self.strong_anchors)?;
                strong.raw_set(id, value.clone())?;
            }
            // Only collectable values can key the weak reverse table.
            if matches!(
                value,
                LuaValue::Table(_) | LuaValue::Function(_) | LuaValue::Thread(_)
            ) {
                let reverse: LuaTable = lua.registry_value(&self.reverse)?;
                reverse.raw_set(value.clone(), id)?;
            }
            Ok(())
        })
    }

    /// Anchor a bare engine value and return its fresh id.
    pub(crate) fn store_value_only(
        &self,
        lua: &Lua,
        value: &LuaValue,
        permanent: bool,
    ) -> mlua::Result<u64> {
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            state.next_id
        };
        self.anchor_value(lua, id, value, permanent)?;
        Ok(id)
    }

    /// Anchor the engine-side proxy of a host object. Idempotent on object
    /// identity: a second store of the same object re-anchors under the
    /// existing id, so a collected weak slot is simply repopulated.
    pub(crate) fn store_object_and_value(
        &self,
        lua: &Lua,
        object: &HostObjectRef,
        value: &LuaValue,
        permanent: bool,
    ) -> mlua::Result<u64> {
        let id = {
            let mut state = self.lock();
            match state.by_object.get(&object.identity()) {
                Some(id) => *id,
                None => {
                    state.next_id += 1;
                    let id = state.next_id;
                    state.by_id.insert(id, object.clone());
                    state.by_object.insert(object.identity(), id);
                    id
                }
            }
        };
        self.anchor_value(lua, id, value, permanent)?;
        Ok(id)
    }

    /// Engine value currently anchored under `id`, if any. Checks the weak
    /// slot first, then the strong one.
    pub(crate) fn value_for_id(&self, lua: &Lua, id: u64) -> mlua::Result<Option<LuaValue>> {
        let weak: LuaTable = lua.registry_value(&self.weak_anchors)?;
        let value: LuaValue = weak.raw_get(id)?;
        if value != LuaValue::Nil {
            return Ok(Some(value));
        }
        let strong: LuaTable = lua.registry_value(&self.strong_anchors)?;
        let value: LuaValue = strong.raw_get(id)?;
        if value != LuaValue::Nil {
            return Ok(Some(value));
        }
        Ok(None)
    }

    /// O(1) push path for an already-stored host object: identity → id →
    /// anchored proxy. `None` on miss (never an error).
    pub(crate) fn value_for_object(
        &self,
        lua: &Lua,
        object: &HostObjectRef,
    ) -> mlua::Result<Option<LuaValue>> {
        let id = match self.lock().by_object.get(&object.identity()) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.value_for_id(lua, id)
    }

    pub(crate) fn object_for_id(&self, id: u64) -> Option<HostObjectRef> {
        self.lock().by_id.get(&id).cloned()
    }

    /// Clear every trace of `id`: both anchor slots, the reverse mapping
    /// and the host-side maps.
    pub(crate) fn remove(&self, lua: &Lua, id: u64) -> mlua::Result<()> {
        unmetered(lua, || {
            let weak: LuaTable = lua.registry_value(&self.weak_anchors)?;
            let strong: LuaTable = lua.registry_value(&self.strong_anchors)?;
            let reverse: LuaTable = lua.registry_value(&self.reverse)?;
            let value: LuaValue = weak.raw_get(id)?;
            let value = if value == LuaValue::Nil {
                strong.raw_get(id)?
            } else {
                value
            };
            if value != LuaValue::Nil {
                reverse.raw_set(value, LuaValue::Nil)?;
            }
            weak.raw_set(id, LuaValue::Nil)?;
            strong.raw_set(id, LuaValue::Nil)?;
            Ok(())
        })?;

        let mut state = self.lock();
        if let Some(object) = state.by_id.remove(&id) {
            state.by_object.remove(&object.identity());
        }
        state.functions.remove(&id);
        state.coroutines.remove(&id);
        Ok(())
    }

    /// Drain the pending-release queue. Failures are logged and skipped so
    /// one bad id cannot wedge the queue.
    pub(crate) fn drain_released(&self, lua: &Lua, queue: &ReleaseQueue) {
        for id in queue.take() {
            if let Err(err) = self.remove(lua, id) {
                warn!(id, error = %err, "failed to clear released anchor");
            }
        }
    }

    /// Surface an engine function as a host handle, deduplicating by engine
    /// identity so the same function always yields the same handle.
    pub(crate) fn function_handle(
        &self,
        lua: &Lua,
        function: mlua::Function,
        releaser: &Arc<ReleaseQueue>,
    ) -> mlua::Result<FunctionHandle> {
        let value = LuaValue::Function(function);
        if let Some(id) = self.existing_id(lua, &value)?
            && let Some(handle) = self.lock().functions.get(&id).and_then(|weak| weak.upgrade())
        {
            return Ok(handle);
        }
        let id = self.store_value_only(lua, &value, true)?;
        let handle = FunctionHandle::new(self.machine_id, id, releaser.weak());
        self.lock().functions.insert(id, handle.downgrade());
        Ok(handle)
    }

    /// Thread counterpart of [`Bridge::function_handle`].
    pub(crate) fn coroutine_handle(
        &self,
        lua: &Lua,
        thread: mlua::Thread,
        releaser: &Arc<ReleaseQueue>,
    ) -> mlua::Result<CoroutineHandle> {
        let value = LuaValue::Thread(thread);
        if let Some(id) = self.existing_id(lua, &value)?
            && let Some(handle) = self
                .lock()
                .coroutines
                .get(&id)
                .and_then(|weak| weak.upgrade())
        {
            return Ok(handle);
        }
        let id = self.store_value_only(lua, &value, true)?;
        let handle = CoroutineHandle::new(self.machine_id, id, releaser.weak());
        self.lock().coroutines.insert(id, handle.downgrade());
        Ok(handle)
    }

    fn existing_id(&self, lua: &Lua, value: &LuaValue) -> mlua::Result<Option<u64>> {
        let reverse: LuaTable = lua.registry_value(&self.reverse)?;
        reverse.raw_get(value.clone())
    }

    /// Drop host-side maps; used by disposal. Engine tables die with the
    /// Lua state.
    pub(crate) fn clear_host_maps(&self) {
        let mut state = self.lock();
        state.by_id.clear();
        state.by_object.clear();
        state.functions.clear();
        state.coroutines.clear();
    }
}

/// Run anchor bookkeeping with the allocator ceiling lifted, restoring it
/// afterwards.
pub(crate) fn unmetered<R>(lua: &Lua, f: impl FnOnce() -> mlua::Result<R>) -> mlua::Result<R> {
    let prior = match lua.set_memory_limit(0) {
        Ok(prior) => prior,
        // Memory control unavailable; there is no ceiling to lift.
        Err(_) => return f(),
    };
    let result = f();
    let _ = lua.set_memory_limit(prior);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Lua, Bridge, Arc<ReleaseQueue>) {
        let lua = Lua::new();
        let bridge = Bridge::new(&lua, 1).unwrap();
        (lua, bridge, Arc::new(ReleaseQueue::default()))
    }

    #[test]
    fn test_ids_increase_and_are_never_reused() {
        let (lua, bridge, _queue) = setup();
        let t1 = LuaValue::Table(lua.create_table().unwrap());
        let t2 = LuaValue::Table(lua.create_table().unwrap());
        let a = bridge.store_value_only(&lua, &t1, true).unwrap();
        bridge.remove(&lua, a).unwrap();
        let b = bridge.store_value_only(&lua, &t2, true).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_weak_anchor_is_collectable() {
        let (lua, bridge, _queue) = setup();
        let id = {
            let table = LuaValue::Table(lua.create_table().unwrap());
            bridge.store_value_only(&lua, &table, false).unwrap()
        };
        // The only remaining reference is the weak anchor slot.
        lua.gc_collect().unwrap();
        lua.gc_collect().unwrap();
        assert!(bridge.value_for_id(&lua, id).unwrap().is_none());
    }

    #[test]
    fn test_strong_anchor_survives_collection() {
        let (lua, bridge, _queue) = setup();
        let id = {
            let table = LuaValue::Table(lua.create_table().unwrap());
            bridge.store_value_only(&lua, &table, true).unwrap()
        };
        lua.gc_collect().unwrap();
        lua.gc_collect().unwrap();
        assert!(bridge.value_for_id(&lua, id).unwrap().is_some());
    }

    #[test]
    fn test_object_store_is_idempotent_on_identity() {
        use std::any::Any;

        struct Marker;
        impl ember_domain::HostObject for Marker {
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let (lua, bridge, _queue) = setup();
        let object = HostObjectRef::new(Marker);
        let proxy = LuaValue::Table(lua.create_table().unwrap());
        let a = bridge
            .store_object_and_value(&lua, &object, &proxy, false)
            .unwrap();
        let b = bridge
            .store_object_and_value(&lua, &object, &proxy, false)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(bridge.object_for_id(a), Some(object));
    }

    #[test]
    fn test_function_handles_dedupe_by_engine_identity() {
        let (lua, bridge, queue) = setup();
        let f: mlua::Function = lua.load("return function() end").eval().unwrap();
        let a = bridge.function_handle(&lua, f.clone(), &queue).unwrap();
        let b = bridge.function_handle(&lua, f, &queue).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_drain_clears_released_anchors() {
        let (lua, bridge, queue) = setup();
        let f: mlua::Function = lua.load("return function() end").eval().unwrap();
        let handle = bridge.function_handle(&lua, f, &queue).unwrap();
        let id = handle.id();
        drop(handle);
        assert!(bridge.value_for_id(&lua, id).unwrap().is_some());
        bridge.drain_released(&lua, &queue);
        assert!(bridge.value_for_id(&lua, id).unwrap().is_none());
    }
}
