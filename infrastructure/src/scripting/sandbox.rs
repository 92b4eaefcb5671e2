//! Global stripping for untrusted scripts.
//!
//! The machine's stdlib set is already the safe one; this removes every
//! global that reaches outside the sandbox: filesystem and environment
//! access, process control, module loading and output. `collectgarbage`
//! is replaced with a stand-in limited to `collect` and `count`, and
//! `debug`, when loaded at all, is reduced to `traceback`. The pure
//! computation libraries (`string`, `table`, `math`, `coroutine`) stay.

use mlua::{Lua, prelude::LuaResult};

/// Strip the globals that escape the sandbox. Idempotent.
pub fn strip_unsafe_globals(lua: &Lua) -> LuaResult<()> {
    lua.load(
        r#"
        io = nil
        os = nil
        print = nil
        dofile = nil
        loadfile = nil
        require = nil
        package = nil

        local rawcollect = collectgarbage
        collectgarbage = function(opt)
            opt = opt or "collect"
            if opt == "collect" or opt == "count" then
                return rawcollect(opt)
            end
            error("collectgarbage option '" .. tostring(opt) .. "' is disabled", 2)
        end

        if debug ~= nil then
            debug = { traceback = debug.traceback }
        end
    "#,
    )
    .set_name("=sandbox")
    .exec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::{LuaOptions, StdLib};

    #[test]
    fn test_strip_removes_external_world_globals() {
        let lua = Lua::new();
        strip_unsafe_globals(&lua).unwrap();

        let ok: bool = lua
            .load(
                "return io == nil and os == nil and print == nil and package == nil\n\
                 and dofile == nil and loadfile == nil and require == nil",
            )
            .eval()
            .unwrap();
        assert!(ok);
    }

    #[test]
    fn test_collectgarbage_stand_in_allows_count_and_collect() {
        let lua = Lua::new();
        strip_unsafe_globals(&lua).unwrap();

        let count: f64 = lua.load("return collectgarbage('count')").eval().unwrap();
        assert!(count > 0.0);
        lua.load("collectgarbage('collect') collectgarbage()")
            .exec()
            .unwrap();
    }

    #[test]
    fn test_collectgarbage_stand_in_blocks_tuning() {
        let lua = Lua::new();
        strip_unsafe_globals(&lua).unwrap();

        let err = lua.load("collectgarbage('stop')").exec().unwrap_err();
        assert!(err.to_string().contains("disabled"));
        let err = lua.load("collectgarbage('setpause', 50)").exec().unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn test_debug_reduced_to_traceback() {
        let lua =
            unsafe { Lua::unsafe_new_with(StdLib::ALL_SAFE | StdLib::DEBUG, LuaOptions::default()) };
        strip_unsafe_globals(&lua).unwrap();

        let ok: bool = lua
            .load(
                "return type(debug.traceback) == 'function'\n\
                 and debug.sethook == nil and debug.getinfo == nil",
            )
            .eval()
            .unwrap();
        assert!(ok);
    }

    #[test]
    fn test_strip_preserves_pure_libraries() {
        let lua = Lua::new();
        strip_unsafe_globals(&lua).unwrap();

        let upper: String = lua.load("return string.upper('ember')").eval().unwrap();
        assert_eq!(upper, "EMBER");
        let floor: i64 = lua.load("return math.floor(2.7)").eval().unwrap();
        assert_eq!(floor, 2);
    }

    #[test]
    fn test_strip_is_idempotent() {
        let lua = Lua::new();
        strip_unsafe_globals(&lua).unwrap();
        strip_unsafe_globals(&lua).unwrap();

        let count: f64 = lua.load("return collectgarbage('count')").eval().unwrap();
        assert!(count > 0.0);
    }
}
