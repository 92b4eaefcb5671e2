//! Infrastructure layer for ember
//!
//! Concrete implementation of the scripting ports on top of mlua
//! (vendored Lua 5.3). Hosts normally depend on the application layer's
//! [`ScriptMachinePort`](ember_application::ScriptMachinePort) and construct
//! a [`scripting::LuaMachine`] here.

pub mod scripting;

pub use scripting::LuaMachine;
