//! The Lua 5.3 scripting machine.
//!
//! One [`LuaMachine`] owns one Lua state plus the bookkeeping that spans
//! the two garbage-collection regimes: the anchor bridge (`bridge`), the
//! value marshaller (`marshal`), the callback trampoline (`trampoline`)
//! and the instruction/memory governor (`governor`). `sandbox` strips the
//! globals that reach outside the machine.

mod bridge;
mod governor;
pub mod machine;
mod marshal;
pub mod sandbox;
mod trampoline;

pub use machine::LuaMachine;
