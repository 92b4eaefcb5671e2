//! Instruction-count governor.
//!
//! The engine calls back into the governor through a debug hook on every
//! fixed instruction quantum and on every function call. The timeout has
//! two stages: crossing the soft limit raises one recoverable timeout per
//! top-level entry; a script that swallows it keeps accumulating, and once
//! the fatal margin is exhausted the hook raises on *every* event. Call
//! events fire before the callee's protection is established, so the fatal
//! stage escapes `pcall` fences the script may have built around the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ember_application::{MachineLimits, ScriptError};
use mlua::{DebugEvent, Error as LuaError, HookTriggers, Lua, VmState};

/// Decision for a single hook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Continue,
    SoftTimeout,
    FatalTimeout,
}

/// Per-machine instruction accounting. Counters reset at the start of each
/// top-level entry point.
pub(crate) struct Governor {
    quantum: u32,
    soft_limit: u64,
    fatal_margin: u64,
    counted: AtomicU64,
    soft_tripped: AtomicBool,
    fatal: AtomicBool,
}

impl Governor {
    pub(crate) fn new(limits: &MachineLimits) -> Self {
        Self {
            quantum: limits.instruction_quantum.max(1),
            soft_limit: limits.soft_instruction_limit,
            fatal_margin: limits.fatal_instruction_margin,
            counted: AtomicU64::new(0),
            soft_tripped: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.soft_limit > 0
    }

    pub(crate) fn reset(&self) {
        self.counted.store(0, Ordering::Relaxed);
        self.soft_tripped.store(false, Ordering::Relaxed);
        self.fatal.store(false, Ordering::Relaxed);
    }

    pub(crate) fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Relaxed)
    }

    /// Account `cost` instructions and decide whether to raise.
    ///
    /// The second-stage counter accumulates from the first trip onward;
    /// catching the soft timeout does not reset it.
    pub(crate) fn charge(&self, cost: u64) -> Verdict {
        if !self.enabled() {
            return Verdict::Continue;
        }
        let counted = self.counted.fetch_add(cost, Ordering::Relaxed) + cost;
        if self.fatal.load(Ordering::Relaxed) {
            return Verdict::FatalTimeout;
        }
        if counted <= self.soft_limit {
            return Verdict::Continue;
        }
        if !self.soft_tripped.swap(true, Ordering::Relaxed) {
            return Verdict::SoftTimeout;
        }
        if counted > self.soft_limit + self.fatal_margin {
            self.fatal.store(true, Ordering::Relaxed);
            return Verdict::FatalTimeout;
        }
        Verdict::Continue
    }
}

/// Install the instruction hook on the machine's Lua state.
///
/// A `Count` event accounts a full quantum, a call event one instruction.
pub(crate) fn install_hook(lua: &Lua, governor: &Arc<Governor>) {
    if !governor.enabled() {
        return;
    }
    let quantum = governor.quantum;
    let governor = Arc::clone(governor);
    lua.set_hook(
        HookTriggers::new()
            .every_nth_instruction(quantum)
            .on_calls(),
        move |_lua, debug| {
            let cost = match debug.event() {
                DebugEvent::Count => quantum as u64,
                _ => 1,
            };
            match governor.charge(cost) {
                Verdict::Continue => Ok(VmState::Continue),
                Verdict::SoftTimeout => {
                    Err(LuaError::external(ScriptError::Timeout { fatal: false }))
                }
                Verdict::FatalTimeout => {
                    Err(LuaError::external(ScriptError::Timeout { fatal: true }))
                }
            }
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(soft: u64, margin: u64) -> MachineLimits {
        MachineLimits {
            instruction_quantum: 100,
            soft_instruction_limit: soft,
            fatal_instruction_margin: margin,
            memory_ceiling: 0,
            allow_bytecode: false,
        }
    }

    #[test]
    fn test_soft_timeout_raised_exactly_once() {
        let governor = Governor::new(&limits(1_000, 10_000));
        assert_eq!(governor.charge(900), Verdict::Continue);
        assert_eq!(governor.charge(200), Verdict::SoftTimeout);
        // Subsequent events within the margin keep running.
        assert_eq!(governor.charge(100), Verdict::Continue);
    }

    #[test]
    fn test_fatal_after_margin_and_then_always() {
        let governor = Governor::new(&limits(1_000, 500));
        assert_eq!(governor.charge(1_100), Verdict::SoftTimeout);
        assert_eq!(governor.charge(300), Verdict::Continue);
        assert_eq!(governor.charge(300), Verdict::FatalTimeout);
        // Once fatal, every event raises, even a cheap one.
        assert_eq!(governor.charge(1), Verdict::FatalTimeout);
        assert!(governor.is_fatal());
    }

    #[test]
    fn test_reset_clears_both_stages() {
        let governor = Governor::new(&limits(100, 100));
        governor.charge(150);
        governor.charge(100);
        assert!(governor.is_fatal());
        governor.reset();
        assert!(!governor.is_fatal());
        assert_eq!(governor.charge(50), Verdict::Continue);
    }

    #[test]
    fn test_zero_soft_limit_disables_accounting() {
        let governor = Governor::new(&limits(0, 0));
        assert!(!governor.enabled());
        assert_eq!(governor.charge(u64::MAX / 2), Verdict::Continue);
    }
}
