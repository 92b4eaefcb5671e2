//! Sandbox configuration for a scripting machine.

use serde::{Deserialize, Serialize};

/// Limits enforced by the sandbox governor, set once per machine.
///
/// Instruction limits are cooperative: the engine checks them every
/// `instruction_quantum` instructions and on every call, so a script can
/// overshoot by at most one quantum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineLimits {
    /// Instructions between governor checks.
    pub instruction_quantum: u32,

    /// First-stage threshold: crossing it raises one recoverable timeout
    /// per top-level call. 0 disables instruction limiting.
    pub soft_instruction_limit: u64,

    /// Additional instructions past the first trip before the timeout
    /// becomes fatal for the remainder of the call.
    pub fatal_instruction_margin: u64,

    /// Engine allocator ceiling in bytes. 0 means unlimited.
    pub memory_ceiling: usize,

    /// Permit loading precompiled bytecode. Off by default: accepting
    /// binary chunks from untrusted sources defeats the sandbox.
    pub allow_bytecode: bool,
}

impl Default for MachineLimits {
    fn default() -> Self {
        Self {
            instruction_quantum: 1_000,
            soft_instruction_limit: 50_000_000,
            fatal_instruction_margin: 5_000_000,
            memory_ceiling: 256 * 1024 * 1024,
            allow_bytecode: false,
        }
    }
}

impl MachineLimits {
    /// Unlimited execution, for trusted hosts and tests.
    pub fn unrestricted() -> Self {
        Self {
            instruction_quantum: 1_000,
            soft_instruction_limit: 0,
            fatal_instruction_margin: 0,
            memory_ceiling: 0,
            allow_bytecode: false,
        }
    }

    pub fn instruction_limiting_enabled(&self) -> bool {
        self.soft_instruction_limit > 0
    }
}
