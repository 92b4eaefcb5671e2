//! Application layer for ember
//!
//! This crate defines the ports through which hosts drive the scripting
//! machine, the error taxonomy shared across layers, and the sandbox
//! configuration. It depends on the domain value model but not on the
//! engine: the concrete Lua machine lives in the infrastructure layer
//! behind [`ScriptMachinePort`].

pub mod config;
pub mod error;
pub mod ports;

pub use config::MachineLimits;
pub use error::ScriptError;
pub use ports::machine::{NoScriptMachine, ScriptMachinePort};
