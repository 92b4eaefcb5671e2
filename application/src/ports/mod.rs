//! Ports - interfaces between the application layer and infrastructure.

pub mod machine;

pub use machine::{NoScriptMachine, ScriptMachinePort};
