//! Domain layer for ember
//!
//! This crate contains the value model shared between the host application
//! and the embedded scripting engine, plus the engine-independent value
//! objects built on top of it. It has no dependency on the engine itself:
//! the concrete Lua machine lives in the infrastructure layer behind
//! `ScriptMachinePort`.
//!
//! # Core concepts
//!
//! ## Value
//!
//! A tagged union over everything that can cross the host/engine boundary:
//! nil, booleans, 64-bit integers and floats, two string representations,
//! tables, host objects, engine function/coroutine handles, host callbacks
//! and raw pointers. Equality follows Lua 5.3: numbers compare numerically
//! across the integer/float split, strings compare by content across both
//! representations, everything else compares by identity.
//!
//! ## Handles
//!
//! `FunctionHandle` and `CoroutineHandle` stand in for engine-resident
//! values. Release is deterministic: dropping the last clone enqueues the
//! handle's anchor id on the owning machine's pending-release queue, which
//! the machine drains before its next engine operation.
//!
//! ## Callback outcomes
//!
//! Host callbacks return an explicit [`value::CallbackOutcome`] — return,
//! yield, or asynchronous call — which the infrastructure trampoline
//! interprets without growing the native stack.

pub mod codec;
pub mod error;
pub mod value;

pub use codec::{CodecError, ValueCodec};
pub use error::ValueError;
pub use value::{
    ArgList, ByteString, CallbackFault, CallbackOutcome, Continuation, CoroutineHandle,
    FunctionHandle, HandleReleaser, HostCallback, HostObject, HostObjectRef, ObjectClass, RawPtr,
    TableRef, Value, WeakCoroutineHandle, WeakFunctionHandle,
};
