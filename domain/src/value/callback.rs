//! Host callbacks and their control outcomes.
//!
//! The engine's native calling convention is synchronous: a host function
//! is invoked and must produce a result count immediately. Instead of
//! returning plain values, a [`HostCallback`] returns a tagged
//! [`CallbackOutcome`] so the dispatch trampoline can distinguish an
//! ordinary return from a request to suspend the coroutine or to call back
//! into the engine asynchronously. The trampoline loops on these outcomes;
//! it never recurses, so chains of async calls cannot grow the native
//! stack.

use std::fmt;
use std::sync::Arc;

use super::args::ArgList;
use super::handle::FunctionHandle;

/// Failure raised by host glue code while executing inside an engine
/// callback. Caught at the callback boundary and translated into an
/// engine-level error; never unwound through engine frames.
#[derive(Debug, Clone)]
pub struct CallbackFault {
    message: String,
}

impl CallbackFault {
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CallbackFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host callback fault: {}", self.message)
    }
}

impl std::error::Error for CallbackFault {}

impl From<String> for CallbackFault {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for CallbackFault {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// A continuation to run with the results of a suspended operation.
/// Registered under a fresh continuation id and consumed exactly once.
pub type Continuation =
    Box<dyn FnOnce(ArgList) -> Result<CallbackOutcome, CallbackFault> + Send>;

/// Control outcome of a host callback.
pub enum CallbackOutcome {
    /// Ordinary synchronous return.
    Return(ArgList),
    /// Suspend the entire coroutine, delivering `results` to the resumer.
    /// `then`, if present, runs with the values supplied on resume.
    Yield {
        results: ArgList,
        then: Option<Continuation>,
    },
    /// Asynchronous call back into the engine. `then`, if present, runs
    /// with the call's results.
    Call {
        function: FunctionHandle,
        args: ArgList,
        then: Option<Continuation>,
    },
}

impl CallbackOutcome {
    /// Convenience constructor for a plain return.
    pub fn ret(values: ArgList) -> Self {
        CallbackOutcome::Return(values)
    }

    /// Asynchronous call with a continuation. This is the only way to call
    /// back into the engine from inside a running callback without
    /// re-entering it synchronously.
    pub fn call_then(
        function: FunctionHandle,
        args: ArgList,
        then: impl FnOnce(ArgList) -> Result<CallbackOutcome, CallbackFault> + Send + 'static,
    ) -> Self {
        CallbackOutcome::Call {
            function,
            args,
            then: Some(Box::new(then)),
        }
    }

    /// Yield the surrounding coroutine with a continuation for the resume
    /// values.
    pub fn yield_then(
        results: ArgList,
        then: impl FnOnce(ArgList) -> Result<CallbackOutcome, CallbackFault> + Send + 'static,
    ) -> Self {
        CallbackOutcome::Yield {
            results,
            then: Some(Box::new(then)),
        }
    }
}

impl fmt::Debug for CallbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackOutcome::Return(args) => write!(f, "Return({} values)", args.len()),
            CallbackOutcome::Yield { results, then } => write!(
                f,
                "Yield({} values, continuation: {})",
                results.len(),
                then.is_some()
            ),
            CallbackOutcome::Call { args, then, .. } => write!(
                f,
                "Call({} args, continuation: {})",
                args.len(),
                then.is_some()
            ),
        }
    }
}

type CallbackFn = dyn Fn(ArgList) -> Result<CallbackOutcome, CallbackFault> + Send + Sync;

/// A host-provided function exposable to the engine as a callable value.
/// Clones share the closure; identity comparison is on that shared
/// closure.
#[derive(Clone)]
pub struct HostCallback(Arc<CallbackFn>);

impl HostCallback {
    pub fn new(
        f: impl Fn(ArgList) -> Result<CallbackOutcome, CallbackFault> + Send + Sync + 'static,
    ) -> Self {
        Self(Arc::new(f))
    }

    /// Shorthand for callbacks that always return synchronously.
    pub fn returning(
        f: impl Fn(ArgList) -> Result<ArgList, CallbackFault> + Send + Sync + 'static,
    ) -> Self {
        Self::new(move |args| f(args).map(CallbackOutcome::Return))
    }

    pub fn invoke(&self, args: ArgList) -> Result<CallbackOutcome, CallbackFault> {
        (self.0)(args)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub(crate) fn same_identity(&self, other: &HostCallback) -> bool {
        self.identity() == other.identity()
    }
}

impl fmt::Debug for HostCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostCallback({:#x})", self.identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_returning_shorthand() {
        let cb = HostCallback::returning(|args| {
            Ok(ArgList::of(&[Value::Int(args.len() as i64)]))
        });
        let outcome = cb.invoke(ArgList::of(&[Value::Nil, Value::Nil])).unwrap();
        match outcome {
            CallbackOutcome::Return(values) => assert_eq!(values.get(0), Value::Int(2)),
            other => panic!("expected Return, got {other:?}"),
        }
    }

    #[test]
    fn test_identity_is_shared_across_clones() {
        let cb = HostCallback::returning(|_| Ok(ArgList::empty()));
        let other = HostCallback::returning(|_| Ok(ArgList::empty()));
        assert!(cb.same_identity(&cb.clone()));
        assert!(!cb.same_identity(&other));
    }

    #[test]
    fn test_fault_display() {
        let fault = CallbackFault::new("boom");
        assert_eq!(fault.to_string(), "host callback fault: boom");
    }
}
