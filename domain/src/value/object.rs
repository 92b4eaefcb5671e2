//! Host objects exposed into the engine.
//!
//! A host object is reference-counted and identity-compared. Method
//! dispatch uses an explicit builder ([`ObjectClass`]): the host registers
//! name → callback pairs at startup, and the machine turns that into the
//! metatable behind every proxy of the class. There is no reflection.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::callback::HostCallback;

/// A host object that can be handed into the engine.
///
/// Implementors provide `as_any` for downcasting inside method callbacks;
/// `type_name` only feeds diagnostics.
pub trait HostObject: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn type_name(&self) -> &str {
        "hostobject"
    }
}

/// Explicit method registration table for a class of host objects.
///
/// Built by the host at startup; the machine caches one engine-side method
/// table per class. Method callbacks receive the object itself as their
/// first argument.
#[derive(Clone)]
pub struct ObjectClass {
    name: String,
    methods: Vec<(String, HostCallback)>,
}

impl ObjectClass {
    pub fn builder(name: impl Into<String>) -> ObjectClassBuilder {
        ObjectClassBuilder {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[(String, HostCallback)] {
        &self.methods
    }
}

impl fmt::Debug for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectClass")
            .field("name", &self.name)
            .field("methods", &self.methods.len())
            .finish()
    }
}

/// Builder for [`ObjectClass`].
pub struct ObjectClassBuilder {
    name: String,
    methods: Vec<(String, HostCallback)>,
}

impl ObjectClassBuilder {
    pub fn method(mut self, name: impl Into<String>, callback: HostCallback) -> Self {
        self.methods.push((name.into(), callback));
        self
    }

    pub fn build(self) -> Arc<ObjectClass> {
        Arc::new(ObjectClass {
            name: self.name,
            methods: self.methods,
        })
    }
}

/// A reference-counted, identity-compared handle to a host object,
/// optionally tagged with its class for method dispatch.
#[derive(Clone)]
pub struct HostObjectRef {
    data: Arc<dyn HostObject>,
    class: Option<Arc<ObjectClass>>,
}

impl HostObjectRef {
    pub fn new(object: impl HostObject + 'static) -> Self {
        Self {
            data: Arc::new(object),
            class: None,
        }
    }

    pub fn with_class(object: impl HostObject + 'static, class: Arc<ObjectClass>) -> Self {
        Self {
            data: Arc::new(object),
            class: Some(class),
        }
    }

    pub fn class(&self) -> Option<&Arc<ObjectClass>> {
        self.class.as_ref()
    }

    pub fn type_name(&self) -> &str {
        self.data.type_name()
    }

    /// Downcast to the concrete host type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.data.as_any().downcast_ref::<T>()
    }

    /// Stable identity of the underlying object. Usable as a map key for
    /// deduplication; valid for as long as any clone is alive.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.data) as *const () as usize
    }
}

impl PartialEq for HostObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for HostObjectRef {}

impl fmt::Debug for HostObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostObjectRef({}@{:#x})", self.type_name(), self.identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ArgList, CallbackOutcome, Value};

    struct Counter {
        start: i64,
    }

    impl HostObject for Counter {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn type_name(&self) -> &str {
            "counter"
        }
    }

    #[test]
    fn test_identity_comparison() {
        let a = HostObjectRef::new(Counter { start: 1 });
        let b = a.clone();
        let c = HostObjectRef::new(Counter { start: 1 });
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_downcast() {
        let a = HostObjectRef::new(Counter { start: 7 });
        assert_eq!(a.downcast_ref::<Counter>().unwrap().start, 7);
        assert!(a.downcast_ref::<String>().is_none());
    }

    #[test]
    fn test_class_builder() {
        let class = ObjectClass::builder("counter")
            .method(
                "get",
                HostCallback::new(|args: ArgList| {
                    let this = args.first();
                    let counter = this
                        .as_object()
                        .ok()
                        .and_then(|o| o.downcast_ref::<Counter>().map(|c| c.start))
                        .unwrap_or(0);
                    Ok(CallbackOutcome::Return(ArgList::of(&[Value::Int(counter)])))
                }),
            )
            .build();
        assert_eq!(class.name(), "counter");
        assert_eq!(class.methods().len(), 1);
    }
}
