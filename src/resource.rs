use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::ResourceError;
use crate::value::{Args, Value};

/// A real blocking resource that a [`Proxy`](crate::Proxy) can stand in for.
///
/// The member table is read once when the resource is wrapped, methods are later
/// dispatched by name on a runner thread.
pub trait Resource: Send + 'static {
    fn members(&self) -> Members;

    /// Runs the method `name`, blocking the calling runner thread.
    fn call(&mut self, name: &str, args: Args) -> Result<Value, ResourceError>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<'a> dyn Resource + 'a {
    pub fn downcast_mut<T: Resource>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

/// Static member table of a resource.
///
/// Attributes are captured by value, so they must not change while the resource is open.
#[derive(Debug, Clone, Default)]
pub struct Members {
    type_name: &'static str,
    methods: BTreeSet<&'static str>,
    attributes: BTreeMap<&'static str, Value>,
}

impl Members {
    pub fn new(type_name: &'static str) -> Self {
        Self {
            type_name,
            methods: BTreeSet::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn method(mut self, name: &'static str) -> Self {
        self.methods.insert(name);
        self
    }

    pub fn methods(mut self, names: &[&'static str]) -> Self {
        self.methods.extend(names.iter().copied());
        self
    }

    pub fn attribute(mut self, name: &'static str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name, value.into());
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains(name)
    }

    pub fn get_attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

/// The real blocking open call, executed on a runner thread.
pub trait Opener: Send + Sync + 'static {
    fn open(&self, args: Args) -> Result<Box<dyn Resource>, ResourceError>;
}

impl<F> Opener for F
where
    F: Fn(Args) -> Result<Box<dyn Resource>, ResourceError> + Send + Sync + 'static,
{
    fn open(&self, args: Args) -> Result<Box<dyn Resource>, ResourceError> {
        self(args)
    }
}


#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::testing::Journal;
    use super::*;

    #[test]
    fn test_members_table() {
        let journal = Journal::new("a", Arc::new(Mutex::new(vec![])));
        let members = journal.members();

        assert_eq!(members.type_name(), "Journal");
        assert!(members.has_method("write"));
        assert!(!members.has_method("name"));
        assert_eq!(members.get_attribute("name"), Some(&Value::from("a")));
        assert_eq!(members.get_attribute("write"), None);
    }

    #[test]
    fn test_downcast_dyn_resource() {
        let mut boxed: Box<dyn Resource> =
            Box::new(Journal::new("a", Arc::new(Mutex::new(vec![]))));

        assert_eq!(boxed.downcast_mut::<Journal>().unwrap().name, "a");
    }
}
