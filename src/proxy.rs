use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::error::{Error, ResourceError};
use crate::manager::{Manager, ManagerInner};
use crate::op::{Call, Op};
use crate::operation::Request;
use crate::resource::{Members, Resource};
use crate::value::{Args, Value};

const UNPINNED: usize = usize::MAX;

static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(1);

/// Shared wrapper around a real resource, the unit of runner affinity.
pub(crate) struct Target {
    id: u64,
    members: Members,
    resource: Mutex<Box<dyn Resource>>,
    runner: AtomicUsize,
}

impl Target {
    fn new(resource: Box<dyn Resource>) -> Self {
        Self {
            id: NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed),
            members: resource.members(),
            resource: Mutex::new(resource),
            runner: AtomicUsize::new(UNPINNED),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn pinned_runner(&self) -> Option<usize> {
        match self.runner.load(Ordering::Acquire) {
            UNPINNED => None,
            index => Some(index),
        }
    }

    /// Pins the target to `index` unless it is already pinned, returns the winning runner.
    pub(crate) fn pin(&self, index: usize) -> usize {
        match self
            .runner
            .compare_exchange(UNPINNED, index, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => index,
            Err(pinned) => pinned,
        }
    }

    /// Locks the real resource, only the pinned runner does this so the lock is uncontended.
    pub(crate) fn with_resource<T>(&self, f: impl FnOnce(&mut dyn Resource) -> T) -> T {
        let mut resource = self.resource.lock().unwrap_or_else(PoisonError::into_inner);

        f(resource.as_mut())
    }
}

/// Facade standing in for a real blocking resource.
///
/// Methods of the resource are enqueued on the manager's runners and return an
/// [`Op`] future, attributes are answered synchronously from the member table
/// captured when the resource was wrapped.
#[derive(Clone)]
pub struct Proxy {
    manager: Weak<ManagerInner>,
    target: Arc<Target>,
}

impl Proxy {
    pub(crate) fn new(manager: Weak<ManagerInner>, resource: Box<dyn Resource>) -> Self {
        Self {
            manager,
            target: Arc::new(Target::new(resource)),
        }
    }

    pub(crate) fn target(&self) -> &Arc<Target> {
        &self.target
    }

    /// Identity of the wrapped resource, unique for the process lifetime.
    pub fn id(&self) -> u64 {
        self.target.id()
    }

    pub fn type_name(&self) -> &'static str {
        self.target.members.type_name()
    }

    /// Resolves `name` against the wrapped resource without leaving the calling thread.
    pub fn member(&self, name: &str) -> Result<Member, Error> {
        let members = &self.target.members;

        if members.has_method(name) {
            return Ok(Member::Method(Method {
                proxy: self.clone(),
                name: name.to_string(),
            }));
        }

        match members.get_attribute(name) {
            Some(value) => Ok(Member::Attribute(value.clone())),
            None => Err(Error::NoSuchMember {
                member: name.to_string(),
                type_name: members.type_name(),
            }),
        }
    }

    pub fn method(&self, name: &str) -> Result<Method, Error> {
        match self.member(name)? {
            Member::Method(method) => Ok(method),
            Member::Attribute(_) => Err(Error::NotCallable {
                member: name.to_string(),
                type_name: self.type_name(),
            }),
        }
    }

    pub fn attribute(&self, name: &str) -> Result<Value, Error> {
        match self.member(name)? {
            Member::Attribute(value) => Ok(value),
            Member::Method(_) => Err(Error::NoSuchMember {
                member: name.to_string(),
                type_name: self.type_name(),
            }),
        }
    }

    /// Shorthand for `self.method(name)?.call(args)`.
    pub fn call(&self, name: &str, args: Args) -> Result<Op<Call>, Error> {
        self.method(name)?.call(args)
    }

    /// Runs `f` against the real resource inside its runner thread.
    ///
    /// Useful to batch many small blocking calls into one thread hop.
    pub fn run_interaction<F>(&self, f: F, args: Args) -> Result<Op<Call>, Error>
    where
        F: FnOnce(&mut dyn Resource, Args) -> Result<Value, ResourceError> + Send + 'static,
    {
        self.enqueue(Request::interaction(f), args)
    }

    fn enqueue(&self, request: Request, args: Args) -> Result<Op<Call>, Error> {
        let manager = Manager::upgrade(&self.manager).ok_or(Error::AdmissionClosed)?;

        manager.enqueue(request, Some(self.clone()), args)
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.target, &other.target)
    }
}

impl Eq for Proxy {}

impl Debug for Proxy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("id", &self.target.id)
            .field("type_name", &self.type_name())
            .field("runner", &self.target.pinned_runner())
            .finish()
    }
}

/// A resolved member of a proxied resource.
#[derive(Debug)]
pub enum Member {
    Method(Method),
    Attribute(Value),
}

/// A callable member bound to its proxy.
#[derive(Debug, Clone)]
pub struct Method {
    proxy: Proxy,
    name: String,
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues the call and returns its completion immediately.
    pub fn call(&self, args: Args) -> Result<Op<Call>, Error> {
        self.proxy.enqueue(Request::Method(self.name.clone()), args)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::resource::testing::Journal;

    fn detached(name: &str) -> Proxy {
        Proxy::new(
            Weak::new(),
            Box::new(Journal::new(name, Arc::new(Mutex::new(vec![])))),
        )
    }

    #[test]
    fn test_missing_member() {
        let proxy = detached("a");

        match proxy.member("frobnicate") {
            Err(Error::NoSuchMember { member, type_name }) => {
                assert_eq!(member, "frobnicate");
                assert_eq!(type_name, "Journal");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_attribute_is_synchronous() {
        let proxy = detached("a");

        assert_eq!(proxy.attribute("name").unwrap(), Value::from("a"));
        assert!(matches!(
            proxy.method("name"),
            Err(Error::NotCallable { .. })
        ));
    }

    #[test]
    fn test_method_without_manager_is_refused() {
        let proxy = detached("a");

        let method = proxy.method("write").unwrap();
        assert_eq!(method.name(), "write");
        assert!(matches!(
            method.call(Args::new().arg("x")),
            Err(Error::AdmissionClosed)
        ));
    }

    #[test]
    fn test_identity_and_pin() {
        let a = detached("a");
        let b = detached("a");

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.id(), a.target().id());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.target().pinned_runner(), None);
        assert_eq!(a.target().pin(2), 2);
        assert_eq!(a.target().pin(0), 2);
        assert_eq!(a.target().pinned_runner(), Some(2));
    }
}
