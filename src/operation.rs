use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use flume::Sender;
use futures_util::task::AtomicWaker;

use crate::error::{Error, ResourceError};
use crate::op::{Completable, Op};
use crate::proxy::Proxy;
use crate::resource::Resource;
use crate::value::{Args, Value};

/// A callable run against the real resource inside a runner thread.
pub type Interaction =
    Box<dyn FnOnce(&mut dyn Resource, Args) -> Result<Value, ResourceError> + Send + 'static>;

/// What a caller may ask the manager to enqueue.
pub enum Request {
    Open,
    Method(String),
    Interaction(Interaction),
}

impl Request {
    pub fn method(name: impl Into<String>) -> Self {
        Request::Method(name.into())
    }

    pub fn interaction<F>(f: F) -> Self
    where
        F: FnOnce(&mut dyn Resource, Args) -> Result<Value, ResourceError> + Send + 'static,
    {
        Request::Interaction(Box::new(f))
    }
}

impl Debug for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Request::Open => f.write_str("Request::Open"),
            Request::Method(name) => f.debug_tuple("Request::Method").field(name).finish(),
            Request::Interaction(_) => f.write_str("Request::Interaction(..)"),
        }
    }
}

pub(crate) enum Kind {
    Open,
    Stop,
    Method(String),
    Interaction,
}

impl Kind {
    pub(crate) fn name(&self) -> &str {
        match self {
            Kind::Open => "open",
            Kind::Stop => "stop",
            Kind::Method(name) => name.as_str(),
            Kind::Interaction => "interaction",
        }
    }
}

impl Request {
    pub(crate) fn into_parts(self) -> (Kind, Option<Interaction>) {
        match self {
            Request::Open => (Kind::Open, None),
            Request::Method(name) => (Kind::Method(name), None),
            Request::Interaction(f) => (Kind::Interaction, Some(f)),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    New,
    Running,
    Success,
    Failure,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::New => "new",
            State::Running => "running",
            State::Success => "success",
            State::Failure => "failure",
        })
    }
}

/// Write-once sending half of an operation's completion.
pub(crate) struct Resolver {
    result_sender: Sender<Result<Value, Error>>,
    waker: Arc<AtomicWaker>,
}

impl Resolver {
    pub(crate) fn resolve(self, result: Result<Value, Error>) {
        if self.result_sender.try_send(result).is_ok() {
            self.waker.wake();
        }
    }
}

/// One deferred unit of work, created per call and consumed by a runner.
pub(crate) struct Operation {
    pub(crate) kind: Kind,
    pub(crate) target: Option<Proxy>,
    pub(crate) args: Args,
    /// Callable carried only by interaction operations.
    pub(crate) batch: Option<Interaction>,
    pub(crate) state: State,
    pub(crate) resolver: Resolver,
}

impl Operation {
    pub(crate) fn new<T: Completable>(
        kind: Kind,
        target: Option<Proxy>,
        args: Args,
        batch: Option<Interaction>,
        data: T,
    ) -> (Self, Op<T>) {
        let (result_sender, result_receiver) = flume::bounded(1);
        let waker = Arc::new(AtomicWaker::new());

        (
            Self {
                kind,
                target,
                args,
                batch,
                state: State::New,
                resolver: Resolver {
                    result_sender,
                    waker: waker.clone(),
                },
            },
            Op::new(data, result_receiver, waker),
        )
    }

    pub(crate) fn name(&self) -> &str {
        self.kind.name()
    }

    /// Moves the state forward, panicking on a transition that is not New→Running→done.
    pub(crate) fn transition(&mut self, next: State) {
        let valid = matches!(
            (self.state, next),
            (State::New, State::Running) | (State::Running, State::Success | State::Failure)
        );
        assert!(valid, "invalid operation transition {} -> {next}", self.state);

        self.state = next;
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operation {}({}), state = {}",
            self.name(),
            self.args,
            self.state
        )
    }
}

impl Debug for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name())
            .field("target", &self.target.as_ref().map(Proxy::id))
            .field("args", &self.args)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
