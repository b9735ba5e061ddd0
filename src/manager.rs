use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use futures_util::future::{self, FutureExt};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::event_loop::Reactor;
use crate::fs::FsOpener;
use crate::op::{Call, Completable, Op, Opened, Shutdown, Stopped};
use crate::operation::{Interaction, Kind, Operation, Request};
use crate::proxy::Proxy;
use crate::resource::{Opener, Resource};
use crate::runner::{Runner, RunnerHandle, RunnerStats};
use crate::value::Args;

pub(crate) struct ManagerInner {
    config: Config,
    reactor: Arc<dyn Reactor>,
    opener: Arc<dyn Opener>,
    pool: OnceLock<Box<[RunnerHandle]>>,
    cursor: AtomicUsize,
    accepting: AtomicBool,
    /// Set by the first `stop()`, every later call waits on the same drain.
    drain: Mutex<Option<Shutdown>>,
}

/// Owns the runner pool of one event loop and routes operations onto it.
///
/// Cloning is cheap, every clone drives the same pool.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Creates a manager whose `stop` runs automatically when the reactor shuts down.
    pub fn new(reactor: impl Reactor, opener: impl Opener, config: Config) -> Self {
        let reactor: Arc<dyn Reactor> = Arc::new(reactor);

        let manager = Self {
            inner: Arc::new(ManagerInner {
                config,
                reactor: reactor.clone(),
                opener: Arc::new(opener),
                pool: OnceLock::new(),
                cursor: AtomicUsize::new(0),
                accepting: AtomicBool::new(false),
                drain: Mutex::new(None),
            }),
        };

        let weak = Arc::downgrade(&manager.inner);
        reactor.add_shutdown_hook(Box::new(move || match Manager::upgrade(&weak) {
            Some(manager) => manager.stop().boxed(),
            None => future::ready(()).boxed(),
        }));

        manager
    }

    /// Manager opening files from the local filesystem, with the default config.
    pub fn with_reactor(reactor: impl Reactor) -> Self {
        Self::new(reactor, FsOpener, Config::default())
    }

    pub(crate) fn upgrade(weak: &Weak<ManagerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn pool_capacity(&self) -> usize {
        self.inner.config.pool_capacity
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Spawns one runner thread per unit of pool capacity and starts accepting operations.
    pub fn start(&self) -> Result<(), Error> {
        let inner = &self.inner;
        inner.config.validate()?;

        if inner.pool.get().is_some() {
            return Err(Error::AlreadyStarted);
        }
        if inner
            .drain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return Err(Error::AdmissionClosed);
        }

        let pool = (0..inner.config.pool_capacity)
            .map(|index| {
                Runner::spawn(
                    index,
                    format!("{}-{index}", inner.config.thread_name_prefix),
                    inner.config.poll_interval,
                    Arc::downgrade(inner),
                    inner.reactor.clone(),
                    inner.opener.clone(),
                )
                // runner threads are detached, they exit after their stop or once the pool is dropped
                .map(|(handle, _join_handle)| handle)
            })
            .collect::<Result<Box<[_]>, _>>()?;

        inner
            .pool
            .set(pool)
            .map_err(|_| Error::AlreadyStarted)?;
        inner.accepting.store(true, Ordering::Release);

        info!(pool_capacity = inner.config.pool_capacity, "manager started");

        Ok(())
    }

    /// Opens a resource on a runner thread, the completion yields its proxy.
    pub fn open(&self, args: Args) -> Result<Op<Opened>, Error> {
        self.admit(Kind::Open, None, args, None, Opened)
    }

    /// Wraps an already open resource without a thread hop.
    pub fn take<R: Resource>(&self, resource: R) -> Proxy {
        self.take_boxed(Box::new(resource))
    }

    pub fn take_boxed(&self, resource: Box<dyn Resource>) -> Proxy {
        Proxy::new(Arc::downgrade(&self.inner), resource)
    }

    /// Routes a request to a runner and returns its completion without blocking.
    ///
    /// Operations on the same target always land on the same runner, so they run
    /// in the order they were enqueued.
    pub fn enqueue(
        &self,
        request: Request,
        target: Option<Proxy>,
        args: Args,
    ) -> Result<Op<Call>, Error> {
        let (kind, batch) = request.into_parts();

        self.admit(kind, target, args, batch, Call)
    }

    fn admit<T: Completable>(
        &self,
        kind: Kind,
        target: Option<Proxy>,
        args: Args,
        batch: Option<Interaction>,
        data: T,
    ) -> Result<Op<T>, Error> {
        if !self.is_accepting() {
            return Err(Error::AdmissionClosed);
        }
        let pool = self.inner.pool.get().ok_or(Error::AdmissionClosed)?;

        let index = self.route(pool, target.as_ref());
        let (operation, completion) = Operation::new(kind, target, args, batch, data);

        if !pool[index].enqueue(operation) {
            warn!(runner = index, "runner gone, operation dropped");
        }

        Ok(completion)
    }

    fn route(&self, pool: &[RunnerHandle], target: Option<&Proxy>) -> usize {
        let Some(proxy) = target else {
            return self.next_runner(pool.len());
        };

        if let Some(index) = pool
            .iter()
            .position(|runner| runner.state().bound_target() == Some(proxy.id()))
        {
            return index;
        }

        // pin on first routing, so a second operation enqueued before the first ran
        // can't pick another runner
        match proxy.target().pinned_runner() {
            Some(index) => index,
            None => proxy.target().pin(self.next_runner(pool.len())),
        }
    }

    fn next_runner(&self, len: usize) -> usize {
        self.inner.cursor.fetch_add(1, Ordering::Relaxed) % len
    }

    /// Closes admission, then lets every runner drain its queue before exiting.
    ///
    /// Only the first call enqueues stop operations, later calls return a [`Shutdown`]
    /// waiting on that same drain.
    pub fn stop(&self) -> Shutdown {
        self.inner.accepting.store(false, Ordering::Release);

        let mut drain = self
            .inner
            .drain
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(shutdown) = drain.as_ref() {
            return shutdown.clone();
        }

        let stops = match self.inner.pool.get() {
            None => vec![],
            Some(pool) => {
                info!(pool_capacity = pool.len(), "manager stopping");

                pool.iter()
                    .map(|runner| {
                        let (operation, stopped) =
                            Operation::new(Kind::Stop, None, Args::new(), None, Stopped);
                        runner.enqueue(operation);

                        stopped
                    })
                    .collect()
            }
        };

        let shutdown = Shutdown::new(stops);
        *drain = Some(shutdown.clone());

        shutdown
    }

    pub fn runner_stats(&self) -> Vec<RunnerStats> {
        self.inner
            .pool
            .get()
            .map(|pool| {
                pool.iter()
                    .enumerate()
                    .map(|(index, runner)| runner.stats(index))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Debug for Manager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.inner.config)
            .field("accepting", &self.is_accepting())
            .field("runners", &self.runner_stats())
            .finish()
    }
}
