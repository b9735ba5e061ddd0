use std::any::Any;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::event_loop::Reactor;
use crate::manager::{Manager, ManagerInner};
use crate::operation::{Kind, Operation, State};
use crate::proxy::Proxy;
use crate::resource::Opener;
use crate::value::{Args, Value};

const NO_TARGET: u64 = 0;

/// Liveness and affinity flags shared between a runner thread and the manager.
#[derive(Debug)]
pub(crate) struct RunnerState {
    bound_target: AtomicU64,
    busy: AtomicBool,
    running: AtomicBool,
}

impl RunnerState {
    fn new() -> Self {
        Self {
            bound_target: AtomicU64::new(NO_TARGET),
            busy: AtomicBool::new(false),
            running: AtomicBool::new(true),
        }
    }

    pub(crate) fn bound_target(&self) -> Option<u64> {
        match self.bound_target.load(Ordering::Acquire) {
            NO_TARGET => None,
            id => Some(id),
        }
    }
}

/// Point-in-time view of one runner.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RunnerStats {
    pub index: usize,
    pub busy: bool,
    pub running: bool,
    /// Id of the proxy this runner last executed against.
    pub bound_target: Option<u64>,
}

/// Manager side of a runner: the writing half of its private queue plus its flags.
#[derive(Debug)]
pub(crate) struct RunnerHandle {
    sender: Sender<Operation>,
    state: Arc<RunnerState>,
}

impl RunnerHandle {
    pub(crate) fn state(&self) -> &RunnerState {
        &self.state
    }

    /// Appends `op` to the runner queue, an operation refused by a gone runner is dropped,
    /// so its completion resolves as disconnected.
    pub(crate) fn enqueue(&self, op: Operation) -> bool {
        self.sender.send(op).is_ok()
    }

    pub(crate) fn stats(&self, index: usize) -> RunnerStats {
        RunnerStats {
            index,
            busy: self.state.busy.load(Ordering::Acquire),
            running: self.state.running.load(Ordering::Acquire),
            bound_target: self.state.bound_target(),
        }
    }
}

pub(crate) struct Runner {
    index: usize,
    queue: Receiver<Operation>,
    state: Arc<RunnerState>,
    manager: Weak<ManagerInner>,
    reactor: Arc<dyn Reactor>,
    opener: Arc<dyn Opener>,
    poll_interval: Duration,
}

impl Runner {
    /// Spawns the runner thread and returns the handle the manager routes through.
    pub(crate) fn spawn(
        index: usize,
        thread_name: String,
        poll_interval: Duration,
        manager: Weak<ManagerInner>,
        reactor: Arc<dyn Reactor>,
        opener: Arc<dyn Opener>,
    ) -> Result<(RunnerHandle, JoinHandle<()>), Error> {
        let (sender, queue) = flume::unbounded();
        let state = Arc::new(RunnerState::new());

        let runner = Runner {
            index,
            queue,
            state: state.clone(),
            manager,
            reactor,
            opener,
            poll_interval,
        };

        let join_handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || runner.run())
            .map_err(Error::Spawn)?;

        Ok((RunnerHandle { sender, state }, join_handle))
    }

    fn run(self) {
        debug!(runner = self.index, "runner started");

        while self.state.running.load(Ordering::Acquire) {
            match self.queue.recv_timeout(self.poll_interval) {
                Ok(op) => self.execute(op),

                // idle, loop around to re-check the liveness flag
                Err(RecvTimeoutError::Timeout) => {}

                // manager dropped and the queue is drained
                Err(RecvTimeoutError::Disconnected) => {
                    self.state.running.store(false, Ordering::Release);
                }
            }
        }

        debug!(runner = self.index, "runner stopped");
    }

    fn execute(&self, mut op: Operation) {
        self.state.bound_target.store(
            op.target.as_ref().map_or(NO_TARGET, Proxy::id),
            Ordering::Release,
        );
        op.transition(State::Running);
        let _busy = BusyGuard::enter(&self.state.busy);

        let args = mem::take(&mut op.args);
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(&mut op, args)))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                warn!(runner = self.index, operation = op.name(), %message, "resource operation panicked");

                Err(Error::Panicked(message))
            });

        match &result {
            Ok(Value::Proxy(proxy)) if matches!(op.kind, Kind::Open) => {
                op.target = Some(proxy.clone());
                op.transition(State::Success);
            }
            Ok(_) => op.transition(State::Success),
            Err(_) => op.transition(State::Failure),
        }

        trace!(runner = self.index, operation = %op, "operation executed");

        let resolver = op.resolver;
        let delivered = self
            .reactor
            .call_from_thread(Box::new(move || resolver.resolve(result)));
        if let Err(err) = delivered {
            debug!(runner = self.index, %err, "event loop gone, completion not delivered");
        }
    }

    fn dispatch(&self, op: &mut Operation, args: Args) -> Result<Value, Error> {
        match &op.kind {
            Kind::Stop => {
                self.state.running.store(false, Ordering::Release);

                Ok(Value::Unit)
            }

            Kind::Open => self.open(args),

            kind => {
                let proxy = op.target.as_ref().ok_or_else(|| Error::UnboundTarget {
                    operation: kind.name().to_string(),
                })?;

                match kind {
                    Kind::Method(name) => proxy
                        .target()
                        .with_resource(|resource| resource.call(name, args))
                        .map_err(Error::Resource),

                    _ => {
                        let interaction = op
                            .batch
                            .take()
                            .expect("interaction operation carries its callable");

                        proxy
                            .target()
                            .with_resource(|resource| interaction(resource, args))
                            .map_err(Error::Resource)
                    }
                }
            }
        }
    }

    fn open(&self, args: Args) -> Result<Value, Error> {
        let resource = self.opener.open(args).map_err(Error::Resource)?;
        let manager = Manager::upgrade(&self.manager).ok_or(Error::Disconnected)?;

        let proxy = manager.take_boxed(resource);
        proxy.target().pin(self.index);
        self.state.bound_target.store(proxy.id(), Ordering::Release);

        Ok(Value::Proxy(proxy))
    }
}

struct BusyGuard<'a> {
    busy: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    fn enter(busy: &'a AtomicBool) -> Self {
        busy.store(true, Ordering::Release);

        Self { busy }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread::ThreadId;

    use futures_util::FutureExt;

    use super::*;
    use crate::error::ResourceError;
    use crate::op::{Call, Op};
    use crate::resource::testing::{journal_opener, Journal};
    use crate::resource::Resource;

    /// Resolves completions inline, recording which thread ran them.
    struct InlineReactor {
        threads: Mutex<Vec<ThreadId>>,
    }

    impl Reactor for InlineReactor {
        fn call_from_thread(&self, f: Box<dyn FnOnce() + Send + 'static>) -> Result<(), Error> {
            self.threads.lock().unwrap().push(thread::current().id());
            f();

            Ok(())
        }

        fn add_shutdown_hook(&self, _hook: crate::event_loop::ShutdownHook) {}
    }

    fn runner(index: usize) -> (Runner, Sender<Operation>, Arc<InlineReactor>) {
        let (sender, queue) = flume::unbounded();
        let reactor = Arc::new(InlineReactor {
            threads: Mutex::new(vec![]),
        });

        let runner = Runner {
            index,
            queue,
            state: Arc::new(RunnerState::new()),
            manager: Weak::new(),
            reactor: reactor.clone(),
            opener: Arc::new(journal_opener(Arc::new(Mutex::new(vec![])))),
            poll_interval: Duration::from_millis(10),
        };

        (runner, sender, reactor)
    }

    fn journal_proxy(log: &Arc<Mutex<Vec<String>>>) -> Proxy {
        Proxy::new(Weak::new(), Box::new(Journal::new("a", log.clone())))
    }

    fn method(name: &str, target: Option<Proxy>, args: Args) -> (Operation, Op<Call>) {
        Operation::new(Kind::Method(name.to_string()), target, args, None, Call)
    }

    #[test]
    fn test_method_on_resource() {
        let (runner, _sender, reactor) = runner(0);
        let log = Arc::new(Mutex::new(vec![]));
        let proxy = journal_proxy(&log);

        let (op, completion) = method("write", Some(proxy.clone()), Args::new().arg("x"));
        runner.execute(op);

        assert_eq!(completion.now_or_never().unwrap().unwrap(), Value::Int(1));
        assert_eq!(*log.lock().unwrap(), vec!["a:x".to_string()]);
        assert_eq!(runner.state.bound_target(), Some(proxy.id()));
        assert!(!runner.state.busy.load(Ordering::Acquire));
        assert_eq!(reactor.threads.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unbound_target() {
        let (runner, _sender, _reactor) = runner(0);

        let (op, completion) = method("write", None, Args::new());
        runner.execute(op);

        assert!(matches!(
            completion.now_or_never().unwrap(),
            Err(Error::UnboundTarget { operation }) if operation == "write"
        ));
        assert!(!runner.state.busy.load(Ordering::Acquire));
    }

    #[test]
    fn test_failure_and_panic_are_delivered() {
        let (runner, _sender, _reactor) = runner(0);
        let proxy = journal_proxy(&Arc::new(Mutex::new(vec![])));

        let (fail, failed) = method("fail", Some(proxy.clone()), Args::new());
        let (panic, panicked) = method("panic", Some(proxy.clone()), Args::new());
        let (write, written) = method("write", Some(proxy), Args::new().arg("ok"));
        runner.execute(fail);
        runner.execute(panic);
        runner.execute(write);

        let err = failed.now_or_never().unwrap().unwrap_err();
        assert_eq!(err.as_io_error().unwrap().to_string(), "journal failure");
        assert!(matches!(
            panicked.now_or_never().unwrap(),
            Err(Error::Panicked(message)) if message == "journal panic"
        ));
        assert_eq!(written.now_or_never().unwrap().unwrap(), Value::Int(2));
        assert!(!runner.state.busy.load(Ordering::Acquire));
    }

    #[test]
    fn test_interaction_gets_real_resource() {
        let (runner, _sender, _reactor) = runner(0);
        let proxy = journal_proxy(&Arc::new(Mutex::new(vec![])));

        let interaction: crate::operation::Interaction = Box::new(
            |resource: &mut dyn Resource, args: Args| -> Result<Value, ResourceError> {
                let journal = resource.downcast_mut::<Journal>().unwrap();
                let n = args.get(0, "n").and_then(Value::as_int).unwrap();

                Ok(Value::Str(journal.name.repeat(n as usize)))
            },
        );
        let (op, completion) = Operation::new(
            Kind::Interaction,
            Some(proxy),
            Args::new().arg(3),
            Some(interaction),
            Call,
        );
        runner.execute(op);

        assert_eq!(completion.now_or_never().unwrap().unwrap(), Value::from("aaa"));
    }

    #[test]
    fn test_open_without_manager_fails() {
        let (runner, _sender, _reactor) = runner(0);

        let (op, completion) = Operation::new(
            Kind::Open,
            None,
            Args::new().arg("b"),
            None,
            crate::op::Opened,
        );
        runner.execute(op);

        assert!(matches!(
            completion.now_or_never().unwrap(),
            Err(Error::Disconnected)
        ));
    }

    #[test]
    fn test_stop_drains_queue_first() {
        let (runner, sender, _reactor) = runner(0);
        let log = Arc::new(Mutex::new(vec![]));
        let proxy = journal_proxy(&log);

        let (first, first_done) = method("write", Some(proxy.clone()), Args::new().arg("1"));
        let (second, second_done) = method("write", Some(proxy), Args::new().arg("2"));
        let (stop, stopped) = Operation::new(Kind::Stop, None, Args::new(), None, Call);
        sender.send(first).unwrap();
        sender.send(second).unwrap();
        sender.send(stop).unwrap();

        let state = runner.state.clone();
        thread::spawn(move || runner.run()).join().unwrap();

        assert!(first_done.now_or_never().unwrap().is_ok());
        assert!(second_done.now_or_never().unwrap().is_ok());
        assert_eq!(stopped.now_or_never().unwrap().unwrap(), Value::Unit);
        assert_eq!(*log.lock().unwrap(), vec!["a:1", "a:2"]);
        assert!(!state.running.load(Ordering::Acquire));
    }

    #[test]
    fn test_exit_on_disconnect() {
        let (runner, sender, _reactor) = runner(0);
        drop(sender);

        let state = runner.state.clone();
        thread::spawn(move || runner.run()).join().unwrap();

        assert!(!state.running.load(Ordering::Acquire));
    }
}
