use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_task::Runnable;
use flume::{Receiver, RecvTimeoutError, Sender};
use futures_util::future::{self, BoxFuture};
use futures_util::task::{self, ArcWake};

use crate::error::Error;

pub type Task<T> = async_task::Task<T>;

/// Produces the drain future a shutdown hook wants the loop to finish before exiting.
pub type ShutdownHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + 'static>;

/// The cooperative event loop as seen from runner threads.
pub trait Reactor: Send + Sync + 'static {
    /// Runs `f` on the loop thread and blocks the caller until it has run.
    ///
    /// Must not be called from the loop thread itself.
    fn call_from_thread(&self, f: Box<dyn FnOnce() + Send + 'static>) -> Result<(), Error>;

    /// Registers a hook run when the loop shuts down.
    fn add_shutdown_hook(&self, hook: ShutdownHook);
}

enum LoopMessage {
    Runnable(Runnable),
    Call(Box<dyn FnOnce() + Send + 'static>, Sender<()>),
    WakeMain,
}

thread_local! {
    static LOCAL_SENDER: RefCell<Option<Sender<LoopMessage>>> = const { RefCell::new(None) };
}

struct Shared {
    hooks: Mutex<Vec<ShutdownHook>>,
    closed: AtomicBool,
}

/// Thread-safe handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    sender: Sender<LoopMessage>,
    shared: Arc<Shared>,
}

impl Reactor for LoopHandle {
    fn call_from_thread(&self, f: Box<dyn FnOnce() + Send + 'static>) -> Result<(), Error> {
        const ACK_POLL: Duration = Duration::from_millis(50);

        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Disconnected);
        }

        let (ack_sender, ack_receiver) = flume::bounded(1);
        self.sender
            .send(LoopMessage::Call(f, ack_sender))
            .map_err(|_| Error::Disconnected)?;

        // a message queued while the loop was closing is never served, so don't wait on it forever
        loop {
            match ack_receiver.recv_timeout(ACK_POLL) {
                Ok(()) => return Ok(()),
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Disconnected),
                Err(RecvTimeoutError::Timeout) => {
                    if self.shared.closed.load(Ordering::Acquire) {
                        return Err(Error::Disconnected);
                    }
                }
            }
        }
    }

    fn add_shutdown_hook(&self, hook: ShutdownHook) {
        self.shared
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }
}

struct MainWaker {
    sender: Sender<LoopMessage>,
}

impl ArcWake for MainWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let _ = arc_self.sender.send(LoopMessage::WakeMain);
    }
}

/// Single-threaded cooperative event loop.
///
/// Futures run on the thread that owns the loop, other threads hand work in
/// through [`LoopHandle`].
pub struct EventLoop {
    receiver: Receiver<LoopMessage>,
    handle: LoopHandle,
    _not_send: PhantomData<Rc<()>>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();

        Self {
            receiver,
            handle: LoopHandle {
                sender,
                shared: Arc::new(Shared {
                    hooks: Mutex::new(vec![]),
                    closed: AtomicBool::new(false),
                }),
            },
            _not_send: PhantomData,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Spawns a future onto this loop, it makes progress while the loop is driven by `block_on`.
    pub fn spawn_local<F>(&self, fut: F) -> Task<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        inner_spawn_local(fut, self.handle.sender.clone())
    }

    /// Drives the loop on the current thread until `fut` completes.
    pub fn block_on<F: Future>(&mut self, fut: F) -> F::Output {
        const MAX_TASK_ONCE: usize = 61;

        let _enter = Enter::new(self.handle.sender.clone());
        let mut fut = pin!(fut);
        let waker = task::waker(Arc::new(MainWaker {
            sender: self.handle.sender.clone(),
        }));
        let mut cx = Context::from_waker(&waker);

        loop {
            if let Poll::Ready(output) = fut.as_mut().poll(&mut cx) {
                return output;
            }

            let mut wake_main = false;
            while !wake_main {
                let message = self
                    .receiver
                    .recv()
                    .unwrap_or_else(|_| unreachable!("loop holds its own sender"));
                wake_main = self.dispatch(message);

                for message in self.receiver.try_iter().take(MAX_TASK_ONCE) {
                    wake_main |= self.dispatch(message);
                }
            }
        }
    }

    /// Runs the shutdown hooks, then keeps serving the loop until their drains complete.
    pub fn shutdown(mut self) {
        let drains = self.take_hooks().into_iter().map(|hook| hook()).collect::<Vec<_>>();

        self.block_on(future::join_all(drains));
    }

    fn take_hooks(&self) -> Vec<ShutdownHook> {
        std::mem::take(
            &mut *self
                .handle
                .shared
                .hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn dispatch(&self, message: LoopMessage) -> bool {
        match message {
            LoopMessage::Runnable(runnable) => {
                runnable.run();

                false
            }

            LoopMessage::Call(f, ack_sender) => {
                f();
                let _ = ack_sender.send(());

                false
            }

            LoopMessage::WakeMain => true,
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // hooks still fire, but nothing serves their drains any more
        for hook in self.take_hooks() {
            drop(hook());
        }

        self.handle.shared.closed.store(true, Ordering::Release);
        self.receiver.drain().for_each(drop);
    }
}

struct Enter {
    previous: Option<Sender<LoopMessage>>,
}

impl Enter {
    fn new(sender: Sender<LoopMessage>) -> Self {
        let previous = LOCAL_SENDER.with(|local| local.borrow_mut().replace(sender));

        Self { previous }
    }
}

impl Drop for Enter {
    fn drop(&mut self) {
        let previous = self.previous.take();
        LOCAL_SENDER.with(|local| *local.borrow_mut() = previous);
    }
}

/// Spawns a future onto the event loop currently running `block_on` on this thread.
pub fn spawn_local<F>(fut: F) -> Task<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    let sender = LOCAL_SENDER.with(|local| {
        local
            .borrow()
            .clone()
            .expect("not in thread_io event loop context")
    });

    inner_spawn_local(fut, sender)
}

fn inner_spawn_local<F>(fut: F, sender: Sender<LoopMessage>) -> Task<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    let (runnable, task) = async_task::spawn_local(fut, move |runnable| {
        let _ = sender.send(LoopMessage::Runnable(runnable));
    });
    runnable.schedule();

    task
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::thread;
    use std::time::Instant;

    use futures_timer::Delay;
    use futures_util::FutureExt;

    use super::*;

    #[test]
    fn test_block_on() {
        let n = EventLoop::new().block_on(async { 1 });

        assert_eq!(n, 1);
    }

    #[test]
    fn test_block_on_with_timer() {
        let start = Instant::now();

        EventLoop::new().block_on(async {
            Delay::new(Duration::from_millis(200)).await;
        });

        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_spawn_local() {
        let counter = Rc::new(Cell::new(0));

        let n = EventLoop::new().block_on({
            let counter = counter.clone();

            async move {
                let tasks = (0..3)
                    .map(|i| {
                        let counter = counter.clone();

                        spawn_local(async move {
                            counter.set(counter.get() + 1);
                            i
                        })
                    })
                    .collect::<Vec<_>>();

                future::join_all(tasks).await.into_iter().sum::<i32>()
            }
        });

        assert_eq!(n, 3);
        assert_eq!(counter.get(), 3);
    }

    #[test]
    fn test_call_from_thread_runs_on_loop_thread() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let loop_thread = thread::current().id();
        let (done_sender, done_receiver) = flume::bounded(1);

        let worker = thread::spawn(move || {
            handle
                .call_from_thread(Box::new(move || {
                    let _ = done_sender.send(thread::current().id());
                }))
                .unwrap();
        });

        let ran_on = event_loop.block_on(done_receiver.recv_async()).unwrap();
        worker.join().unwrap();

        assert_eq!(ran_on, loop_thread);
    }

    #[test]
    fn test_call_after_drop_fails() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        drop(event_loop);

        let result = thread::spawn(move || handle.call_from_thread(Box::new(|| {})))
            .join()
            .unwrap();

        assert!(matches!(result, Err(Error::Disconnected)));
    }

    #[test]
    fn test_shutdown_runs_hooks_and_drains() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let (sender, receiver) = flume::bounded(1);
        let drained = Arc::new(AtomicBool::new(false));

        handle.add_shutdown_hook(Box::new({
            let drained = drained.clone();

            move || {
                async move {
                    receiver.recv_async().await.unwrap();
                    drained.store(true, Ordering::Release);
                }
                .boxed()
            }
        }));

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            sender.send(()).unwrap();
        });

        event_loop.shutdown();
        worker.join().unwrap();

        assert!(drained.load(Ordering::Acquire));
    }
}
