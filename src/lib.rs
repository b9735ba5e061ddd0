//! Blocking resource operations offloaded to a pool of runner threads, with
//! completions delivered back on a single-threaded event loop.

pub use config::Config;
pub use error::{Error, ResourceError, Result};
pub use event_loop::{spawn_local, EventLoop, LoopHandle, Reactor, ShutdownHook, Task};
pub use manager::Manager;
pub use op::{Call, Completable, Op, Opened, Shutdown, Stopped};
pub use operation::{Interaction, Request, State};
pub use proxy::{Member, Method, Proxy};
pub use resource::{Members, Opener, Resource};
pub use runner::RunnerStats;
pub use value::{Args, Value};

pub mod config;
mod error;
mod event_loop;
pub mod fs;
mod manager;
mod op;
mod operation;
mod proxy;
mod resource;
mod runner;
mod value;
