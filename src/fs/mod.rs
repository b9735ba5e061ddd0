//! Local files as proxied resources.
//!
//! [`FsOpener`] is the opener a [`Manager`](crate::Manager) uses by default, so
//! `manager.open(Args::new().arg(path).arg("wb"))` resolves to a proxy around a [`File`].

pub use file::File;
pub use open::{FsOpener, OpenOptions};

mod file;
mod open;
