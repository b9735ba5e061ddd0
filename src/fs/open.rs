use std::fs;
use std::io::{self, Error};
use std::path::Path;

use crate::error::ResourceError;
use crate::fs::File;
use crate::resource::{Opener, Resource};
use crate::value::{Args, Value};

/// Open options parsed from a mode string such as `"r"`, `"wb"` or `"a+"`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    append: bool,
    truncate: bool,
    create: bool,
    create_new: bool,
    binary: bool,
}

impl OpenOptions {
    pub fn new() -> OpenOptions {
        OpenOptions::default()
    }

    /// Parses a mode made of exactly one of `r w a x`, optionally `+`, and at most one of `b t`.
    pub fn from_mode(mode: &str) -> io::Result<OpenOptions> {
        let mut options = OpenOptions::new();
        let mut primary = None;
        let mut plus = false;
        let mut kind = None;

        for c in mode.chars() {
            match c {
                'r' | 'w' | 'a' | 'x' if primary.is_none() => primary = Some(c),
                '+' if !plus => plus = true,
                'b' | 't' if kind.is_none() => kind = Some(c),
                _ => return Err(invalid_mode(mode)),
            }
        }

        match primary.ok_or_else(|| invalid_mode(mode))? {
            'r' => options.read(true),
            'w' => options.write(true).create(true).truncate(true),
            'a' => options.append(true).create(true),
            _ => options.write(true).create_new(true),
        };
        if plus {
            options.read(true).write(true);
        }
        options.binary(kind == Some('b'));

        Ok(options)
    }

    pub fn read(&mut self, read: bool) -> &mut Self {
        self.read = read;
        self
    }

    pub fn write(&mut self, write: bool) -> &mut Self {
        self.write = write;
        self
    }

    pub fn append(&mut self, append: bool) -> &mut Self {
        self.append = append;
        self
    }

    pub fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.truncate = truncate;
        self
    }

    pub fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    pub fn create_new(&mut self, create_new: bool) -> &mut Self {
        self.create_new = create_new;
        self
    }

    /// Binary files read as bytes, text files read as UTF-8 strings.
    pub fn binary(&mut self, binary: bool) -> &mut Self {
        self.binary = binary;
        self
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// Blocking open, meant to run on a runner thread.
    pub fn open(&self, path: impl AsRef<Path>, mode: &str) -> io::Result<File> {
        self.check_access_mode()?;
        self.check_creation_mode()?;

        let path = path.as_ref();
        let file = fs::OpenOptions::new()
            .read(self.read)
            .write(self.write)
            .append(self.append)
            .truncate(self.truncate)
            .create(self.create)
            .create_new(self.create_new)
            .open(path)?;

        Ok(File::new(file, path.to_string_lossy(), mode, self.binary))
    }

    fn check_access_mode(&self) -> io::Result<()> {
        match (self.read, self.write, self.append) {
            (false, false, false) => Err(Error::from_raw_os_error(libc::EINVAL)),
            _ => Ok(()),
        }
    }

    fn check_creation_mode(&self) -> io::Result<()> {
        match (self.write, self.append) {
            (true, false) => {}
            (false, false) => {
                if self.truncate || self.create || self.create_new {
                    return Err(Error::from_raw_os_error(libc::EINVAL));
                }
            }
            (_, true) => {
                if self.truncate && !self.create_new {
                    return Err(Error::from_raw_os_error(libc::EINVAL));
                }
            }
        }

        Ok(())
    }
}

fn invalid_mode(mode: &str) -> Error {
    Error::new(io::ErrorKind::InvalidInput, format!("invalid mode: {mode:?}"))
}

/// Opens local files from `open(path[, mode])` arguments, mode defaulting to `"r"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsOpener;

impl Opener for FsOpener {
    fn open(&self, args: Args) -> Result<Box<dyn Resource>, ResourceError> {
        let path = args
            .get(0, "path")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::new(io::ErrorKind::InvalidInput, "open requires a path"))?;
        let mode = match args.get(1, "mode") {
            None => "r",
            Some(mode) => mode
                .as_str()
                .ok_or_else(|| Error::new(io::ErrorKind::InvalidInput, "mode must be a string"))?,
        };

        let file = OpenOptions::from_mode(mode)?.open(path, mode)?;

        Ok(Box::new(file))
    }
}
