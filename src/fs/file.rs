use std::any::Any;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;

use bytes::Bytes;

use crate::error::ResourceError;
use crate::resource::{Members, Resource};
use crate::value::{Args, Value};

const READLINE_CHUNK: usize = 8192;

/// A blocking local file exposed to proxies as a file-like resource.
///
/// Methods: `read([size])`, `readline()`, `write(data)`, `seek(offset[, whence])`,
/// `tell()`, `flush()`, `truncate([size])`, `fileno()`, `close()`.
/// Attributes: `name`, `mode`.
#[derive(Debug)]
pub struct File {
    file: Option<fs::File>,
    name: String,
    mode: String,
    binary: bool,
}

impl File {
    pub fn new(
        file: fs::File,
        name: impl Into<String>,
        mode: impl Into<String>,
        binary: bool,
    ) -> Self {
        Self {
            file: Some(file),
            name: name.into(),
            mode: mode.into(),
            binary,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn file(&mut self) -> io::Result<&mut fs::File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "I/O operation on closed file"))
    }

    fn data(&self, buf: Vec<u8>) -> io::Result<Value> {
        if self.binary {
            return Ok(Value::Bytes(Bytes::from(buf)));
        }

        String::from_utf8(buf)
            .map(Value::Str)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    /// Reads up to `size` bytes in binary mode, or up to `size` characters in text mode.
    pub fn read(&mut self, size: Option<usize>) -> io::Result<Value> {
        let binary = self.binary;
        let file = self.file()?;
        let mut buf = vec![];

        match size {
            None => {
                file.read_to_end(&mut buf)?;
            }
            Some(size) if binary => {
                file.take(size as u64).read_to_end(&mut buf)?;
            }
            Some(size) => read_chars(file, size, &mut buf)?,
        }

        self.data(buf)
    }

    /// Reads up to and including the next `\n`, leaving the offset right after it.
    pub fn readline(&mut self) -> io::Result<Value> {
        let file = self.file()?;
        let mut line = vec![];
        let mut chunk = [0; READLINE_CHUNK];

        loop {
            let n = file.read(&mut chunk)?;
            if n == 0 {
                break;
            }

            if let Some(pos) = chunk[..n].iter().position(|&b| b == b'\n') {
                line.extend_from_slice(&chunk[..=pos]);
                file.seek(SeekFrom::Current(-((n - pos - 1) as i64)))?;
                break;
            }

            line.extend_from_slice(&chunk[..n]);
        }

        self.data(line)
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.file()?.write_all(data)?;

        Ok(data.len())
    }

    pub fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file()?.seek(pos)
    }

    pub fn truncate(&mut self, size: Option<u64>) -> io::Result<u64> {
        let file = self.file()?;
        let size = match size {
            Some(size) => size,
            None => file.stream_position()?,
        };
        file.set_len(size)?;

        Ok(size)
    }

    /// Closing twice is a no-op.
    pub fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }

        Ok(())
    }
}

impl Resource for File {
    fn members(&self) -> Members {
        Members::new("File")
            .methods(&[
                "read", "readline", "write", "seek", "tell", "flush", "truncate", "fileno", "close",
            ])
            .attribute("name", self.name.clone())
            .attribute("mode", self.mode.clone())
    }

    fn call(&mut self, name: &str, args: Args) -> Result<Value, ResourceError> {
        let value = match name {
            "read" => {
                let size = optional_int(&args, 0, "size")?.and_then(|n| usize::try_from(n).ok());
                self.read(size)?
            }
            "readline" => self.readline()?,
            "write" => {
                let data = args
                    .get(0, "data")
                    .and_then(Value::as_bytes)
                    .ok_or_else(|| invalid_input("write requires bytes or str data"))?;
                Value::Int(self.write(data)? as i64)
            }
            "seek" => {
                let offset = optional_int(&args, 0, "offset")?
                    .ok_or_else(|| invalid_input("seek requires an offset"))?;
                let pos = match optional_int(&args, 1, "whence")?.unwrap_or(0) {
                    0 => SeekFrom::Start(
                        u64::try_from(offset).map_err(|_| invalid_input("negative seek position"))?,
                    ),
                    1 => SeekFrom::Current(offset),
                    2 => SeekFrom::End(offset),
                    whence => return Err(invalid_input(&format!("invalid whence ({whence})")).into()),
                };
                Value::Int(self.seek(pos)? as i64)
            }
            "tell" => Value::Int(self.file()?.stream_position()? as i64),
            "flush" => {
                self.file()?.flush()?;
                Value::Unit
            }
            "truncate" => {
                let size = optional_int(&args, 0, "size")?
                    .map(|n| u64::try_from(n).map_err(|_| invalid_input("negative size")))
                    .transpose()?;
                Value::Int(self.truncate(size)? as i64)
            }
            "fileno" => Value::Int(self.file()?.as_raw_fd().into()),
            "close" => {
                self.close()?;
                Value::Unit
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("File has no method {name}"),
                )
                .into())
            }
        };

        Ok(value)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Reads until `buf` holds `size` complete UTF-8 characters or the file ends.
///
/// Each read asks for at most one byte per missing character, so it never goes
/// past the last wanted character.
fn read_chars(file: &mut fs::File, size: usize, buf: &mut Vec<u8>) -> io::Result<()> {
    let mut chars = 0;

    while chars < size {
        let start = buf.len();
        buf.resize(start + size - chars, 0);
        let n = file.read(&mut buf[start..])?;
        buf.truncate(start + n);
        if n == 0 {
            break;
        }

        chars = match std::str::from_utf8(buf) {
            Ok(text) => text.chars().count(),
            // a character cut by the read, complete it on the next round
            Err(err) if err.error_len().is_none() => {
                String::from_utf8_lossy(&buf[..err.valid_up_to()])
                    .chars()
                    .count()
            }
            Err(err) => return Err(io::Error::new(io::ErrorKind::InvalidData, err)),
        };
    }

    Ok(())
}

fn invalid_input(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
}

/// Integer argument, `None` when absent or passed as unit.
fn optional_int(args: &Args, index: usize, name: &str) -> io::Result<Option<i64>> {
    match args.get(index, name) {
        None | Some(Value::Unit) => Ok(None),
        Some(Value::Int(n)) => Ok(Some(*n)),
        Some(other) => Err(invalid_input(&format!("{name} must be an integer, got {other}"))),
    }
}
