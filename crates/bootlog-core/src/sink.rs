use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

/// Durable destination for flushed lines
///
/// Owned by the flusher task; producers never touch it.
pub trait Sink: Send + 'static {
    /// Append lines in order, each followed by a newline
    fn append(&mut self, lines: &[String]) -> io::Result<()>;

    /// Make everything appended so far durable
    fn flush(&mut self) -> io::Result<()>;
}

/// Append-only file sink
///
/// The file is opened lazily. Any failure drops the handle so the next
/// attempt reopens it.
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        // Just populated above
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("sink file not open"))
    }
}

impl Sink for FileSink {
    fn append(&mut self, lines: &[String]) -> io::Result<()> {
        let result = self.writer().and_then(|writer| {
            for line in lines {
                writer.write_all(line.as_bytes())?;
                writer.write_all(b"\n")?;
            }
            Ok(())
        });
        if result.is_err() {
            self.writer = None;
        }
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        let result = writer.flush();
        if result.is_err() {
            self.writer = None;
        }
        result
    }
}

/// In-memory sink sharing its lines with every clone
#[derive(Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines appended so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

impl Sink for MemorySink {
    fn append(&mut self, lines: &[String]) -> io::Result<()> {
        self.lines.lock().extend(lines.iter().cloned());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
