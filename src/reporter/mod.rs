//! # Reporter
//!
//! Line-oriented report writer. Producers enqueue lines on a bounded
//! channel; one writer thread drains it into stdout or a file. Lines are
//! written in submission order.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::background::Background;
use crate::engine::blocking;
use crate::error::ScriptError;
use crate::script::{Composable, Segment};

pub const QUEUE_CAPACITY: usize = 1000;

#[derive(Debug)]
enum Message {
    Line(String),
    Close,
}

#[derive(Debug)]
pub struct Reporter {
    sender: SyncSender<Message>,
    writer: Mutex<Option<JoinHandle<()>>>,
    format: Option<Segment>,
    templates: HashMap<String, Segment>,
    destination: String,
}

impl Reporter {
    /// Start a reporter writing to `path`, or stdout when `None`. Parent
    /// directories of `path` are created.
    pub fn start(
        path: Option<&Path>,
        format: Option<Segment>,
        templates: HashMap<String, Segment>,
    ) -> io::Result<Self> {
        let (sink, destination): (Box<dyn Write + Send>, String) = match path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                let file = File::create(path)?;
                (Box::new(BufWriter::new(file)), path.display().to_string())
            }
            None => (Box::new(io::stdout()), "stdout".to_string()),
        };

        let (sender, receiver) = mpsc::sync_channel(QUEUE_CAPACITY);
        let label = destination.clone();
        let writer = thread::Builder::new()
            .name("barrage-reporter".to_string())
            .spawn(move || drain(receiver, sink, &label))?;

        Ok(Self {
            sender,
            writer: Mutex::new(Some(writer)),
            format,
            templates,
            destination,
        })
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Enqueue a rendered line. Waits for room while the queue is full.
    pub fn report_line(&self, line: impl Into<String>) {
        let sent = match self.sender.try_send(Message::Line(line.into())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => blocking(|| self.sender.send(message)).map_err(|_| ()),
            Err(TrySendError::Disconnected(_)) => Err(()),
        };
        if sent.is_err() {
            tracing::warn!(destination = %self.destination, "report line dropped: reporter closed");
        }
    }

    /// Render the default format against `bg` and enqueue it.
    pub fn report_default(&self, bg: &mut Background, newline: bool) -> Result<(), ScriptError> {
        let format = self
            .format
            .as_ref()
            .ok_or_else(|| ScriptError::runtime("report: no default format configured"))?;
        self.render(format, bg, newline)
    }

    /// Render the named template against `bg` and enqueue it.
    pub fn report_template(
        &self,
        bg: &mut Background,
        name: &str,
        newline: bool,
    ) -> Result<(), ScriptError> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| ScriptError::runtime(format!("report: unknown template `{name}`")))?;
        self.render(template, bg, newline)
    }

    fn render(&self, segment: &Segment, bg: &mut Background, newline: bool) -> Result<(), ScriptError> {
        let mut line = segment.compose(bg)?;
        if newline {
            line.push('\n');
        }
        self.report_line(line);
        Ok(())
    }

    /// Drain pending lines and stop the writer. Idempotent.
    pub fn close(&self) {
        let Some(writer) = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let joined = blocking(|| {
            let _ = self.sender.send(Message::Close);
            writer.join()
        });
        if joined.is_err() {
            tracing::error!(destination = %self.destination, "reporter writer panicked");
        }
        self.close_templates();
    }

    fn close_templates(&self) {
        if let Some(format) = &self.format {
            format.close();
        }
        for template in self.templates.values() {
            template.close();
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.close();
    }
}

fn drain(receiver: Receiver<Message>, mut sink: Box<dyn Write + Send>, destination: &str) {
    let mut failed = false;
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Line(line) => {
                if failed {
                    continue;
                }
                if let Err(err) = sink.write_all(line.as_bytes()) {
                    tracing::error!(%destination, error = %err, "report write failed");
                    failed = true;
                }
            }
            Message::Close => break,
        }
    }
    if let Err(err) = sink.flush() {
        tracing::error!(%destination, error = %err, "report flush failed");
    }
}

/// Resolve a reporter path against the config directory.
pub fn resolve_path(base: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    }
}
