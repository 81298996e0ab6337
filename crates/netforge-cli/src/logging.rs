//! Per-level log routing for the `tracing` fmt subscriber.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILE: &str = "netforge.log";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sink {
    Stdout,
    Stderr,
    File,
    Off,
}

impl FromStr for Sink {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdout" => Ok(Sink::Stdout),
            "stderr" => Ok(Sink::Stderr),
            "file" => Ok(Sink::File),
            "off" | "none" => Ok(Sink::Off),
            other => Err(format!("unknown log sink: {other} (expected stdout, stderr, file or off)")),
        }
    }
}

/// One sink per severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelSinks {
    pub error: Sink,
    pub warn: Sink,
    pub info: Sink,
    pub debug: Sink,
    pub trace: Sink,
}

impl LevelSinks {
    /// Errors and warnings to stderr, info to stdout, debug and trace to
    /// the log file when there is one.
    pub fn defaults(with_file: bool) -> Self {
        let verbose = if with_file { Sink::File } else { Sink::Off };
        Self {
            error: Sink::Stderr,
            warn: Sink::Stderr,
            info: Sink::Stdout,
            debug: verbose,
            trace: verbose,
        }
    }

    pub fn for_level(&self, level: &Level) -> Sink {
        match *level {
            Level::ERROR => self.error,
            Level::WARN => self.warn,
            Level::INFO => self.info,
            Level::DEBUG => self.debug,
            _ => self.trace,
        }
    }

    pub fn set(&mut self, level: Level, sink: Sink) {
        match level {
            Level::ERROR => self.error = sink,
            Level::WARN => self.warn = sink,
            Level::INFO => self.info = sink,
            Level::DEBUG => self.debug = sink,
            _ => self.trace = sink,
        }
    }

    pub fn uses_file(&self) -> bool {
        [self.error, self.warn, self.info, self.debug, self.trace].contains(&Sink::File)
    }
}

/// `LEVEL=SINK`, as taken by `--log-route`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub level: Level,
    pub sink: Sink,
}

impl FromStr for Route {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (level, sink) = s
            .split_once('=')
            .ok_or_else(|| format!("expected LEVEL=SINK, got `{s}`"))?;
        Ok(Route {
            level: level
                .trim()
                .parse()
                .map_err(|_| format!("unknown log level: {level}"))?,
            sink: sink.trim().parse()?,
        })
    }
}

type SharedWriter = Mutex<Box<dyn Write + Send>>;

/// Picks the destination of each event from its level.
pub struct LevelRouter {
    sinks: LevelSinks,
    file: Option<SharedWriter>,
}

impl LevelRouter {
    pub fn new(sinks: LevelSinks, file: Option<Box<dyn Write + Send>>) -> Self {
        Self {
            sinks,
            file: file.map(Mutex::new),
        }
    }

    fn writer(&self, sink: Sink) -> SinkWriter<'_> {
        match (sink, &self.file) {
            (Sink::Stdout, _) => SinkWriter::Stdout(io::stdout().lock()),
            (Sink::Stderr, _) => SinkWriter::Stderr(io::stderr().lock()),
            (Sink::File, Some(file)) => SinkWriter::Shared(file),
            (Sink::File, None) | (Sink::Off, _) => SinkWriter::Off,
        }
    }
}

impl<'a> MakeWriter<'a> for LevelRouter {
    type Writer = SinkWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer(self.sinks.info)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        self.writer(self.sinks.for_level(meta.level()))
    }
}

/// Writer for one event. Console variants hold the stream lock until the
/// event is written.
pub enum SinkWriter<'a> {
    Stdout(io::StdoutLock<'static>),
    Stderr(io::StderrLock<'static>),
    Shared(&'a SharedWriter),
    Off,
}

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SinkWriter::Stdout(out) => out.write(buf),
            SinkWriter::Stderr(err) => err.write(buf),
            // fmt hands over a whole formatted event at once
            SinkWriter::Shared(file) => {
                let mut file = file
                    .lock()
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "log sink lock poisoned"))?;
                file.write_all(buf)?;
                Ok(buf.len())
            }
            SinkWriter::Off => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SinkWriter::Stdout(out) => out.flush(),
            SinkWriter::Stderr(err) => err.flush(),
            SinkWriter::Shared(file) => file
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "log sink lock poisoned"))?
                .flush(),
            SinkWriter::Off => Ok(()),
        }
    }
}

/// Installs the global subscriber.
pub fn init(filter: &str, log_file: Option<&Path>, routes: &[Route]) -> Result<()> {
    let mut sinks = LevelSinks::defaults(log_file.is_some());
    for route in routes {
        sinks.set(route.level, route.sink);
    }

    let file = match log_file {
        Some(path) if sinks.uses_file() => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(Box::new(file) as Box<dyn Write + Send>)
        }
        _ => None,
    };

    let filter = EnvFilter::try_new(filter).with_context(|| format!("invalid log filter `{filter}`"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(LevelRouter::new(sinks, file))
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {e}"))
}
