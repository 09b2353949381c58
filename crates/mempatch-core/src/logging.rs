//! Forwards the core's `tracing` output to the manager as `LOG` frames.
//! Falls back to stderr once the channel is gone.

use std::io::Write;
use std::sync::{Arc, Weak};

use tracing::Metadata;
use tracing_subscriber::fmt::MakeWriter;

use mempatch_common::channel::LogSeverity;

use crate::core::Core;

#[derive(Clone)]
pub struct LogForwarder {
    core: Weak<Core>,
}

impl LogForwarder {
    pub fn new(core: &Arc<Core>) -> Self {
        Self {
            core: Arc::downgrade(core),
        }
    }
}

impl<'a> MakeWriter<'a> for LogForwarder {
    type Writer = FrameWriter;

    fn make_writer(&'a self) -> Self::Writer {
        FrameWriter {
            core: self.core.clone(),
            severity: LogSeverity::Info,
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        let severity = match *meta.level() {
            tracing::Level::ERROR => LogSeverity::Error,
            tracing::Level::WARN => LogSeverity::Warning,
            tracing::Level::INFO => LogSeverity::Info,
            _ => LogSeverity::Debug,
        };
        FrameWriter {
            core: self.core.clone(),
            severity,
        }
    }
}

pub struct FrameWriter {
    core: Weak<Core>,
    severity: LogSeverity,
}

impl Write for FrameWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let message = String::from_utf8_lossy(buf);
        let message = message.trim_end();
        if message.is_empty() {
            return Ok(buf.len());
        }
        match self.core.upgrade() {
            Some(core) if core.is_connected() => {
                let _ = core.send_log(self.severity, message);
            }
            _ => {
                let _ = std::io::stderr().write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
