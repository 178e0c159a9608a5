//! Structured logging: record model, sink, `tracing` front-end, and the `log` facade bridge.
//!
//! # Design
//! - Every front-end funnels into one [`LogSink`] so both facades share ordering, counting,
//!   and trace correlation.
//! - Records are serialized by hand so the key order is stable and `message` stays last.

mod bridge;
mod layer;
mod record;
mod sink;

pub use bridge::NativeLogBridge;
pub use layer::StructuredLogLayer;
pub use record::{Caller, Level, LogRecord, TraceIds, float_value};
pub use sink::{LOG_EVENT_NAME, LogSink};

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex, PoisonError};

    use serde_json::Value;

    /// Cloneable in-memory writer for inspecting sink output.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer {
        bytes: Arc<Mutex<Vec<u8>>>,
    }

    impl SharedBuffer {
        pub(crate) fn contents(&self) -> String {
            let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
            String::from_utf8_lossy(&bytes).into_owned()
        }

        pub(crate) fn json_lines(&self) -> serde_json::Result<Vec<Value>> {
            self.contents()
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(serde_json::from_str)
                .collect()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.bytes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
