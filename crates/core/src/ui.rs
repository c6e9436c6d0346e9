//! UI sink shared by the pipeline and executor tasks.

use std::sync::Mutex;

use tracing::info;

pub trait UiSink: Send + Sync {
    fn notify(&self, msg: &str);
}

/// Forwards messages to `tracing` under the `kade::ui` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUi;

impl UiSink for TracingUi {
    fn notify(&self, msg: &str) { info!(target: "kade::ui", "{msg}"); }
}

/// Keeps every message; used by tests to assert on output order.
#[derive(Debug, Default)]
pub struct RecordingUi {
    lines: Mutex<Vec<String>>,
}

impl RecordingUi {
    pub fn new() -> Self { Self::default() }

    pub fn lines(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(g) => g.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }
}

impl UiSink for RecordingUi {
    fn notify(&self, msg: &str) {
        let mut g = match self.lines.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        g.push(msg.to_string());
    }
}
