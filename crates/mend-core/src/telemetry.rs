//! Telemetry event boundary.
//!
//! Every tracked operation (model call, patch evaluation, command
//! execution, test run) emits one structured [`TelemetryEvent`] to the
//! sinks registered on a [`Telemetry`] handle. Export backends are
//! external collaborators behind the [`TelemetrySink`] trait; with no sink
//! registered, emitting is a no-op and never fails.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::trace;

/// One structured telemetry event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    /// Operation name, e.g. `"llm_call"`.
    pub name: String,

    /// Wall-clock seconds since the Unix epoch.
    pub timestamp: f64,

    /// Operation-specific attributes.
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,

    /// Duration of the operation in milliseconds, when measured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,

    /// Outcome status, e.g. `"ok"`, `"error"`, `"timeout"`.
    pub status: String,

    /// Error description for failed operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TelemetryEvent {
    /// Create an event named `name` with status `"ok"`, stamped now.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
            attributes: serde_json::Map::new(),
            duration_ms: None,
            status: "ok".to_owned(),
            error: None,
        }
    }

    /// Attach an attribute.
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Attach a duration in milliseconds.
    pub fn duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Set the outcome status.
    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Set the error description and flip the status to `"error"`.
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.status = "error".to_owned();
        self
    }
}

/// Receives telemetry events.
///
/// Implementations must not block: a slow exporter buffers or drops on its
/// side of this boundary.
pub trait TelemetrySink: Send + Sync {
    /// Handle one event.
    fn emit(&self, event: &TelemetryEvent);
}

/// Cloneable handle dispatching events to registered sinks.
///
/// Created once by the controller and shared with the components that emit
/// events. Clones share the same sink registry.
#[derive(Clone, Default)]
pub struct Telemetry {
    sinks: Arc<RwLock<Vec<Arc<dyn TelemetrySink>>>>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.sinks.read().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("Telemetry").field("sinks", &count).finish()
    }
}

impl Telemetry {
    /// Create a handle with no sinks registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink for all future events.
    pub fn register(&self, sink: Arc<dyn TelemetrySink>) {
        if let Ok(mut sinks) = self.sinks.write() {
            sinks.push(sink);
        }
    }

    /// Dispatch one event to every registered sink.
    ///
    /// A no-op without sinks; a poisoned registry drops the event rather
    /// than failing the caller.
    pub fn emit(&self, event: TelemetryEvent) {
        trace!(name = %event.name, status = %event.status, "telemetry event");
        if let Ok(sinks) = self.sinks.read() {
            for sink in sinks.iter() {
                sink.emit(&event);
            }
        }
    }

    /// Track one model call.
    pub fn track_model_call(
        &self,
        model: &str,
        status: &str,
        latency_ms: f64,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) {
        self.emit(
            TelemetryEvent::new("llm_call")
                .attribute("model", model)
                .attribute("prompt_tokens", prompt_tokens)
                .attribute("completion_tokens", completion_tokens)
                .duration_ms(latency_ms)
                .status(status),
        );
    }

    /// Track one patch evaluation.
    pub fn track_patch_evaluation(&self, model: &str, status: &str, duration_ms: f64, diff: &str) {
        self.emit(
            TelemetryEvent::new("patch_evaluation")
                .attribute("model", model)
                .attribute("diff_lines", diff.matches('\n').count() as u64)
                .duration_ms(duration_ms)
                .status(status),
        );
    }

    /// Track one command execution.
    ///
    /// Only the first word of the command is recorded.
    pub fn track_command_execution(&self, command: &str, status: &str, duration_ms: f64) {
        let cmd_base = command.split_whitespace().next().unwrap_or("unknown");
        self.emit(
            TelemetryEvent::new("command_execution")
                .attribute("command", cmd_base)
                .duration_ms(duration_ms)
                .status(status),
        );
    }

    /// Track one test run.
    pub fn track_test_run(
        &self,
        test_cmd: &str,
        status: &str,
        duration_ms: f64,
        tests_passed: u64,
        tests_failed: u64,
    ) {
        let cmd_base = test_cmd.split_whitespace().next().unwrap_or("unknown");
        self.emit(
            TelemetryEvent::new("test_run")
                .attribute("command", cmd_base)
                .attribute("tests_passed", tests_passed)
                .attribute("tests_failed", tests_failed)
                .duration_ms(duration_ms)
                .status(status),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Collects emitted events for assertions.
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<TelemetryEvent>>,
    }

    impl TelemetrySink for RecordingSink {
        fn emit(&self, event: &TelemetryEvent) {
            self.events.lock().expect("sink lock").push(event.clone());
        }
    }

    #[test]
    fn test_should_emit_without_sinks() {
        let telemetry = Telemetry::new();
        // Must not panic or block.
        telemetry.emit(TelemetryEvent::new("noop"));
    }

    #[test]
    fn test_should_dispatch_to_registered_sink() {
        let telemetry = Telemetry::new();
        let sink = Arc::new(RecordingSink::default());
        telemetry.register(sink.clone());

        telemetry.emit(TelemetryEvent::new("op").attribute("k", "v"));

        let events = sink.events.lock().expect("sink lock");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "op");
        assert_eq!(events[0].attributes["k"], "v");
        assert_eq!(events[0].status, "ok");
    }

    #[test]
    fn test_should_dispatch_to_all_sinks_and_clones() {
        let telemetry = Telemetry::new();
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        telemetry.register(first.clone());

        let clone = telemetry.clone();
        clone.register(second.clone());
        clone.emit(TelemetryEvent::new("shared"));

        assert_eq!(first.events.lock().expect("lock").len(), 1);
        assert_eq!(second.events.lock().expect("lock").len(), 1);
    }

    #[test]
    fn test_should_track_model_call_shape() {
        let telemetry = Telemetry::new();
        let sink = Arc::new(RecordingSink::default());
        telemetry.register(sink.clone());

        telemetry.track_model_call("deepseek-chat", "ok", 120.5, 100, 50);

        let events = sink.events.lock().expect("lock");
        let event = &events[0];
        assert_eq!(event.name, "llm_call");
        assert_eq!(event.attributes["model"], "deepseek-chat");
        assert_eq!(event.attributes["prompt_tokens"], 100);
        assert_eq!(event.duration_ms, Some(120.5));
    }

    #[test]
    fn test_should_record_only_command_base_word() {
        let telemetry = Telemetry::new();
        let sink = Arc::new(RecordingSink::default());
        telemetry.register(sink.clone());

        telemetry.track_command_execution("rm -rf /tmp/scratch", "ok", 3.0);

        let events = sink.events.lock().expect("lock");
        assert_eq!(events[0].attributes["command"], "rm");
    }

    #[test]
    fn test_should_serialize_event_with_camel_case_keys() {
        let event = TelemetryEvent::new("op").duration_ms(10.0).error("boom");
        let value = serde_json::to_value(&event).expect("should serialize");

        assert_eq!(value["name"], "op");
        assert_eq!(value["durationMs"], 10.0);
        assert_eq!(value["status"], "error");
        assert_eq!(value["error"], "boom");
    }
}
