//! The observability surface: traces, spans, and metrics recorded during
//! execution and exposed to scripts under the `observability.*` bindings.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

/// Trace identifiers are opaque 128-bit values.
pub type TraceId = Uuid;
pub type SpanId = Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct SpanEvent {
    pub name: String,
    pub at: DateTime<Utc>,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Span {
    pub id: SpanId,
    pub parent_id: Option<SpanId>,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub tags: HashMap<String, String>,
    pub events: Vec<SpanEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    pub id: TraceId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub spans: Vec<Span>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricShape {
    Counter,
    Gauge,
    Histogram,
    Timer,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub name: String,
    pub shape: MetricShape,
    pub value: f64,
    pub tags: HashMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportJson {
    pub traces: Vec<Trace>,
    pub metrics: Vec<MetricSample>,
    pub exported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub active_traces: usize,
    pub total_traces: usize,
    pub total_metrics: usize,
    pub checked_at: DateTime<Utc>,
}

struct TimerStart {
    started_at: DateTime<Utc>,
    tags: HashMap<String, String>,
}

/// In-memory traces/spans/metrics store. Exported surfaces are opaque
/// sinks; only an in-memory JSON export and a health report are required.
#[derive(Default)]
pub struct Observability {
    traces: RwLock<HashMap<TraceId, Trace>>,
    metrics: RwLock<Vec<MetricSample>>,
    timers: RwLock<HashMap<String, TimerStart>>,
}

impl Observability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_trace(&self) -> TraceId {
        let id = Uuid::now_v7();
        self.traces.write().insert(
            id,
            Trace {
                id,
                started_at: Utc::now(),
                ended_at: None,
                spans: Vec::new(),
            },
        );
        id
    }

    pub fn end_trace(&self, trace: TraceId) {
        if let Some(trace) = self.traces.write().get_mut(&trace) {
            trace.ended_at = Some(Utc::now());
        }
    }

    pub fn start_span(
        &self,
        trace: TraceId,
        name: impl Into<String>,
        parent_id: Option<SpanId>,
    ) -> Option<SpanId> {
        let mut traces = self.traces.write();
        let trace = traces.get_mut(&trace)?;
        let id = Uuid::now_v7();
        trace.spans.push(Span {
            id,
            parent_id,
            name: name.into(),
            started_at: Utc::now(),
            ended_at: None,
            tags: HashMap::new(),
            events: Vec::new(),
        });
        Some(id)
    }

    pub fn end_span(&self, trace: TraceId, span: SpanId) {
        if let Some(trace) = self.traces.write().get_mut(&trace) {
            if let Some(span) = trace.spans.iter_mut().find(|s| s.id == span) {
                span.ended_at = Some(Utc::now());
            }
        }
    }

    pub fn add_span_event(&self, trace: TraceId, span: SpanId, name: impl Into<String>) {
        if let Some(trace) = self.traces.write().get_mut(&trace) {
            if let Some(span) = trace.spans.iter_mut().find(|s| s.id == span) {
                span.events.push(SpanEvent {
                    name: name.into(),
                    at: Utc::now(),
                    tags: HashMap::new(),
                });
            }
        }
    }

    pub fn add_span_tag(&self, trace: TraceId, span: SpanId, key: impl Into<String>, value: impl Into<String>) {
        if let Some(trace) = self.traces.write().get_mut(&trace) {
            if let Some(span) = trace.spans.iter_mut().find(|s| s.id == span) {
                span.tags.insert(key.into(), value.into());
            }
        }
    }

    fn record(&self, name: impl Into<String>, shape: MetricShape, value: f64, tags: HashMap<String, String>) {
        self.metrics.write().push(MetricSample {
            name: name.into(),
            shape,
            value,
            tags,
            recorded_at: Utc::now(),
        });
    }

    pub fn counter(&self, name: impl Into<String>, delta: f64, tags: HashMap<String, String>) {
        self.record(name, MetricShape::Counter, delta, tags);
    }

    pub fn gauge(&self, name: impl Into<String>, value: f64, tags: HashMap<String, String>) {
        self.record(name, MetricShape::Gauge, value, tags);
    }

    pub fn histogram(&self, name: impl Into<String>, value: f64, tags: HashMap<String, String>) {
        self.record(name, MetricShape::Histogram, value, tags);
    }

    pub fn timer_start(&self, name: impl Into<String>, tags: HashMap<String, String>) {
        self.timers.write().insert(
            name.into(),
            TimerStart {
                started_at: Utc::now(),
                tags,
            },
        );
    }

    pub fn timer_end(&self, name: &str) {
        if let Some(start) = self.timers.write().remove(name) {
            let elapsed = (Utc::now() - start.started_at).num_milliseconds() as f64;
            self.record(name.to_string(), MetricShape::Timer, elapsed, start.tags);
        }
    }

    pub fn export_json(&self) -> ExportJson {
        ExportJson {
            traces: self.traces.read().values().cloned().collect(),
            metrics: self.metrics.read().clone(),
            exported_at: Utc::now(),
        }
    }

    pub fn health_check(&self) -> HealthReport {
        let traces = self.traces.read();
        HealthReport {
            status: "healthy",
            active_traces: traces.values().filter(|t| t.ended_at.is_none()).count(),
            total_traces: traces.len(),
            total_metrics: self.metrics.read().len(),
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_and_span_lifecycle() {
        let obs = Observability::new();
        let trace = obs.start_trace();
        let span = obs.start_span(trace, "task:a", None).unwrap();
        obs.add_span_tag(trace, span, "task", "a");
        obs.end_span(trace, span);
        obs.end_trace(trace);

        let export = obs.export_json();
        assert_eq!(export.traces.len(), 1);
        assert!(export.traces[0].ended_at.is_some());
        assert_eq!(export.traces[0].spans[0].tags.get("task").unwrap(), "a");
    }

    #[test]
    fn health_check_counts_active_traces() {
        let obs = Observability::new();
        let t1 = obs.start_trace();
        let _t2 = obs.start_trace();
        obs.end_trace(t1);
        let report = obs.health_check();
        assert_eq!(report.status, "healthy");
        assert_eq!(report.total_traces, 2);
        assert_eq!(report.active_traces, 1);
    }

    #[test]
    fn timer_records_elapsed_sample() {
        let obs = Observability::new();
        obs.timer_start("task.duration", HashMap::new());
        obs.timer_end("task.duration");
        let export = obs.export_json();
        assert_eq!(export.metrics.len(), 1);
        assert!(matches!(export.metrics[0].shape, MetricShape::Timer));
    }
}
