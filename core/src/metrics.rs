//! Maps named analytics events onto fixed-width positional records.
//!
//! Events declare each field against an explicit [`Blob`] or [`Double`]
//! slot. `blob1` and `blob2` belong to the server identity and are filled in
//! by [`MetricsTracker`] at emission time; events may not declare them.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::MetricsError;

macro_rules! slots {
    ($name:ident, $label:literal, [$($variant:ident = $index:literal),+ $(,)?]) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum $name {
            $($variant = $index),+
        }

        impl $name {
            /// One-based position in the emitted array.
            pub const fn index(self) -> usize {
                self as usize
            }

            pub fn label(self) -> String {
                format!(concat!($label, "{}"), self.index())
            }
        }
    };
}

slots!(Blob, "blob", [
    Blob1 = 1, Blob2 = 2, Blob3 = 3, Blob4 = 4, Blob5 = 5,
    Blob6 = 6, Blob7 = 7, Blob8 = 8, Blob9 = 9, Blob10 = 10,
    Blob11 = 11, Blob12 = 12, Blob13 = 13, Blob14 = 14, Blob15 = 15,
    Blob16 = 16, Blob17 = 17, Blob18 = 18, Blob19 = 19, Blob20 = 20,
]);

slots!(Double, "double", [
    Double1 = 1, Double2 = 2, Double3 = 3, Double4 = 4, Double5 = 5,
    Double6 = 6, Double7 = 7, Double8 = 8, Double9 = 9, Double10 = 10,
    Double11 = 11, Double12 = 12, Double13 = 13, Double14 = 14, Double15 = 15,
    Double16 = 16, Double17 = 17, Double18 = 18, Double19 = 19, Double20 = 20,
]);

impl Blob {
    pub fn is_reserved(self) -> bool {
        matches!(self, Blob::Blob1 | Blob::Blob2)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl ServerInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Positional record accepted by an [`AnalyticsSink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    pub indexes: Vec<String>,
    pub blobs: Vec<Option<String>>,
    pub doubles: Vec<Option<f64>>,
}

pub trait MetricsEvent {
    /// Index tag written with the data point.
    fn name(&self) -> &'static str;

    fn blobs(&self) -> Vec<(Blob, Option<String>)>;

    fn doubles(&self) -> Vec<(Double, Option<f64>)> {
        Vec::new()
    }

    /// Map this event into a data point carrying `server` in the reserved
    /// slots.
    fn to_data_point(&self, server: &ServerInfo) -> Result<DataPoint, MetricsError> {
        let declared = self.blobs();
        if let Some((slot, _)) = declared.iter().find(|(slot, _)| slot.is_reserved()) {
            return Err(MetricsError::ReservedSlot(slot.label()));
        }

        let mut blobs = vec![
            (Blob::Blob1, Some(server.name.clone())),
            (Blob::Blob2, Some(server.version.clone())),
        ];
        blobs.extend(declared);

        Ok(DataPoint {
            indexes: vec![self.name().to_string()],
            blobs: dense(blobs, Blob::index, Blob::label)?,
            doubles: dense(self.doubles(), Double::index, Double::label)?,
        })
    }
}

fn dense<S: Copy, T>(
    fields: Vec<(S, Option<T>)>,
    index: fn(S) -> usize,
    label: fn(S) -> String,
) -> Result<Vec<Option<T>>, MetricsError> {
    let len = fields.iter().map(|(slot, _)| index(*slot)).max().unwrap_or(0);
    let mut out: Vec<Option<T>> = std::iter::repeat_with(|| None).take(len).collect();
    let mut filled = vec![false; len];
    for (slot, value) in fields {
        let position = index(slot) - 1;
        if filled[position] {
            return Err(MetricsError::DuplicateSlot(label(slot)));
        }
        filled[position] = true;
        out[position] = value;
    }
    Ok(out)
}

/// Delivery is fire-and-forget; implementations must not block.
pub trait AnalyticsSink: Send + Sync {
    fn write_data_point(&self, point: DataPoint) -> Result<(), MetricsError>;
}

/// Emits every data point as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl AnalyticsSink for LogSink {
    fn write_data_point(&self, point: DataPoint) -> Result<(), MetricsError> {
        tracing::info!(
            target: "analytics",
            indexes = ?point.indexes,
            blobs = ?point.blobs,
            doubles = ?point.doubles,
            "analytics data point"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    points: Mutex<Vec<DataPoint>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<DataPoint> {
        self.points.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AnalyticsSink for MemorySink {
    fn write_data_point(&self, point: DataPoint) -> Result<(), MetricsError> {
        self.points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(point);
        Ok(())
    }
}

/// Best-effort emitter. [`track`](Self::track) never fails; mapping and sink
/// errors are logged and dropped.
#[derive(Clone)]
pub struct MetricsTracker {
    sink: Arc<dyn AnalyticsSink>,
    server: ServerInfo,
}

impl MetricsTracker {
    pub fn new(sink: Arc<dyn AnalyticsSink>, server: ServerInfo) -> Self {
        Self { sink, server }
    }

    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    pub fn track(&self, event: &dyn MetricsEvent) {
        let point = match event.to_data_point(&self.server) {
            Ok(point) => point,
            Err(err) => {
                tracing::error!(event = event.name(), error = %err, "failed to map metrics event");
                return;
            }
        };
        if let Err(err) = self.sink.write_data_point(point) {
            tracing::error!(event = event.name(), error = %err, "failed to write metrics event");
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool_name: String,
    pub user_id: Option<String>,
    pub account_id: Option<String>,
    pub status: &'static str,
    pub duration_ms: f64,
}

impl MetricsEvent for ToolCall {
    fn name(&self) -> &'static str {
        "tool_call"
    }

    fn blobs(&self) -> Vec<(Blob, Option<String>)> {
        vec![
            (Blob::Blob3, Some(self.tool_name.clone())),
            (Blob::Blob4, self.user_id.clone()),
            (Blob::Blob5, self.account_id.clone()),
            (Blob::Blob6, Some(self.status.to_string())),
        ]
    }

    fn doubles(&self) -> Vec<(Double, Option<f64>)> {
        vec![(Double::Double1, Some(self.duration_ms))]
    }
}

#[derive(Debug, Clone)]
pub struct SessionStart {
    pub client_name: Option<String>,
    pub client_version: Option<String>,
    pub user_id: Option<String>,
}

impl MetricsEvent for SessionStart {
    fn name(&self) -> &'static str {
        "session_start"
    }

    fn blobs(&self) -> Vec<(Blob, Option<String>)> {
        vec![
            (Blob::Blob3, self.client_name.clone()),
            (Blob::Blob4, self.client_version.clone()),
            (Blob::Blob5, self.user_id.clone()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct AuthEvent {
    pub outcome: &'static str,
    pub reason: Option<String>,
}

impl MetricsEvent for AuthEvent {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn blobs(&self) -> Vec<(Blob, Option<String>)> {
        vec![
            (Blob::Blob3, Some(self.outcome.to_string())),
            (Blob::Blob4, self.reason.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sparse;

    impl MetricsEvent for Sparse {
        fn name(&self) -> &'static str {
            "sparse"
        }

        fn blobs(&self) -> Vec<(Blob, Option<String>)> {
            vec![(Blob::Blob4, Some("fourth".to_string()))]
        }
    }

    struct Reserved(Blob);

    impl MetricsEvent for Reserved {
        fn name(&self) -> &'static str {
            "reserved"
        }

        fn blobs(&self) -> Vec<(Blob, Option<String>)> {
            vec![
                (Blob::Blob3, Some("fine".to_string())),
                (self.0, Some("sneaky".to_string())),
            ]
        }
    }

    struct Duplicate;

    impl MetricsEvent for Duplicate {
        fn name(&self) -> &'static str {
            "duplicate"
        }

        fn blobs(&self) -> Vec<(Blob, Option<String>)> {
            vec![
                (Blob::Blob3, Some("a".to_string())),
                (Blob::Blob3, Some("b".to_string())),
            ]
        }
    }

    struct FailingSink;

    impl AnalyticsSink for FailingSink {
        fn write_data_point(&self, _point: DataPoint) -> Result<(), MetricsError> {
            Err(MetricsError::Sink("unavailable".to_string()))
        }
    }

    fn server() -> ServerInfo {
        ServerInfo::new("cloudflare-auditlogs", "0.1.0")
    }

    #[test]
    fn sparse_event_is_densified_with_server_identity_first() {
        let point = Sparse.to_data_point(&server()).unwrap();
        assert_eq!(
            point.blobs,
            vec![
                Some("cloudflare-auditlogs".to_string()),
                Some("0.1.0".to_string()),
                None,
                Some("fourth".to_string()),
            ]
        );
        assert!(point.doubles.is_empty());
        assert_eq!(point.indexes, vec!["sparse".to_string()]);
    }

    #[test]
    fn declaring_reserved_slots_is_rejected() {
        for slot in [Blob::Blob1, Blob::Blob2] {
            let err = Reserved(slot).to_data_point(&server()).unwrap_err();
            assert_eq!(err, MetricsError::ReservedSlot(slot.label()));
        }
        assert!(Reserved(Blob::Blob7).to_data_point(&server()).is_ok());
    }

    #[test]
    fn duplicate_slots_are_a_configuration_error() {
        assert_eq!(
            Duplicate.to_data_point(&server()).unwrap_err(),
            MetricsError::DuplicateSlot("blob3".to_string())
        );
    }

    #[test]
    fn tool_call_maps_blobs_and_doubles() {
        let event = ToolCall {
            tool_name: "auditlogs_by_account_id".to_string(),
            user_id: Some("user-1".to_string()),
            account_id: None,
            status: "ok",
            duration_ms: 12.5,
        };
        let point = event.to_data_point(&server()).unwrap();
        assert_eq!(point.blobs.len(), 6);
        assert_eq!(point.blobs[2].as_deref(), Some("auditlogs_by_account_id"));
        assert_eq!(point.blobs[4], None);
        assert_eq!(point.blobs[5].as_deref(), Some("ok"));
        assert_eq!(point.doubles, vec![Some(12.5)]);
    }

    #[test]
    fn tracker_records_points_in_sink() {
        let sink = Arc::new(MemorySink::new());
        let tracker = MetricsTracker::new(sink.clone(), server());
        tracker.track(&AuthEvent {
            outcome: "granted",
            reason: None,
        });
        let points = sink.points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].indexes, vec!["auth".to_string()]);
        assert_eq!(points[0].blobs[0].as_deref(), Some("cloudflare-auditlogs"));
    }

    #[test]
    fn tracker_swallows_mapping_and_sink_failures() {
        let sink = Arc::new(MemorySink::new());
        MetricsTracker::new(sink.clone(), server()).track(&Reserved(Blob::Blob1));
        assert!(sink.points().is_empty());

        MetricsTracker::new(Arc::new(FailingSink), server()).track(&Sparse);
    }

    #[test]
    fn slot_labels_are_one_based() {
        assert_eq!(Blob::Blob1.label(), "blob1");
        assert_eq!(Blob::Blob20.index(), 20);
        assert_eq!(Double::Double3.label(), "double3");
    }
}
