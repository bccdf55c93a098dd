//! Per-worker outcome of one stage execution

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::metrics::Statistics;

/// Error details carried by a failed [`Ack`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckError {
    /// Human readable message
    pub message: String,
    /// Rendered cause chain, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Stage-specific result data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum AckPayload {
    /// Nothing beyond success or failure
    #[default]
    None,
    /// Statistics of a stress test, one entry per thread or merged
    Statistics(Vec<Statistics>),
}

/// Acknowledgement a worker sends back for every stage id it receives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    /// Index of the reporting worker
    pub worker_index: usize,

    /// Set when the stage failed on this worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AckError>,

    /// Stage execution time on this worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,

    /// Stage-specific result
    #[serde(default)]
    pub payload: AckPayload,
}

impl Ack {
    /// Successful ack with no payload
    pub fn success(worker_index: usize) -> Self {
        Self {
            worker_index,
            error: None,
            duration: None,
            payload: AckPayload::None,
        }
    }

    /// Failed ack with a message and an optional cause
    pub fn error(
        worker_index: usize,
        message: impl Into<String>,
        cause: Option<&dyn std::error::Error>,
    ) -> Self {
        Self {
            worker_index,
            error: Some(AckError {
                message: message.into(),
                cause: cause.map(render_cause),
            }),
            duration: None,
            payload: AckPayload::None,
        }
    }

    /// Attach the measured stage duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: AckPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Whether the stage failed on this worker
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Statistics carried by the payload, empty for other payloads
    pub fn statistics(&self) -> &[Statistics] {
        match &self.payload {
            AckPayload::Statistics(stats) => stats,
            AckPayload::None => &[],
        }
    }
}

fn render_cause(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        rendered.push_str(": ");
        rendered.push_str(&inner.to_string());
        source = inner.source();
    }
    rendered
}

impl std::fmt::Display for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error {
            Some(error) => write!(f, "worker {} failed: {}", self.worker_index, error.message)?,
            None => write!(f, "worker {} ok", self.worker_index)?,
        }
        if let Some(duration) = self.duration {
            write!(f, " in {}", humantime::format_duration(duration))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] std::io::Error);

    #[test]
    fn test_error_ack_renders_cause_chain() {
        let cause = Outer(std::io::Error::new(std::io::ErrorKind::Other, "inner"));
        let ack = Ack::error(3, "stage failed", Some(&cause));
        assert!(ack.is_error());
        let error = ack.error.unwrap();
        assert_eq!(error.message, "stage failed");
        assert_eq!(error.cause.as_deref(), Some("outer: inner"));
    }

    #[test]
    fn test_success_ack_has_no_statistics() {
        let ack = Ack::success(0).with_duration(Duration::from_millis(1500));
        assert!(!ack.is_error());
        assert!(ack.statistics().is_empty());
        assert_eq!(ack.to_string(), "worker 0 ok in 1s 500ms");
    }

    #[test]
    fn test_ack_json_shape() {
        let ack = Ack::success(1).with_payload(AckPayload::Statistics(vec![Statistics::new()]));
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["worker_index"], 1);
        assert_eq!(json["payload"]["kind"], "statistics");
        assert!(json.get("error").is_none());

        let back: Ack = serde_json::from_value(json).unwrap();
        assert_eq!(back.statistics().len(), 1);
    }
}
