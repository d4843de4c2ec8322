//! Event types broadcast to consumers.
//!
//! Both streams are fanned out over `tokio::sync::broadcast`:
//!
//! | Event | Source | Cadence |
//! |-------|--------|---------|
//! | [`SpectrumFrame`] | spectrum service | ≤ 60 Hz |
//! | [`CaptureStatusEvent`] | capture worker | on state transition |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Spectrum frames
// ---------------------------------------------------------------------------

/// One analysis tick's output: `bars.len()` magnitudes, each in [0.0, 1.0].
///
/// Lower indices are bass, higher indices are treble (log-spaced bands).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectrumFrame {
    /// Monotonically increasing frame sequence number.
    pub seq: u64,
    /// Smoothed bar magnitudes, length == configured bar count.
    pub bars: Vec<f32>,
}

// ---------------------------------------------------------------------------
// Capture status events
// ---------------------------------------------------------------------------

/// Emitted whenever the capture worker changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStatusEvent {
    pub status: CaptureStatus,
    /// Optional human-readable detail (e.g. the negotiation error).
    pub detail: Option<String>,
}

/// Capture worker state machine, as visible to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    /// No data has arrived within the idle timeout; the buffer reads as silence.
    Idle,
    /// Opening the backend stream (includes retry backoff).
    Negotiating,
    /// Samples are flowing into the capture buffer.
    Streaming,
    /// Negotiation exhausted its retry budget; the service stays up but silent.
    Unavailable,
    /// The worker has shut down cleanly.
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spectrum_frame_serializes_with_camel_case() {
        let frame = SpectrumFrame {
            seq: 42,
            bars: vec![0.0, 0.5, 1.0],
        };

        let json = serde_json::to_value(&frame).expect("serialize spectrum frame");
        assert_eq!(json["seq"], 42);
        assert_eq!(json["bars"].as_array().map(|b| b.len()), Some(3));

        let round_trip: SpectrumFrame =
            serde_json::from_value(json).expect("deserialize spectrum frame");
        assert_eq!(round_trip.seq, 42);
        assert_eq!(round_trip.bars, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn capture_status_serializes_lowercase() {
        let event = CaptureStatusEvent {
            status: CaptureStatus::Negotiating,
            detail: Some("attempt 2".into()),
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "negotiating");
        assert_eq!(json["detail"], "attempt 2");

        let round_trip: CaptureStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, CaptureStatus::Negotiating);
    }

    #[test]
    fn capture_status_rejects_non_lowercase() {
        let err = serde_json::from_str::<CaptureStatus>(r#""Streaming""#);
        assert!(err.is_err(), "expected invalid casing to fail");
    }
}
