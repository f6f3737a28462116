use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One status value an execution's stream can carry, per spec.md §3. Two
/// values are added beyond the literal spec set: `SubscriberLagged`, sent
/// only to a dropped-for-lag subscriber (§4.6), and `Ended`, the synthetic
/// frame reconstructed for a subscriber that attaches after finalisation
/// (§5 "Ordering guarantees").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusValue {
    Queued,
    Running,
    Completed,
    Error,
    Timeout,
    Stopped,
    SubscriberLagged,
    Ended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FramePayload {
    Stdout { bytes: Vec<u8> },
    Stderr { bytes: Vec<u8> },
    Status { value: StatusValue },
}

/// A single unit of streaming output, totally ordered per execution
/// (spec.md §3 "Stream frame").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: FramePayload,
}

impl Frame {
    pub fn is_terminal_status(&self) -> bool {
        matches!(
            self.payload,
            FramePayload::Status {
                value: StatusValue::Completed
                    | StatusValue::Error
                    | StatusValue::Timeout
                    | StatusValue::Stopped
                    | StatusValue::Ended
            }
        )
    }
}
