use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// What the target reported about one execution.
#[derive(Encode, Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WorkResult {
    /// The input is not worth keeping, regardless of coverage.
    Ignore,
    #[default]
    Allow,
    /// The target explicitly marked the input as well-formed.
    Reinforce,
    Error,
}

/// The outcome of executing one input, produced by the worker runtime.
#[derive(Encode, Decode, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct WorkSummary {
    pub result: WorkResult,
    /// Sum of the bucket-flattened coverage buffer.
    pub coverage_size: u64,
    pub input_length: u64,
    /// Hex md5 of the bucket-flattened coverage buffer.
    pub hash: String,
    /// Wall time of the target invocation in microseconds.
    #[serde(with = "runtime_serde")]
    pub runtime_us: f64,
    pub error: Option<String>,
}

impl WorkSummary {
    pub fn is_error(&self) -> bool {
        self.result == WorkResult::Error || self.error.is_some()
    }
}

/// JSON has no infinity, so non-finite runtimes round-trip through `null`.
mod runtime_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

/// Wire tag of each message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Ready = 0,
    WorkSummary = 1,
    RequestCoverage = 2,
    WorkCoverage = 3,
    DoWork = 4,
    FoundLiterals = 5,
}

impl TryFrom<u8> for MessageKind {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => MessageKind::Ready,
            1 => MessageKind::WorkSummary,
            2 => MessageKind::RequestCoverage,
            3 => MessageKind::WorkCoverage,
            4 => MessageKind::DoWork,
            5 => MessageKind::FoundLiterals,
            other => return Err(other),
        })
    }
}

/// A single protocol message. The transport is symmetric: either side may
/// encode or decode any kind, and request/response pairing is left to the
/// orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Worker to orchestrator: the target is loaded and accepting work.
    Ready,
    /// Orchestrator to worker: execute this payload.
    DoWork(Vec<u8>),
    WorkSummary(WorkSummary),
    /// Orchestrator to worker: send the coverage of the last execution.
    RequestCoverage,
    WorkCoverage(Vec<u8>),
    /// Worker to orchestrator: literals discovered in the target.
    FoundLiterals(Vec<String>),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Ready => MessageKind::Ready,
            Message::DoWork(_) => MessageKind::DoWork,
            Message::WorkSummary(_) => MessageKind::WorkSummary,
            Message::RequestCoverage => MessageKind::RequestCoverage,
            Message::WorkCoverage(_) => MessageKind::WorkCoverage,
            Message::FoundLiterals(_) => MessageKind::FoundLiterals,
        }
    }
}
