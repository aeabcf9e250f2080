//! Typed error kinds shared across the controller (§7 of the design doc).
//!
//! `SchemaError` and `RuleError` are recoverable per-entry: callers log and
//! move on to the next entry rather than aborting a batch. `TransportError`
//! crosses the RPC boundary; `ControllerError` is the orchestrator-facing
//! union used where a single `Result` type is convenient.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown {kind:?} `{name}`")]
    Unknown { kind: EntityKind, name: String },

    #[error("value for field `{field}` does not fit in {bit_width} bits")]
    Encode { field: String, bit_width: u32 },

    #[error("match kind mismatch for field `{field}`: expected {expected:?}, got {actual:?}")]
    MatchKindMismatch {
        field: String,
        expected: MatchKind,
        actual: MatchKind,
    },

    #[error("priority is required for ternary/range field `{field}`")]
    MissingPriority { field: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Table,
    MatchField,
    Action,
    ActionParam,
    Digest,
    Counter,
    Register,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Table => "table",
            EntityKind::MatchField => "match field",
            EntityKind::Action => "action",
            EntityKind::ActionParam => "action param",
            EntityKind::Digest => "digest",
            EntityKind::Counter => "counter",
            EntityKind::Register => "register",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Lpm,
    Ternary,
    Range,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to device failed: {0}")]
    Connect(String),
    #[error("RPC deadline exceeded")]
    Deadline,
    #[error("stream closed by peer")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(String),
}

/// Raised by [`crate::rules::RuleEngine`] upsert operations.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A topology link lacked a reverse port, or the spanning tree could not
/// reach a declared switch. Logged, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum ConsistencyWarning {
    #[error("link {a}:{a_port} -> {b} has no matching reverse port on {b}")]
    MissingReversePort { a: String, a_port: u32, b: String },
    #[error("switch `{0}` is unreachable from the spanning-tree root")]
    UnreachableSwitch(String),
}

/// A digest referenced a tunnel id absent from the currently loaded plan.
/// The metric is still published; the reactive block step is skipped.
#[derive(Debug, thiserror::Error)]
#[error("tunnel id {0} not present in the loaded plan")]
pub struct PlanMismatch(pub u64);

/// Catch-all used at orchestrator call sites where a single `Result` type
/// is convenient; module-internal code uses the narrower types above.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    PlanMismatch(#[from] PlanMismatch),
    #[error("timed out waiting for the next inbound message")]
    Timeout,
}
