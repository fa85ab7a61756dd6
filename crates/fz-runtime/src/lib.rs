#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

pub const EVIDENCE_SCHEMA_VERSION: u32 = 1;

/// Whether re-derived views are replayed as true zero-copy strided views or
/// materialized into fresh storage. Read once when a descriptor is built and
/// baked into it; later policy changes never affect existing descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReapplyViewsPolicy {
    ZeroCopy,
    Materialize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionalizeConfig {
    pub reapply_views: ReapplyViewsPolicy,
}

impl Default for FunctionalizeConfig {
    fn default() -> Self {
        Self {
            reapply_views: ReapplyViewsPolicy::ZeroCopy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Interception,
    Sync,
    Storage,
    Policy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u64,
    pub kind: EvidenceKind,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn count_of(&self, kind: EvidenceKind) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvidenceExport {
    pub schema_version: u32,
    pub entries: Vec<EvidenceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    EvidenceEncode { diagnostic: String },
    EvidenceDecode { diagnostic: String },
    VersionMismatch { expected: u32, found: u32 },
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EvidenceEncode { diagnostic } => {
                write!(f, "evidence encode failure: {diagnostic}")
            }
            Self::EvidenceDecode { diagnostic } => {
                write!(f, "evidence decode failure: {diagnostic}")
            }
            Self::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "evidence schema version mismatch: expected={expected} found={found}"
                )
            }
        }
    }
}

impl std::error::Error for RuntimeError {}

pub fn encode_evidence(ledger: &EvidenceLedger) -> Result<String, RuntimeError> {
    let export = EvidenceExport {
        schema_version: EVIDENCE_SCHEMA_VERSION,
        entries: ledger.entries().to_vec(),
    };
    serde_json::to_string_pretty(&export).map_err(|error| RuntimeError::EvidenceEncode {
        diagnostic: error.to_string(),
    })
}

pub fn decode_evidence(payload: &str) -> Result<EvidenceExport, RuntimeError> {
    let export: EvidenceExport =
        serde_json::from_str(payload).map_err(|error| RuntimeError::EvidenceDecode {
            diagnostic: error.to_string(),
        })?;
    if export.schema_version != EVIDENCE_SCHEMA_VERSION {
        return Err(RuntimeError::VersionMismatch {
            expected: EVIDENCE_SCHEMA_VERSION,
            found: export.schema_version,
        });
    }
    Ok(export)
}

/// Shared runtime context: configuration plus the evidence ledger the
/// interception handlers record into. Handlers hold a clone of the handle.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    config: FunctionalizeConfig,
    ledger: Rc<RefCell<EvidenceLedger>>,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(config: FunctionalizeConfig) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Policy,
            format!("reapply_views={:?}", config.reapply_views),
        );
        Self {
            config,
            ledger: Rc::new(RefCell::new(ledger)),
        }
    }

    #[must_use]
    pub fn config(&self) -> FunctionalizeConfig {
        self.config
    }

    pub fn record(&self, kind: EvidenceKind, summary: impl Into<String>) {
        self.ledger.borrow_mut().record(kind, summary);
    }

    #[must_use]
    pub fn evidence(&self) -> Vec<EvidenceEntry> {
        self.ledger.borrow().entries().to_vec()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.ledger.borrow().len()
    }

    #[must_use]
    pub fn evidence_count_of(&self, kind: EvidenceKind) -> usize {
        self.ledger.borrow().count_of(kind)
    }

    pub fn export_evidence_json(&self) -> Result<String, RuntimeError> {
        encode_evidence(&self.ledger.borrow())
    }
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}
