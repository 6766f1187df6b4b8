//! Core domain model for the legislative bill tracker.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "lbt-core";

/// The lookup-table families mirrored from the data provider.
///
/// Everything else in the store depends on these for referential
/// integrity, so they are synchronized before bills on every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    /// Procedural status codes (`codSituacao`).
    Status,
    /// Procedural step type codes (`codTipoTramitacao`).
    StepType,
    /// Topic codes (`codTema`).
    Topic,
}

impl ReferenceKind {
    pub const ALL: [ReferenceKind; 3] = [
        ReferenceKind::Status,
        ReferenceKind::StepType,
        ReferenceKind::Topic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Status => "status",
            ReferenceKind::StepType => "step_type",
            ReferenceKind::Topic => "topic",
        }
    }
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One code→label lookup entry. Upserted by `external_id`, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceItem {
    pub external_id: i64,
    pub label: String,
}

/// A tracked legislative bill.
///
/// Identity is the provider-assigned `external_id`, permanent. The
/// denormalized `current_*` / `last_event_time` / `agency_code` /
/// `dispatch_text` fields reflect the procedural step with the greatest
/// sequence number after any successful reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    pub external_id: i64,
    pub title: Option<String>,
    pub description: Option<String>,
    pub year_started: Option<i32>,
    pub current_status_ref: Option<i64>,
    pub current_step_type_ref: Option<i64>,
    pub last_event_time: Option<NaiveDateTime>,
    pub agency_code: Option<String>,
    pub dispatch_text: Option<String>,
}

impl Bill {
    pub fn new(external_id: i64) -> Self {
        Self {
            external_id,
            title: None,
            description: None,
            year_started: None,
            current_status_ref: None,
            current_step_type_ref: None,
            last_event_time: None,
            agency_code: None,
            dispatch_text: None,
        }
    }
}

/// One recorded procedural event in a bill's lifecycle.
///
/// Append-only: `(bill_id, sequence_number)` is the natural dedup key and
/// a sequence number once recorded is never re-applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureStep {
    pub bill_id: i64,
    pub sequence_number: i64,
    pub event_time: NaiveDateTime,
    pub status_ref: i64,
    pub step_type_ref: i64,
}

/// Everything a single bill reconciliation wants to persist, applied by the
/// store in one transaction so a failed bill never leaves partial state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillDelta {
    /// Desired row state for the bill (descriptive + denormalized fields).
    pub bill: Bill,
    /// True when the bill did not exist locally before this cycle.
    pub is_new: bool,
    /// Steps whose sequence numbers were absent locally, in source order.
    pub new_steps: Vec<ProcedureStep>,
    /// Topic ids to link that were not yet linked.
    pub new_topic_links: Vec<i64>,
}

/// A user-facing notification row, created exclusively by the sync engine's
/// notifier and mutated (marked read) only by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub bill_id: Option<i64>,
    pub title: String,
    pub body: String,
    pub read_flag: bool,
    pub created_at: NaiveDateTime,
}

/// Insert payload for a notification; id and timestamp are store-assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNotification {
    pub user_id: i64,
    pub bill_id: Option<i64>,
    pub title: String,
    pub body: String,
}
