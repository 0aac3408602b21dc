use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct JobId(pub Ulid);

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EventId(pub Ulid);

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageId(pub Ulid);

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed application-progress vocabulary. Every stage event's `to_stage`
/// is one of these members; external labels must pass through
/// [`normalize_stage_label`] first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Applied,
    RecruiterScreen,
    Assessment,
    HiringManagerScreen,
    TechnicalInterview,
    Onsite,
    Offer,
    Closed,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::RecruiterScreen => "recruiter_screen",
            Self::Assessment => "assessment",
            Self::HiringManagerScreen => "hiring_manager_screen",
            Self::TechnicalInterview => "technical_interview",
            Self::Onsite => "onsite",
            Self::Offer => "offer",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "applied" => Some(Self::Applied),
            "recruiter_screen" => Some(Self::RecruiterScreen),
            "assessment" => Some(Self::Assessment),
            "hiring_manager_screen" => Some(Self::HiringManagerScreen),
            "technical_interview" => Some(Self::TechnicalInterview),
            "onsite" => Some(Self::Onsite),
            "offer" => Some(Self::Offer),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Closing stages may carry or retain a terminal outcome.
    #[must_use]
    pub fn is_closing(self) -> bool {
        matches!(self, Self::Offer | Self::Closed)
    }
}

/// Coarse job status derived from the latest projectable stage event.
/// `Discovered` is the pre-application reset state and is never produced
/// by the stage→status map directly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Discovered,
    Applied,
    InProgress,
    Closed,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Applied => "applied",
            Self::InProgress => "in_progress",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "discovered" => Some(Self::Discovered),
            "applied" => Some(Self::Applied),
            "in_progress" => Some(Self::InProgress),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Stage→status map. The `closed` stage only reads as a closed job once an
/// outcome is attached; until then the job is still in progress.
#[must_use]
pub fn job_status_for(stage: Stage, outcome: Option<StageOutcome>) -> JobStatus {
    match stage {
        Stage::Applied => JobStatus::Applied,
        Stage::Closed if outcome.is_some() => JobStatus::Closed,
        _ => JobStatus::InProgress,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    OfferAccepted,
    Rejected,
    Withdrawn,
}

impl StageOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OfferAccepted => "offer_accepted",
            Self::Rejected => "rejected",
            Self::Withdrawn => "withdrawn",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "offer_accepted" => Some(Self::OfferAccepted),
            "rejected" => Some(Self::Rejected),
            "withdrawn" => Some(Self::Withdrawn),
            _ => None,
        }
    }
}

/// Coarse classification of an inbound message, produced by the external
/// classification pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Interview,
    Offer,
    Rejection,
    Update,
    Other,
}

impl MessageType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interview => "interview",
            Self::Offer => "offer",
            Self::Rejection => "rejection",
            Self::Update => "update",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "interview" => Some(Self::Interview),
            "offer" => Some(Self::Offer),
            "rejection" => Some(Self::Rejection),
            "update" => Some(Self::Update),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Message lifecycle status. Anything other than `PendingUser` is terminal
/// and frozen against automatic overwrite by re-syncs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    PendingUser,
    AutoLinked,
    ManualLinked,
    Ignored,
}

impl ProcessingStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingUser => "pending_user",
            Self::AutoLinked => "auto_linked",
            Self::ManualLinked => "manual_linked",
            Self::Ignored => "ignored",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending_user" => Some(Self::PendingUser),
            "auto_linked" => Some(Self::AutoLinked),
            "manual_linked" => Some(Self::ManualLinked),
            "ignored" => Some(Self::Ignored),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::PendingUser)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InterviewLog,
    #[default]
    StatusUpdate,
    Note,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InterviewLog => "interview_log",
            Self::StatusUpdate => "status_update",
            Self::Note => "note",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "interview_log" => Some(Self::InterviewLog),
            "status_update" => Some(Self::StatusUpdate),
            "note" => Some(Self::Note),
            _ => None,
        }
    }
}

/// Target of a ledger transition: either an explicit stage or the
/// pseudo-value `no_change`, which logs an event without moving the job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionTarget {
    Stage(Stage),
    NoChange,
}

impl TransitionTarget {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if value == "no_change" {
            return Some(Self::NoChange);
        }
        Stage::parse(value).map(Self::Stage)
    }
}

/// Strict metadata schema for stage events. Unknown keys are rejected so a
/// caller typo cannot silently drop information.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventKind>,
}

impl EventMetadata {
    /// Decodes and validates a raw metadata blob.
    ///
    /// # Errors
    /// Returns [`LedgerError::Invalid`] with the offending field detail when
    /// the blob carries unknown keys or mistyped values.
    pub fn from_value(value: &Value) -> Result<Self, LedgerError> {
        serde_json::from_value(value.clone())
            .map_err(|err| LedgerError::Invalid(format!("invalid event metadata: {err}")))
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.event_type.unwrap_or_default()
    }

    /// Note events participate in the timeline but never change the
    /// projection or the `from_stage` chain.
    #[must_use]
    pub fn is_note(&self) -> bool {
        self.kind() == EventKind::Note
    }
}

/// Maps an untrusted classifier label onto the stage vocabulary.
/// Case- and separator-insensitive, with a synonym table for the labels the
/// classification pipeline is known to emit.
#[must_use]
pub fn normalize_stage_label(raw: &str) -> Option<Stage> {
    let folded: String = raw
        .trim()
        .chars()
        .map(|ch| match ch {
            ' ' | '-' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect();

    if let Some(stage) = Stage::parse(&folded) {
        return Some(stage);
    }

    match folded.as_str() {
        "application" | "application_submitted" | "apply" => Some(Stage::Applied),
        "phone_screen" | "recruiter_call" | "recruiter_phone_screen" | "intro_call"
        | "screening" => Some(Stage::RecruiterScreen),
        "take_home" | "coding_challenge" | "online_assessment" | "oa" | "test" => {
            Some(Stage::Assessment)
        }
        "hm_screen" | "hiring_manager" | "manager_screen" => Some(Stage::HiringManagerScreen),
        "technical" | "tech_screen" | "technical_screen" | "coding_interview" => {
            Some(Stage::TechnicalInterview)
        }
        "on_site" | "onsite_interview" | "final_round" | "final_interview" | "panel" | "loop" => {
            Some(Stage::Onsite)
        }
        "offer_extended" | "verbal_offer" => Some(Stage::Offer),
        "rejected" | "rejection" | "withdrawn" | "close" => Some(Stage::Closed),
        _ => None,
    }
}

/// Default stage target when the classifier produced no explicit label.
#[must_use]
pub fn default_stage_for(message_type: MessageType) -> Option<Stage> {
    match message_type {
        MessageType::Interview => Some(Stage::TechnicalInterview),
        MessageType::Offer => Some(Stage::Offer),
        MessageType::Rejection => Some(Stage::Closed),
        MessageType::Update | MessageType::Other => None,
    }
}

/// Resolves the stage target for a classified message: an explicit label wins,
/// otherwise the message-type default applies.
#[must_use]
pub fn resolve_stage_target(label: Option<&str>, message_type: MessageType) -> Option<Stage> {
    label
        .and_then(normalize_stage_label)
        .or_else(|| default_stage_for(message_type))
}

/// One row of the event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageEvent {
    pub event_seq: i64,
    pub event_id: EventId,
    pub job_id: JobId,
    pub title: String,
    pub group_id: Option<String>,
    pub from_stage: Option<Stage>,
    pub to_stage: Stage,
    pub occurred_at: i64,
    pub recorded_at: OffsetDateTime,
    pub metadata: EventMetadata,
    pub outcome: Option<StageOutcome>,
}

/// Application record. The four ledger-owned fields (`status`, `outcome`,
/// `applied_at`, `closed_at`) are mutated exclusively by ledger operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub job_id: JobId,
    pub company: String,
    pub role: String,
    pub status: JobStatus,
    pub outcome: Option<StageOutcome>,
    pub applied_at: Option<i64>,
    pub closed_at: Option<i64>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub target: TransitionTarget,
    pub occurred_at: Option<i64>,
    pub metadata: Option<Value>,
    pub outcome: Option<StageOutcome>,
}

impl TransitionRequest {
    #[must_use]
    pub fn to_stage(target: TransitionTarget) -> Self {
        Self {
            target,
            occurred_at: None,
            metadata: None,
            outcome: None,
        }
    }
}

/// Patch for `update_event`. Every field uses explicit-presence semantics:
/// a present field is applied even when the value is falsy (`occurred_at = 0`
/// is honored), and `outcome` distinguishes "clear" (`Some(None)`) from
/// "leave untouched" (`None`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageEventPatch {
    pub to_stage: Option<Stage>,
    pub occurred_at: Option<i64>,
    pub metadata: Option<Value>,
    pub outcome: Option<Option<StageOutcome>>,
}

/// Natural key of an externally observed message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct MessageKey {
    pub provider: String,
    pub account_key: String,
    pub external_message_id: String,
}

/// Content fields of a message sighting. Refreshed unconditionally on every
/// re-sync, independent of the lifecycle status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageContent {
    pub integration_id: Option<String>,
    pub sync_run_id: Option<String>,
    pub external_thread_id: Option<String>,
    pub from_address: Option<String>,
    pub from_domain: Option<String>,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub received_at: Option<i64>,
    pub classification_label: Option<String>,
    pub classification_confidence: Option<f64>,
    pub classification_payload: Option<Value>,
    pub relevance_llm_score: Option<f64>,
    pub relevance_decision: Option<String>,
    pub match_confidence: Option<f64>,
    pub stage_target: Option<Stage>,
    pub message_type: Option<MessageType>,
    pub stage_event_payload: Option<Value>,
}

/// One row per externally observed message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostApplicationMessage {
    pub message_id: MessageId,
    pub key: MessageKey,
    pub content: MessageContent,
    pub matched_job_id: Option<JobId>,
    pub processing_status: ProcessingStatus,
    pub decided_at: Option<i64>,
    pub decided_by: Option<String>,
    pub first_seen_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Inputs to the projection resolver: the latest projectable event for a job
/// plus the job's current outcome/close state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionInput<'a> {
    pub last_stage: Stage,
    pub occurred_at: i64,
    pub metadata: &'a EventMetadata,
    pub event_outcome: Option<StageOutcome>,
    pub current_outcome: Option<StageOutcome>,
    pub current_closed_at: Option<i64>,
}

/// Derived `{status, outcome, closed_at}` view of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Projection {
    pub status: JobStatus,
    pub outcome: Option<StageOutcome>,
    pub closed_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum OutcomeSource {
    Explicit,
    Inferred,
    Retained,
    None,
}

/// Pure projection resolver. Outcome precedence is explicit > inferred >
/// retained-while-still-closing > none. `closed_at` is always the event
/// timestamp for the `closed` stage and for an explicitly supplied outcome;
/// an inferred `offer_accepted` does not close the job (the offer stage is
/// closing but the job stays open until `closed` is reached), and an outcome
/// that merely survived from the prior record keeps the prior `closed_at`.
#[must_use]
pub fn resolve_projection(input: &ProjectionInput<'_>) -> Projection {
    let inferred = match input.last_stage {
        Stage::Offer => Some(StageOutcome::OfferAccepted),
        Stage::Closed if input.metadata.reason_code.is_some() => Some(StageOutcome::Rejected),
        _ => None,
    };

    let closing = input.last_stage.is_closing();

    let (outcome, source) = if input.event_outcome.is_some() {
        (input.event_outcome, OutcomeSource::Explicit)
    } else if inferred.is_some() {
        (inferred, OutcomeSource::Inferred)
    } else if closing && input.current_outcome.is_some() {
        (input.current_outcome, OutcomeSource::Retained)
    } else {
        (None, OutcomeSource::None)
    };

    let closed_at = if input.last_stage == Stage::Closed {
        Some(input.occurred_at)
    } else {
        match source {
            OutcomeSource::Explicit => Some(input.occurred_at),
            OutcomeSource::Retained => input.current_closed_at,
            OutcomeSource::Inferred | OutcomeSource::None => None,
        }
    };

    Projection {
        status: job_status_for(input.last_stage, outcome),
        outcome,
        closed_at,
    }
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Current wall-clock time as epoch milliseconds, the unit used for all
/// caller-suppliable logical timestamps.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::Internal`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Internal(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Parses an RFC3339 timestamp.
///
/// # Errors
/// Returns [`LedgerError::Invalid`] when parsing fails.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, LedgerError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Invalid(format!("invalid RFC3339 timestamp: {err}")))
}
