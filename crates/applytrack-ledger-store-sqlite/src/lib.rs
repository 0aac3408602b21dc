#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use applytrack_ledger_core::{
    format_rfc3339, now_ms, now_utc, parse_rfc3339, resolve_projection, EventId, EventMetadata,
    JobId, JobRecord, JobStatus, LedgerError, MessageContent, MessageId, MessageKey, MessageType,
    PostApplicationMessage, ProcessingStatus, Projection, ProjectionInput, Stage, StageEvent,
    StageEventPatch, StageOutcome, TransitionRequest, TransitionTarget,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use ulid::Ulid;

const LEDGER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS jobs (
  job_id TEXT PRIMARY KEY,
  company TEXT NOT NULL,
  role TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'discovered' CHECK (
    status IN ('discovered', 'applied', 'in_progress', 'closed')
  ),
  outcome TEXT CHECK (
    outcome IN ('offer_accepted', 'rejected', 'withdrawn') OR outcome IS NULL
  ),
  applied_at INTEGER,
  closed_at INTEGER,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stage_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  job_id TEXT NOT NULL REFERENCES jobs(job_id),
  title TEXT NOT NULL,
  group_id TEXT,
  from_stage TEXT CHECK (
    from_stage IN (
      'applied', 'recruiter_screen', 'assessment', 'hiring_manager_screen',
      'technical_interview', 'onsite', 'offer', 'closed'
    ) OR from_stage IS NULL
  ),
  to_stage TEXT NOT NULL CHECK (
    to_stage IN (
      'applied', 'recruiter_screen', 'assessment', 'hiring_manager_screen',
      'technical_interview', 'onsite', 'offer', 'closed'
    )
  ),
  occurred_at INTEGER NOT NULL,
  recorded_at TEXT NOT NULL,
  metadata_json TEXT NOT NULL DEFAULT '{}',
  outcome TEXT CHECK (
    outcome IN ('offer_accepted', 'rejected', 'withdrawn') OR outcome IS NULL
  )
);

CREATE INDEX IF NOT EXISTS idx_stage_events_job_occurred
  ON stage_events(job_id, occurred_at, event_seq);

CREATE TABLE IF NOT EXISTS post_application_messages (
  message_id TEXT PRIMARY KEY,
  provider TEXT NOT NULL,
  account_key TEXT NOT NULL,
  external_message_id TEXT NOT NULL,
  integration_id TEXT,
  sync_run_id TEXT,
  external_thread_id TEXT,
  from_address TEXT,
  from_domain TEXT,
  sender_name TEXT,
  subject TEXT,
  snippet TEXT,
  received_at INTEGER,
  classification_label TEXT,
  classification_confidence REAL,
  classification_payload TEXT,
  relevance_llm_score REAL,
  relevance_decision TEXT,
  matched_job_id TEXT REFERENCES jobs(job_id),
  match_confidence REAL,
  stage_target TEXT CHECK (
    stage_target IN (
      'applied', 'recruiter_screen', 'assessment', 'hiring_manager_screen',
      'technical_interview', 'onsite', 'offer', 'closed'
    ) OR stage_target IS NULL
  ),
  message_type TEXT CHECK (
    message_type IN ('interview', 'offer', 'rejection', 'update', 'other')
      OR message_type IS NULL
  ),
  stage_event_payload TEXT NOT NULL DEFAULT '{}',
  processing_status TEXT NOT NULL CHECK (
    processing_status IN ('pending_user', 'auto_linked', 'manual_linked', 'ignored')
  ),
  decided_at INTEGER,
  decided_by TEXT,
  first_seen_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(provider, account_key, external_message_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_account_status
  ON post_application_messages(provider, account_key, processing_status);
CREATE INDEX IF NOT EXISTS idx_messages_sync_run
  ON post_application_messages(sync_run_id);
";

const EVENT_COLUMNS: &str = "event_seq, event_id, job_id, title, group_id, from_stage, to_stage, \
     occurred_at, recorded_at, metadata_json, outcome";

const JOB_COLUMNS: &str =
    "job_id, company, role, status, outcome, applied_at, closed_at, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "message_id, provider, account_key, external_message_id, \
     integration_id, sync_run_id, external_thread_id, from_address, from_domain, sender_name, \
     subject, snippet, received_at, classification_label, classification_confidence, \
     classification_payload, relevance_llm_score, relevance_decision, matched_job_id, \
     match_confidence, stage_target, message_type, stage_event_payload, processing_status, \
     decided_at, decided_by, first_seen_at, updated_at";

pub struct SqliteLedgerStore {
    conn: Connection,
}

/// Result of a message upsert. `auto_link_transitioned` is the one-shot
/// transition signal: true exactly on the sync call that flipped the message
/// into `auto_linked`, false on every re-sync afterwards.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct MessageUpsert {
    pub message: PostApplicationMessage,
    pub was_created: bool,
    pub previous_status: Option<ProcessingStatus>,
    pub auto_link_transitioned: bool,
}

impl SqliteLedgerStore {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path).map_err(|err| {
            LedgerError::Internal(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|err| LedgerError::Internal(format!("failed to configure sqlite pragmas: {err}")))?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<(), LedgerError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .map_err(internal)?;

        self.conn.execute_batch(SCHEMA_LEDGER_V1).map_err(internal)?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, now],
            )
            .map_err(internal)?;

        Ok(())
    }

    pub fn create_job(&mut self, company: &str, role: &str) -> Result<JobRecord, LedgerError> {
        let job_id = JobId(Ulid::new());
        let created_at = now_utc();
        let stamp = format_rfc3339(created_at)?;

        self.conn
            .execute(
                "INSERT INTO jobs(job_id, company, role, status, outcome, applied_at, closed_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'discovered', NULL, NULL, NULL, ?4, ?4)",
                params![job_id.to_string(), company, role, stamp],
            )
            .map_err(internal)?;

        Ok(JobRecord {
            job_id,
            company: company.to_string(),
            role: role.to_string(),
            status: JobStatus::Discovered,
            outcome: None,
            applied_at: None,
            closed_at: None,
            created_at,
            updated_at: created_at,
        })
    }

    pub fn get_job(&self, job_id: JobId) -> Result<JobRecord, LedgerError> {
        load_job(&self.conn, job_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("job {job_id} does not exist")))
    }

    /// Appends a stage event and materializes the job projection inside one
    /// transaction.
    ///
    /// `from_stage` is resolved from the latest projectable (non-note) event,
    /// ties on `occurred_at` broken by insertion sequence. The projection is
    /// only rewritten when the new event is now the latest projectable event,
    /// so a backfilled historical event never clobbers the current status.
    pub fn transition(
        &mut self,
        job_id: JobId,
        request: &TransitionRequest,
    ) -> Result<StageEvent, LedgerError> {
        let metadata = match &request.metadata {
            Some(raw) => EventMetadata::from_value(raw)?,
            None => EventMetadata::default(),
        };

        let tx = self.conn.transaction().map_err(internal)?;

        let job = load_job(&tx, job_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("job {job_id} does not exist")))?;

        let latest = load_latest_projectable_event(&tx, job_id)?;
        let from_stage = latest.as_ref().map(|event| event.to_stage);
        let final_stage = match request.target {
            TransitionTarget::Stage(stage) => stage,
            TransitionTarget::NoChange => from_stage.unwrap_or(Stage::Applied),
        };

        let occurred_at = request.occurred_at.unwrap_or_else(now_ms);
        let recorded_at = now_utc();
        let event_id = EventId(Ulid::new());
        let title = metadata
            .event_label
            .clone()
            .unwrap_or_else(|| final_stage.as_str().to_string());
        let metadata_json = encode_json(&metadata)?;

        tx.execute(
            "INSERT INTO stage_events(
                event_id, job_id, title, group_id, from_stage, to_stage,
                occurred_at, recorded_at, metadata_json, outcome
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event_id.to_string(),
                job_id.to_string(),
                title,
                metadata.group_id,
                from_stage.map(Stage::as_str),
                final_stage.as_str(),
                occurred_at,
                format_rfc3339(recorded_at)?,
                metadata_json,
                request.outcome.map(StageOutcome::as_str),
            ],
        )
        .map_err(internal)?;
        let event_seq = tx.last_insert_rowid();

        if !metadata.is_note() {
            let is_new_latest = latest
                .as_ref()
                .map_or(true, |prev| occurred_at >= prev.occurred_at);
            if is_new_latest {
                let projection = resolve_projection(&ProjectionInput {
                    last_stage: final_stage,
                    occurred_at,
                    metadata: &metadata,
                    event_outcome: request.outcome,
                    current_outcome: job.outcome,
                    current_closed_at: job.closed_at,
                });
                let applied_at = if final_stage == Stage::Applied && job.applied_at.is_none() {
                    Some(now_ms())
                } else {
                    job.applied_at
                };
                store_projection(&tx, job_id, &projection, applied_at)?;
            }
        }

        tx.commit().map_err(internal)?;

        Ok(StageEvent {
            event_seq,
            event_id,
            job_id,
            title,
            group_id: metadata.group_id.clone(),
            from_stage,
            to_stage: final_stage,
            occurred_at,
            recorded_at,
            metadata,
            outcome: request.outcome,
        })
    }

    /// Applies a patch to an existing event, then recomputes the job
    /// projection only when the edited event is still the latest projectable
    /// event. Edits to historical events never retroactively change the
    /// job's current status.
    pub fn update_event(
        &mut self,
        event_id: EventId,
        patch: &StageEventPatch,
    ) -> Result<(), LedgerError> {
        let patched_metadata = match &patch.metadata {
            Some(raw) => Some(EventMetadata::from_value(raw)?),
            None => None,
        };

        let tx = self.conn.transaction().map_err(internal)?;

        let mut event = load_event(&tx, event_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("stage event {event_id} does not exist")))?;

        if let Some(metadata) = patched_metadata {
            event.group_id = metadata.group_id.clone();
            event.metadata = metadata;
        }
        if let Some(stage) = patch.to_stage {
            event.to_stage = stage;
        }
        if let Some(occurred_at) = patch.occurred_at {
            event.occurred_at = occurred_at;
        }
        match patch.outcome {
            Some(next_outcome) => event.outcome = next_outcome,
            None => {
                // A move to a non-closing stage without an explicit outcome
                // key is a reopen; the stale terminal marker must not survive.
                if patch.to_stage.is_some() && !event.to_stage.is_closing() {
                    event.outcome = None;
                }
            }
        }

        tx.execute(
            "UPDATE stage_events
             SET to_stage = ?2, occurred_at = ?3, metadata_json = ?4, group_id = ?5, outcome = ?6
             WHERE event_id = ?1",
            params![
                event_id.to_string(),
                event.to_stage.as_str(),
                event.occurred_at,
                encode_json(&event.metadata)?,
                event.group_id,
                event.outcome.map(StageOutcome::as_str),
            ],
        )
        .map_err(internal)?;

        if let Some(latest) = load_latest_projectable_event(&tx, event.job_id)? {
            if latest.event_id == event_id {
                let job = load_job(&tx, event.job_id)?.ok_or_else(|| {
                    LedgerError::NotFound(format!("job {} does not exist", event.job_id))
                })?;
                let projection = resolve_projection(&ProjectionInput {
                    last_stage: latest.to_stage,
                    occurred_at: latest.occurred_at,
                    metadata: &latest.metadata,
                    event_outcome: latest.outcome,
                    current_outcome: job.outcome,
                    current_closed_at: job.closed_at,
                });
                store_projection(&tx, event.job_id, &projection, job.applied_at)?;
            }
        }

        tx.commit().map_err(internal)
    }

    /// Deletes an event (no-op when missing) and recomputes the job from the
    /// new latest projectable event, or resets the job to its
    /// pre-application state when none remains.
    pub fn delete_event(&mut self, event_id: EventId) -> Result<(), LedgerError> {
        let tx = self.conn.transaction().map_err(internal)?;

        let Some(event) = load_event(&tx, event_id)? else {
            return tx.commit().map_err(internal);
        };

        tx.execute(
            "DELETE FROM stage_events WHERE event_id = ?1",
            params![event_id.to_string()],
        )
        .map_err(internal)?;

        match load_latest_projectable_event(&tx, event.job_id)? {
            Some(latest) => {
                let job = load_job(&tx, event.job_id)?.ok_or_else(|| {
                    LedgerError::NotFound(format!("job {} does not exist", event.job_id))
                })?;
                let projection = resolve_projection(&ProjectionInput {
                    last_stage: latest.to_stage,
                    occurred_at: latest.occurred_at,
                    metadata: &latest.metadata,
                    event_outcome: latest.outcome,
                    current_outcome: job.outcome,
                    current_closed_at: job.closed_at,
                });
                store_projection(&tx, event.job_id, &projection, job.applied_at)?;
            }
            None => reset_job(&tx, event.job_id)?,
        }

        tx.commit().map_err(internal)
    }

    pub fn list_events_for_job(
        &self,
        job_id: JobId,
        limit: Option<usize>,
    ) -> Result<Vec<StageEvent>, LedgerError> {
        let mut query = format!(
            "SELECT {EVENT_COLUMNS} FROM stage_events
             WHERE job_id = ?1
             ORDER BY occurred_at ASC, event_seq ASC"
        );
        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query).map_err(internal)?;
        let rows = stmt
            .query_map(params![job_id.to_string()], parse_event_row)
            .map_err(internal)?;
        collect_rows(rows)
    }

    /// Idempotent upsert keyed by `(provider, account_key,
    /// external_message_id)`. Content is refreshed unconditionally on every
    /// sighting; the lifecycle status and the matched job are frozen once the
    /// message has left `pending_user`, so routine re-syncs can never move a
    /// decided message.
    pub fn upsert_message(
        &mut self,
        key: &MessageKey,
        content: &MessageContent,
        proposed_status: ProcessingStatus,
        matched_job_id: Option<JobId>,
    ) -> Result<MessageUpsert, LedgerError> {
        let tx = self.conn.transaction().map_err(internal)?;

        let existing = load_message_by_key(&tx, key)?;
        let now = now_utc();
        let stamp = format_rfc3339(now)?;
        let payload = stamp_stage_target(content.stage_event_payload.as_ref(), content.stage_target);
        let payload_json = encode_json(&payload)?;
        let classification_json = content
            .classification_payload
            .as_ref()
            .map(encode_json)
            .transpose()?;

        let result = match existing {
            None => {
                let message_id = MessageId(Ulid::new());
                tx.execute(
                    "INSERT INTO post_application_messages(
                        message_id, provider, account_key, external_message_id,
                        integration_id, sync_run_id, external_thread_id,
                        from_address, from_domain, sender_name, subject, snippet, received_at,
                        classification_label, classification_confidence, classification_payload,
                        relevance_llm_score, relevance_decision, matched_job_id, match_confidence,
                        stage_target, message_type, stage_event_payload, processing_status,
                        decided_at, decided_by, first_seen_at, updated_at
                     ) VALUES (
                        ?1, ?2, ?3, ?4,
                        ?5, ?6, ?7,
                        ?8, ?9, ?10, ?11, ?12, ?13,
                        ?14, ?15, ?16,
                        ?17, ?18, ?19, ?20,
                        ?21, ?22, ?23, ?24,
                        NULL, NULL, ?25, ?25
                     )",
                    params![
                        message_id.to_string(),
                        key.provider,
                        key.account_key,
                        key.external_message_id,
                        content.integration_id,
                        content.sync_run_id,
                        content.external_thread_id,
                        content.from_address,
                        content.from_domain,
                        content.sender_name,
                        content.subject,
                        content.snippet,
                        content.received_at,
                        content.classification_label,
                        content.classification_confidence,
                        classification_json,
                        content.relevance_llm_score,
                        content.relevance_decision,
                        matched_job_id.map(|id| id.to_string()),
                        content.match_confidence,
                        content.stage_target.map(Stage::as_str),
                        content.message_type.map(MessageType::as_str),
                        payload_json,
                        proposed_status.as_str(),
                        stamp,
                    ],
                )
                .map_err(internal)?;

                let mut stored = content.clone();
                stored.stage_event_payload = Some(payload);
                MessageUpsert {
                    message: PostApplicationMessage {
                        message_id,
                        key: key.clone(),
                        content: stored,
                        matched_job_id,
                        processing_status: proposed_status,
                        decided_at: None,
                        decided_by: None,
                        first_seen_at: now,
                        updated_at: now,
                    },
                    was_created: true,
                    previous_status: None,
                    auto_link_transitioned: proposed_status == ProcessingStatus::AutoLinked,
                }
            }
            Some(existing) => {
                let previous_status = existing.processing_status;
                let next_status = if previous_status.is_terminal() {
                    previous_status
                } else {
                    proposed_status
                };
                let auto_link_transitioned = previous_status != ProcessingStatus::AutoLinked
                    && next_status == ProcessingStatus::AutoLinked;
                let next_matched_job_id = if previous_status.is_terminal() {
                    existing.matched_job_id
                } else {
                    matched_job_id
                };

                tx.execute(
                    "UPDATE post_application_messages SET
                        integration_id = ?2, sync_run_id = ?3, external_thread_id = ?4,
                        from_address = ?5, from_domain = ?6, sender_name = ?7,
                        subject = ?8, snippet = ?9, received_at = ?10,
                        classification_label = ?11, classification_confidence = ?12,
                        classification_payload = ?13, relevance_llm_score = ?14,
                        relevance_decision = ?15, match_confidence = ?16,
                        stage_target = ?17, message_type = ?18, stage_event_payload = ?19,
                        matched_job_id = ?20, processing_status = ?21, updated_at = ?22
                     WHERE message_id = ?1",
                    params![
                        existing.message_id.to_string(),
                        content.integration_id,
                        content.sync_run_id,
                        content.external_thread_id,
                        content.from_address,
                        content.from_domain,
                        content.sender_name,
                        content.subject,
                        content.snippet,
                        content.received_at,
                        content.classification_label,
                        content.classification_confidence,
                        classification_json,
                        content.relevance_llm_score,
                        content.relevance_decision,
                        content.match_confidence,
                        content.stage_target.map(Stage::as_str),
                        content.message_type.map(MessageType::as_str),
                        payload_json,
                        next_matched_job_id.map(|id| id.to_string()),
                        next_status.as_str(),
                        stamp,
                    ],
                )
                .map_err(internal)?;

                let mut stored = content.clone();
                stored.stage_event_payload = Some(payload);
                MessageUpsert {
                    message: PostApplicationMessage {
                        message_id: existing.message_id,
                        key: key.clone(),
                        content: stored,
                        matched_job_id: next_matched_job_id,
                        processing_status: next_status,
                        decided_at: existing.decided_at,
                        decided_by: existing.decided_by,
                        first_seen_at: existing.first_seen_at,
                        updated_at: now,
                    },
                    was_created: false,
                    previous_status: Some(previous_status),
                    auto_link_transitioned,
                }
            }
        };

        tx.commit().map_err(internal)?;
        Ok(result)
    }

    /// Records an explicit human decision. Always overrides the frozen
    /// terminal status; that freeze exists to protect decisions from
    /// automated regression, not from the user.
    pub fn record_decision(
        &mut self,
        message_id: MessageId,
        status: ProcessingStatus,
        matched_job_id: Option<JobId>,
        decided_at: Option<i64>,
        decided_by: Option<&str>,
    ) -> Result<PostApplicationMessage, LedgerError> {
        if !matches!(
            status,
            ProcessingStatus::ManualLinked | ProcessingStatus::Ignored
        ) {
            return Err(LedgerError::Invalid(format!(
                "decision status must be manual_linked or ignored, got {}",
                status.as_str()
            )));
        }

        let tx = self.conn.transaction().map_err(internal)?;

        let mut message = load_message(&tx, message_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("message {message_id} does not exist")))?;

        let decided_at = decided_at.unwrap_or_else(now_ms);
        let now = now_utc();

        tx.execute(
            "UPDATE post_application_messages SET
                processing_status = ?2, matched_job_id = ?3, decided_at = ?4,
                decided_by = ?5, updated_at = ?6
             WHERE message_id = ?1",
            params![
                message_id.to_string(),
                status.as_str(),
                matched_job_id.map(|id| id.to_string()),
                decided_at,
                decided_by,
                format_rfc3339(now)?,
            ],
        )
        .map_err(internal)?;

        tx.commit().map_err(internal)?;

        message.processing_status = status;
        message.matched_job_id = matched_job_id;
        message.decided_at = Some(decided_at);
        message.decided_by = decided_by.map(str::to_string);
        message.updated_at = now;
        Ok(message)
    }

    pub fn get_message(&self, message_id: MessageId) -> Result<PostApplicationMessage, LedgerError> {
        load_message(&self.conn, message_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("message {message_id} does not exist")))
    }

    pub fn list_messages_by_status(
        &self,
        provider: &str,
        account_key: &str,
        status: ProcessingStatus,
    ) -> Result<Vec<PostApplicationMessage>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM post_application_messages
                 WHERE provider = ?1 AND account_key = ?2 AND processing_status = ?3
                 ORDER BY received_at DESC, message_id ASC"
            ))
            .map_err(internal)?;

        let rows = stmt
            .query_map(params![provider, account_key, status.as_str()], parse_message_row)
            .map_err(internal)?;
        collect_rows(rows)
    }

    pub fn list_messages_for_sync_run(
        &self,
        sync_run_id: &str,
    ) -> Result<Vec<PostApplicationMessage>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM post_application_messages
                 WHERE sync_run_id = ?1
                 ORDER BY received_at DESC, message_id ASC"
            ))
            .map_err(internal)?;

        let rows = stmt
            .query_map(params![sync_run_id], parse_message_row)
            .map_err(internal)?;
        collect_rows(rows)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn load_job(conn: &Connection, job_id: JobId) -> Result<Option<JobRecord>, LedgerError> {
    let mut stmt = conn
        .prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"))
        .map_err(internal)?;

    stmt.query_row(params![job_id.to_string()], parse_job_row)
        .optional()
        .map_err(internal)
}

fn load_event(conn: &Connection, event_id: EventId) -> Result<Option<StageEvent>, LedgerError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM stage_events WHERE event_id = ?1"
        ))
        .map_err(internal)?;

    stmt.query_row(params![event_id.to_string()], parse_event_row)
        .optional()
        .map_err(internal)
}

/// Latest non-note event for a job. Note events participate in the timeline
/// but are invisible to projection and to the `from_stage` chain. Ties on
/// `occurred_at` resolve to the most recently inserted row.
fn load_latest_projectable_event(
    conn: &Connection,
    job_id: JobId,
) -> Result<Option<StageEvent>, LedgerError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM stage_events
             WHERE job_id = ?1
               AND (json_extract(metadata_json, '$.event_type') IS NULL
                    OR json_extract(metadata_json, '$.event_type') <> 'note')
             ORDER BY occurred_at DESC, event_seq DESC
             LIMIT 1"
        ))
        .map_err(internal)?;

    stmt.query_row(params![job_id.to_string()], parse_event_row)
        .optional()
        .map_err(internal)
}

fn store_projection(
    conn: &Connection,
    job_id: JobId,
    projection: &Projection,
    applied_at: Option<i64>,
) -> Result<(), LedgerError> {
    conn.execute(
        "UPDATE jobs
         SET status = ?2, outcome = ?3, applied_at = ?4, closed_at = ?5, updated_at = ?6
         WHERE job_id = ?1",
        params![
            job_id.to_string(),
            projection.status.as_str(),
            projection.outcome.map(StageOutcome::as_str),
            applied_at,
            projection.closed_at,
            format_rfc3339(now_utc())?,
        ],
    )
    .map_err(internal)?;
    Ok(())
}

fn reset_job(conn: &Connection, job_id: JobId) -> Result<(), LedgerError> {
    conn.execute(
        "UPDATE jobs
         SET status = 'discovered', outcome = NULL, applied_at = NULL, closed_at = NULL,
             updated_at = ?2
         WHERE job_id = ?1",
        params![job_id.to_string(), format_rfc3339(now_utc())?],
    )
    .map_err(internal)?;
    Ok(())
}

fn load_message_by_key(
    conn: &Connection,
    key: &MessageKey,
) -> Result<Option<PostApplicationMessage>, LedgerError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM post_application_messages
             WHERE provider = ?1 AND account_key = ?2 AND external_message_id = ?3"
        ))
        .map_err(internal)?;

    stmt.query_row(
        params![key.provider, key.account_key, key.external_message_id],
        parse_message_row,
    )
    .optional()
    .map_err(internal)
}

fn load_message(
    conn: &Connection,
    message_id: MessageId,
) -> Result<Option<PostApplicationMessage>, LedgerError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM post_application_messages WHERE message_id = ?1"
        ))
        .map_err(internal)?;

    stmt.query_row(params![message_id.to_string()], parse_message_row)
        .optional()
        .map_err(internal)
}

/// Merges the resolved stage target into the audit payload blob so every
/// stored message carries the target it would transition to.
fn stamp_stage_target(payload: Option<&Value>, stage_target: Option<Stage>) -> Value {
    let mut map = match payload {
        Some(Value::Object(existing)) => existing.clone(),
        _ => serde_json::Map::new(),
    };
    let target = match stage_target {
        Some(stage) => Value::String(stage.as_str().to_string()),
        None => Value::Null,
    };
    map.insert("stage_target".to_string(), target);
    Value::Object(map)
}

fn parse_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    let job_id_raw: String = row.get(0)?;
    let status_raw: String = row.get(3)?;
    let outcome_raw: Option<String> = row.get(4)?;

    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(3, format!("invalid job status: {status_raw}")))?;
    let outcome = outcome_raw
        .as_deref()
        .map(|raw| {
            StageOutcome::parse(raw)
                .ok_or_else(|| invalid_column(4, format!("invalid outcome: {raw}")))
        })
        .transpose()?;

    Ok(JobRecord {
        job_id: JobId(parse_ulid(0, &job_id_raw)?),
        company: row.get(1)?,
        role: row.get(2)?,
        status,
        outcome,
        applied_at: row.get(5)?,
        closed_at: row.get(6)?,
        created_at: parse_timestamp(7, &row.get::<_, String>(7)?)?,
        updated_at: parse_timestamp(8, &row.get::<_, String>(8)?)?,
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StageEvent> {
    let event_id_raw: String = row.get(1)?;
    let job_id_raw: String = row.get(2)?;
    let from_stage_raw: Option<String> = row.get(5)?;
    let to_stage_raw: String = row.get(6)?;
    let metadata_json: String = row.get(9)?;
    let outcome_raw: Option<String> = row.get(10)?;

    let from_stage = from_stage_raw
        .as_deref()
        .map(|raw| {
            Stage::parse(raw).ok_or_else(|| invalid_column(5, format!("invalid from_stage: {raw}")))
        })
        .transpose()?;
    let to_stage = Stage::parse(&to_stage_raw)
        .ok_or_else(|| invalid_column(6, format!("invalid to_stage: {to_stage_raw}")))?;
    let outcome = outcome_raw
        .as_deref()
        .map(|raw| {
            StageOutcome::parse(raw)
                .ok_or_else(|| invalid_column(10, format!("invalid outcome: {raw}")))
        })
        .transpose()?;
    let metadata: EventMetadata = serde_json::from_str(&metadata_json)
        .map_err(|err| invalid_column(9, format!("invalid metadata_json: {err}")))?;

    Ok(StageEvent {
        event_seq: row.get(0)?,
        event_id: EventId(parse_ulid(1, &event_id_raw)?),
        job_id: JobId(parse_ulid(2, &job_id_raw)?),
        title: row.get(3)?,
        group_id: row.get(4)?,
        from_stage,
        to_stage,
        occurred_at: row.get(7)?,
        recorded_at: parse_timestamp(8, &row.get::<_, String>(8)?)?,
        metadata,
        outcome,
    })
}

fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PostApplicationMessage> {
    let message_id_raw: String = row.get(0)?;
    let matched_job_raw: Option<String> = row.get(18)?;
    let stage_target_raw: Option<String> = row.get(20)?;
    let message_type_raw: Option<String> = row.get(21)?;
    let payload_json: String = row.get(22)?;
    let status_raw: String = row.get(23)?;
    let classification_json: Option<String> = row.get(15)?;

    let matched_job_id = matched_job_raw
        .as_deref()
        .map(|raw| parse_ulid(18, raw).map(JobId))
        .transpose()?;
    let stage_target = stage_target_raw
        .as_deref()
        .map(|raw| {
            Stage::parse(raw)
                .ok_or_else(|| invalid_column(20, format!("invalid stage_target: {raw}")))
        })
        .transpose()?;
    let message_type = message_type_raw
        .as_deref()
        .map(|raw| {
            MessageType::parse(raw)
                .ok_or_else(|| invalid_column(21, format!("invalid message_type: {raw}")))
        })
        .transpose()?;
    let processing_status = ProcessingStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(23, format!("invalid processing_status: {status_raw}")))?;
    let stage_event_payload: Value = serde_json::from_str(&payload_json)
        .map_err(|err| invalid_column(22, format!("invalid stage_event_payload: {err}")))?;
    let classification_payload = classification_json
        .as_deref()
        .map(|raw| {
            serde_json::from_str(raw)
                .map_err(|err| invalid_column(15, format!("invalid classification_payload: {err}")))
        })
        .transpose()?;

    Ok(PostApplicationMessage {
        message_id: MessageId(parse_ulid(0, &message_id_raw)?),
        key: MessageKey {
            provider: row.get(1)?,
            account_key: row.get(2)?,
            external_message_id: row.get(3)?,
        },
        content: MessageContent {
            integration_id: row.get(4)?,
            sync_run_id: row.get(5)?,
            external_thread_id: row.get(6)?,
            from_address: row.get(7)?,
            from_domain: row.get(8)?,
            sender_name: row.get(9)?,
            subject: row.get(10)?,
            snippet: row.get(11)?,
            received_at: row.get(12)?,
            classification_label: row.get(13)?,
            classification_confidence: row.get(14)?,
            classification_payload,
            relevance_llm_score: row.get(16)?,
            relevance_decision: row.get(17)?,
            match_confidence: row.get(19)?,
            stage_target,
            message_type,
            stage_event_payload: Some(stage_event_payload),
        },
        matched_job_id,
        processing_status,
        decided_at: row.get(24)?,
        decided_by: row.get(25)?,
        first_seen_at: parse_timestamp(26, &row.get::<_, String>(26)?)?,
        updated_at: parse_timestamp(27, &row.get::<_, String>(27)?)?,
    })
}

fn parse_ulid(index: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|_| invalid_column(index, format!("invalid ULID: {raw}")))
}

fn parse_timestamp(index: usize, raw: &str) -> rusqlite::Result<time::OffsetDateTime> {
    parse_rfc3339(raw).map_err(|err| invalid_column(index, err.to_string()))
}

fn invalid_column(index: usize, detail: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, detail)),
    )
}

fn internal(err: rusqlite::Error) -> LedgerError {
    LedgerError::Internal(err.to_string())
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, LedgerError> {
    serde_json::to_string(value)
        .map_err(|err| LedgerError::Internal(format!("failed to serialize JSON column: {err}")))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, LedgerError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(internal)?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines, clippy::float_cmp)]

    use super::*;
    use applytrack_ledger_core::EventKind;
    use proptest::prelude::*;
    use serde_json::json;

    fn must<T>(result: Result<T, LedgerError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteLedgerStore {
        let store = must(SqliteLedgerStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_job(store: &mut SqliteLedgerStore) -> JobId {
        must(store.create_job("Acme", "Platform Engineer")).job_id
    }

    fn stage_request(stage: Stage, occurred_at: i64) -> TransitionRequest {
        TransitionRequest {
            target: TransitionTarget::Stage(stage),
            occurred_at: Some(occurred_at),
            metadata: None,
            outcome: None,
        }
    }

    fn fixture_key(external_id: &str) -> MessageKey {
        MessageKey {
            provider: "gmail".to_string(),
            account_key: "primary".to_string(),
            external_message_id: external_id.to_string(),
        }
    }

    fn fixture_content(subject: &str) -> MessageContent {
        MessageContent {
            sync_run_id: Some("run-1".to_string()),
            from_address: Some("recruiter@acme.example".to_string()),
            from_domain: Some("acme.example".to_string()),
            subject: Some(subject.to_string()),
            received_at: Some(1_000),
            classification_label: Some("interview".to_string()),
            classification_confidence: Some(0.91),
            message_type: Some(MessageType::Interview),
            stage_target: Some(Stage::TechnicalInterview),
            ..MessageContent::default()
        }
    }

    #[test]
    fn transition_requires_existing_job() {
        let mut store = fixture_store();
        let missing = JobId(Ulid::new());
        let result = store.transition(missing, &stage_request(Stage::Applied, 100));
        assert!(matches!(result, Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn first_no_change_event_defaults_to_applied() {
        let mut store = fixture_store();
        let job_id = fixture_job(&mut store);

        let event = must(store.transition(
            job_id,
            &TransitionRequest {
                target: TransitionTarget::NoChange,
                occurred_at: Some(100),
                metadata: None,
                outcome: None,
            },
        ));
        assert_eq!(event.from_stage, None);
        assert_eq!(event.to_stage, Stage::Applied);
        assert_eq!(event.title, "applied");

        let job = must(store.get_job(job_id));
        assert_eq!(job.status, JobStatus::Applied);
        assert!(job.applied_at.is_some());
        assert_eq!(job.outcome, None);
        assert_eq!(job.closed_at, None);
    }

    #[test]
    fn applied_then_offer_then_closed_matches_resolver() {
        let mut store = fixture_store();
        let job_id = fixture_job(&mut store);

        must(store.transition(job_id, &stage_request(Stage::Applied, 100)));
        must(store.transition(job_id, &stage_request(Stage::Offer, 200)));

        let job = must(store.get_job(job_id));
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.outcome, Some(StageOutcome::OfferAccepted));
        assert_eq!(job.closed_at, None);

        must(store.transition(job_id, &stage_request(Stage::Closed, 300)));

        let job = must(store.get_job(job_id));
        assert_eq!(job.outcome, Some(StageOutcome::OfferAccepted));
        assert_eq!(job.closed_at, Some(300));
        assert_eq!(job.status, JobStatus::Closed);
    }

    #[test]
    fn note_events_are_invisible_to_projection() {
        let mut store = fixture_store();
        let job_id = fixture_job(&mut store);

        must(store.transition(job_id, &stage_request(Stage::Applied, 100)));
        let before = must(store.get_job(job_id));

        let note = must(store.transition(
            job_id,
            &TransitionRequest {
                target: TransitionTarget::NoChange,
                occurred_at: Some(200),
                metadata: Some(json!({"event_type": "note", "note": "left voicemail"})),
                outcome: None,
            },
        ));
        assert!(note.metadata.is_note());

        let after = must(store.get_job(job_id));
        assert_eq!(after.status, before.status);
        assert_eq!(after.outcome, before.outcome);
        assert_eq!(after.applied_at, before.applied_at);
        assert_eq!(after.closed_at, before.closed_at);

        let events = must(store.list_events_for_job(job_id, None));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn note_does_not_enter_from_stage_chain() {
        let mut store = fixture_store();
        let job_id = fixture_job(&mut store);

        must(store.transition(job_id, &stage_request(Stage::RecruiterScreen, 100)));
        must(store.transition(
            job_id,
            &TransitionRequest {
                target: TransitionTarget::Stage(Stage::Onsite),
                occurred_at: Some(200),
                metadata: Some(json!({"event_type": "note"})),
                outcome: None,
            },
        ));

        let next = must(store.transition(job_id, &stage_request(Stage::Offer, 300)));
        assert_eq!(next.from_stage, Some(Stage::RecruiterScreen));
    }

    #[test]
    fn invalid_metadata_is_rejected_before_insert() {
        let mut store = fixture_store();
        let job_id = fixture_job(&mut store);

        let result = store.transition(
            job_id,
            &TransitionRequest {
                target: TransitionTarget::Stage(Stage::Applied),
                occurred_at: Some(100),
                metadata: Some(json!({"surprise": true})),
                outcome: None,
            },
        );
        assert!(matches!(result, Err(LedgerError::Invalid(_))));
        assert!(must(store.list_events_for_job(job_id, None)).is_empty());
    }

    #[test]
    fn title_defaults_to_event_label_then_stage_name() {
        let mut store = fixture_store();
        let job_id = fixture_job(&mut store);

        let labeled = must(store.transition(
            job_id,
            &TransitionRequest {
                target: TransitionTarget::Stage(Stage::Onsite),
                occurred_at: Some(100),
                metadata: Some(json!({"event_label": "Final loop", "group_id": "loop-1"})),
                outcome: None,
            },
        ));
        assert_eq!(labeled.title, "Final loop");
        assert_eq!(labeled.group_id.as_deref(), Some("loop-1"));

        let bare = must(store.transition(job_id, &stage_request(Stage::Offer, 200)));
        assert_eq!(bare.title, "offer");
    }

    #[test]
    fn backfilled_event_does_not_clobber_projection() {
        let mut store = fixture_store();
        let job_id = fixture_job(&mut store);

        must(store.transition(job_id, &stage_request(Stage::Applied, 100)));
        must(store.transition(job_id, &stage_request(Stage::Offer, 200)));

        let backfill = must(store.transition(job_id, &stage_request(Stage::RecruiterScreen, 150)));
        // from_stage reflects the latest event at insert time, per the
        // ledger's read-then-append contract
        assert_eq!(backfill.from_stage, Some(Stage::Offer));

        let job = must(store.get_job(job_id));
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.outcome, Some(StageOutcome::OfferAccepted));
    }

    #[test]
    fn equal_timestamps_resolve_to_latest_insert() {
        let mut store = fixture_store();
        let job_id = fixture_job(&mut store);

        must(store.transition(job_id, &stage_request(Stage::Applied, 100)));
        must(store.transition(job_id, &stage_request(Stage::Closed, 100)));

        let job = must(store.get_job(job_id));
        assert_eq!(job.closed_at, Some(100));

        let next = must(store.transition(
            job_id,
            &TransitionRequest {
                target: TransitionTarget::NoChange,
                occurred_at: Some(100),
                metadata: None,
                outcome: None,
            },
        ));
        assert_eq!(next.from_stage, Some(Stage::Closed));
    }

    #[test]
    fn explicit_outcome_always_wins() {
        let mut store = fixture_store();
        let job_id = fixture_job(&mut store);

        must(store.transition(job_id, &stage_request(Stage::TechnicalInterview, 100)));
        must(store.transition(
            job_id,
            &TransitionRequest {
                target: TransitionTarget::NoChange,
                occurred_at: Some(200),
                metadata: None,
                outcome: Some(StageOutcome::Withdrawn),
            },
        ));

        let job = must(store.get_job(job_id));
        assert_eq!(job.outcome, Some(StageOutcome::Withdrawn));
        assert_eq!(job.closed_at, Some(200));
    }

    #[test]
    fn historical_edit_does_not_change_projection() {
        let mut store = fixture_store();
        let job_id = fixture_job(&mut store);

        let first = must(store.transition(job_id, &stage_request(Stage::Applied, 1)));
        must(store.transition(job_id, &stage_request(Stage::Offer, 2)));

        must(store.update_event(
            first.event_id,
            &StageEventPatch {
                to_stage: Some(Stage::Onsite),
                ..StageEventPatch::default()
            },
        ));

        let job = must(store.get_job(job_id));
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.outcome, Some(StageOutcome::OfferAccepted));

        let events = must(store.list_events_for_job(job_id, None));
        assert_eq!(events[0].to_stage, Stage::Onsite);
    }

    #[test]
    fn editing_latest_event_recomputes_and_clears_stale_outcome() {
        let mut store = fixture_store();
        let job_id = fixture_job(&mut store);

        must(store.transition(job_id, &stage_request(Stage::Applied, 100)));
        let closed = must(store.transition(
            job_id,
            &TransitionRequest {
                target: TransitionTarget::Stage(Stage::Closed),
                occurred_at: Some(200),
                metadata: Some(json!({"reason_code": "position_filled"})),
                outcome: None,
            },
        ));

        let job = must(store.get_job(job_id));
        assert_eq!(job.outcome, Some(StageOutcome::Rejected));
        assert_eq!(job.closed_at, Some(200));

        // reopen: move the closing event back to a non-closing stage
        must(store.update_event(
            closed.event_id,
            &StageEventPatch {
                to_stage: Some(Stage::TechnicalInterview),
                metadata: Some(json!({})),
                ..StageEventPatch::default()
            },
        ));

        let job = must(store.get_job(job_id));
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.outcome, None);
        assert_eq!(job.closed_at, None);
    }

    #[test]
    fn update_honors_zero_occurred_at() {
        let mut store = fixture_store();
        let job_id = fixture_job(&mut store);

        let event = must(store.transition(job_id, &stage_request(Stage::Applied, 500)));
        must(store.update_event(
            event.event_id,
            &StageEventPatch {
                occurred_at: Some(0),
                ..StageEventPatch::default()
            },
        ));

        let events = must(store.list_events_for_job(job_id, None));
        assert_eq!(events[0].occurred_at, 0);
    }

    #[test]
    fn explicit_outcome_key_clears_event_outcome() {
        let mut store = fixture_store();
        let job_id = fixture_job(&mut store);

        let event = must(store.transition(
            job_id,
            &TransitionRequest {
                target: TransitionTarget::Stage(Stage::Closed),
                occurred_at: Some(100),
                metadata: None,
                outcome: Some(StageOutcome::Withdrawn),
            },
        ));

        must(store.update_event(
            event.event_id,
            &StageEventPatch {
                outcome: Some(None),
                ..StageEventPatch::default()
            },
        ));

        let events = must(store.list_events_for_job(job_id, None));
        assert_eq!(events[0].outcome, None);

        // the job-level outcome survives via retention: the stage is still
        // closing and the prior record carried withdrawn
        let job = must(store.get_job(job_id));
        assert_eq!(job.outcome, Some(StageOutcome::Withdrawn));
        assert_eq!(job.closed_at, Some(100));
    }

    #[test]
    fn update_missing_event_is_not_found() {
        let mut store = fixture_store();
        let result = store.update_event(EventId(Ulid::new()), &StageEventPatch::default());
        assert!(matches!(result, Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn delete_only_event_resets_job() {
        let mut store = fixture_store();
        let job_id = fixture_job(&mut store);

        let event = must(store.transition(job_id, &stage_request(Stage::Applied, 100)));
        must(store.delete_event(event.event_id));

        let job = must(store.get_job(job_id));
        assert_eq!(job.status, JobStatus::Discovered);
        assert_eq!(job.applied_at, None);
        assert_eq!(job.outcome, None);
        assert_eq!(job.closed_at, None);
    }

    #[test]
    fn delete_recomputes_from_new_latest() {
        let mut store = fixture_store();
        let job_id = fixture_job(&mut store);

        must(store.transition(job_id, &stage_request(Stage::Applied, 100)));
        let offer = must(store.transition(job_id, &stage_request(Stage::Offer, 200)));

        must(store.delete_event(offer.event_id));

        let job = must(store.get_job(job_id));
        assert_eq!(job.status, JobStatus::Applied);
        assert_eq!(job.outcome, None);
        assert_eq!(job.closed_at, None);
        assert!(job.applied_at.is_some());
    }

    #[test]
    fn delete_missing_event_is_noop() {
        let mut store = fixture_store();
        must(store.delete_event(EventId(Ulid::new())));
    }

    #[test]
    fn auto_link_signal_fires_at_most_once() {
        let mut store = fixture_store();
        let key = fixture_key("msg-1");

        let first = must(store.upsert_message(
            &key,
            &fixture_content("Interview invite"),
            ProcessingStatus::AutoLinked,
            None,
        ));
        assert!(first.was_created);
        assert_eq!(first.previous_status, None);
        assert!(first.auto_link_transitioned);

        for round in 0..2 {
            let repeat = must(store.upsert_message(
                &key,
                &fixture_content("Interview invite (updated)"),
                ProcessingStatus::AutoLinked,
                None,
            ));
            assert!(!repeat.was_created, "round {round}");
            assert!(!repeat.auto_link_transitioned, "round {round}");
            assert_eq!(repeat.previous_status, Some(ProcessingStatus::AutoLinked));
            assert_eq!(repeat.message.processing_status, ProcessingStatus::AutoLinked);
        }
    }

    #[test]
    fn pending_message_flips_to_auto_linked_once() {
        let mut store = fixture_store();
        let key = fixture_key("msg-2");

        let first = must(store.upsert_message(
            &key,
            &fixture_content("Thanks for applying"),
            ProcessingStatus::PendingUser,
            None,
        ));
        assert!(!first.auto_link_transitioned);

        let second = must(store.upsert_message(
            &key,
            &fixture_content("Thanks for applying"),
            ProcessingStatus::AutoLinked,
            None,
        ));
        assert!(second.auto_link_transitioned);
        assert_eq!(second.previous_status, Some(ProcessingStatus::PendingUser));
    }

    #[test]
    fn terminal_status_freezes_against_resync() {
        let mut store = fixture_store();
        let job_id = fixture_job(&mut store);
        let other_job = fixture_job(&mut store);
        let key = fixture_key("msg-3");

        let created = must(store.upsert_message(
            &key,
            &fixture_content("Offer details"),
            ProcessingStatus::PendingUser,
            None,
        ));
        must(store.record_decision(
            created.message.message_id,
            ProcessingStatus::ManualLinked,
            Some(job_id),
            Some(5_000),
            Some("user"),
        ));

        let resync = must(store.upsert_message(
            &key,
            &fixture_content("Offer details (resync)"),
            ProcessingStatus::AutoLinked,
            Some(other_job),
        ));
        assert!(!resync.auto_link_transitioned);
        assert_eq!(resync.message.processing_status, ProcessingStatus::ManualLinked);
        assert_eq!(resync.message.matched_job_id, Some(job_id));
        // content is still refreshed for observability
        assert_eq!(
            resync.message.content.subject.as_deref(),
            Some("Offer details (resync)")
        );

        let stored = must(store.get_message(created.message.message_id));
        assert_eq!(stored.processing_status, ProcessingStatus::ManualLinked);
        assert_eq!(stored.matched_job_id, Some(job_id));
        assert_eq!(stored.decided_by.as_deref(), Some("user"));
        assert_eq!(stored.content.subject.as_deref(), Some("Offer details (resync)"));
    }

    #[test]
    fn stage_target_is_stamped_into_payload() {
        let mut store = fixture_store();
        let key = fixture_key("msg-4");
        let mut content = fixture_content("Interview invite");
        content.stage_event_payload = Some(json!({"matched_by": "domain"}));

        let result = must(store.upsert_message(&key, &content, ProcessingStatus::PendingUser, None));
        let payload = result
            .message
            .content
            .stage_event_payload
            .unwrap_or(Value::Null);
        assert_eq!(payload["stage_target"], json!("technical_interview"));
        assert_eq!(payload["matched_by"], json!("domain"));
    }

    #[test]
    fn record_decision_rejects_non_decision_status() {
        let mut store = fixture_store();
        let key = fixture_key("msg-5");
        let created = must(store.upsert_message(
            &key,
            &fixture_content("Update"),
            ProcessingStatus::PendingUser,
            None,
        ));

        let result = store.record_decision(
            created.message.message_id,
            ProcessingStatus::AutoLinked,
            None,
            None,
            None,
        );
        assert!(matches!(result, Err(LedgerError::Invalid(_))));

        let missing = store.record_decision(
            MessageId(Ulid::new()),
            ProcessingStatus::Ignored,
            None,
            None,
            None,
        );
        assert!(matches!(missing, Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn decision_overrides_previous_decision() {
        let mut store = fixture_store();
        let key = fixture_key("msg-6");
        let created = must(store.upsert_message(
            &key,
            &fixture_content("Rejection"),
            ProcessingStatus::AutoLinked,
            None,
        ));

        let decided = must(store.record_decision(
            created.message.message_id,
            ProcessingStatus::Ignored,
            None,
            Some(9_000),
            Some("user"),
        ));
        assert_eq!(decided.processing_status, ProcessingStatus::Ignored);
        assert_eq!(decided.decided_at, Some(9_000));
    }

    #[test]
    fn message_listings_filter_by_status_and_sync_run() {
        let mut store = fixture_store();

        let mut pending = fixture_content("one");
        pending.sync_run_id = Some("run-a".to_string());
        must(store.upsert_message(
            &fixture_key("m-1"),
            &pending,
            ProcessingStatus::PendingUser,
            None,
        ));

        let mut linked = fixture_content("two");
        linked.sync_run_id = Some("run-b".to_string());
        must(store.upsert_message(
            &fixture_key("m-2"),
            &linked,
            ProcessingStatus::AutoLinked,
            None,
        ));

        let pending_list = must(store.list_messages_by_status(
            "gmail",
            "primary",
            ProcessingStatus::PendingUser,
        ));
        assert_eq!(pending_list.len(), 1);
        assert_eq!(pending_list[0].key.external_message_id, "m-1");

        let run_b = must(store.list_messages_for_sync_run("run-b"));
        assert_eq!(run_b.len(), 1);
        assert_eq!(run_b[0].key.external_message_id, "m-2");
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());
        let count: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(count, 1);
    }

    fn stage_for_index(index: u8) -> Stage {
        match index % 8 {
            0 => Stage::Applied,
            1 => Stage::RecruiterScreen,
            2 => Stage::Assessment,
            3 => Stage::HiringManagerScreen,
            4 => Stage::TechnicalInterview,
            5 => Stage::Onsite,
            6 => Stage::Offer,
            _ => Stage::Closed,
        }
    }

    proptest! {
        // The projection must remain a pure function of the latest
        // projectable event, no matter the order transitions arrive in.
        #[test]
        fn projection_is_function_of_latest_event(
            sequence in prop::collection::vec((0u8..8, 0i64..10_000), 1..12)
        ) {
            let mut store = fixture_store();
            let job_id = fixture_job(&mut store);

            let metadata = EventMetadata::default();
            let mut latest_ts: Option<i64> = None;
            let mut expected_outcome: Option<StageOutcome> = None;
            let mut expected_closed_at: Option<i64> = None;
            let mut expected_status = JobStatus::Discovered;

            for (index, occurred_at) in sequence {
                let stage = stage_for_index(index);
                prop_assert!(store
                    .transition(job_id, &stage_request(stage, occurred_at))
                    .is_ok());

                if latest_ts.map_or(true, |ts| occurred_at >= ts) {
                    let projection = resolve_projection(&ProjectionInput {
                        last_stage: stage,
                        occurred_at,
                        metadata: &metadata,
                        event_outcome: None,
                        current_outcome: expected_outcome,
                        current_closed_at: expected_closed_at,
                    });
                    expected_outcome = projection.outcome;
                    expected_closed_at = projection.closed_at;
                    expected_status = projection.status;
                    latest_ts = Some(occurred_at);
                }
            }

            let job = store.get_job(job_id);
            prop_assert!(job.is_ok());
            if let Ok(job) = job {
                prop_assert_eq!(job.status, expected_status);
                prop_assert_eq!(job.outcome, expected_outcome);
                prop_assert_eq!(job.closed_at, expected_closed_at);
            }
        }
    }

    #[test]
    fn note_kind_round_trips_through_storage() {
        let mut store = fixture_store();
        let job_id = fixture_job(&mut store);

        must(store.transition(
            job_id,
            &TransitionRequest {
                target: TransitionTarget::NoChange,
                occurred_at: Some(100),
                metadata: Some(json!({"event_type": "interview_log", "actor": "panel"})),
                outcome: None,
            },
        ));

        let events = must(store.list_events_for_job(job_id, None));
        assert_eq!(events[0].metadata.kind(), EventKind::InterviewLog);
        assert_eq!(events[0].metadata.actor.as_deref(), Some("panel"));
    }
}
