//! Command surface for the application stage ledger.
//!
//! Host processes can embed the ledger through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command`] for direct [`Command`] execution against an open store.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use applytrack_ledger_core::{
    normalize_stage_label, resolve_stage_target, EventId, JobId, MessageContent, MessageId,
    MessageKey, MessageType, ProcessingStatus, Stage, StageEventPatch, StageOutcome,
    TransitionRequest, TransitionTarget,
};
use applytrack_ledger_store_sqlite::SqliteLedgerStore;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "applytrack")]
#[command(about = "Application stage ledger CLI")]
pub struct Cli {
    #[arg(long, default_value = "./applytrack.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Job {
        #[command(subcommand)]
        command: Box<JobCommand>,
    },
    Stage {
        #[command(subcommand)]
        command: Box<StageCommand>,
    },
    Message {
        #[command(subcommand)]
        command: Box<MessageCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum JobCommand {
    Create(JobCreateArgs),
    Show(JobShowArgs),
}

#[derive(Debug, Args)]
pub struct JobCreateArgs {
    #[arg(long)]
    company: String,
    #[arg(long)]
    role: String,
}

#[derive(Debug, Args)]
pub struct JobShowArgs {
    #[arg(long)]
    job_id: String,
}

#[derive(Debug, Subcommand)]
pub enum StageCommand {
    Transition(TransitionArgs),
    Update(UpdateEventArgs),
    Delete(DeleteEventArgs),
    List(EventsListArgs),
}

#[derive(Debug, Args)]
pub struct TransitionArgs {
    #[arg(long)]
    job_id: String,
    /// Target stage, or `no_change` to log an event without moving the job.
    #[arg(long)]
    to: String,
    /// Epoch milliseconds; defaults to now.
    #[arg(long)]
    occurred_at: Option<i64>,
    #[arg(long, default_value = "{}")]
    metadata_json: String,
    #[arg(long)]
    outcome: Option<OutcomeArg>,
}

#[derive(Debug, Args)]
pub struct UpdateEventArgs {
    #[arg(long)]
    event_id: String,
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    occurred_at: Option<i64>,
    #[arg(long)]
    metadata_json: Option<String>,
    #[arg(long, conflicts_with = "clear_outcome")]
    outcome: Option<OutcomeArg>,
    #[arg(long)]
    clear_outcome: bool,
}

#[derive(Debug, Args)]
pub struct DeleteEventArgs {
    #[arg(long)]
    event_id: String,
}

#[derive(Debug, Args)]
pub struct EventsListArgs {
    #[arg(long)]
    job_id: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum MessageCommand {
    Upsert(MessageUpsertArgs),
    Decide(DecideArgs),
    Show(MessageShowArgs),
    List(MessageListArgs),
    SyncRun(SyncRunArgs),
}

#[derive(Debug, Args)]
pub struct MessageUpsertArgs {
    #[arg(long)]
    provider: String,
    #[arg(long)]
    account_key: String,
    #[arg(long)]
    external_message_id: String,
    #[arg(long, default_value = "pending-user")]
    status: StatusArg,
    #[arg(long)]
    matched_job_id: Option<String>,
    #[arg(long)]
    integration_id: Option<String>,
    #[arg(long)]
    sync_run_id: Option<String>,
    #[arg(long)]
    external_thread_id: Option<String>,
    #[arg(long)]
    from_address: Option<String>,
    #[arg(long)]
    from_domain: Option<String>,
    #[arg(long)]
    sender_name: Option<String>,
    #[arg(long)]
    subject: Option<String>,
    #[arg(long)]
    snippet: Option<String>,
    /// Epoch milliseconds.
    #[arg(long)]
    received_at: Option<i64>,
    /// Raw classifier stage label; normalized onto the stage vocabulary.
    #[arg(long)]
    stage_label: Option<String>,
    #[arg(long)]
    message_type: Option<MessageTypeArg>,
    #[arg(long)]
    classification_label: Option<String>,
    #[arg(long)]
    classification_confidence: Option<f64>,
    #[arg(long)]
    classification_payload_json: Option<String>,
    #[arg(long)]
    relevance_llm_score: Option<f64>,
    #[arg(long)]
    relevance_decision: Option<String>,
    #[arg(long)]
    match_confidence: Option<f64>,
    #[arg(long)]
    stage_event_payload_json: Option<String>,
}

#[derive(Debug, Args)]
pub struct DecideArgs {
    #[arg(long)]
    message_id: String,
    #[arg(long)]
    status: DecisionArg,
    #[arg(long)]
    matched_job_id: Option<String>,
    /// Epoch milliseconds; defaults to now.
    #[arg(long)]
    decided_at: Option<i64>,
    #[arg(long)]
    decided_by: Option<String>,
}

#[derive(Debug, Args)]
pub struct MessageShowArgs {
    #[arg(long)]
    message_id: String,
}

#[derive(Debug, Args)]
pub struct MessageListArgs {
    #[arg(long)]
    provider: String,
    #[arg(long)]
    account_key: String,
    #[arg(long, default_value = "pending-user")]
    status: StatusArg,
}

#[derive(Debug, Args)]
pub struct SyncRunArgs {
    #[arg(long)]
    sync_run_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutcomeArg {
    OfferAccepted,
    Rejected,
    Withdrawn,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    PendingUser,
    AutoLinked,
    ManualLinked,
    Ignored,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DecisionArg {
    ManualLinked,
    Ignored,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MessageTypeArg {
    Interview,
    Offer,
    Rejection,
    Update,
    Other,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteLedgerStore::open(&cli.db)?;
    store.migrate()?;
    run_command(cli.command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when argument parsing or the requested operation fails.
pub fn run_command(command: Command, store: &mut SqliteLedgerStore) -> Result<()> {
    match command {
        Command::Job { command } => run_job(*command, store),
        Command::Stage { command } => run_stage(*command, store),
        Command::Message { command } => run_message(*command, store),
    }
}

fn run_job(command: JobCommand, store: &mut SqliteLedgerStore) -> Result<()> {
    match command {
        JobCommand::Create(args) => {
            let job = store.create_job(&args.company, &args.role)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        JobCommand::Show(args) => {
            let job = store.get_job(parse_job_id(&args.job_id)?)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
    }
}

fn run_stage(command: StageCommand, store: &mut SqliteLedgerStore) -> Result<()> {
    match command {
        StageCommand::Transition(args) => {
            let request = TransitionRequest {
                target: parse_target(&args.to)?,
                occurred_at: args.occurred_at,
                metadata: Some(parse_payload_json(&args.metadata_json)?),
                outcome: args.outcome.map(map_outcome),
            };
            let event = store.transition(parse_job_id(&args.job_id)?, &request)?;
            println!("{}", serde_json::to_string_pretty(&event)?);
            Ok(())
        }
        StageCommand::Update(args) => {
            let event_id = parse_event_id(&args.event_id)?;
            let patch = StageEventPatch {
                to_stage: args.to.as_deref().map(parse_stage).transpose()?,
                occurred_at: args.occurred_at,
                metadata: args
                    .metadata_json
                    .as_deref()
                    .map(parse_payload_json)
                    .transpose()?,
                outcome: if args.clear_outcome {
                    Some(None)
                } else {
                    args.outcome.map(|value| Some(map_outcome(value)))
                },
            };
            store.update_event(event_id, &patch)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "event_id": event_id.to_string(),
                    "updated": true,
                }))?
            );
            Ok(())
        }
        StageCommand::Delete(args) => {
            let event_id = parse_event_id(&args.event_id)?;
            store.delete_event(event_id)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "event_id": event_id.to_string(),
                    "deleted": true,
                }))?
            );
            Ok(())
        }
        StageCommand::List(args) => {
            let events = store.list_events_for_job(parse_job_id(&args.job_id)?, args.limit)?;
            println!("{}", serde_json::to_string_pretty(&events)?);
            Ok(())
        }
    }
}

fn run_message(command: MessageCommand, store: &mut SqliteLedgerStore) -> Result<()> {
    match command {
        MessageCommand::Upsert(args) => {
            let key = MessageKey {
                provider: args.provider.clone(),
                account_key: args.account_key.clone(),
                external_message_id: args.external_message_id.clone(),
            };
            let matched_job_id = args
                .matched_job_id
                .as_deref()
                .map(parse_job_id)
                .transpose()?;
            let content = build_message_content(&args)?;
            let result = store.upsert_message(&key, &content, map_status(args.status), matched_job_id)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        MessageCommand::Decide(args) => {
            let message = store.record_decision(
                parse_message_id(&args.message_id)?,
                match args.status {
                    DecisionArg::ManualLinked => ProcessingStatus::ManualLinked,
                    DecisionArg::Ignored => ProcessingStatus::Ignored,
                },
                args.matched_job_id.as_deref().map(parse_job_id).transpose()?,
                args.decided_at,
                args.decided_by.as_deref(),
            )?;
            println!("{}", serde_json::to_string_pretty(&message)?);
            Ok(())
        }
        MessageCommand::Show(args) => {
            let message = store.get_message(parse_message_id(&args.message_id)?)?;
            println!("{}", serde_json::to_string_pretty(&message)?);
            Ok(())
        }
        MessageCommand::List(args) => {
            let messages = store.list_messages_by_status(
                &args.provider,
                &args.account_key,
                map_status(args.status),
            )?;
            println!("{}", serde_json::to_string_pretty(&messages)?);
            Ok(())
        }
        MessageCommand::SyncRun(args) => {
            let messages = store.list_messages_for_sync_run(&args.sync_run_id)?;
            println!("{}", serde_json::to_string_pretty(&messages)?);
            Ok(())
        }
    }
}

fn build_message_content(args: &MessageUpsertArgs) -> Result<MessageContent> {
    let message_type = args.message_type.map(map_message_type);
    let stage_target = match message_type {
        Some(message_type) => resolve_stage_target(args.stage_label.as_deref(), message_type),
        None => args.stage_label.as_deref().and_then(normalize_stage_label),
    };

    Ok(MessageContent {
        integration_id: args.integration_id.clone(),
        sync_run_id: args.sync_run_id.clone(),
        external_thread_id: args.external_thread_id.clone(),
        from_address: args.from_address.clone(),
        from_domain: args.from_domain.clone(),
        sender_name: args.sender_name.clone(),
        subject: args.subject.clone(),
        snippet: args.snippet.clone(),
        received_at: args.received_at,
        classification_label: args.classification_label.clone(),
        classification_confidence: args.classification_confidence,
        classification_payload: args
            .classification_payload_json
            .as_deref()
            .map(parse_payload_json)
            .transpose()?,
        relevance_llm_score: args.relevance_llm_score,
        relevance_decision: args.relevance_decision.clone(),
        match_confidence: args.match_confidence,
        stage_target,
        message_type,
        stage_event_payload: args
            .stage_event_payload_json
            .as_deref()
            .map(parse_payload_json)
            .transpose()?,
    })
}

fn parse_payload_json(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).with_context(|| format!("payload must be valid JSON: {raw}"))
}

fn parse_target(raw: &str) -> Result<TransitionTarget> {
    TransitionTarget::parse(raw)
        .or_else(|| normalize_stage_label(raw).map(TransitionTarget::Stage))
        .ok_or_else(|| anyhow!("unknown stage target: {raw}"))
}

fn parse_stage(raw: &str) -> Result<Stage> {
    Stage::parse(raw)
        .or_else(|| normalize_stage_label(raw))
        .ok_or_else(|| anyhow!("unknown stage: {raw}"))
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(JobId(parsed))
}

fn parse_event_id(raw: &str) -> Result<EventId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(EventId(parsed))
}

fn parse_message_id(raw: &str) -> Result<MessageId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(MessageId(parsed))
}

fn map_outcome(value: OutcomeArg) -> StageOutcome {
    match value {
        OutcomeArg::OfferAccepted => StageOutcome::OfferAccepted,
        OutcomeArg::Rejected => StageOutcome::Rejected,
        OutcomeArg::Withdrawn => StageOutcome::Withdrawn,
    }
}

fn map_status(value: StatusArg) -> ProcessingStatus {
    match value {
        StatusArg::PendingUser => ProcessingStatus::PendingUser,
        StatusArg::AutoLinked => ProcessingStatus::AutoLinked,
        StatusArg::ManualLinked => ProcessingStatus::ManualLinked,
        StatusArg::Ignored => ProcessingStatus::Ignored,
    }
}

fn map_message_type(value: MessageTypeArg) -> MessageType {
    match value {
        MessageTypeArg::Interview => MessageType::Interview,
        MessageTypeArg::Offer => MessageType::Offer,
        MessageTypeArg::Rejection => MessageType::Rejection,
        MessageTypeArg::Update => MessageType::Update,
        MessageTypeArg::Other => MessageType::Other,
    }
}
