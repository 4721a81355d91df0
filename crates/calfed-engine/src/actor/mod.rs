//! The per-user actor.
//!
//! One logically single-threaded task owns one user's store. Every
//! externally callable operation arrives as a typed command with a
//! deadline and runs to completion in arrival order, so any sequence of
//! operations on one user is serializable. Provider I/O happens in the
//! writer pool; the only awaits inside an operation are the scheduling
//! hold reservations, which are invisible to other callers because the
//! mailbox is not polled meanwhile.
//!
//! A sweeper interval inside the actor expires holds, settles sessions,
//! and re-enqueues due mirror retries.

pub mod registry;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use calfed_core::analytics::{
    ContextSwitch, DailyLoad, DayRisk, DeepWorkWindow, DriftEntry, OutcomeKind,
    ReconnectionSuggestion, ReputationSummary, SlotProbability,
};
use calfed_core::config::EngineConfig;
use calfed_core::constraint::{Constraint, ConstraintKind};
use calfed_core::error::{EngineError, EngineResult};
use calfed_core::event::{DeltaSummary, EventSource, ProviderDelta};
use calfed_core::ids::{AccountId, ConstraintId, EventId, MilestoneId, MirrorId, RelationshipId, SessionId};
use serde::{Deserialize, Serialize};

use crate::analytics::{self, EventBriefing};
use crate::availability::{self, AvailabilityReport};
use crate::constraints;
use crate::journal::{self, JournalEntry};
use crate::mirror::{self, MirrorWriteOutcome, MirrorWriteTicket};
use crate::provider::ProviderWriteAdapter;
use crate::queue::{JobSink, MirrorJob};
use crate::relationships::{
    self, LedgerEntry, Milestone, NewMilestone, NewRelationship, Relationship, RelationshipUpdate,
    TimelineEntry, UpcomingMilestone,
};
use crate::scheduling::{self, CommitOutcome, ProposeRequest, SessionView};
use crate::snapshot::{self, HealthReport, SimulationSnapshot};
use crate::store::Store;

/// Result of one sweeper pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired_holds: u32,
    pub expired_sessions: u32,
    pub mirror_retries_enqueued: u32,
}

type Reply<T> = oneshot::Sender<EngineResult<T>>;

enum UserCommand {
    ApplyProviderDelta {
        origin_account: AccountId,
        deltas: Vec<ProviderDelta>,
        reply: Reply<DeltaSummary>,
    },
    ImportIcsEvents {
        account: AccountId,
        deltas: Vec<ProviderDelta>,
        reply: Reply<DeltaSummary>,
    },
    CreateConstraint {
        kind: ConstraintKind,
        config: serde_json::Value,
        active_from: Option<DateTime<Utc>>,
        active_to: Option<DateTime<Utc>>,
        reply: Reply<Constraint>,
    },
    UpdateConstraint {
        constraint_id: ConstraintId,
        config: serde_json::Value,
        active_from: Option<DateTime<Utc>>,
        active_to: Option<DateTime<Utc>>,
        reply: Reply<Constraint>,
    },
    DeleteConstraint {
        constraint_id: ConstraintId,
        reply: Reply<()>,
    },
    ListConstraints {
        kind: Option<ConstraintKind>,
        reply: Reply<Vec<Constraint>>,
    },
    GetJournal {
        canonical_event_id: EventId,
        reply: Reply<Vec<JournalEntry>>,
    },
    CreateRelationship {
        input: NewRelationship,
        reply: Reply<Relationship>,
    },
    UpdateRelationship {
        relationship_id: RelationshipId,
        patch: RelationshipUpdate,
        reply: Reply<Relationship>,
    },
    DeleteRelationship {
        relationship_id: RelationshipId,
        reply: Reply<()>,
    },
    GetRelationship {
        relationship_id: RelationshipId,
        reply: Reply<Relationship>,
    },
    ListRelationships {
        reply: Reply<Vec<Relationship>>,
    },
    MarkOutcome {
        relationship_id: RelationshipId,
        outcome: OutcomeKind,
        note: Option<String>,
        reply: Reply<LedgerEntry>,
    },
    ListOutcomes {
        relationship_id: RelationshipId,
        reply: Reply<Vec<LedgerEntry>>,
    },
    GetTimeline {
        relationship_id: RelationshipId,
        reply: Reply<Vec<TimelineEntry>>,
    },
    GetReputation {
        relationship_id: RelationshipId,
        reply: Reply<ReputationSummary>,
    },
    GetDriftReport {
        reply: Reply<Vec<DriftEntry>>,
    },
    GetReconnectionSuggestions {
        city: Option<String>,
        trip_id: Option<ConstraintId>,
        reply: Reply<Vec<ReconnectionSuggestion>>,
    },
    CreateMilestone {
        input: NewMilestone,
        reply: Reply<Milestone>,
    },
    DeleteMilestone {
        milestone_id: MilestoneId,
        reply: Reply<()>,
    },
    ListMilestones {
        reply: Reply<Vec<Milestone>>,
    },
    ListUpcomingMilestones {
        max_days: u32,
        reply: Reply<Vec<UpcomingMilestone>>,
    },
    ProposeTimes {
        request: ProposeRequest,
        reply: Reply<SessionView>,
    },
    SelectCandidate {
        session_id: SessionId,
        candidate_id: String,
        reply: Reply<SessionView>,
    },
    CommitCandidate {
        session_id: SessionId,
        candidate_id: Option<String>,
        reply: Reply<CommitOutcome>,
    },
    CancelSession {
        session_id: SessionId,
        reply: Reply<SessionView>,
    },
    ListSessions {
        reply: Reply<Vec<SessionView>>,
    },
    RunSweep {
        reply: Reply<SweepReport>,
    },
    ComputeAvailability {
        range_start: String,
        range_end: String,
        accounts: Option<Vec<AccountId>>,
        reply: Reply<AvailabilityReport>,
    },
    GetCognitiveLoad {
        range_start: String,
        range_end: String,
        reply: Reply<Vec<DailyLoad>>,
    },
    GetContextSwitches {
        range_start: String,
        range_end: String,
        reply: Reply<Vec<ContextSwitch>>,
    },
    GetDeepWork {
        range_start: String,
        range_end: String,
        reply: Reply<Vec<DeepWorkWindow>>,
    },
    GetRiskScores {
        range_start: String,
        range_end: String,
        reply: Reply<Vec<DayRisk>>,
    },
    GetProbabilisticAvailability {
        weeks_back: u32,
        reply: Reply<Vec<SlotProbability>>,
    },
    GetEventBriefing {
        canonical_event_id: EventId,
        reply: Reply<EventBriefing>,
    },
    GetHealthReport {
        reply: Reply<HealthReport>,
    },
    RetryFailedMirror {
        mirror_id: MirrorId,
        reply: Reply<()>,
    },
    BuildSimulationSnapshot {
        reply: Reply<SimulationSnapshot>,
    },
    BeginMirrorWrite {
        job: MirrorJob,
        reply: Reply<Option<MirrorWriteTicket>>,
    },
    CompleteMirrorWrite {
        mirror_id: MirrorId,
        outcome: MirrorWriteOutcome,
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

struct Envelope {
    deadline: Instant,
    command: UserCommand,
}

/// Cloneable handle to one user actor. Every method sends a command with
/// the configured per-operation deadline and awaits the typed reply.
#[derive(Clone)]
pub struct UserActorHandle {
    user_id: String,
    tx: mpsc::Sender<Envelope>,
    op_timeout: std::time::Duration,
}

macro_rules! call {
    ($self:expr, $command:ident { $($field:ident : $value:expr),* $(,)? }) => {{
        let (reply, rx) = oneshot::channel();
        let envelope = Envelope {
            deadline: Instant::now() + $self.op_timeout,
            command: UserCommand::$command { $($field: $value,)* reply },
        };
        $self
            .tx
            .send(envelope)
            .await
            .map_err(|_| EngineError::transient("user actor is not running"))?;
        rx.await
            .map_err(|_| EngineError::transient("user actor dropped the operation"))?
    }};
}

impl UserActorHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn apply_provider_delta(
        &self,
        origin_account: AccountId,
        deltas: Vec<ProviderDelta>,
    ) -> EngineResult<DeltaSummary> {
        call!(self, ApplyProviderDelta { origin_account: origin_account, deltas: deltas })
    }

    /// ICS feed batches ride the same pipeline with `source = ics`.
    pub async fn import_ics_events(
        &self,
        account: AccountId,
        deltas: Vec<ProviderDelta>,
    ) -> EngineResult<DeltaSummary> {
        call!(self, ImportIcsEvents { account: account, deltas: deltas })
    }

    pub async fn create_constraint(
        &self,
        kind: ConstraintKind,
        config: serde_json::Value,
        active_from: Option<DateTime<Utc>>,
        active_to: Option<DateTime<Utc>>,
    ) -> EngineResult<Constraint> {
        call!(self, CreateConstraint {
            kind: kind,
            config: config,
            active_from: active_from,
            active_to: active_to,
        })
    }

    pub async fn update_constraint(
        &self,
        constraint_id: ConstraintId,
        config: serde_json::Value,
        active_from: Option<DateTime<Utc>>,
        active_to: Option<DateTime<Utc>>,
    ) -> EngineResult<Constraint> {
        call!(self, UpdateConstraint {
            constraint_id: constraint_id,
            config: config,
            active_from: active_from,
            active_to: active_to,
        })
    }

    pub async fn delete_constraint(&self, constraint_id: ConstraintId) -> EngineResult<()> {
        call!(self, DeleteConstraint { constraint_id: constraint_id })
    }

    pub async fn list_constraints(
        &self,
        kind: Option<ConstraintKind>,
    ) -> EngineResult<Vec<Constraint>> {
        call!(self, ListConstraints { kind: kind })
    }

    pub async fn get_journal(
        &self,
        canonical_event_id: EventId,
    ) -> EngineResult<Vec<JournalEntry>> {
        call!(self, GetJournal { canonical_event_id: canonical_event_id })
    }

    pub async fn create_relationship(
        &self,
        input: NewRelationship,
    ) -> EngineResult<Relationship> {
        call!(self, CreateRelationship { input: input })
    }

    pub async fn update_relationship(
        &self,
        relationship_id: RelationshipId,
        patch: RelationshipUpdate,
    ) -> EngineResult<Relationship> {
        call!(self, UpdateRelationship { relationship_id: relationship_id, patch: patch })
    }

    pub async fn delete_relationship(
        &self,
        relationship_id: RelationshipId,
    ) -> EngineResult<()> {
        call!(self, DeleteRelationship { relationship_id: relationship_id })
    }

    pub async fn get_relationship(
        &self,
        relationship_id: RelationshipId,
    ) -> EngineResult<Relationship> {
        call!(self, GetRelationship { relationship_id: relationship_id })
    }

    pub async fn list_relationships(&self) -> EngineResult<Vec<Relationship>> {
        call!(self, ListRelationships {})
    }

    pub async fn mark_outcome(
        &self,
        relationship_id: RelationshipId,
        outcome: OutcomeKind,
        note: Option<String>,
    ) -> EngineResult<LedgerEntry> {
        call!(self, MarkOutcome { relationship_id: relationship_id, outcome: outcome, note: note })
    }

    pub async fn list_outcomes(
        &self,
        relationship_id: RelationshipId,
    ) -> EngineResult<Vec<LedgerEntry>> {
        call!(self, ListOutcomes { relationship_id: relationship_id })
    }

    pub async fn get_timeline(
        &self,
        relationship_id: RelationshipId,
    ) -> EngineResult<Vec<TimelineEntry>> {
        call!(self, GetTimeline { relationship_id: relationship_id })
    }

    pub async fn get_reputation(
        &self,
        relationship_id: RelationshipId,
    ) -> EngineResult<ReputationSummary> {
        call!(self, GetReputation { relationship_id: relationship_id })
    }

    pub async fn get_drift_report(&self) -> EngineResult<Vec<DriftEntry>> {
        call!(self, GetDriftReport {})
    }

    pub async fn get_reconnection_suggestions(
        &self,
        city: Option<String>,
        trip_id: Option<ConstraintId>,
    ) -> EngineResult<Vec<ReconnectionSuggestion>> {
        call!(self, GetReconnectionSuggestions { city: city, trip_id: trip_id })
    }

    pub async fn create_milestone(&self, input: NewMilestone) -> EngineResult<Milestone> {
        call!(self, CreateMilestone { input: input })
    }

    pub async fn delete_milestone(&self, milestone_id: MilestoneId) -> EngineResult<()> {
        call!(self, DeleteMilestone { milestone_id: milestone_id })
    }

    pub async fn list_milestones(&self) -> EngineResult<Vec<Milestone>> {
        call!(self, ListMilestones {})
    }

    pub async fn list_upcoming_milestones(
        &self,
        max_days: u32,
    ) -> EngineResult<Vec<UpcomingMilestone>> {
        call!(self, ListUpcomingMilestones { max_days: max_days })
    }

    pub async fn propose_times(&self, request: ProposeRequest) -> EngineResult<SessionView> {
        call!(self, ProposeTimes { request: request })
    }

    pub async fn select_candidate(
        &self,
        session_id: SessionId,
        candidate_id: String,
    ) -> EngineResult<SessionView> {
        call!(self, SelectCandidate { session_id: session_id, candidate_id: candidate_id })
    }

    pub async fn commit_candidate(
        &self,
        session_id: SessionId,
        candidate_id: Option<String>,
    ) -> EngineResult<CommitOutcome> {
        call!(self, CommitCandidate { session_id: session_id, candidate_id: candidate_id })
    }

    pub async fn cancel_session(&self, session_id: SessionId) -> EngineResult<SessionView> {
        call!(self, CancelSession { session_id: session_id })
    }

    pub async fn list_scheduling_sessions(&self) -> EngineResult<Vec<SessionView>> {
        call!(self, ListSessions {})
    }

    /// Manually trigger the sweeper (the interval inside the actor runs
    /// it on its own cadence).
    pub async fn run_sweep(&self) -> EngineResult<SweepReport> {
        call!(self, RunSweep {})
    }

    pub async fn compute_availability(
        &self,
        range_start: impl Into<String>,
        range_end: impl Into<String>,
        accounts: Option<Vec<AccountId>>,
    ) -> EngineResult<AvailabilityReport> {
        call!(self, ComputeAvailability {
            range_start: range_start.into(),
            range_end: range_end.into(),
            accounts: accounts,
        })
    }

    pub async fn get_cognitive_load(
        &self,
        range_start: impl Into<String>,
        range_end: impl Into<String>,
    ) -> EngineResult<Vec<DailyLoad>> {
        call!(self, GetCognitiveLoad { range_start: range_start.into(), range_end: range_end.into() })
    }

    pub async fn get_context_switches(
        &self,
        range_start: impl Into<String>,
        range_end: impl Into<String>,
    ) -> EngineResult<Vec<ContextSwitch>> {
        call!(self, GetContextSwitches { range_start: range_start.into(), range_end: range_end.into() })
    }

    pub async fn get_deep_work(
        &self,
        range_start: impl Into<String>,
        range_end: impl Into<String>,
    ) -> EngineResult<Vec<DeepWorkWindow>> {
        call!(self, GetDeepWork { range_start: range_start.into(), range_end: range_end.into() })
    }

    pub async fn get_risk_scores(
        &self,
        range_start: impl Into<String>,
        range_end: impl Into<String>,
    ) -> EngineResult<Vec<DayRisk>> {
        call!(self, GetRiskScores { range_start: range_start.into(), range_end: range_end.into() })
    }

    pub async fn get_probabilistic_availability(
        &self,
        weeks_back: u32,
    ) -> EngineResult<Vec<SlotProbability>> {
        call!(self, GetProbabilisticAvailability { weeks_back: weeks_back })
    }

    pub async fn get_event_briefing(
        &self,
        canonical_event_id: EventId,
    ) -> EngineResult<EventBriefing> {
        call!(self, GetEventBriefing { canonical_event_id: canonical_event_id })
    }

    pub async fn get_health_report(&self) -> EngineResult<HealthReport> {
        call!(self, GetHealthReport {})
    }

    pub async fn retry_failed_mirror(&self, mirror_id: MirrorId) -> EngineResult<()> {
        call!(self, RetryFailedMirror { mirror_id: mirror_id })
    }

    pub async fn build_simulation_snapshot(&self) -> EngineResult<SimulationSnapshot> {
        call!(self, BuildSimulationSnapshot {})
    }

    pub(crate) async fn begin_mirror_write(
        &self,
        job: MirrorJob,
    ) -> EngineResult<Option<MirrorWriteTicket>> {
        call!(self, BeginMirrorWrite { job: job })
    }

    pub(crate) async fn complete_mirror_write(
        &self,
        mirror_id: MirrorId,
        outcome: MirrorWriteOutcome,
    ) -> EngineResult<()> {
        call!(self, CompleteMirrorWrite { mirror_id: mirror_id, outcome: outcome })
    }

    pub async fn shutdown(&self) -> EngineResult<()> {
        call!(self, Shutdown {})
    }
}

/// The actor: owns the store and processes its mailbox to completion in
/// arrival order.
pub struct UserActor {
    user_id: String,
    store: Store,
    config: EngineConfig,
    jobs: Arc<dyn JobSink>,
    provider: Arc<dyn ProviderWriteAdapter>,
    /// Back-pressure latch: set when pending mirror writes crest the high
    /// watermark, cleared below the low watermark.
    ingestion_gated: bool,
}

impl UserActor {
    /// Spawn the actor task for one user. Migrations run before the
    /// mailbox opens.
    pub fn spawn(
        user_id: String,
        store: Store,
        config: EngineConfig,
        jobs: Arc<dyn JobSink>,
        provider: Arc<dyn ProviderWriteAdapter>,
    ) -> (UserActorHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let handle = UserActorHandle {
            user_id: user_id.clone(),
            tx,
            op_timeout: config.op_timeout(),
        };
        let actor = UserActor {
            user_id,
            store,
            config,
            jobs,
            provider,
            ingestion_gated: false,
        };
        let join = tokio::spawn(actor.run(rx));
        (handle, join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Envelope>) {
        tracing::info!(user_id = %self.user_id, "user actor started");
        let mut sweep = tokio::time::interval(std::time::Duration::from_secs(
            self.config.sweep_interval_seconds.max(1),
        ));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; consume it so the loop
        // only sweeps on the configured cadence.
        sweep.tick().await;

        loop {
            tokio::select! {
                envelope = rx.recv() => {
                    match envelope {
                        Some(envelope) => {
                            let stop = self.handle(envelope).await;
                            if stop {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    if let Err(error) = self.sweep_once().await {
                        tracing::warn!(user_id = %self.user_id, error = %error, "sweep failed");
                    }
                }
            }
        }
        tracing::info!(user_id = %self.user_id, "user actor stopped");
    }

    /// Dispatch one command. Returns true on shutdown.
    async fn handle(&mut self, envelope: Envelope) -> bool {
        let deadline = envelope.deadline;

        macro_rules! respond {
            ($reply:expr, $result:expr) => {{
                if Instant::now() >= deadline {
                    let _ = $reply.send(Err(EngineError::Cancelled {
                        message: "operation deadline passed before execution".to_string(),
                    }));
                } else {
                    let _ = $reply.send($result);
                }
            }};
        }

        // Async operations check the deadline before starting; once
        // provider side effects begin, the operation runs to completion.
        macro_rules! bail_if_expired {
            ($reply:expr) => {{
                if Instant::now() >= deadline {
                    let _ = $reply.send(Err(EngineError::Cancelled {
                        message: "operation deadline passed before execution".to_string(),
                    }));
                    return false;
                }
            }};
        }

        match envelope.command {
            UserCommand::ApplyProviderDelta {
                origin_account,
                deltas,
                reply,
            } => {
                respond!(
                    reply,
                    self.ingest(origin_account, deltas, EventSource::Provider)
                );
            }
            UserCommand::ImportIcsEvents {
                account,
                deltas,
                reply,
            } => {
                respond!(reply, self.ingest(account, deltas, EventSource::Ics));
            }
            UserCommand::CreateConstraint {
                kind,
                config,
                active_from,
                active_to,
                reply,
            } => {
                let result = self
                    .store
                    .transaction(|conn| {
                        constraints::create(
                            conn,
                            &self.user_id,
                            kind,
                            config.clone(),
                            active_from,
                            active_to,
                        )
                    })
                    .map(|(constraint, jobs)| {
                        self.enqueue_jobs(jobs);
                        constraint
                    });
                respond!(reply, result);
            }
            UserCommand::UpdateConstraint {
                constraint_id,
                config,
                active_from,
                active_to,
                reply,
            } => {
                let result = self
                    .store
                    .transaction(|conn| {
                        constraints::update(
                            conn,
                            &self.user_id,
                            &constraint_id,
                            config.clone(),
                            active_from,
                            active_to,
                        )
                    })
                    .map(|(constraint, jobs)| {
                        self.enqueue_jobs(jobs);
                        constraint
                    });
                respond!(reply, result);
            }
            UserCommand::DeleteConstraint {
                constraint_id,
                reply,
            } => {
                let result = self
                    .store
                    .transaction(|conn| constraints::delete(conn, &self.user_id, &constraint_id))
                    .map(|jobs| self.enqueue_jobs(jobs));
                respond!(reply, result);
            }
            UserCommand::ListConstraints { kind, reply } => {
                respond!(reply, self.store.transaction(|conn| constraints::list(conn, kind)));
            }
            UserCommand::GetJournal {
                canonical_event_id,
                reply,
            } => {
                respond!(
                    reply,
                    self.store
                        .transaction(|conn| journal::for_event(conn, &canonical_event_id))
                );
            }
            UserCommand::CreateRelationship { input, reply } => {
                let salt = self.config.participant_salt.clone();
                respond!(
                    reply,
                    self.store
                        .transaction(|conn| relationships::create(conn, &salt, input.clone()))
                );
            }
            UserCommand::UpdateRelationship {
                relationship_id,
                patch,
                reply,
            } => {
                respond!(
                    reply,
                    self.store.transaction(|conn| {
                        relationships::update(conn, &relationship_id, patch.clone())
                    })
                );
            }
            UserCommand::DeleteRelationship {
                relationship_id,
                reply,
            } => {
                respond!(
                    reply,
                    self.store
                        .transaction(|conn| relationships::delete(conn, &relationship_id))
                );
            }
            UserCommand::GetRelationship {
                relationship_id,
                reply,
            } => {
                respond!(
                    reply,
                    self.store
                        .transaction(|conn| relationships::get(conn, &relationship_id))
                );
            }
            UserCommand::ListRelationships { reply } => {
                respond!(reply, self.store.transaction(relationships::list));
            }
            UserCommand::MarkOutcome {
                relationship_id,
                outcome,
                note,
                reply,
            } => {
                respond!(
                    reply,
                    self.store.transaction(|conn| {
                        relationships::mark_outcome(conn, &relationship_id, outcome, note.clone())
                    })
                );
            }
            UserCommand::ListOutcomes {
                relationship_id,
                reply,
            } => {
                respond!(
                    reply,
                    self.store
                        .transaction(|conn| relationships::list_outcomes(conn, &relationship_id))
                );
            }
            UserCommand::GetTimeline {
                relationship_id,
                reply,
            } => {
                respond!(
                    reply,
                    self.store
                        .transaction(|conn| relationships::timeline(conn, &relationship_id))
                );
            }
            UserCommand::GetReputation {
                relationship_id,
                reply,
            } => {
                respond!(
                    reply,
                    self.store
                        .transaction(|conn| relationships::reputation(conn, &relationship_id))
                );
            }
            UserCommand::GetDriftReport { reply } => {
                respond!(reply, self.store.transaction(relationships::drift));
            }
            UserCommand::GetReconnectionSuggestions {
                city,
                trip_id,
                reply,
            } => {
                respond!(
                    reply,
                    self.store.transaction(|conn| {
                        relationships::reconnection_suggestions(
                            conn,
                            city.clone(),
                            trip_id.clone(),
                        )
                    })
                );
            }
            UserCommand::CreateMilestone { input, reply } => {
                respond!(
                    reply,
                    self.store
                        .transaction(|conn| relationships::create_milestone(conn, input.clone()))
                );
            }
            UserCommand::DeleteMilestone {
                milestone_id,
                reply,
            } => {
                respond!(
                    reply,
                    self.store
                        .transaction(|conn| relationships::delete_milestone(conn, &milestone_id))
                );
            }
            UserCommand::ListMilestones { reply } => {
                respond!(reply, self.store.transaction(relationships::list_milestones));
            }
            UserCommand::ListUpcomingMilestones { max_days, reply } => {
                respond!(
                    reply,
                    self.store.transaction(|conn| {
                        relationships::upcoming_milestones(conn, max_days, Utc::now())
                    })
                );
            }
            UserCommand::ProposeTimes { request, reply } => {
                bail_if_expired!(reply);
                let result = scheduling::propose(
                    &self.store,
                    &self.config,
                    &self.provider,
                    request,
                )
                .await;
                let _ = reply.send(result);
            }
            UserCommand::SelectCandidate {
                session_id,
                candidate_id,
                reply,
            } => {
                respond!(
                    reply,
                    self.store.transaction(|conn| {
                        scheduling::select_candidate(conn, &session_id, &candidate_id)
                    })
                );
            }
            UserCommand::CommitCandidate {
                session_id,
                candidate_id,
                reply,
            } => {
                bail_if_expired!(reply);
                let result = scheduling::commit(
                    &self.store,
                    &self.config,
                    &self.provider,
                    &self.user_id,
                    &session_id,
                    candidate_id.as_deref(),
                )
                .await
                .map(|(outcome, jobs)| {
                    self.enqueue_jobs(jobs);
                    outcome
                });
                let _ = reply.send(result);
            }
            UserCommand::CancelSession { session_id, reply } => {
                bail_if_expired!(reply);
                let result = scheduling::cancel(&self.store, &self.provider, &session_id).await;
                let _ = reply.send(result);
            }
            UserCommand::ListSessions { reply } => {
                respond!(reply, self.store.transaction(scheduling::list));
            }
            UserCommand::RunSweep { reply } => {
                bail_if_expired!(reply);
                let result = self.sweep_once().await;
                let _ = reply.send(result);
            }
            UserCommand::ComputeAvailability {
                range_start,
                range_end,
                accounts,
                reply,
            } => {
                respond!(
                    reply,
                    self.store.transaction(|conn| {
                        availability::compute(conn, &range_start, &range_end, accounts.as_deref())
                    })
                );
            }
            UserCommand::GetCognitiveLoad {
                range_start,
                range_end,
                reply,
            } => {
                respond!(
                    reply,
                    self.store
                        .transaction(|conn| analytics::cognitive_load(conn, &range_start, &range_end))
                );
            }
            UserCommand::GetContextSwitches {
                range_start,
                range_end,
                reply,
            } => {
                respond!(
                    reply,
                    self.store.transaction(|conn| {
                        analytics::context_switch_report(conn, &range_start, &range_end)
                    })
                );
            }
            UserCommand::GetDeepWork {
                range_start,
                range_end,
                reply,
            } => {
                respond!(
                    reply,
                    self.store.transaction(|conn| {
                        analytics::deep_work(conn, &range_start, &range_end)
                    })
                );
            }
            UserCommand::GetRiskScores {
                range_start,
                range_end,
                reply,
            } => {
                respond!(
                    reply,
                    self.store
                        .transaction(|conn| analytics::risk_scores(conn, &range_start, &range_end))
                );
            }
            UserCommand::GetProbabilisticAvailability { weeks_back, reply } => {
                respond!(
                    reply,
                    self.store
                        .transaction(|conn| analytics::probabilistic_availability(conn, weeks_back))
                );
            }
            UserCommand::GetEventBriefing {
                canonical_event_id,
                reply,
            } => {
                respond!(
                    reply,
                    self.store
                        .transaction(|conn| analytics::event_briefing(conn, &canonical_event_id))
                );
            }
            UserCommand::GetHealthReport { reply } => {
                let gated = self.ingestion_gated;
                respond!(
                    reply,
                    self.store
                        .transaction(|conn| snapshot::health(conn, &self.user_id, gated))
                );
            }
            UserCommand::RetryFailedMirror { mirror_id, reply } => {
                let result = self
                    .store
                    .transaction(|conn| mirror::retry_failed(conn, &self.user_id, &mirror_id))
                    .map(|jobs| self.enqueue_jobs(jobs));
                respond!(reply, result);
            }
            UserCommand::BuildSimulationSnapshot { reply } => {
                respond!(
                    reply,
                    self.store
                        .transaction(|conn| snapshot::build(conn, &self.user_id))
                );
            }
            UserCommand::BeginMirrorWrite { job, reply } => {
                let result = self
                    .store
                    .transaction(|conn| {
                        mirror::begin_write(
                            conn,
                            &self.user_id,
                            &job.mirror_id,
                            job.state_when_enqueued,
                        )
                    })
                    .map(|(ticket, jobs)| {
                        self.enqueue_jobs(jobs);
                        ticket
                    });
                respond!(reply, result);
            }
            UserCommand::CompleteMirrorWrite {
                mirror_id,
                outcome,
                reply,
            } => {
                let result = self
                    .store
                    .transaction(|conn| {
                        mirror::apply_write_outcome(
                            conn,
                            &self.user_id,
                            &self.config,
                            &mirror_id,
                            outcome.clone(),
                        )
                    })
                    .map(|jobs| self.enqueue_jobs(jobs));
                respond!(reply, result);
            }
            UserCommand::Shutdown { reply } => {
                let _ = reply.send(Ok(()));
                return true;
            }
        }
        false
    }

    /// Ingestion entry point with the back-pressure gate.
    fn ingest(
        &mut self,
        origin_account: AccountId,
        deltas: Vec<ProviderDelta>,
        source: EventSource,
    ) -> EngineResult<DeltaSummary> {
        let pending = self.store.transaction(mirror::pending_write_count)?;
        if self.ingestion_gated {
            if pending > self.config.queue_low_watermark as i64 {
                return Err(EngineError::retry_later(
                    format!("mirror write backlog at {} entries", pending),
                    std::time::Duration::from_secs(30),
                ));
            }
            self.ingestion_gated = false;
            tracing::info!(user_id = %self.user_id, pending, "ingestion gate lifted");
        } else if pending >= self.config.queue_high_watermark as i64 {
            self.ingestion_gated = true;
            tracing::warn!(user_id = %self.user_id, pending, "ingestion gated by mirror backlog");
            return Err(EngineError::retry_later(
                format!("mirror write backlog at {} entries", pending),
                std::time::Duration::from_secs(30),
            ));
        }

        let (summary, jobs) = self.store.transaction(|conn| {
            crate::ingest::apply_deltas(
                conn,
                &self.config,
                &self.user_id,
                &origin_account,
                &deltas,
                source,
            )
        })?;
        self.enqueue_jobs(jobs);
        Ok(summary)
    }

    fn enqueue_jobs(&self, jobs: Vec<MirrorJob>) {
        for job in jobs {
            if let Err(error) = self.jobs.enqueue(job) {
                // The row keeps its pending state; the retry sweep will
                // re-enqueue it.
                tracing::warn!(user_id = %self.user_id, error = %error, "mirror job enqueue failed");
            }
        }
    }

    async fn sweep_once(&mut self) -> EngineResult<SweepReport> {
        let (expired_holds, expired_sessions) =
            scheduling::sweep(&self.store, &self.provider, Utc::now()).await?;
        let retries = self
            .store
            .transaction(|conn| mirror::due_retries(conn, &self.user_id, &self.config))?;
        let report = SweepReport {
            expired_holds,
            expired_sessions,
            mirror_retries_enqueued: retries.len() as u32,
        };
        self.enqueue_jobs(retries);
        Ok(report)
    }
}
