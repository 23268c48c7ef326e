//! Workflow Coordinator — the per-project state machine driving the pipeline.
//!
//! The coordinator is the single fan-in point for worker replies: every
//! worker addresses its replies to the `orchestrator` topic (failures to the
//! reserved `error` topic), and the coordinator alone publishes work orders
//! onto worker topics. For each project it tracks the current phase, the
//! append-only transition history, and the bounded clarification loop, and it
//! reports every transition on the `status` topic for observers.
//!
//! Pipeline: Created → RequirementsAnalysis → ArchitectureDesign →
//! Development → QaTesting → Completed, with AwaitingClarification as a
//! bounded detour and Failed reachable from any non-terminal phase.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::broker::{MessageBroker, Subscriber, SubscriptionHandle};
use crate::error::{CoreError, SubscriberError};
use crate::models::{
    topics, AgentRole, Message, MessageType, PhaseTransition, ProjectPhase, ProjectRecord,
    ProjectSnapshot,
};

/// Bookkeeping key stamped once when a project starts. Never overwrites a
/// forwarded key: if the trigger already carries it, the original wins.
const INITIATED_BY_KEY: &str = "initiated_by";

/// Coordinator tuning knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Fail a project on an unexpected (sender, type) for its current phase
    /// instead of logging and ignoring it.
    pub strict: bool,
    /// Clarification rounds allowed per project before the pipeline fails.
    pub max_clarification_rounds: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            strict: false,
            max_clarification_rounds: 3,
        }
    }
}

struct CoordinatorInner {
    broker: MessageBroker,
    config: CoordinatorConfig,
    /// Per-project mutex: no two transitions for one project apply
    /// concurrently; different projects progress independently.
    projects: RwLock<HashMap<String, Arc<Mutex<ProjectRecord>>>>,
}

/// Drives project workflows over a [`MessageBroker`]. Cheap to clone; clones
/// share state.
#[derive(Clone)]
pub struct WorkflowCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl WorkflowCoordinator {
    pub fn new(broker: MessageBroker, config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                broker,
                config,
                projects: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe this coordinator to its inbound topics. The returned handles
    /// can be used to detach it again.
    pub async fn attach(&self) -> Result<Vec<SubscriptionHandle>, CoreError> {
        let subscriber: Arc<dyn Subscriber> = Arc::new(self.clone());
        let mut handles = Vec::with_capacity(2);
        handles.push(
            self.inner
                .broker
                .subscribe(AgentRole::Orchestrator.topic(), subscriber.clone())
                .await?,
        );
        handles.push(self.inner.broker.subscribe(topics::ERROR, subscriber).await?);
        Ok(handles)
    }

    /// Start a project from its trigger message: a `Specification` addressed
    /// to the first worker. Creates the workflow record, moves it into
    /// RequirementsAnalysis, forwards the specification to the business
    /// analyst, and reports on the status topic.
    pub async fn start_project(&self, trigger: Message) -> Result<(), CoreError> {
        if trigger.message_type != MessageType::Specification {
            return Err(CoreError::InvalidMessage(format!(
                "project trigger must be a specification, got {}",
                trigger.message_type
            )));
        }
        if trigger.to_agent != AgentRole::BusinessAnalyst {
            return Err(CoreError::InvalidMessage(format!(
                "project trigger must address the business analyst, got {}",
                trigger.to_agent
            )));
        }

        let project_id = trigger.project_id.clone();
        let mut record = ProjectRecord::new(&project_id);
        record.record_transition(ProjectPhase::RequirementsAnalysis);
        let status = self.status_message(&record)?;

        {
            let mut projects = self.inner.projects.write().await;
            if projects.contains_key(&project_id) {
                return Err(CoreError::DuplicateProject(project_id));
            }
            projects.insert(project_id.clone(), Arc::new(Mutex::new(record)));
        }

        let mut work_order = trigger.forward_to(
            AgentRole::Orchestrator,
            AgentRole::BusinessAnalyst,
            MessageType::Specification,
            trigger.content.clone(),
        )?;
        if work_order.metadata.contains_key(INITIATED_BY_KEY) {
            tracing::warn!(
                "[Coordinator] trigger for {} already carries '{}', keeping original",
                project_id,
                INITIATED_BY_KEY
            );
        } else {
            work_order = work_order.with_metadata_entry(INITIATED_BY_KEY, "orchestrator");
        }

        tracing::info!("[Coordinator] project {} started", project_id);
        // Status goes out before the work order: the work order can trigger
        // the next transition (and its status) from inside the callback, and
        // observers must see phases in transition order.
        self.inner.broker.publish(topics::STATUS, status).await?;
        self.inner
            .broker
            .publish(AgentRole::BusinessAnalyst.topic(), work_order)
            .await?;
        Ok(())
    }

    /// Relay a user's answer to the worker whose question parked the project
    /// in AwaitingClarification.
    pub async fn submit_clarification(
        &self,
        project_id: &str,
        answer: impl Into<String>,
    ) -> Result<(), CoreError> {
        let record = self
            .project(project_id)
            .await
            .ok_or_else(|| CoreError::UnknownProject(project_id.to_string()))?;

        let worker = {
            let record = record.lock().await;
            if record.phase != ProjectPhase::AwaitingClarification {
                return Err(CoreError::InvalidMessage(format!(
                    "project {} is in phase {}, not awaiting clarification",
                    project_id, record.phase
                )));
            }
            record.active_worker
        };

        let answer = Message::new(
            AgentRole::Orchestrator,
            worker,
            MessageType::Clarification,
            answer,
            project_id,
        )?;
        self.process(answer).await
    }

    pub async fn project_snapshot(&self, project_id: &str) -> Option<ProjectSnapshot> {
        let record = self.project(project_id).await?;
        let record = record.lock().await;
        Some(record.snapshot())
    }

    pub async fn all_projects(&self) -> Vec<ProjectSnapshot> {
        let records: Vec<_> = {
            let projects = self.inner.projects.read().await;
            projects.values().cloned().collect()
        };
        let mut snapshots = Vec::with_capacity(records.len());
        for record in records {
            snapshots.push(record.lock().await.snapshot());
        }
        snapshots
    }

    pub async fn history(&self, project_id: &str) -> Option<Vec<PhaseTransition>> {
        self.project_snapshot(project_id)
            .await
            .map(|snapshot| snapshot.history)
    }

    async fn project(&self, project_id: &str) -> Option<Arc<Mutex<ProjectRecord>>> {
        let projects = self.inner.projects.read().await;
        projects.get(project_id).cloned()
    }

    /// Route one inbound message through the state machine.
    ///
    /// Mutates the project record under its per-project lock, then publishes
    /// the resulting messages after the lock is released so that worker
    /// callbacks re-entering the coordinator cannot deadlock on it.
    async fn process(&self, message: Message) -> Result<(), CoreError> {
        if message.message_type == MessageType::Status {
            tracing::debug!(
                "[Coordinator] ignoring status message {} from {}",
                message.message_id,
                message.from_agent
            );
            return Ok(());
        }

        let Some(record) = self.project(&message.project_id).await else {
            tracing::warn!(
                "[Coordinator] message {} for unknown project {}, dropped",
                message.message_id,
                message.project_id
            );
            return Ok(());
        };

        let outbound = {
            let mut record = record.lock().await;
            self.apply(&mut record, &message)?
        };

        for (topic, message) in outbound {
            self.inner.broker.publish(&topic, message).await?;
        }
        Ok(())
    }

    /// Apply one message to a locked record; returns the (topic, message)
    /// pairs to publish once the lock is dropped.
    fn apply(
        &self,
        record: &mut ProjectRecord,
        message: &Message,
    ) -> Result<Vec<(String, Message)>, CoreError> {
        if record.is_terminal() {
            tracing::info!(
                "[Coordinator] project {} is {}, message {} dropped",
                record.project_id,
                record.phase,
                message.message_id
            );
            return Ok(Vec::new());
        }

        if message.message_type == MessageType::Error {
            return self.fail(
                record,
                format!("{} reported: {}", message.from_agent, message.content),
            );
        }

        if record.phase == ProjectPhase::AwaitingClarification {
            return self.apply_awaiting_clarification(record, message);
        }

        let Some((expected_from, expected_type)) = record.phase.expected_completion() else {
            return self.unexpected(record, message);
        };

        if message.from_agent == expected_from && message.message_type == MessageType::Clarification
        {
            return self.apply_clarification_request(record, message);
        }

        if message.from_agent == expected_from && message.message_type == expected_type {
            return self.advance(record, message);
        }

        self.unexpected(record, message)
    }

    /// Expected completion received: append history, advance, report status,
    /// then hand the next worker its work order.
    fn advance(
        &self,
        record: &mut ProjectRecord,
        message: &Message,
    ) -> Result<Vec<(String, Message)>, CoreError> {
        let next = record
            .phase
            .next()
            .ok_or_else(|| CoreError::PipelineFailed(format!(
                "phase {} has no successor",
                record.phase
            )))?;
        record.record_transition(next);
        tracing::info!(
            "[Coordinator] project {} advanced to {}",
            record.project_id,
            next
        );

        // Status first: the work order can drive the next transition from
        // inside its own delivery, and the status topic must observe phases
        // in transition order.
        let mut outbound = Vec::with_capacity(2);
        outbound.push((topics::STATUS.to_string(), self.status_message(record)?));
        if let (Some(worker), Some(entry_type)) = (next.worker(), next.entry_message_type()) {
            // The work order keeps the completing worker as its sender: the
            // architect sees a design from the business analyst, not from the
            // coordinator relaying it.
            let work_order = message.forward_to(
                message.from_agent,
                worker,
                entry_type,
                message.content.clone(),
            )?;
            outbound.push((worker.topic().to_string(), work_order));
        }
        Ok(outbound)
    }

    /// Active worker asked a question: park the project, bounded by the
    /// clarification cap. The question itself reaches the user through the
    /// shell observing the status topic.
    fn apply_clarification_request(
        &self,
        record: &mut ProjectRecord,
        message: &Message,
    ) -> Result<Vec<(String, Message)>, CoreError> {
        record.clarification_rounds += 1;
        if record.clarification_rounds > self.inner.config.max_clarification_rounds {
            return self.fail(
                record,
                format!(
                    "clarification limit exceeded ({} rounds)",
                    self.inner.config.max_clarification_rounds
                ),
            );
        }

        record.resume_phase = Some(record.phase);
        record.record_transition(ProjectPhase::AwaitingClarification);
        tracing::info!(
            "[Coordinator] project {} awaiting clarification from user (round {}, asked by {})",
            record.project_id,
            record.clarification_rounds,
            message.from_agent
        );
        Ok(vec![(
            topics::STATUS.to_string(),
            self.status_message(record)?,
        )])
    }

    /// User answer arrived: resume the parked phase and relay the answer to
    /// the waiting worker.
    fn apply_awaiting_clarification(
        &self,
        record: &mut ProjectRecord,
        message: &Message,
    ) -> Result<Vec<(String, Message)>, CoreError> {
        if message.from_agent != AgentRole::Orchestrator
            || message.message_type != MessageType::Clarification
        {
            return self.unexpected(record, message);
        }

        let resume = record
            .resume_phase
            .take()
            .unwrap_or(ProjectPhase::RequirementsAnalysis);
        record.record_transition(resume);
        let worker = resume.worker().unwrap_or(record.active_worker);
        tracing::info!(
            "[Coordinator] project {} resumed {} after clarification",
            record.project_id,
            resume
        );

        let relay = message.forward_to(
            AgentRole::Orchestrator,
            worker,
            MessageType::Clarification,
            message.content.clone(),
        )?;
        Ok(vec![
            (topics::STATUS.to_string(), self.status_message(record)?),
            (worker.topic().to_string(), relay),
        ])
    }

    /// Message doesn't match the phase contract: the slow/duplicate/ordering
    /// case. Ignored unless strict mode makes it fatal.
    fn unexpected(
        &self,
        record: &mut ProjectRecord,
        message: &Message,
    ) -> Result<Vec<(String, Message)>, CoreError> {
        if self.inner.config.strict {
            return self.fail(
                record,
                format!(
                    "unexpected {} from {} in phase {}",
                    message.message_type, message.from_agent, record.phase
                ),
            );
        }
        tracing::warn!(
            "[Coordinator] project {}: unexpected {} from {} in phase {}, ignored",
            record.project_id,
            message.message_type,
            message.from_agent,
            record.phase
        );
        Ok(Vec::new())
    }

    /// Terminal failure: a normal, observable end state — never a process
    /// failure. No further transitions are accepted for this project.
    fn fail(
        &self,
        record: &mut ProjectRecord,
        reason: String,
    ) -> Result<Vec<(String, Message)>, CoreError> {
        tracing::error!(
            "[Coordinator] project {} failed in phase {}: {}",
            record.project_id,
            record.phase,
            reason
        );
        record.last_error = Some(reason);
        record.record_transition(ProjectPhase::Failed);
        Ok(vec![(
            topics::STATUS.to_string(),
            self.status_message(record)?,
        )])
    }

    /// Build the observer-facing status report for the record's current
    /// phase. Addressed to the active worker: observers subscribe by topic,
    /// and a self-addressed message would be invalid.
    fn status_message(&self, record: &ProjectRecord) -> Result<Message, CoreError> {
        let payload = serde_json::json!({
            "projectId": record.project_id,
            "phase": record.phase.as_str(),
            "progressEstimate": record.phase.progress_estimate(),
        });
        Message::new(
            AgentRole::Orchestrator,
            record.active_worker,
            MessageType::Status,
            payload.to_string(),
            record.project_id.clone(),
        )
    }
}

#[async_trait]
impl Subscriber for WorkflowCoordinator {
    fn name(&self) -> &str {
        "workflow-coordinator"
    }

    async fn handle(&self, message: Message) -> Result<(), SubscriberError> {
        self.process(message)
            .await
            .map_err(|e| SubscriberError::new(e.to_string()))
    }
}
