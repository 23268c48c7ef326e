//! Per-project workflow state.
//!
//! One [`ProjectRecord`] exists per `project_id`, owned and mutated only by
//! the coordinator. History is append-only; records are never deleted by the
//! core (an external layer may archive them).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::message::{AgentRole, MessageType};

/// Workflow phases in pipeline order, plus the two terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPhase {
    Created,
    RequirementsAnalysis,
    AwaitingClarification,
    ArchitectureDesign,
    Development,
    QaTesting,
    Completed,
    Failed,
}

impl ProjectPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::RequirementsAnalysis => "requirements_analysis",
            Self::AwaitingClarification => "awaiting_clarification",
            Self::ArchitectureDesign => "architecture_design",
            Self::Development => "development",
            Self::QaTesting => "qa_testing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Rough completion fraction reported on the status topic.
    pub fn progress_estimate(&self) -> f32 {
        match self {
            Self::Created => 0.0,
            Self::RequirementsAnalysis => 0.15,
            Self::AwaitingClarification => 0.25,
            Self::ArchitectureDesign => 0.4,
            Self::Development => 0.65,
            Self::QaTesting => 0.85,
            Self::Completed => 1.0,
            Self::Failed => 0.0,
        }
    }

    /// The worker actively driving this phase, if any.
    pub fn worker(&self) -> Option<AgentRole> {
        match self {
            Self::RequirementsAnalysis => Some(AgentRole::BusinessAnalyst),
            Self::ArchitectureDesign => Some(AgentRole::Architect),
            Self::Development => Some(AgentRole::Developer),
            Self::QaTesting => Some(AgentRole::Tester),
            Self::Created | Self::AwaitingClarification | Self::Completed | Self::Failed => None,
        }
    }

    /// The message type the phase's worker receives as its work order.
    pub fn entry_message_type(&self) -> Option<MessageType> {
        match self {
            Self::RequirementsAnalysis => Some(MessageType::Specification),
            Self::ArchitectureDesign => Some(MessageType::Design),
            Self::Development => Some(MessageType::Implementation),
            Self::QaTesting => Some(MessageType::TestReport),
            _ => None,
        }
    }

    /// The one (sender, type) pair that completes this phase.
    pub fn expected_completion(&self) -> Option<(AgentRole, MessageType)> {
        match self {
            Self::RequirementsAnalysis => Some((AgentRole::BusinessAnalyst, MessageType::Design)),
            Self::ArchitectureDesign => Some((AgentRole::Architect, MessageType::Implementation)),
            Self::Development => Some((AgentRole::Developer, MessageType::TestReport)),
            Self::QaTesting => Some((AgentRole::Tester, MessageType::Approval)),
            _ => None,
        }
    }

    /// The phase that follows this one in the pipeline.
    pub fn next(&self) -> Option<ProjectPhase> {
        match self {
            Self::Created => Some(Self::RequirementsAnalysis),
            Self::RequirementsAnalysis => Some(Self::ArchitectureDesign),
            Self::ArchitectureDesign => Some(Self::Development),
            Self::Development => Some(Self::QaTesting),
            Self::QaTesting => Some(Self::Completed),
            Self::AwaitingClarification | Self::Completed | Self::Failed => None,
        }
    }
}

impl std::fmt::Display for ProjectPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a project's append-only phase history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTransition {
    pub from: ProjectPhase,
    pub to: ProjectPhase,
    pub at: DateTime<Utc>,
}

/// Mutable workflow state for a single project.
#[derive(Debug, Clone)]
pub struct ProjectRecord {
    pub project_id: String,
    pub phase: ProjectPhase,
    /// Phase to return to once a clarification round completes.
    pub resume_phase: Option<ProjectPhase>,
    /// The worker the project is currently parked on or driven by.
    pub active_worker: AgentRole,
    pub clarification_rounds: u32,
    pub history: Vec<PhaseTransition>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProjectRecord {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            phase: ProjectPhase::Created,
            resume_phase: None,
            active_worker: AgentRole::BusinessAnalyst,
            clarification_rounds: 0,
            history: Vec::new(),
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Append a history entry and advance the phase. Updates `active_worker`
    /// when the new phase has one.
    pub fn record_transition(&mut self, to: ProjectPhase) {
        self.history.push(PhaseTransition {
            from: self.phase,
            to,
            at: Utc::now(),
        });
        self.phase = to;
        if let Some(worker) = to.worker() {
            self.active_worker = worker;
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// When the project last moved. Supports an external watchdog; the core
    /// itself imposes no timeouts.
    pub fn last_transition_at(&self) -> DateTime<Utc> {
        self.history.last().map(|t| t.at).unwrap_or(self.created_at)
    }

    pub fn idle_time(&self) -> chrono::Duration {
        Utc::now() - self.last_transition_at()
    }

    pub fn snapshot(&self) -> ProjectSnapshot {
        ProjectSnapshot {
            project_id: self.project_id.clone(),
            phase: self.phase,
            progress_estimate: self.phase.progress_estimate(),
            clarification_rounds: self.clarification_rounds,
            last_error: self.last_error.clone(),
            history: self.history.clone(),
            idle_seconds: self.idle_time().num_seconds(),
        }
    }
}

/// Serializable read-model of a project record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSnapshot {
    pub project_id: String,
    pub phase: ProjectPhase,
    pub progress_estimate: f32,
    pub clarification_rounds: u32,
    pub last_error: Option<String>,
    pub history: Vec<PhaseTransition>,
    pub idle_seconds: i64,
}
