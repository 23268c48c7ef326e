//! Inter-agent message model.
//!
//! A `Message` is the only value that crosses the broker: immutable once
//! constructed, validated at construction (fail fast), and forwarded by
//! building a *new* message that carries the original metadata verbatim.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Reserved topic names. Worker topics come from [`AgentRole::topic`].
pub mod topics {
    /// Coordinator-emitted progress reports for observers.
    pub const STATUS: &str = "status";
    /// Worker failure reports.
    pub const ERROR: &str = "error";
    /// Fan-out to every connected agent.
    pub const BROADCAST: &str = "broadcast";
}

/// The fixed set of agent roles in the delivery pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Orchestrator,
    BusinessAnalyst,
    Architect,
    Developer,
    Tester,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::BusinessAnalyst => "business_analyst",
            Self::Architect => "architect",
            Self::Developer => "developer",
            Self::Tester => "tester",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "orchestrator" => Some(Self::Orchestrator),
            "business_analyst" | "ba" => Some(Self::BusinessAnalyst),
            "architect" => Some(Self::Architect),
            "developer" => Some(Self::Developer),
            "tester" => Some(Self::Tester),
            _ => None,
        }
    }

    /// Topic a role receives its work messages on. By convention the topic
    /// name is the role name.
    pub fn topic(&self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of message kinds. Extending it is a compile-time change by
/// design: the coordinator matches exhaustively on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Project requirements handed to the business analyst.
    Specification,
    /// A worker's question back to the user, or the relayed answer.
    Clarification,
    /// Requirements analysis result handed to the architect.
    Design,
    /// Architecture handed to the developer.
    Implementation,
    /// Implementation handed to the tester.
    TestReport,
    /// QA sign-off.
    Approval,
    /// Progress report for observers.
    Status,
    /// Worker failure report.
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Specification => "specification",
            Self::Clarification => "clarification",
            Self::Design => "design",
            Self::Implementation => "implementation",
            Self::TestReport => "test_report",
            Self::Approval => "approval",
            Self::Status => "status",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message priority. Carried but never interpreted by the core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// An immutable message exchanged between agents.
///
/// `metadata` is the side-channel that keeps project context alive across the
/// pipeline: any component that forwards a derived message must carry every
/// existing key through unmodified.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique id, used for dedup and logging only — never for ordering.
    pub message_id: Uuid,
    pub from_agent: AgentRole,
    pub to_agent: AgentRole,
    pub message_type: MessageType,
    /// Opaque payload; the core never inspects it.
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Correlation key; required non-empty.
    pub project_id: String,
    #[serde(default)]
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Construct a validated message. Fails fast on an empty `project_id` or
    /// a self-addressed message (`from_agent == to_agent` is meaningless in
    /// the pipeline).
    pub fn new(
        from_agent: AgentRole,
        to_agent: AgentRole,
        message_type: MessageType,
        content: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let project_id = project_id.into();
        if project_id.trim().is_empty() {
            return Err(CoreError::InvalidMessage(
                "project_id must be non-empty".to_string(),
            ));
        }
        if from_agent == to_agent {
            return Err(CoreError::InvalidMessage(format!(
                "from_agent and to_agent are both {from_agent}"
            )));
        }
        Ok(Self {
            message_id: Uuid::new_v4(),
            from_agent,
            to_agent,
            message_type,
            content: content.into(),
            metadata: HashMap::new(),
            project_id,
            priority: Priority::default(),
            timestamp: Utc::now(),
        })
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_metadata_entry(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Build a derived message for the next pipeline stage.
    ///
    /// Carries `project_id`, `priority`, and the full `metadata` map forward;
    /// gets a fresh id and timestamp.
    pub fn forward_to(
        &self,
        from_agent: AgentRole,
        to_agent: AgentRole,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let forwarded = Self::new(
            from_agent,
            to_agent,
            message_type,
            content,
            self.project_id.clone(),
        )?;
        Ok(forwarded
            .with_metadata(self.metadata.clone())
            .with_priority(self.priority))
    }
}
