//! Agora Core — Transport-agnostic messaging and workflow coordination for
//! multi-agent pipelines.
//!
//! Two cooperating pieces:
//!
//! - [`broker::MessageBroker`] — an in-process topic pub/sub bus with ordered
//!   at-least-once delivery per topic and per-subscriber failure isolation.
//! - [`coordinator::WorkflowCoordinator`] — a per-project state machine that
//!   drives the fixed agent pipeline (business analyst, architect, developer,
//!   tester) over the broker and reports progress on the `status` topic.
//!
//! The crate has no transport dependency: embed it directly, or front it with
//! an HTTP server, a CLI, or a desktop shell.

pub mod broker;
pub mod coordinator;
pub mod error;
pub mod models;

// Convenience re-exports
pub use broker::{DeliveryReport, MessageBroker, Subscriber, SubscriptionHandle};
pub use coordinator::{CoordinatorConfig, WorkflowCoordinator};
pub use error::{CoreError, SubscriberError};
pub use models::{AgentRole, Message, MessageType, Priority, ProjectPhase, ProjectSnapshot};
