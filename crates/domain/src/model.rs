//! Core model-lifecycle enums shared by every component.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lifecycle status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle status for training, deployment, and cache refresh.
///
/// Legal forward path: `not_started → starting → in_progress →
/// {complete, failed}`. A deployment additionally drops `complete →
/// stopped` when the scheduler reports the job dead. Everything else is
/// an illegal transition, except an explicit admin reset back to
/// `not_started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    NotStarted,
    Starting,
    InProgress,
    Stopped,
    Complete,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Stopped)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// `allow_stop` enables the deploy-only edges: demotion to
    /// `stopped` when the scheduler reports the job dead or an
    /// undeploy is requested, and `stopped → starting` when a stopped
    /// model is deployed again.
    pub fn can_transition(self, next: Status, allow_stop: bool) -> bool {
        use Status::*;
        match (self, next) {
            (a, b) if a == b => true,
            (NotStarted, Starting) => true,
            (Starting, InProgress) => true,
            (Starting, Complete) | (Starting, Failed) => true,
            (InProgress, Complete) | (InProgress, Failed) => true,
            (Starting, Stopped) | (InProgress, Stopped) | (Complete, Stopped) => allow_stop,
            (Stopped, Starting) => allow_stop,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::InProgress => "in_progress",
            Self::Stopped => "stopped",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "starting" => Ok(Self::Starting),
            "in_progress" => Ok(Self::InProgress),
            "stopped" => Ok(Self::Stopped),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model type & access level
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    /// Retrieval model (document search).
    Ndb,
    /// Token / text classifier.
    Udt,
    /// Composition-only workflow over retrieval + guardrail components.
    EnterpriseSearch,
    KnowledgeExtraction,
}

impl ModelType {
    /// Workflow models are compositions; they never get their own
    /// training or deployment job.
    pub fn is_workflow(self) -> bool {
        matches!(self, Self::EnterpriseSearch | Self::KnowledgeExtraction)
    }
}

/// Sub-type of a model (e.g. `token` vs `text` for classifiers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSubType {
    #[serde(alias = "")]
    None,
    Token,
    Text,
    Single,
}

impl Default for ModelSubType {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// Any authenticated user may read.
    Public,
    /// Users whose domain matches the model's domain may read; a team
    /// admin of the owning team may write.
    Protected,
    /// Owner and global admins only.
    Private,
}

impl Default for AccessLevel {
    fn default() -> Self {
        Self::Private
    }
}

/// The operation a caller wants to perform on a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelOp {
    Read,
    Write,
}

/// Role of a user within a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamRole {
    Member,
    TeamAdmin,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Integrations (external LLM endpoints)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationType {
    Openai,
    SelfHosted,
    Anthropic,
    Cohere,
}
