//! Interview context, conversation log types, and the persistence
//! collaborator seam.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::providers::Provider;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProfile {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateProfile {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterviewType {
    Technical,
    Behavioral,
    Screening,
    Mixed,
}

impl InterviewType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterviewType::Technical => "technical",
            InterviewType::Behavioral => "behavioral",
            InterviewType::Screening => "screening",
            InterviewType::Mixed => "mixed",
        }
    }
}

/// Precomputed question plan: ordered core questions plus a pool of
/// follow-up phrasings. Read-only for the life of the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuestionPlan {
    #[serde(default)]
    pub core_questions: Vec<String>,
    #[serde(default)]
    pub followups: Vec<String>,
}

/// Per-interview AI preferences chosen when the interview was set up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiPreferences {
    pub provider: Provider,
    pub model: String,
    #[serde(default)]
    pub preferred_key_id: Option<String>,
    pub min_user_turns_before_wrap: u32,
}

/// Everything the session runtime needs to know about one interview,
/// loaded once at session start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterviewContext {
    pub company_id: String,
    pub job: JobProfile,
    pub candidate: CandidateProfile,
    pub interview_type: InterviewType,
    pub question_plan: QuestionPlan,
    pub ai: AiPreferences,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// One conversation entry. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Persistence collaborator. CRUD lives with an external service; the
/// runtime loads context once and appends transcript messages as they
/// are produced. Append failures are telemetry-grade: callers log and
/// continue.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InterviewStore: Send + Sync {
    async fn load_interview_context(&self, interview_id: &str) -> Result<InterviewContext>;

    async fn append_conversation_message(
        &self,
        session_id: &str,
        message: ConversationMessage,
    ) -> Result<()>;
}
