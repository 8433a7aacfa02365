//! Core logic for the Parley interview session runtime: the
//! provider/credential model, the fallback resolver, the runtime
//! health cache, the turn controller, and the collaborator seams for
//! AI generation and persistence.
//!
//! This crate owns no sockets and no server state; the gateway
//! service drives it.

pub mod context;
pub mod gateway;
pub mod health;
pub mod providers;
pub mod resolver;
pub mod turns;

pub use context::{ConversationMessage, InterviewContext, MessageRole, QuestionPlan};
pub use providers::{CredentialCandidate, CredentialSource, Provider, UsedCredential};
pub use resolver::{CredentialResolver, ResolveError, ResolveRequest, Resolution};
