//! The opaque issue-tracker capability the engine is built against.
//!
//! [`TicketClient`] is the only seam between the engine and the outside
//! tracker: one implementation instance is constructed per daemon (GitHub or
//! GitHub Enterprise), and the engine is agnostic to which. Retries and
//! error classification live behind the trait, inside implementations.

pub mod github;
#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::TicketClientError;

/// Global identity of an issue: `(hostname, owner, repo, number)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssueRef {
    pub host: String,
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl std::fmt::Display for IssueRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}#{}", self.host, self.owner, self.repo, self.number)
    }
}

impl IssueRef {
    pub fn key(&self) -> String {
        format!("{}/{}/{}#{}", self.host, self.owner, self.repo, self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionKind {
    Eyes,
    ThumbsUp,
    Confused,
}

impl ReactionKind {
    pub fn as_api_str(self) -> &'static str {
        match self {
            Self::Eyes => "eyes",
            Self::ThumbsUp => "+1",
            Self::Confused => "confused",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PullRequestHandle {
    pub number: u64,
    pub url: String,
    pub is_ready_for_review: bool,
    pub is_merged: bool,
    pub is_closed: bool,
}

#[derive(Debug, Clone)]
pub struct Issue {
    pub issue_ref: IssueRef,
    pub status: String,
    pub labels: Vec<String>,
    pub body: String,
    pub comments: Vec<Comment>,
    pub assignees: Vec<String>,
    pub author: String,
    pub title: String,
}

impl Issue {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// The project the engine watches, identified by URL.
#[derive(Debug, Clone)]
pub struct Project {
    pub url: String,
}

/// The opaque issue-tracker capability set described in the engine's
/// external-interfaces contract. Every operation that can fail transiently
/// retries internally; callers only see [`TicketClientError`] kinds that are
/// not worth retrying further up the stack.
#[async_trait]
pub trait TicketClient: Send + Sync {
    async fn list_project_issues(
        &self,
        project: &Project,
        watched_statuses: &[String],
    ) -> Result<Vec<Issue>, TicketClientError>;

    /// Re-fetch a single issue, used to observe a body mutation the executor
    /// made directly (e.g. for the comment-processor's before/after diff).
    async fn get_issue(&self, issue_ref: &IssueRef) -> Result<Issue, TicketClientError>;

    async fn list_comments(
        &self,
        issue_ref: &IssueRef,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Comment>, TicketClientError>;

    async fn add_label(&self, issue_ref: &IssueRef, label: &str) -> Result<(), TicketClientError>;

    async fn remove_label(&self, issue_ref: &IssueRef, label: &str) -> Result<(), TicketClientError>;

    async fn update_body(&self, issue_ref: &IssueRef, new_body: &str) -> Result<(), TicketClientError>;

    async fn move_column(&self, issue_ref: &IssueRef, target_status: &str) -> Result<(), TicketClientError>;

    async fn add_reaction(
        &self,
        issue_ref: &IssueRef,
        comment_id: u64,
        kind: ReactionKind,
    ) -> Result<(), TicketClientError>;

    async fn post_comment(&self, issue_ref: &IssueRef, body: &str) -> Result<(), TicketClientError>;

    async fn find_linked_pr(
        &self,
        issue_ref: &IssueRef,
    ) -> Result<Option<PullRequestHandle>, TicketClientError>;

    async fn close_pr(&self, issue_ref: &IssueRef, pr_number: u64) -> Result<(), TicketClientError>;

    /// Username and timestamp of whoever last moved the issue into its
    /// current column, read from the project's activity log. `None` means
    /// the actor could not be established (the authorization gate denies).
    async fn last_status_change_actor(
        &self,
        issue_ref: &IssueRef,
    ) -> Result<Option<(String, DateTime<Utc>)>, TicketClientError>;

    /// Scopes granted to the configured credential, for the startup
    /// excessive-scope refusal check.
    async fn granted_token_scopes(&self) -> Result<Vec<String>, TicketClientError>;
}
