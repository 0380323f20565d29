//! In-memory [`TicketClient`] double for reconciler/dispatcher tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use super::{Comment, Issue, IssueRef, Project, PullRequestHandle, ReactionKind, TicketClient};
use crate::errors::TicketClientError;

#[derive(Default)]
struct State {
    issues: HashMap<String, Issue>,
    last_actor: HashMap<String, (String, DateTime<Utc>)>,
    pull_requests: HashMap<String, PullRequestHandle>,
    reactions: Vec<(u64, ReactionKind)>,
    posted_comments: Vec<(IssueRef, String)>,
}

pub struct FakeTicketClient {
    state: Mutex<State>,
}

impl Default for FakeTicketClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTicketClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub fn add_issue(&self, issue: Issue) {
        self.state.lock().unwrap().issues.insert(issue.issue_ref.key(), issue);
    }

    pub fn set_last_actor(&self, issue_ref: &IssueRef, actor: &str, at: DateTime<Utc>) {
        self.state
            .lock()
            .unwrap()
            .last_actor
            .insert(issue_ref.key(), (actor.to_string(), at));
    }

    pub fn set_linked_pr(&self, issue_ref: &IssueRef, pr: PullRequestHandle) {
        self.state.lock().unwrap().pull_requests.insert(issue_ref.key(), pr);
    }

    pub fn issue(&self, issue_ref: &IssueRef) -> Issue {
        self.state.lock().unwrap().issues.get(&issue_ref.key()).unwrap().clone()
    }

    pub fn posted_comments(&self) -> Vec<(IssueRef, String)> {
        self.state.lock().unwrap().posted_comments.clone()
    }

    pub fn reactions(&self) -> Vec<(u64, ReactionKind)> {
        self.state.lock().unwrap().reactions.clone()
    }
}

#[async_trait]
impl TicketClient for FakeTicketClient {
    async fn list_project_issues(
        &self,
        _project: &Project,
        watched_statuses: &[String],
    ) -> Result<Vec<Issue>, TicketClientError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .issues
            .values()
            .filter(|i| watched_statuses.is_empty() || watched_statuses.iter().any(|s| s == &i.status))
            .cloned()
            .collect())
    }

    async fn get_issue(&self, issue_ref: &IssueRef) -> Result<Issue, TicketClientError> {
        self.state
            .lock()
            .unwrap()
            .issues
            .get(&issue_ref.key())
            .cloned()
            .ok_or_else(|| TicketClientError::NotFound(issue_ref.key()))
    }

    async fn list_comments(
        &self,
        issue_ref: &IssueRef,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Comment>, TicketClientError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .issues
            .get(&issue_ref.key())
            .map(|i| i.comments.clone())
            .unwrap_or_default())
    }

    async fn add_label(&self, issue_ref: &IssueRef, label: &str) -> Result<(), TicketClientError> {
        let mut state = self.state.lock().unwrap();
        if let Some(issue) = state.issues.get_mut(&issue_ref.key())
            && !issue.labels.iter().any(|l| l == label)
        {
            issue.labels.push(label.to_string());
        }
        Ok(())
    }

    async fn remove_label(&self, issue_ref: &IssueRef, label: &str) -> Result<(), TicketClientError> {
        let mut state = self.state.lock().unwrap();
        if let Some(issue) = state.issues.get_mut(&issue_ref.key()) {
            issue.labels.retain(|l| l != label);
        }
        Ok(())
    }

    async fn update_body(&self, issue_ref: &IssueRef, new_body: &str) -> Result<(), TicketClientError> {
        let mut state = self.state.lock().unwrap();
        if let Some(issue) = state.issues.get_mut(&issue_ref.key()) {
            issue.body = new_body.to_string();
        }
        Ok(())
    }

    async fn move_column(&self, issue_ref: &IssueRef, target_status: &str) -> Result<(), TicketClientError> {
        let mut state = self.state.lock().unwrap();
        if let Some(issue) = state.issues.get_mut(&issue_ref.key()) {
            issue.status = target_status.to_string();
        }
        Ok(())
    }

    async fn add_reaction(
        &self,
        _issue_ref: &IssueRef,
        comment_id: u64,
        kind: ReactionKind,
    ) -> Result<(), TicketClientError> {
        self.state.lock().unwrap().reactions.push((comment_id, kind));
        Ok(())
    }

    async fn post_comment(&self, issue_ref: &IssueRef, body: &str) -> Result<(), TicketClientError> {
        self.state
            .lock()
            .unwrap()
            .posted_comments
            .push((issue_ref.clone(), body.to_string()));
        Ok(())
    }

    async fn find_linked_pr(
        &self,
        issue_ref: &IssueRef,
    ) -> Result<Option<PullRequestHandle>, TicketClientError> {
        Ok(self.state.lock().unwrap().pull_requests.get(&issue_ref.key()).cloned())
    }

    async fn close_pr(&self, _issue_ref: &IssueRef, _pr_number: u64) -> Result<(), TicketClientError> {
        Ok(())
    }

    async fn last_status_change_actor(
        &self,
        issue_ref: &IssueRef,
    ) -> Result<Option<(String, DateTime<Utc>)>, TicketClientError> {
        Ok(self.state.lock().unwrap().last_actor.get(&issue_ref.key()).cloned())
    }

    async fn granted_token_scopes(&self) -> Result<Vec<String>, TicketClientError> {
        Ok(vec!["repo".to_string(), "read:org".to_string()])
    }
}
