//! GitHub REST binding for [`super::TicketClient`].
//!
//! Columns are modeled as a `status:<name>` label (GitHub issues have no
//! native kanban-column field outside Projects, which is a separate API);
//! `MoveColumn` therefore removes any existing `status:*` label and adds the
//! new one. Activity for `LastStatusChangeActor` is read from the issue's
//! timeline events, filtered to label/labeled events matching `status:*`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use super::{Comment, Issue, IssueRef, Project, PullRequestHandle, ReactionKind, TicketClient};
use crate::errors::TicketClientError;

const STATUS_LABEL_PREFIX: &str = "status:";

pub struct GitHubTicketClient {
    client: Client,
    api_base: String,
    token: String,
}

impl GitHubTicketClient {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .user_agent("kiln-engine")
                .build()
                .expect("failed to build reqwest client"),
            api_base: api_base.into(),
            token: token.into(),
        }
    }

    fn repo_url(&self, owner: &str, repo: &str) -> String {
        format!("{}/repos/{}/{}", self.api_base, owner, repo)
    }

    fn issue_url(&self, issue_ref: &IssueRef) -> String {
        format!(
            "{}/issues/{}",
            self.repo_url(&issue_ref.owner, &issue_ref.repo),
            issue_ref.number
        )
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, TicketClientError> {
        let resp = req
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| TicketClientError::Transient(e.to_string()))?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(TicketClientError::Auth(resp.status().to_string()))
            }
            StatusCode::NOT_FOUND => Err(TicketClientError::NotFound(resp.status().to_string())),
            s if s.is_server_error() => Err(TicketClientError::Transient(s.to_string())),
            s if s.is_success() => Ok(resp),
            s => Err(TicketClientError::Transient(s.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    body: Option<String>,
    labels: Vec<GhLabel>,
    user: Option<GhUser>,
    assignees: Vec<GhUser>,
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GhComment {
    id: u64,
    user: Option<GhUser>,
    created_at: DateTime<Utc>,
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhTimelineEvent {
    event: String,
    actor: Option<GhUser>,
    label: Option<GhLabel>,
    created_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl TicketClient for GitHubTicketClient {
    async fn list_project_issues(
        &self,
        project: &Project,
        watched_statuses: &[String],
    ) -> Result<Vec<Issue>, TicketClientError> {
        let (owner, repo) = parse_owner_repo(&project.url)?;
        let url = format!("{}?state=open&per_page=100", self.repo_url(&owner, &repo));
        let resp = self.send(self.client.get(&url)).await?;
        let items: Vec<GhIssue> = resp
            .json()
            .await
            .map_err(|e| TicketClientError::Transient(e.to_string()))?;

        let mut issues = Vec::new();
        for item in items {
            if item.pull_request.is_some() {
                continue;
            }
            let labels: Vec<String> = item.labels.into_iter().map(|l| l.name).collect();
            let status = labels
                .iter()
                .find_map(|l| l.strip_prefix(STATUS_LABEL_PREFIX).map(|s| s.to_string()))
                .unwrap_or_else(|| "Backlog".to_string());
            if !watched_statuses.is_empty() && !watched_statuses.iter().any(|s| s == &status) {
                continue;
            }
            issues.push(Issue {
                issue_ref: IssueRef {
                    host: "github.com".to_string(),
                    owner: owner.clone(),
                    repo: repo.clone(),
                    number: item.number,
                },
                status,
                labels,
                body: item.body.unwrap_or_default(),
                comments: Vec::new(),
                assignees: item.assignees.into_iter().map(|u| u.login).collect(),
                author: item.user.map(|u| u.login).unwrap_or_default(),
                title: item.title,
            });
        }
        Ok(issues)
    }

    async fn get_issue(&self, issue_ref: &IssueRef) -> Result<Issue, TicketClientError> {
        let resp = self.send(self.client.get(self.issue_url(issue_ref))).await?;
        let item: GhIssue = resp
            .json()
            .await
            .map_err(|e| TicketClientError::Transient(e.to_string()))?;
        let labels: Vec<String> = item.labels.into_iter().map(|l| l.name).collect();
        let status = labels
            .iter()
            .find_map(|l| l.strip_prefix(STATUS_LABEL_PREFIX).map(|s| s.to_string()))
            .unwrap_or_else(|| "Backlog".to_string());
        Ok(Issue {
            issue_ref: issue_ref.clone(),
            status,
            labels,
            body: item.body.unwrap_or_default(),
            comments: Vec::new(),
            assignees: item.assignees.into_iter().map(|u| u.login).collect(),
            author: item.user.map(|u| u.login).unwrap_or_default(),
            title: item.title,
        })
    }

    async fn list_comments(
        &self,
        issue_ref: &IssueRef,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Comment>, TicketClientError> {
        let mut url = format!("{}/comments?per_page=100", self.issue_url(issue_ref));
        if let Some(since) = since {
            url.push_str(&format!("&since={}", since.to_rfc3339()));
        }
        let resp = self.send(self.client.get(&url)).await?;
        let items: Vec<GhComment> = resp
            .json()
            .await
            .map_err(|e| TicketClientError::Transient(e.to_string()))?;
        Ok(items
            .into_iter()
            .map(|c| Comment {
                id: c.id,
                author: c.user.map(|u| u.login).unwrap_or_default(),
                created_at: c.created_at,
                body: c.body.unwrap_or_default(),
            })
            .collect())
    }

    async fn add_label(&self, issue_ref: &IssueRef, label: &str) -> Result<(), TicketClientError> {
        let url = format!("{}/labels", self.issue_url(issue_ref));
        self.send(self.client.post(&url).json(&serde_json::json!({ "labels": [label] })))
            .await?;
        Ok(())
    }

    async fn remove_label(&self, issue_ref: &IssueRef, label: &str) -> Result<(), TicketClientError> {
        let url = format!("{}/labels/{}", self.issue_url(issue_ref), label);
        match self.send(self.client.delete(&url)).await {
            Ok(_) => Ok(()),
            Err(TicketClientError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn update_body(&self, issue_ref: &IssueRef, new_body: &str) -> Result<(), TicketClientError> {
        let url = self.issue_url(issue_ref);
        self.send(self.client.patch(&url).json(&serde_json::json!({ "body": new_body })))
            .await?;
        Ok(())
    }

    async fn move_column(&self, issue_ref: &IssueRef, target_status: &str) -> Result<(), TicketClientError> {
        let current = self
            .send(self.client.get(self.issue_url(issue_ref)))
            .await?
            .json::<GhIssue>()
            .await
            .map_err(|e| TicketClientError::Transient(e.to_string()))?;
        for label in &current.labels {
            if label.name.starts_with(STATUS_LABEL_PREFIX) {
                self.remove_label(issue_ref, &label.name).await?;
            }
        }
        self.add_label(issue_ref, &format!("{}{}", STATUS_LABEL_PREFIX, target_status))
            .await
    }

    async fn add_reaction(
        &self,
        issue_ref: &IssueRef,
        comment_id: u64,
        kind: ReactionKind,
    ) -> Result<(), TicketClientError> {
        let url = format!(
            "{}/comments/{}/reactions",
            self.repo_url(&issue_ref.owner, &issue_ref.repo),
            comment_id
        );
        self.send(
            self.client
                .post(&url)
                .json(&serde_json::json!({ "content": kind.as_api_str() })),
        )
        .await?;
        Ok(())
    }

    async fn post_comment(&self, issue_ref: &IssueRef, body: &str) -> Result<(), TicketClientError> {
        let url = format!("{}/comments", self.issue_url(issue_ref));
        self.send(self.client.post(&url).json(&serde_json::json!({ "body": body })))
            .await?;
        Ok(())
    }

    async fn find_linked_pr(
        &self,
        issue_ref: &IssueRef,
    ) -> Result<Option<PullRequestHandle>, TicketClientError> {
        let query = format!(
            "repo:{}/{} is:pr in:body \"Closes #{}\"",
            issue_ref.owner, issue_ref.repo, issue_ref.number
        );
        let url = format!("{}/search/issues?q={}", self.api_base, urlencoding_encode(&query));
        let resp = self.send(self.client.get(&url)).await?;

        #[derive(Deserialize)]
        struct SearchResult {
            items: Vec<SearchItem>,
        }
        #[derive(Deserialize)]
        struct SearchItem {
            number: u64,
            html_url: String,
            state: String,
            draft: Option<bool>,
            pull_request: Option<PrMergeInfo>,
        }
        #[derive(Deserialize)]
        struct PrMergeInfo {
            merged_at: Option<DateTime<Utc>>,
        }

        let parsed: SearchResult = resp
            .json()
            .await
            .map_err(|e| TicketClientError::Transient(e.to_string()))?;

        Ok(parsed.items.into_iter().next().map(|item| PullRequestHandle {
            number: item.number,
            url: item.html_url,
            is_ready_for_review: !item.draft.unwrap_or(false),
            is_merged: item
                .pull_request
                .as_ref()
                .and_then(|p| p.merged_at)
                .is_some(),
            is_closed: item.state == "closed",
        }))
    }

    async fn close_pr(&self, issue_ref: &IssueRef, pr_number: u64) -> Result<(), TicketClientError> {
        let url = format!(
            "{}/pulls/{}",
            self.repo_url(&issue_ref.owner, &issue_ref.repo),
            pr_number
        );
        self.send(self.client.patch(&url).json(&serde_json::json!({ "state": "closed" })))
            .await?;
        Ok(())
    }

    async fn last_status_change_actor(
        &self,
        issue_ref: &IssueRef,
    ) -> Result<Option<(String, DateTime<Utc>)>, TicketClientError> {
        let url = format!("{}/timeline?per_page=100", self.issue_url(issue_ref));
        let resp = self
            .send(
                self.client
                    .get(&url)
                    .header("Accept", "application/vnd.github.mockingbird-preview+json"),
            )
            .await?;
        let events: Vec<GhTimelineEvent> = resp
            .json()
            .await
            .map_err(|e| TicketClientError::Transient(e.to_string()))?;

        Ok(events
            .into_iter()
            .rev()
            .find(|e| {
                e.event == "labeled"
                    && e.label
                        .as_ref()
                        .map(|l| l.name.starts_with(STATUS_LABEL_PREFIX))
                        .unwrap_or(false)
            })
            .and_then(|e| match (e.actor, e.created_at) {
                (Some(actor), Some(ts)) => Some((actor.login, ts)),
                _ => None,
            }))
    }

    async fn granted_token_scopes(&self) -> Result<Vec<String>, TicketClientError> {
        let resp = self.send(self.client.get(&self.api_base)).await?;
        let scopes = resp
            .headers()
            .get("x-oauth-scopes")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Ok(scopes)
    }
}

fn parse_owner_repo(url: &str) -> Result<(String, String), TicketClientError> {
    let trimmed = url.trim_end_matches('/');
    let segments: Vec<&str> = trimmed.split('/').collect();
    match segments.as_slice() {
        [.., owner, repo] if segments.len() >= 5 && !owner.is_empty() && !repo.is_empty() => {
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => Err(TicketClientError::NotFound(format!("invalid project url: {url}"))),
    }
}

fn urlencoding_encode(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => (b as char).to_string(),
            b' ' => "%20".to_string(),
            _ => format!("%{:02X}", b),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_owner_repo_from_https_url() {
        let (owner, repo) = parse_owner_repo("https://github.com/acme/web").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(repo, "web");
    }

    #[test]
    fn parses_owner_repo_trailing_slash() {
        let (owner, repo) = parse_owner_repo("https://github.com/acme/web/").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(repo, "web");
    }

    #[test]
    fn rejects_url_without_owner_repo() {
        assert!(parse_owner_repo("https://github.com").is_err());
    }

    #[test]
    fn urlencoding_escapes_spaces_and_symbols() {
        assert_eq!(urlencoding_encode("a b#1"), "a%20b%231");
    }
}
