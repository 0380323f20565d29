//! Wires configuration, tracker, database, workspace manager and dispatcher
//! together into the reconciliation loop and the four-phase workflow
//! execution procedure (§4.3).

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::body::{self, RegionKind};
use crate::config::EngineConfig;
use crate::db::{Database, RunOutcome};
use crate::dispatcher::Dispatcher;
use crate::errors::{EngineError, ExecutorError};
use crate::executor::{self, ExecutorInvocation};
use crate::reconciler::{
    self, CandidateAction, ClassificationContext, PendingComment, PullRequestHandlePlain,
    BACKLOG_STATUS, CLEANED_UP_LABEL, DONE_STATUS, REVIEWING_LABEL, VALIDATE_STATUS, YOLO_LABEL,
};
use crate::ticket::{Issue, IssueRef, Project, ReactionKind, TicketClient};
use crate::workflow::Workflow;
use crate::workspace::WorkspaceManager;

/// Every kiln-managed label, stripped unconditionally by `reset`.
const KILN_LABELS: &[&str] = &[
    "reset",
    "researching",
    "research_ready",
    "research_failed",
    "planning",
    "plan_ready",
    "plan_failed",
    "implementing",
    "implementation_failed",
    REVIEWING_LABEL,
    CLEANED_UP_LABEL,
    YOLO_LABEL,
];

const BASE_BRANCH: &str = "main";

pub struct Engine<T: TicketClient> {
    config: Arc<EngineConfig>,
    ticket: Arc<T>,
    db: Arc<Database>,
    workspaces: Arc<WorkspaceManager>,
    dispatcher: Arc<Dispatcher>,
}

impl<T: TicketClient> Clone for Engine<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            ticket: self.ticket.clone(),
            db: self.db.clone(),
            workspaces: self.workspaces.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<T: TicketClient + 'static> Engine<T> {
    pub fn new(config: EngineConfig, ticket: T, db: Database, workspaces: WorkspaceManager) -> Self {
        let max_concurrent = config.max_concurrent_workflows;
        Self {
            config: Arc::new(config),
            ticket: Arc::new(ticket),
            db: Arc::new(db),
            workspaces: Arc::new(workspaces),
            dispatcher: Arc::new(Dispatcher::new(max_concurrent)),
        }
    }

    /// Refuse to start if the configured credential carries broader scopes
    /// than the engine needs.
    pub async fn check_credential_scopes(&self) -> Result<(), EngineError> {
        let granted = self.ticket.granted_token_scopes().await?;
        let excessive: Vec<&String> = granted
            .iter()
            .filter(|s| !crate::config::REQUIRED_TOKEN_SCOPES.contains(&s.as_str()))
            .collect();
        if !excessive.is_empty() {
            return Err(crate::errors::ConfigError::ExcessiveScope(
                excessive.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
            )
            .into());
        }
        Ok(())
    }

    /// Run the reconciliation loop until `shutdown` is triggered, then drain
    /// in-flight actions within a grace period.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), EngineError> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.tick() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(jittered_interval(self.config.poll_interval)) => {}
            }
        }
        info!("shutting down, draining in-flight actions");
        self.dispatcher.shutdown(Duration::from_secs(30)).await;
        Ok(())
    }

    async fn tick(&self) {
        for project_url in self.config.project_urls.clone() {
            let project = Project { url: project_url.clone() };
            match self
                .ticket
                .list_project_issues(&project, &self.config.watched_statuses)
                .await
            {
                Ok(issues) => {
                    for issue in issues {
                        let issue_ref = issue.issue_ref.clone();
                        if let Err(e) = self.process_issue(issue).await {
                            warn!(issue = %issue_ref, error = %e, "failed to process issue, skipping");
                        }
                    }
                }
                Err(e) => warn!(project = %project_url, error = %e, "failed to list project issues"),
            }
        }
    }

    async fn process_issue(&self, issue: Issue) -> Result<(), EngineError> {
        let ctx = self.gather_context(&issue).await?;
        let Some(action) = reconciler::classify(&issue, &ctx) else {
            return Ok(());
        };
        self.dispatch(issue, action).await;
        Ok(())
    }

    async fn gather_context(&self, issue: &Issue) -> Result<ClassificationContext, EngineError> {
        let issue_key = issue.issue_ref.key();
        let in_flight = self.dispatcher.is_in_flight(&issue_key).await;

        let mut pending_comment = None;
        if matches!(issue.status.as_str(), "Research" | "Plan") {
            let comments = self.ticket.list_comments(&issue.issue_ref, None).await?;
            for c in comments {
                if self.db.has_processed_comment(&issue.issue_ref, c.id)? {
                    continue;
                }
                if !reconciler::authorize_comment_author(&c.author, &self.config.allowed_usernames) {
                    continue;
                }
                pending_comment = Some(PendingComment {
                    id: c.id,
                    author: c.author,
                    body: c.body,
                });
                break;
            }
        }

        // Reset bypasses the gate entirely (§4.1); skip the extra call.
        let authorized_mover = if issue.has_label("reset") {
            false
        } else {
            let actor = self.ticket.last_status_change_actor(&issue.issue_ref).await?;
            reconciler::authorize_mover(actor.map(|(a, _)| a).as_deref(), &self.config.allowed_usernames)
        };

        let linked_pr = if issue.has_label(REVIEWING_LABEL) {
            self.ticket
                .find_linked_pr(&issue.issue_ref)
                .await?
                .as_ref()
                .map(PullRequestHandlePlain::from)
        } else {
            None
        };

        Ok(ClassificationContext {
            in_flight,
            authorized_mover,
            pending_comment,
            linked_pr,
        })
    }

    async fn dispatch(&self, issue: Issue, action: CandidateAction) {
        let issue_key = issue.issue_ref.key();
        match action {
            CandidateAction::Reset => {
                self.dispatcher.cancel_and_wait(&issue_key).await;
                let engine = self.clone();
                self.dispatcher
                    .submit(issue_key, move |cancel| async move { engine.run_reset(issue, cancel).await })
                    .await;
            }
            CandidateAction::CrashRecovery { workflow } | CandidateAction::StageTrigger { workflow } => {
                let engine = self.clone();
                self.dispatcher
                    .submit(issue_key, move |cancel| async move {
                        engine.run_workflow(issue, workflow, cancel).await
                    })
                    .await;
            }
            CandidateAction::CommentIteration { comment } => {
                let engine = self.clone();
                self.dispatcher
                    .submit(issue_key, move |cancel| async move {
                        engine.run_comment_processor(issue, comment, cancel).await
                    })
                    .await;
            }
            CandidateAction::MoveToValidate => {
                if let Err(e) = self.ticket.move_column(&issue.issue_ref, VALIDATE_STATUS).await {
                    warn!(issue = %issue.issue_ref, error = %e, "failed to move issue to Validate");
                }
            }
            CandidateAction::MoveToDoneAndCleanup => {
                if let Err(e) = self.ticket.move_column(&issue.issue_ref, DONE_STATUS).await {
                    warn!(issue = %issue.issue_ref, error = %e, "failed to move issue to Done");
                }
                let branch = WorkspaceManager::branch_name(&issue.issue_ref, &issue.title);
                let _ = self.workspaces.cleanup_for_issue(&issue.issue_ref, &branch, false).await;
                let _ = self.ticket.add_label(&issue.issue_ref, CLEANED_UP_LABEL).await;
            }
        }
    }

    /// The four-phase Acquire/Prepare/Invoke/Settle procedure for a
    /// column-bound stage (Research, Plan, Implement).
    async fn run_workflow(&self, issue: Issue, workflow: Workflow, cancel: CancellationToken) {
        let issue_ref = issue.issue_ref.clone();

        // Acquire.
        if let Some(label) = workflow.running_label() {
            let _ = self.ticket.add_label(&issue_ref, label).await;
        }
        if let Some(prior_ready) = workflow.prior_ready_label() {
            let _ = self.ticket.remove_label(&issue_ref, prior_ready).await;
        }
        let log_path = self.run_log_path(&issue_ref, workflow);
        let run_id = match self.db.create_run(&issue_ref, workflow.name(), &log_path.to_string_lossy()) {
            Ok(id) => id,
            Err(e) => {
                warn!(issue = %issue_ref, error = %e, "failed to record run, aborting workflow");
                return;
            }
        };

        // Prepare workspace.
        let workspace_path = match self.workspaces.ensure_for_issue(&issue_ref, &issue.title, BASE_BRANCH).await {
            Ok(p) => p,
            Err(e) => {
                warn!(issue = %issue_ref, error = %e, "workspace preparation failed");
                self.settle_failure(&issue_ref, workflow, run_id).await;
                return;
            }
        };

        // Invoke.
        let model = self
            .config
            .model_for_stage(workflow.name())
            .unwrap_or_else(|| workflow.default_model())
            .to_string();
        let prompt = workflow.render_prompt(&issue, None);
        let prior_session = self.db.get_session(&issue_ref, workflow.name()).ok().flatten();
        let mut log_writer = self.open_log_writer(&log_path);

        let invocation = ExecutorInvocation {
            executor_bin: &self.config.executor_bin,
            prompt: &prompt,
            model: &model,
            working_dir: &workspace_path,
            session_id: prior_session.as_deref(),
            aux_config_path: None,
            stage_timeout: self.config.stage_timeout,
            idle_timeout: self.config.idle_timeout,
        };
        let outcome = executor::run_with_retry(&invocation, &cancel, |line| {
            self.write_log_line(&mut log_writer, &issue_ref, line);
        })
        .await;
        self.flush_log(&mut log_writer);

        // Settle.
        match outcome {
            Ok(exec_outcome) => {
                if let Some(sid) = &exec_outcome.session_id {
                    let _ = self.db.set_session(&issue_ref, workflow.name(), sid);
                }
                self.settle_success(&issue, workflow, run_id, exec_outcome.session_id.as_deref()).await;
            }
            Err(ExecutorError::Cancelled) => {
                let _ = self.db.settle_run(run_id, RunOutcome::Cancelled, None);
                if let Some(running) = workflow.running_label() {
                    let _ = self.ticket.remove_label(&issue_ref, running).await;
                }
            }
            Err(ExecutorError::Timeout(_)) | Err(ExecutorError::IdleTimeout(_)) => {
                let _ = self.db.settle_run(run_id, RunOutcome::Timeout, None);
                self.settle_failure(&issue_ref, workflow, run_id).await;
            }
            Err(e) => {
                warn!(issue = %issue_ref, workflow = workflow.name(), error = %e, "workflow failed");
                self.settle_failure(&issue_ref, workflow, run_id).await;
            }
        }
    }

    async fn settle_success(&self, issue: &Issue, workflow: Workflow, run_id: i64, session_id: Option<&str>) {
        let issue_ref = &issue.issue_ref;
        if workflow == Workflow::Implement {
            match self.ticket.find_linked_pr(issue_ref).await {
                Ok(Some(_pr)) => {
                    let _ = self.ticket.add_label(issue_ref, REVIEWING_LABEL).await;
                    if let Some(running) = workflow.running_label() {
                        let _ = self.ticket.remove_label(issue_ref, running).await;
                    }
                    let _ = self.db.settle_run(run_id, RunOutcome::Success, session_id);
                }
                _ => {
                    warn!(issue = %issue_ref, "implement stage exited cleanly but no linked pull request was found");
                    let _ = self.db.settle_run(run_id, RunOutcome::Failure, session_id);
                    self.settle_failure(issue_ref, workflow, run_id).await;
                }
            }
            return;
        }

        if let Some(ready) = workflow.ready_label() {
            let _ = self.ticket.add_label(issue_ref, ready).await;
        }
        if let Some(running) = workflow.running_label() {
            let _ = self.ticket.remove_label(issue_ref, running).await;
        }
        let _ = self.db.settle_run(run_id, RunOutcome::Success, session_id);

        if issue.has_label(YOLO_LABEL)
            && let Some(next) = workflow.next_status_on_ready()
        {
            let _ = self.ticket.move_column(issue_ref, next).await;
        }
    }

    async fn settle_failure(&self, issue_ref: &IssueRef, workflow: Workflow, run_id: i64) {
        if let Some(failed) = workflow.failed_label() {
            let _ = self.ticket.add_label(issue_ref, failed).await;
        }
        if let Some(running) = workflow.running_label() {
            let _ = self.ticket.remove_label(issue_ref, running).await;
        }
        let _ = self.db.settle_run(run_id, RunOutcome::Failure, None);
    }

    /// §4.6: the comment-driven iteration path. Not column-bound; runs
    /// against the single earliest unprocessed authorized comment.
    async fn run_comment_processor(&self, issue: Issue, comment: PendingComment, cancel: CancellationToken) {
        let issue_ref = issue.issue_ref.clone();
        let _ = self.ticket.add_reaction(&issue_ref, comment.id, ReactionKind::Eyes).await;

        let region_kind = if issue.status == "Plan" { RegionKind::Plan } else { RegionKind::Research };
        let before = body::extract_region(&issue.body, region_kind).unwrap_or("").to_string();

        let log_path = self.run_log_path(&issue_ref, Workflow::ProcessComments);
        let run_id = match self.db.create_run(&issue_ref, Workflow::ProcessComments.name(), &log_path.to_string_lossy()) {
            Ok(id) => id,
            Err(e) => {
                warn!(issue = %issue_ref, error = %e, "failed to record comment-processor run");
                return;
            }
        };

        let workspace_path = match self.workspaces.ensure_for_issue(&issue_ref, &issue.title, BASE_BRANCH).await {
            Ok(p) => p,
            Err(e) => {
                warn!(issue = %issue_ref, error = %e, "workspace preparation failed for comment processor");
                let _ = self.db.settle_run(run_id, RunOutcome::Failure, None);
                self.finish_comment(&issue_ref, &comment, false, &before, &before).await;
                return;
            }
        };

        let model = self
            .config
            .model_for_stage(Workflow::ProcessComments.name())
            .unwrap_or_else(|| Workflow::ProcessComments.default_model())
            .to_string();
        let prompt = Workflow::ProcessComments.render_prompt(&issue, Some(&comment.body));
        let mut log_writer = self.open_log_writer(&log_path);

        let invocation = ExecutorInvocation {
            executor_bin: &self.config.executor_bin,
            prompt: &prompt,
            model: &model,
            working_dir: &workspace_path,
            session_id: None,
            aux_config_path: None,
            stage_timeout: self.config.stage_timeout,
            idle_timeout: self.config.idle_timeout,
        };
        let outcome = executor::run_with_retry(&invocation, &cancel, |line| {
            self.write_log_line(&mut log_writer, &issue_ref, line);
        })
        .await;
        self.flush_log(&mut log_writer);

        let success = outcome.is_ok();
        let run_outcome = if success { RunOutcome::Success } else { RunOutcome::Failure };
        let _ = self.db.settle_run(run_id, run_outcome, None);

        let after = match self.ticket.get_issue(&issue_ref).await {
            Ok(fresh) => body::extract_region(&fresh.body, region_kind).unwrap_or("").to_string(),
            Err(_) => before.clone(),
        };

        self.finish_comment(&issue_ref, &comment, success, &before, &after).await;
    }

    async fn finish_comment(&self, issue_ref: &IssueRef, comment: &PendingComment, success: bool, before: &str, after: &str) {
        if before != after {
            let _ = self.ticket.post_comment(issue_ref, &render_diff(before, after)).await;
        }
        let reaction = if success { ReactionKind::ThumbsUp } else { ReactionKind::Confused };
        let _ = self.ticket.add_reaction(issue_ref, comment.id, reaction).await;
        let _ = self.db.mark_comment_processed(issue_ref, comment.id);
    }

    /// `reset`: cancel, close PRs, destroy the workspace, strip regions and
    /// labels, move to Backlog. Bypasses the authorization gate.
    async fn run_reset(&self, issue: Issue, _cancel: CancellationToken) {
        let issue_ref = issue.issue_ref.clone();

        if let Ok(Some(pr)) = self.ticket.find_linked_pr(&issue_ref).await
            && !pr.is_merged
            && !pr.is_closed
        {
            let _ = self.ticket.close_pr(&issue_ref, pr.number).await;
        }

        let branch = WorkspaceManager::branch_name(&issue_ref, &issue.title);
        let _ = self.workspaces.cleanup_for_issue(&issue_ref, &branch, true).await;

        let stripped = body::strip_all_regions(&issue.body);
        if stripped != issue.body {
            let _ = self.ticket.update_body(&issue_ref, &stripped).await;
        }

        for label in KILN_LABELS {
            let _ = self.ticket.remove_label(&issue_ref, label).await;
        }
        let _ = self.ticket.move_column(&issue_ref, BACKLOG_STATUS).await;
    }

    fn run_log_path(&self, issue_ref: &IssueRef, workflow: Workflow) -> PathBuf {
        let ts = chrono::Utc::now().format("%Y%m%d-%H%M");
        self.config
            .logs_dir()
            .join(&issue_ref.host)
            .join(&issue_ref.owner)
            .join(&issue_ref.repo)
            .join(issue_ref.number.to_string())
            .join(format!("{}-{ts}.log", workflow.name()))
    }

    fn open_log_writer(&self, log_path: &std::path::Path) -> Option<std::fs::File> {
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::File::create(log_path)
            .inspect_err(|e| warn!(path = %log_path.display(), error = %e, "failed to open run log file"))
            .ok()
    }

    fn write_log_line(&self, writer: &mut Option<std::fs::File>, issue_ref: &IssueRef, line: &str) {
        let Some(f) = writer else { return };
        let rendered = if self.config.ghes_logs_mask { mask_line(line, issue_ref) } else { line.to_string() };
        let _ = writeln!(f, "{rendered}");
    }

    /// Flushed before the run's terminal database write so a finished `Run`
    /// row is always backed by a complete log file (§4.7).
    fn flush_log(&self, writer: &mut Option<std::fs::File>) {
        if let Some(f) = writer {
            let _ = f.flush();
        }
    }
}

fn render_diff(before: &str, after: &str) -> String {
    format!("Updated in response to this comment.\n\n**Before:**\n{before}\n\n**After:**\n{after}")
}

fn mask_line(line: &str, issue_ref: &IssueRef) -> String {
    line.replace(&issue_ref.host, "***").replace(&issue_ref.owner, "***")
}

fn jittered_interval(base: Duration) -> Duration {
    let jitter_fraction = rand::thread_rng().gen_range(-0.1..=0.1);
    let millis = base.as_millis() as f64 * (1.0 + jitter_fraction);
    Duration::from_millis(millis.max(0.0) as u64)
}
