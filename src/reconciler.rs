//! Per-issue classification: the priority chain in §4.1, kept as a pure
//! function over a pre-gathered [`ClassificationContext`] so it is testable
//! without a network double.

use crate::ticket::{Issue, PullRequestHandle};
use crate::workflow::Workflow;

pub const RESET_LABEL: &str = "reset";
pub const YOLO_LABEL: &str = "yolo";
pub const REVIEWING_LABEL: &str = "reviewing";
pub const CLEANED_UP_LABEL: &str = "cleaned_up";
pub const VALIDATE_STATUS: &str = "Validate";
pub const DONE_STATUS: &str = "Done";
pub const BACKLOG_STATUS: &str = "Backlog";

const STAGE_WORKFLOWS: [Workflow; 3] = [Workflow::Research, Workflow::Plan, Workflow::Implement];

#[derive(Debug, Clone)]
pub struct PendingComment {
    pub id: u64,
    pub author: String,
    pub body: String,
}

/// Everything the pure classifier needs, gathered ahead of time by async
/// calls to the `TicketClient`, database and dispatcher.
#[derive(Debug, Clone, Default)]
pub struct ClassificationContext {
    pub in_flight: bool,
    pub authorized_mover: bool,
    pub pending_comment: Option<PendingComment>,
    pub linked_pr: Option<PullRequestHandlePlain>,
}

/// A plain-data mirror of [`PullRequestHandle`] so the classifier doesn't
/// need the tracker-facing type in its signature.
#[derive(Debug, Clone)]
pub struct PullRequestHandlePlain {
    pub number: u64,
    pub is_ready_for_review: bool,
    pub is_merged: bool,
    pub is_closed: bool,
}

impl From<&PullRequestHandle> for PullRequestHandlePlain {
    fn from(pr: &PullRequestHandle) -> Self {
        Self {
            number: pr.number,
            is_ready_for_review: pr.is_ready_for_review,
            is_merged: pr.is_merged,
            is_closed: pr.is_closed,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CandidateAction {
    Reset,
    CrashRecovery { workflow: Workflow },
    CommentIteration { comment: PendingComment },
    StageTrigger { workflow: Workflow },
    MoveToValidate,
    MoveToDoneAndCleanup,
}

/// Classify a single issue per the priority chain: reset > crash recovery >
/// comment iteration > stage trigger > completion handling.
pub fn classify(issue: &Issue, ctx: &ClassificationContext) -> Option<CandidateAction> {
    if issue.has_label(RESET_LABEL) {
        return Some(CandidateAction::Reset);
    }

    for workflow in STAGE_WORKFLOWS {
        if let Some(label) = workflow.running_label()
            && issue.has_label(label)
            && !ctx.in_flight
        {
            return Some(CandidateAction::CrashRecovery { workflow });
        }
    }

    if matches!(issue.status.as_str(), "Research" | "Plan")
        && let Some(comment) = &ctx.pending_comment
    {
        return Some(CandidateAction::CommentIteration {
            comment: comment.clone(),
        });
    }

    for workflow in STAGE_WORKFLOWS {
        if workflow.watched_status() == Some(issue.status.as_str()) {
            let running_absent = workflow.running_label().is_none_or(|l| !issue.has_label(l));
            let ready_absent = workflow.ready_label().is_none_or(|l| !issue.has_label(l));
            if running_absent && ready_absent && ctx.authorized_mover {
                return Some(CandidateAction::StageTrigger { workflow });
            }
        }
    }

    if issue.has_label(REVIEWING_LABEL)
        && let Some(pr) = &ctx.linked_pr
    {
        if pr.is_merged || pr.is_closed {
            return Some(CandidateAction::MoveToDoneAndCleanup);
        }
        if pr.is_ready_for_review {
            return Some(CandidateAction::MoveToValidate);
        }
    }

    None
}

/// Whether an action on `issue` is authorized: the user who last moved it
/// into its current column must be in the allow-list. `None` actor denies.
pub fn authorize_mover(last_actor: Option<&str>, allow_list: &[String]) -> bool {
    match last_actor {
        Some(actor) => allow_list.iter().any(|a| a == actor),
        None => false,
    }
}

pub fn authorize_comment_author(author: &str, allow_list: &[String]) -> bool {
    allow_list.iter().any(|a| a == author)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::IssueRef;

    fn issue(status: &str, labels: &[&str]) -> Issue {
        Issue {
            issue_ref: IssueRef {
                host: "github.com".into(),
                owner: "acme".into(),
                repo: "web".into(),
                number: 42,
            },
            status: status.to_string(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            body: String::new(),
            comments: vec![],
            assignees: vec![],
            author: "alice".to_string(),
            title: "Fix the login bug".to_string(),
        }
    }

    #[test]
    fn reset_label_wins_over_everything_else() {
        let issue = issue("Implement", &["reset", "implementing"]);
        let ctx = ClassificationContext {
            in_flight: true,
            authorized_mover: true,
            ..Default::default()
        };
        assert!(matches!(classify(&issue, &ctx), Some(CandidateAction::Reset)));
    }

    #[test]
    fn running_label_without_in_memory_run_triggers_crash_recovery() {
        let issue = issue("Research", &["researching"]);
        let ctx = ClassificationContext {
            in_flight: false,
            ..Default::default()
        };
        assert!(matches!(
            classify(&issue, &ctx),
            Some(CandidateAction::CrashRecovery {
                workflow: Workflow::Research
            })
        ));
    }

    #[test]
    fn running_label_with_in_memory_run_does_nothing() {
        let issue = issue("Research", &["researching"]);
        let ctx = ClassificationContext {
            in_flight: true,
            ..Default::default()
        };
        assert!(classify(&issue, &ctx).is_none());
    }

    #[test]
    fn unauthorized_stage_trigger_is_not_scheduled() {
        let issue = issue("Research", &[]);
        let ctx = ClassificationContext {
            authorized_mover: false,
            ..Default::default()
        };
        assert!(classify(&issue, &ctx).is_none());
    }

    #[test]
    fn authorized_stage_trigger_schedules_workflow() {
        let issue = issue("Research", &[]);
        let ctx = ClassificationContext {
            authorized_mover: true,
            ..Default::default()
        };
        assert!(matches!(
            classify(&issue, &ctx),
            Some(CandidateAction::StageTrigger {
                workflow: Workflow::Research
            })
        ));
    }

    #[test]
    fn ready_label_present_blocks_stage_trigger() {
        let issue = issue("Research", &["research_ready"]);
        let ctx = ClassificationContext {
            authorized_mover: true,
            ..Default::default()
        };
        assert!(classify(&issue, &ctx).is_none());
    }

    #[test]
    fn comment_iteration_never_fires_during_implement() {
        let issue = issue("Implement", &["implementing"]);
        let ctx = ClassificationContext {
            in_flight: true,
            pending_comment: Some(PendingComment {
                id: 1,
                author: "alice".to_string(),
                body: "hurry up".to_string(),
            }),
            ..Default::default()
        };
        assert!(!matches!(
            classify(&issue, &ctx),
            Some(CandidateAction::CommentIteration { .. })
        ));
    }

    #[test]
    fn comment_iteration_fires_during_plan() {
        let issue = issue("Plan", &["plan_ready"]);
        let ctx = ClassificationContext {
            pending_comment: Some(PendingComment {
                id: 1,
                author: "alice".to_string(),
                body: "tighten section 2".to_string(),
            }),
            ..Default::default()
        };
        assert!(matches!(
            classify(&issue, &ctx),
            Some(CandidateAction::CommentIteration { .. })
        ));
    }

    #[test]
    fn reviewing_with_ready_pr_moves_to_validate() {
        let issue = issue("Implement", &["reviewing"]);
        let ctx = ClassificationContext {
            linked_pr: Some(PullRequestHandlePlain {
                number: 7,
                is_ready_for_review: true,
                is_merged: false,
                is_closed: false,
            }),
            ..Default::default()
        };
        assert!(matches!(classify(&issue, &ctx), Some(CandidateAction::MoveToValidate)));
    }

    #[test]
    fn reviewing_with_merged_pr_moves_to_done() {
        let issue = issue("Implement", &["reviewing"]);
        let ctx = ClassificationContext {
            linked_pr: Some(PullRequestHandlePlain {
                number: 7,
                is_ready_for_review: true,
                is_merged: true,
                is_closed: false,
            }),
            ..Default::default()
        };
        assert!(matches!(
            classify(&issue, &ctx),
            Some(CandidateAction::MoveToDoneAndCleanup)
        ));
    }

    #[test]
    fn authorize_mover_denies_unknown_actor() {
        assert!(!authorize_mover(None, &["alice".to_string()]));
        assert!(!authorize_mover(Some("mallory"), &["alice".to_string()]));
        assert!(authorize_mover(Some("alice"), &["alice".to_string()]));
    }
}
