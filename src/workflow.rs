//! The five workflow stages as static, tagged-variant policy descriptions.
//!
//! Each variant carries its precondition/running/ready/failed label triplet
//! and its prompt template as plain data, rather than being modeled as a
//! trait object — the Reconciler and Dispatcher match on the tag.

use crate::ticket::Issue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Workflow {
    Prepare,
    Research,
    Plan,
    Implement,
    ProcessComments,
}

impl Workflow {
    pub fn name(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Research => "research",
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::ProcessComments => "process_comments",
        }
    }

    /// The label applied while this stage is in flight. `Prepare` and
    /// `ProcessComments` are not label-driven stages.
    pub fn running_label(self) -> Option<&'static str> {
        match self {
            Self::Research => Some("researching"),
            Self::Plan => Some("planning"),
            Self::Implement => Some("implementing"),
            Self::Prepare | Self::ProcessComments => None,
        }
    }

    /// The label applied on successful completion.
    pub fn ready_label(self) -> Option<&'static str> {
        match self {
            Self::Research => Some("research_ready"),
            Self::Plan => Some("plan_ready"),
            // Implement transitions running -> reviewing directly, not a
            // `*_ready` label (see §4.3 stage-specific policy).
            Self::Implement | Self::Prepare | Self::ProcessComments => None,
        }
    }

    /// The label applied on terminal failure.
    pub fn failed_label(self) -> Option<&'static str> {
        match self {
            Self::Research => Some("research_failed"),
            Self::Plan => Some("plan_failed"),
            Self::Implement => Some("implementation_failed"),
            Self::Prepare | Self::ProcessComments => None,
        }
    }

    /// The board column whose presence (plus absent running/ready labels)
    /// triggers this stage. `None` for stages that are not column-bound.
    pub fn watched_status(self) -> Option<&'static str> {
        match self {
            Self::Research => Some("Research"),
            Self::Plan => Some("Plan"),
            Self::Implement => Some("Implement"),
            Self::Prepare | Self::ProcessComments => None,
        }
    }

    /// The column an issue advances to once this stage's `*_ready` label is
    /// applied, used only when the `yolo` auto-progress label is present.
    pub fn next_status_on_ready(self) -> Option<&'static str> {
        match self {
            Self::Research => Some("Plan"),
            Self::Plan => Some("Implement"),
            _ => None,
        }
    }

    /// The previous stage's `*_ready` label, cleared when this stage's
    /// running label is applied (§3's "cleared by next stage's running").
    pub fn prior_ready_label(self) -> Option<&'static str> {
        match self {
            Self::Plan => Workflow::Research.ready_label(),
            Self::Implement => Workflow::Plan.ready_label(),
            Self::Research | Self::Prepare | Self::ProcessComments => None,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::Prepare => "haiku",
            Self::Research | Self::Plan => "sonnet",
            Self::Implement => "opus",
            Self::ProcessComments => "sonnet",
        }
    }

    /// Materialize the executor prompt by substituting the issue's identity
    /// into this stage's template. `extra` carries stage-specific arguments
    /// (e.g. the triggering comment body for `ProcessComments`).
    pub fn render_prompt(self, issue: &Issue, extra: Option<&str>) -> String {
        let identity = format!(
            "{}/{}#{}",
            issue.issue_ref.owner, issue.issue_ref.repo, issue.issue_ref.number
        );
        match self {
            Self::Prepare => format!(
                "You are preparing the workspace for issue {identity} (\"{}\").\n\
                 Confirm the workspace is ready for work; make no code changes.",
                issue.title
            ),
            Self::Research => format!(
                "You are researching issue {identity} (\"{}\").\n\
                 Description:\n{}\n\n\
                 Replace the `<!-- kiln:research -->` marked region in the issue body with \
                 your findings. Do not touch any other part of the body.",
                issue.title, issue.body
            ),
            Self::Plan => format!(
                "You are planning the implementation for issue {identity} (\"{}\").\n\
                 Description:\n{}\n\n\
                 Replace the `<!-- kiln:plan -->` marked region in the issue body with your plan.",
                issue.title, issue.body
            ),
            Self::Implement => format!(
                "You are implementing issue {identity} (\"{}\").\n\
                 Description:\n{}\n\n\
                 Make the necessary code changes, commit them, and open a pull request that \
                 closes #{}.",
                issue.title, issue.body, issue.issue_ref.number
            ),
            Self::ProcessComments => format!(
                "Issue {identity} (\"{}\") received a new comment:\n{}\n\n\
                 Update the relevant marked region to address it.",
                issue.title,
                extra.unwrap_or("")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::IssueRef;

    fn issue() -> Issue {
        Issue {
            issue_ref: IssueRef {
                host: "github.com".to_string(),
                owner: "acme".to_string(),
                repo: "web".to_string(),
                number: 42,
            },
            status: "Research".to_string(),
            labels: vec![],
            body: "Some description".to_string(),
            comments: vec![],
            assignees: vec![],
            author: "alice".to_string(),
            title: "Fix the login bug".to_string(),
        }
    }

    #[test]
    fn at_most_one_ing_label_shape_per_workflow() {
        for wf in [Workflow::Research, Workflow::Plan, Workflow::Implement] {
            assert!(wf.running_label().unwrap().ends_with("ing"));
        }
    }

    #[test]
    fn ready_and_running_labels_never_share_a_name() {
        for wf in [Workflow::Research, Workflow::Plan, Workflow::Implement] {
            if let (Some(running), Some(ready)) = (wf.running_label(), wf.ready_label()) {
                assert_ne!(running, ready);
            }
        }
    }

    #[test]
    fn implement_has_no_ready_label() {
        assert_eq!(Workflow::Implement.ready_label(), None);
        assert_eq!(Workflow::Implement.failed_label(), Some("implementation_failed"));
    }

    #[test]
    fn prior_ready_label_chains_research_to_plan_to_implement() {
        assert_eq!(Workflow::Research.prior_ready_label(), None);
        assert_eq!(Workflow::Plan.prior_ready_label(), Some("research_ready"));
        assert_eq!(Workflow::Implement.prior_ready_label(), Some("plan_ready"));
    }

    #[test]
    fn render_prompt_embeds_issue_identity() {
        let prompt = Workflow::Research.render_prompt(&issue(), None);
        assert!(prompt.contains("acme/web#42"));
        assert!(prompt.contains("kiln:research"));
    }

    #[test]
    fn process_comments_embeds_extra_argument() {
        let prompt = Workflow::ProcessComments.render_prompt(&issue(), Some("please tighten section 2"));
        assert!(prompt.contains("please tighten section 2"));
    }
}
