//! Git worktree lifecycle for each issue's workspace.
//!
//! All mutating Git operations funnel through [`WorkspaceManager`]'s global
//! mutex, since they touch the shared object database of the single
//! underlying repository; per-issue filesystem work is otherwise
//! independent and safe to run concurrently.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Mutex;

use crate::errors::WorkspaceError;
use crate::ticket::IssueRef;
use crate::util::slugify;

const SLUG_MAX_LEN: usize = 32;

pub struct WorkspaceManager {
    /// Path to the canonical, fully-checked-out repository the worktrees
    /// are created from.
    repo_root: PathBuf,
    workspaces_root: PathBuf,
    /// Serializes Git operations that touch shared repository state.
    git_lock: Arc<Mutex<()>>,
}

impl WorkspaceManager {
    pub fn new(repo_root: impl Into<PathBuf>, workspaces_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            workspaces_root: workspaces_root.into(),
            git_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn branch_name(issue_ref: &IssueRef, title: &str) -> String {
        format!("{}-{}", issue_ref.number, slugify(title, SLUG_MAX_LEN))
    }

    fn workspace_path(&self, issue_ref: &IssueRef) -> PathBuf {
        self.workspaces_root
            .join(&issue_ref.host)
            .join(&issue_ref.owner)
            .join(&issue_ref.repo)
            .join(issue_ref.number.to_string())
    }

    /// Ensure a worktree for `issue_ref` exists, on a branch derived from
    /// the issue number and `title`, created from `base_branch` if new.
    /// A no-op if the worktree already exists.
    pub async fn ensure_for_issue(
        &self,
        issue_ref: &IssueRef,
        title: &str,
        base_branch: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let path = self.workspace_path(issue_ref);
        if path.join(".git").exists() {
            return Ok(path);
        }

        let branch = Self::branch_name(issue_ref, title);
        let _guard = self.git_lock.lock().await;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let branch_exists = self.run_git(&["rev-parse", "--verify", &branch]).await.is_ok();

        let mut args: Vec<String> = vec!["worktree".into(), "add".into()];
        if !branch_exists {
            args.push("-b".into());
            args.push(branch.clone());
            args.push(path.to_string_lossy().into_owned());
            args.push(base_branch.to_string());
        } else {
            args.push(path.to_string_lossy().into_owned());
            args.push(branch.clone());
        }
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.run_git(&arg_refs).await?;

        Ok(path)
    }

    /// Remove the worktree and, if fully merged or `force` (as `reset`
    /// does), delete the local branch.
    pub async fn cleanup_for_issue(
        &self,
        issue_ref: &IssueRef,
        branch: &str,
        force: bool,
    ) -> Result<(), WorkspaceError> {
        let path = self.workspace_path(issue_ref);
        let _guard = self.git_lock.lock().await;

        if path.exists() {
            let mut args = vec!["worktree", "remove"];
            if force {
                args.push("--force");
            }
            let path_str = path.to_string_lossy().into_owned();
            args.push(&path_str);
            let _ = self.run_git(&args).await;
        }

        let mut delete_args = vec!["branch"];
        if force {
            delete_args.push("-D");
        } else {
            delete_args.push("-d");
        }
        delete_args.push(branch);
        let _ = self.run_git(&delete_args).await;

        Ok(())
    }

    async fn run_git(&self, args: &[&str]) -> Result<String, WorkspaceError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_root)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(WorkspaceError::GitCommand(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    async fn init_repo(dir: &Path) {
        run(dir, &["init", "-b", "main"]).await;
        run(dir, &["config", "user.email", "test@example.com"]).await;
        run(dir, &["config", "user.name", "Test"]).await;
        tokio::fs::write(dir.join("README.md"), b"hello").await.unwrap();
        run(dir, &["add", "."]).await;
        run(dir, &["commit", "-m", "init"]).await;
    }

    async fn run(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    fn issue_ref() -> IssueRef {
        IssueRef {
            host: "github.com".to_string(),
            owner: "acme".to_string(),
            repo: "web".to_string(),
            number: 42,
        }
    }

    #[tokio::test]
    async fn ensure_for_issue_creates_worktree_and_branch() {
        let repo_dir = TempDir::new().unwrap();
        init_repo(repo_dir.path()).await;
        let workspaces_dir = TempDir::new().unwrap();

        let mgr = WorkspaceManager::new(repo_dir.path(), workspaces_dir.path());
        let path = mgr
            .ensure_for_issue(&issue_ref(), "Fix the login bug", "main")
            .await
            .unwrap();

        assert!(path.join(".git").exists());
    }

    #[tokio::test]
    async fn ensure_for_issue_is_idempotent() {
        let repo_dir = TempDir::new().unwrap();
        init_repo(repo_dir.path()).await;
        let workspaces_dir = TempDir::new().unwrap();

        let mgr = WorkspaceManager::new(repo_dir.path(), workspaces_dir.path());
        let path1 = mgr.ensure_for_issue(&issue_ref(), "Fix bug", "main").await.unwrap();
        let path2 = mgr.ensure_for_issue(&issue_ref(), "Fix bug", "main").await.unwrap();
        assert_eq!(path1, path2);
    }

    #[tokio::test]
    async fn cleanup_removes_worktree_directory() {
        let repo_dir = TempDir::new().unwrap();
        init_repo(repo_dir.path()).await;
        let workspaces_dir = TempDir::new().unwrap();

        let mgr = WorkspaceManager::new(repo_dir.path(), workspaces_dir.path());
        let path = mgr.ensure_for_issue(&issue_ref(), "Fix bug", "main").await.unwrap();
        assert!(path.exists());

        let branch = WorkspaceManager::branch_name(&issue_ref(), "Fix bug");
        mgr.cleanup_for_issue(&issue_ref(), &branch, true).await.unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn branch_name_embeds_issue_number_and_slug() {
        let name = WorkspaceManager::branch_name(&issue_ref(), "Fix the login bug!!");
        assert_eq!(name, "42-fix-the-login-bug");
    }
}
