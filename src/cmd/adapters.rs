//! Collaborator adapters for the CLI: an agent backend that shells out to a
//! configured command, and a GitHub client on top of the `gh` CLI.
//!
//! The engine only knows the `AgentCall` and `GithubClient` traits; these
//! adapters are the binary's concrete wiring.

use anyhow::{Context, Result};
use async_trait::async_trait;
use conductor::agent::AgentCall;
use conductor::config::EngineConfig;
use conductor::errors::{AgentCallError, FeedbackError};
use conductor::feedback::{CiStatus, GithubClient, PrComment};
use conductor::persona::Persona;
use conductor::router::Backend;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Agent backend that spawns the configured command once per call, writes
/// the prompt to stdin, and returns stdout. The backend choice maps to the
/// configured local/remote model flag.
pub struct CommandAgent {
    agent_cmd: String,
    local_model: String,
    remote_model: String,
}

impl CommandAgent {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            agent_cmd: config.agent_cmd.clone(),
            local_model: config.local_model.clone(),
            remote_model: config.remote_model.clone(),
        }
    }
}

#[async_trait]
impl AgentCall for CommandAgent {
    async fn call(
        &self,
        backend: Backend,
        persona: Persona,
        prompt: &str,
        context: &str,
        _timeout: Duration, // enforced wall-clock by the executor
    ) -> Result<String, AgentCallError> {
        let model = match backend {
            Backend::Local => &self.local_model,
            Backend::Remote => &self.remote_model,
        };

        let mut cmd = Command::new(&self.agent_cmd);
        cmd.arg("--print")
            .arg("--model")
            .arg(model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|e| {
            AgentCallError::Unavailable(format!("failed to spawn {}: {}", self.agent_cmd, e))
        })?;

        let input = format!("{}\n\n{}", prompt, context);
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| AgentCallError::Unavailable(format!("stdin write failed: {}", e)))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| AgentCallError::Unavailable(format!("stdin close failed: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AgentCallError::Unavailable(format!("wait failed: {}", e)))?;

        if !output.status.success() {
            return Err(AgentCallError::Unavailable(format!(
                "{} ({}) exited with code {}",
                self.agent_cmd,
                persona,
                output.status.code().unwrap_or(-1)
            )));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| AgentCallError::Unavailable(format!("non-UTF8 output: {}", e)))
    }
}

/// GitHub client over the `gh` CLI. Each run maps to the branch
/// `conductor/run-<run_id>`; the PR for that branch carries the feedback
/// conversation and the CI signal.
pub struct GhCli;

impl GhCli {
    pub fn new() -> Self {
        Self
    }

    fn branch_for(run_ref: &str) -> String {
        format!("conductor/run-{}", run_ref)
    }

    async fn gh(args: &[&str]) -> Result<String> {
        let output = Command::new("gh")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run gh")?;
        if !output.status.success() {
            anyhow::bail!(
                "gh {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8(output.stdout).context("Invalid UTF-8 in gh output")?)
    }
}

impl Default for GhCli {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct PrNumber {
    number: u64,
}

#[derive(Deserialize)]
struct ApiComment {
    id: u64,
    body: String,
    created_at: chrono::DateTime<chrono::Utc>,
    user: ApiUser,
    /// Present on review comments only; issue comments have no file anchor.
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize)]
struct ApiUser {
    login: String,
}

fn github_err(e: anyhow::Error) -> FeedbackError {
    FeedbackError::Github(e.to_string())
}

#[async_trait]
impl GithubClient for GhCli {
    async fn fetch_comments(&self, run_ref: &str) -> Result<Vec<PrComment>, FeedbackError> {
        let branch = Self::branch_for(run_ref);
        let view = Self::gh(&["pr", "view", &branch, "--json", "number"])
            .await
            .map_err(github_err)?;
        let pr: PrNumber = serde_json::from_str(&view)
            .context("Failed to parse gh pr view output")
            .map_err(github_err)?;

        let endpoint = format!("repos/{{owner}}/{{repo}}/issues/{}/comments", pr.number);
        let raw = Self::gh(&["api", &endpoint]).await.map_err(github_err)?;
        let comments: Vec<ApiComment> = serde_json::from_str(&raw)
            .context("Failed to parse comment list")
            .map_err(github_err)?;

        Ok(comments
            .into_iter()
            .map(|c| PrComment {
                id: c.id,
                author: c.user.login,
                body: c.body,
                target_file: c.path,
                created_at: c.created_at,
            })
            .collect())
    }

    async fn post_reply(&self, comment_id: u64, body: &str) -> Result<(), FeedbackError> {
        let quoted = format!("Re comment {}:\n\n{}", comment_id, body);
        // Replies land as new issue comments on the same PR thread.
        let target = format!("repos/{{owner}}/{{repo}}/issues/comments/{}", comment_id);
        let raw = Self::gh(&["api", &target]).await.map_err(github_err)?;
        #[derive(Deserialize)]
        struct CommentRef {
            issue_url: String,
        }
        let parsed: CommentRef = serde_json::from_str(&raw)
            .context("Failed to resolve comment thread")
            .map_err(github_err)?;
        let issue_comments = format!("{}/comments", parsed.issue_url);
        Self::gh(&["api", &issue_comments, "-f", &format!("body={}", quoted)])
            .await
            .map_err(github_err)?;
        Ok(())
    }

    async fn create_or_update_pr(
        &self,
        run_ref: &str,
        title: &str,
        body: &str,
        _files: &[String],
    ) -> Result<u64, FeedbackError> {
        let branch = Self::branch_for(run_ref);
        // Update in place when the PR already exists.
        if let Ok(view) = Self::gh(&["pr", "view", &branch, "--json", "number"]).await {
            if let Ok(pr) = serde_json::from_str::<PrNumber>(&view) {
                let number = pr.number.to_string();
                Self::gh(&["pr", "edit", &number, "--title", title, "--body", body])
                    .await
                    .map_err(github_err)?;
                return Ok(pr.number);
            }
        }

        Self::gh(&[
            "pr", "create", "--head", &branch, "--title", title, "--body", body,
        ])
        .await
        .map_err(github_err)?;
        let view = Self::gh(&["pr", "view", &branch, "--json", "number"])
            .await
            .map_err(github_err)?;
        let pr: PrNumber = serde_json::from_str(&view)
            .context("Failed to parse created PR number")
            .map_err(github_err)?;
        Ok(pr.number)
    }

    async fn ci_status(&self, commit_ref: &str) -> Result<CiStatus, FeedbackError> {
        let branch = Self::branch_for(commit_ref);
        let output = Command::new("gh")
            .args(["pr", "checks", &branch])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| FeedbackError::Github(format!("Failed to run gh pr checks: {}", e)))?;

        if output.status.success() {
            return Ok(CiStatus::Success);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.contains("pending") {
            Ok(CiStatus::Pending)
        } else {
            Ok(CiStatus::Failure)
        }
    }
}
