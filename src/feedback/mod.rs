//! The PR feedback loop: fetch review comments, classify them, close
//! escalated conflicts, and feed the rest back into the pipeline.
//!
//! The loop itself is stateless beyond the last processed comment id, which
//! lives in the run's checkpoint context and is advanced only here, on the
//! single-threaded poll path. Every consumed comment gets exactly one reply
//! describing what was done with it, posted in consumption order within the
//! same poll cycle.

use crate::errors::FeedbackError;
use crate::run::Phase;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// A PR review comment as fetched from the GitHub collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrComment {
    pub id: u64,
    pub author: String,
    pub body: String,
    pub target_file: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// CI state of the run's head commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiStatus {
    Pending,
    Success,
    Failure,
}

/// External GitHub surface the engine consumes. Implementations are out of
/// the engine's scope.
#[async_trait]
pub trait GithubClient: Send + Sync {
    async fn fetch_comments(&self, run_ref: &str) -> Result<Vec<PrComment>, FeedbackError>;
    async fn post_reply(&self, comment_id: u64, body: &str) -> Result<(), FeedbackError>;
    async fn create_or_update_pr(
        &self,
        run_ref: &str,
        title: &str,
        body: &str,
        files: &[String],
    ) -> Result<u64, FeedbackError>;
    async fn ci_status(&self, commit_ref: &str) -> Result<CiStatus, FeedbackError>;
}

/// Which phase a piece of feedback targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackTarget {
    Design,
    Implementation,
}

impl FeedbackTarget {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Design => Phase::Design,
            Self::Implementation => Phase::Implementation,
        }
    }
}

impl fmt::Display for FeedbackTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Design => write!(f, "design"),
            Self::Implementation => write!(f, "implementation"),
        }
    }
}

/// A consumed comment queued for a phase re-entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackItem {
    pub comment_id: u64,
    pub author: String,
    pub body: String,
    pub target: FeedbackTarget,
    pub received_at: DateTime<Utc>,
}

/// What the engine must do with one consumed comment.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackAction {
    /// The comment answers an open escalated conflict: close it.
    CloseConflict {
        question: String,
        resolution: String,
        comment_id: u64,
    },
    /// New feedback for a phase: append it and force re-entry.
    Reenter { item: FeedbackItem },
}

/// Result of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollOutcome {
    pub actions: Vec<FeedbackAction>,
    /// New high-water mark for the processed-comment marker.
    pub last_comment_id: u64,
    pub replies_posted: usize,
}

impl PollOutcome {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Vocabulary that marks a comment as design-level rather than a remark on
/// the implementation itself.
const DESIGN_KEYWORDS: &[&str] = &[
    "design",
    "architecture",
    "architectural",
    "approach",
    "interface",
    "data model",
    "schema",
    "structure",
    "why not",
    "should we",
    "rethink",
];

/// Classify a comment as design- or implementation-targeted.
///
/// Deterministic on purpose: comments on markdown/design documents and
/// comments using design vocabulary re-enter DESIGN; everything else is an
/// implementation remark.
pub fn classify(comment: &PrComment) -> FeedbackTarget {
    if let Some(file) = &comment.target_file {
        if file.ends_with(".md") {
            return FeedbackTarget::Design;
        }
    }
    let body = comment.body.to_lowercase();
    if DESIGN_KEYWORDS.iter().any(|k| body.contains(k)) {
        return FeedbackTarget::Design;
    }
    FeedbackTarget::Implementation
}

/// Polls the GitHub collaborator and turns new comments into engine actions.
pub struct FeedbackLoop {
    github: Arc<dyn GithubClient>,
}

impl FeedbackLoop {
    pub fn new(github: Arc<dyn GithubClient>) -> Self {
        Self { github }
    }

    /// One poll cycle: consume comments newer than `last_comment_id`, reply
    /// to each, and return the actions for the engine to apply.
    ///
    /// A comment that quotes an open escalated question closes that conflict;
    /// anything else becomes a feedback item for its classified phase. If a
    /// reply fails mid-cycle the error propagates and the caller must keep
    /// the old marker, so the remaining comments are re-consumed next poll.
    pub async fn poll(
        &self,
        run_ref: &str,
        last_comment_id: u64,
        open_questions: &[String],
    ) -> Result<PollOutcome, FeedbackError> {
        let mut comments: Vec<PrComment> = self
            .github
            .fetch_comments(run_ref)
            .await?
            .into_iter()
            .filter(|c| c.id > last_comment_id)
            .collect();
        comments.sort_by_key(|c| c.id);

        let mut outcome = PollOutcome {
            last_comment_id,
            ..Default::default()
        };

        for comment in comments {
            let body_lower = comment.body.to_lowercase();
            let answered = open_questions
                .iter()
                .find(|q| body_lower.contains(&q.to_lowercase()));

            let (action, reply) = match answered {
                Some(question) => (
                    FeedbackAction::CloseConflict {
                        question: question.clone(),
                        resolution: comment.body.clone(),
                        comment_id: comment.id,
                    },
                    format!("Resolved the open question '{}' with this guidance.", question),
                ),
                None => {
                    let target = classify(&comment);
                    let item = FeedbackItem {
                        comment_id: comment.id,
                        author: comment.author.clone(),
                        body: comment.body.clone(),
                        target,
                        received_at: comment.created_at,
                    };
                    (
                        FeedbackAction::Reenter { item },
                        format!("Queued as {} feedback; re-running that phase.", target),
                    )
                }
            };

            self.github.post_reply(comment.id, &reply).await?;
            info!(comment_id = comment.id, "consumed PR comment");
            outcome.replies_posted += 1;
            outcome.last_comment_id = comment.id;
            outcome.actions.push(action);
        }

        Ok(outcome)
    }
}
