//! External resolution agents.
//!
//! An agent receives the conflicting region of one file together with its
//! surroundings and returns a complete candidate for the file. The engine
//! never trusts the answer: see [`crate::conflict::resolver`] for the
//! checks a candidate must pass.

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::ResolverConfig;
use crate::conflict::detector::ConflictKind;
use crate::errors::AgentError;

/// Environment variable through which [`CommandAgent`] passes the API key.
pub const AGENT_KEY_ENV: &str = "TASKMERGE_AGENT_KEY";

/// Everything an agent needs to resolve one conflicting region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionContext {
    pub file_path: String,
    pub language: Option<String>,
    pub conflict_kind: ConflictKind,
    /// Symbol paths of the interacting regions.
    pub symbols: Vec<String>,
    /// The conflicting region as it was in the common ancestor.
    pub base_region: String,
    /// The region on the integration branch.
    pub ours_region: String,
    /// The region on the task branch.
    pub theirs_region: String,
    /// Lines immediately before the region.
    pub context_before: String,
    /// Lines immediately after the region.
    pub context_after: String,
    /// The whole file with non-conflicting changes applied and the region
    /// shown as a diff3 conflict block.
    pub draft: String,
}

/// Something that can propose a resolution for a conflicting region.
#[async_trait]
pub trait ResolutionAgent: Send + Sync {
    /// Return the full content of the resolved file.
    async fn resolve(&self, context: &ResolutionContext) -> Result<String, AgentError>;
}

/// Runs an external command: the context is written to its stdin as JSON
/// and its stdout is the candidate file.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    program: String,
    args: Vec<String>,
    api_key: Option<String>,
}

impl CommandAgent {
    pub fn new(program: impl Into<String>, args: Vec<String>, api_key: Option<String>) -> Self {
        Self {
            program: program.into(),
            args,
            api_key,
        }
    }

    /// Build the agent described by the resolver configuration, if any.
    pub fn from_config(config: &ResolverConfig) -> Option<Self> {
        config
            .command
            .as_ref()
            .map(|cmd| Self::new(cmd.clone(), config.args.clone(), config.api_key.clone()))
    }
}

#[async_trait]
impl ResolutionAgent for CommandAgent {
    async fn resolve(&self, context: &ResolutionContext) -> Result<String, AgentError> {
        let payload =
            serde_json::to_vec(context).map_err(|e| AgentError::Malformed(e.to_string()))?;

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(key) = &self.api_key {
            cmd.env(AGENT_KEY_ENV, key);
        }

        debug!(program = %self.program, file = %context.file_path, "invoking resolution agent");
        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        let text = String::from_utf8(output.stdout)
            .map_err(|_| AgentError::Malformed("agent output is not valid UTF-8".into()))?;
        let text = strip_code_fence(&text);
        if text.trim().is_empty() {
            return Err(AgentError::Malformed("agent returned no content".into()));
        }
        Ok(text)
    }
}

/// Remove one enclosing Markdown code fence, which chat-style agents tend to
/// wrap their answer in.
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") || !trimmed.ends_with("```") || trimmed.len() < 6 {
        return text.to_string();
    }
    let Some(first_newline) = trimmed.find('\n') else {
        return text.to_string();
    };
    let body = &trimmed[first_newline + 1..trimmed.len() - 3];
    body.to_string()
}
