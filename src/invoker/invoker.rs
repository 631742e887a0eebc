//! Agent process lifecycle — spawn, stream, watchdogs, cancellation.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::InvokerConfig;
use crate::error::InvokerError;

use super::stream::StreamState;

/// Callback invoked with each new chunk of assistant text.
pub type TokenCallback = Box<dyn FnMut(&str) + Send>;

/// One agent invocation request.
pub struct InvokeRequest {
    /// The prompt to submit.
    pub prompt: String,
    /// Appended to the agent's system prompt, if set.
    pub system_prompt: Option<String>,
    /// Session token from a prior invocation to resume.
    pub resume_session: Option<String>,
    /// Tool-capability config the agent process may call into.
    pub tool_config: PathBuf,
    /// Streaming text callback.
    pub on_token: Option<TokenCallback>,
    /// Cooperative cancellation; kills the process when triggered.
    pub cancel: Option<CancellationToken>,
}

impl InvokeRequest {
    /// Create a request with the required fields.
    pub fn new(prompt: impl Into<String>, tool_config: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            resume_session: None,
            tool_config: tool_config.into(),
            on_token: None,
            cancel: None,
        }
    }

    /// Set the appended system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Resume a prior session.
    pub fn with_resume(mut self, session: impl Into<String>) -> Self {
        self.resume_session = Some(session.into());
        self
    }

    /// Set the streaming text callback.
    pub fn with_token_callback(mut self, callback: TokenCallback) -> Self {
        self.on_token = Some(callback);
        self
    }

    /// Attach a cancellation token.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// The outcome of one agent invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentReply {
    /// Full response text.
    pub text: String,
    /// Session token for resuming this conversation later.
    pub session_id: Option<String>,
    /// Cost reported by the agent process, if any.
    pub cost_usd: Option<f64>,
    /// Model identifier reported by the agent process, if any.
    pub model: Option<String>,
}

/// Seam for the external reasoning agent, so the scheduler and tests can
/// substitute fakes.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Run one agent invocation to completion.
    async fn invoke(&self, request: InvokeRequest) -> Result<AgentReply, InvokerError>;
}

/// Spawns the external reasoning-agent process for one request, interprets
/// its newline-delimited JSON output, and enforces liveness watchdogs.
pub struct AgentInvoker {
    config: InvokerConfig,
}

impl AgentInvoker {
    pub fn new(config: InvokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AgentProvider for AgentInvoker {
    async fn invoke(&self, mut request: InvokeRequest) -> Result<AgentReply, InvokerError> {
        let mut command = Command::new(&self.config.program);
        command
            .args(["--output-format", "stream-json"])
            .arg("--mcp-config")
            .arg(&request.tool_config);
        if let Some(ref system_prompt) = request.system_prompt {
            command.args(["--append-system-prompt", system_prompt]);
        }
        if let Some(ref session) = request.resume_session {
            command.args(["--resume", session]);
        }
        command
            .arg(&request.prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| InvokerError::Spawn {
            program: self.config.program.clone(),
            source,
        })?;
        let stdout = child.stdout.take().ok_or(InvokerError::NoStdout)?;
        let mut lines = BufReader::new(stdout).lines();

        debug!(program = %self.config.program, resume = request.resume_session.is_some(), "Agent process spawned");

        let cancel = request.cancel.clone().unwrap_or_default();
        let hard_deadline = Instant::now() + self.config.hard_timeout;
        let mut idle_deadline = Instant::now() + self.config.inactivity_timeout;

        let mut state = StreamState::new();
        let mut failure: Option<InvokerError> = None;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            idle_deadline = Instant::now() + self.config.inactivity_timeout;
                            state.apply_line(&line, |delta| {
                                if let Some(callback) = request.on_token.as_mut() {
                                    callback(delta);
                                }
                            });
                        }
                        Ok(None) => break,
                        Err(error) => {
                            failure = Some(InvokerError::Io(error));
                            break;
                        }
                    }
                }
                _ = sleep_until(idle_deadline) => {
                    warn!(timeout = ?self.config.inactivity_timeout, "Agent process went silent, killing it");
                    failure = Some(InvokerError::Inactivity(self.config.inactivity_timeout));
                    break;
                }
                _ = sleep_until(hard_deadline) => {
                    warn!(timeout = ?self.config.hard_timeout, "Agent process hit the hard ceiling, killing it");
                    failure = Some(InvokerError::HardCeiling(self.config.hard_timeout));
                    break;
                }
                _ = cancel.cancelled() => {
                    debug!("Agent invocation cancelled, killing the process");
                    failure = Some(InvokerError::Aborted);
                    break;
                }
            }
        }

        if failure.is_some() || cancel.is_cancelled() {
            let _ = child.kill().await;
        }
        // The hard ceiling still applies after stdout closes: a process
        // that sheds its pipe but keeps running is killed at the same
        // deadline.
        let status = match timeout_at(hard_deadline, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(timeout = ?self.config.hard_timeout, "Agent process outlived its stdout, killing it");
                let _ = child.kill().await;
                if failure.is_none() {
                    failure = Some(InvokerError::HardCeiling(self.config.hard_timeout));
                }
                child.wait().await
            }
        };

        // Cancellation wins over every other outcome, including a clean exit.
        if cancel.is_cancelled() {
            return Err(InvokerError::Aborted);
        }
        if let Some(error) = failure {
            return Err(error);
        }

        let status = status?;
        if !status.success() && state.tracker.accumulated().is_empty() {
            return Err(InvokerError::ProcessExit {
                code: status.code().unwrap_or(-1),
            });
        }

        Ok(AgentReply {
            text: state.tracker.into_text(),
            session_id: state.session_id,
            cost_usd: state.cost_usd,
            model: state.model,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    /// Write an executable fake-agent script that ignores its arguments.
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn invoker_for(script: &Path) -> AgentInvoker {
        AgentInvoker::new(InvokerConfig {
            program: script.to_string_lossy().into_owned(),
            inactivity_timeout: Duration::from_secs(5),
            hard_timeout: Duration::from_secs(30),
        })
    }

    fn request(dir: &Path) -> InvokeRequest {
        InvokeRequest::new("test prompt", dir.join("tools.json"))
    }

    #[tokio::test]
    async fn streams_deltas_and_collects_reply() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            r#"echo '{"type":"system","subtype":"init","session_id":"sess-1"}'
echo '{"type":"assistant","message":{"id":"m1","model":"opus","content":[{"type":"text","text":"Hel"}]}}'
echo '{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"Hello"}]}}'
echo '{"type":"result","session_id":"sess-1","total_cost_usd":0.05,"model":"opus","result":"Hello"}'"#,
        );

        let deltas = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&deltas);
        let request = request(dir.path()).with_token_callback(Box::new(move |delta| {
            sink.lock().unwrap().push(delta.to_string());
        }));

        let reply = invoker_for(&script).invoke(request).await.unwrap();
        assert_eq!(reply.text, "Hello");
        assert_eq!(reply.session_id.as_deref(), Some("sess-1"));
        assert_eq!(reply.cost_usd, Some(0.05));
        assert_eq!(reply.model.as_deref(), Some("opus"));
        assert_eq!(*deltas.lock().unwrap(), vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn malformed_lines_do_not_break_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            r#"echo 'garbage that is not json'
echo '{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"ok"}]}}'
echo '{"half":'"#,
        );

        let reply = invoker_for(&script).invoke(request(dir.path())).await.unwrap();
        assert_eq!(reply.text, "ok");
    }

    #[tokio::test]
    async fn inactivity_watchdog_kills_a_silent_process() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep 30");

        let invoker = AgentInvoker::new(InvokerConfig {
            program: script.to_string_lossy().into_owned(),
            inactivity_timeout: Duration::from_millis(200),
            hard_timeout: Duration::from_secs(30),
        });

        let started = std::time::Instant::now();
        let error = invoker.invoke(request(dir.path())).await.unwrap_err();
        assert!(matches!(error, InvokerError::Inactivity(_)));
        assert!(error.is_timeout());
        // The process was killed: we did not sit out its 30-second sleep.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn hard_ceiling_kills_a_chatty_process() {
        let dir = tempfile::tempdir().unwrap();
        // Emits a line every 50ms, so the inactivity watchdog never fires.
        let script = write_script(
            dir.path(),
            r#"while true; do
  echo '{"type":"assistant","message":{"id":"m1","content":[]}}'
  sleep 0.05
done"#,
        );

        let invoker = AgentInvoker::new(InvokerConfig {
            program: script.to_string_lossy().into_owned(),
            inactivity_timeout: Duration::from_secs(5),
            hard_timeout: Duration::from_millis(300),
        });

        let error = invoker.invoke(request(dir.path())).await.unwrap_err();
        assert!(matches!(error, InvokerError::HardCeiling(_)));
        assert!(error.is_timeout());
    }

    #[tokio::test]
    async fn hard_ceiling_applies_after_stdout_closes() {
        let dir = tempfile::tempdir().unwrap();
        // Closes stdout, then keeps running.
        let script = write_script(dir.path(), "exec >&-\nsleep 10");

        let invoker = AgentInvoker::new(InvokerConfig {
            program: script.to_string_lossy().into_owned(),
            inactivity_timeout: Duration::from_millis(300),
            hard_timeout: Duration::from_millis(300),
        });

        let started = std::time::Instant::now();
        let error = invoker.invoke(request(dir.path())).await.unwrap_err();
        assert!(matches!(error, InvokerError::HardCeiling(_)));
        // The process was killed at the deadline, not awaited to its end.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_aborts_and_kills() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep 30");

        let token = CancellationToken::new();
        let request = request(dir.path()).with_cancel(token.clone());
        let invoker = invoker_for(&script);

        let handle = tokio::spawn(async move { invoker.invoke(request).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let error = handle.await.unwrap().unwrap_err();
        assert!(matches!(error, InvokerError::Aborted));
    }

    #[tokio::test]
    async fn nonzero_exit_without_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exit 3");

        let error = invoker_for(&script).invoke(request(dir.path())).await.unwrap_err();
        assert!(matches!(error, InvokerError::ProcessExit { code: 3 }));
    }

    #[tokio::test]
    async fn nonzero_exit_with_output_still_returns_text() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            r#"echo '{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"partial answer"}]}}'
exit 2"#,
        );

        let reply = invoker_for(&script).invoke(request(dir.path())).await.unwrap();
        assert_eq!(reply.text, "partial answer");
    }

    #[tokio::test]
    async fn result_text_is_a_fallback_only() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            r#"echo '{"type":"result","session_id":"sess-9","result":"final only"}'"#,
        );

        let reply = invoker_for(&script).invoke(request(dir.path())).await.unwrap();
        assert_eq!(reply.text, "final only");
        assert_eq!(reply.session_id.as_deref(), Some("sess-9"));
    }

    #[tokio::test]
    async fn spawn_failure_surfaces() {
        let invoker = AgentInvoker::new(InvokerConfig {
            program: "/nonexistent/agent-binary".to_string(),
            ..InvokerConfig::default()
        });
        let dir = tempfile::tempdir().unwrap();

        let error = invoker.invoke(request(dir.path())).await.unwrap_err();
        assert!(matches!(error, InvokerError::Spawn { .. }));
    }
}
