//! Stdio transport: a local MCP server running as a child process.
//!
//! Outbound messages are written to the child's stdin as line-delimited
//! JSON; the child's stdout is read line by line and parsed as inbound
//! messages. Stderr is drained and logged so server diagnostics are not
//! lost. The child exiting (stdout EOF) drops the inbound sink, which the
//! owning client treats as connection teardown.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use super::error::{McpError, McpResult};
use super::transport::{McpTransport, MessageSink};

/// Delay after spawn before the transport reports ready, so the child can
/// bring its stdin loop up before `initialize` is written.
const SPAWN_SETTLE: Duration = Duration::from_millis(100);

/// How long a closing child gets to exit cleanly before it is killed.
const KILL_GRACE: Duration = Duration::from_millis(500);

pub struct StdioTransport {
    name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    child: Option<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    reader_handles: Vec<tokio::task::JoinHandle<()>>,
}

impl StdioTransport {
    pub fn new(
        name: &str,
        command: &str,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args,
            env,
            child: None,
            stdin: Mutex::new(None),
            reader_handles: Vec::new(),
        }
    }
}

/// On Windows, commands like `npx` resolve through %PATH% only when run via
/// the shell, so anything that is not already a `cmd` invocation is wrapped
/// as `cmd /C <command> <args...>`. Elsewhere the command runs as-is.
fn shell_wrap(command: &str, args: &[String]) -> (String, Vec<String>) {
    let lowered = command.to_ascii_lowercase();
    if cfg!(windows) && lowered != "cmd" && !lowered.ends_with("cmd.exe") {
        let mut wrapped = Vec::with_capacity(args.len() + 2);
        wrapped.push("/C".to_string());
        wrapped.push(command.to_string());
        wrapped.extend_from_slice(args);
        ("cmd".to_string(), wrapped)
    } else {
        (command.to_string(), args.to_vec())
    }
}

#[async_trait::async_trait]
impl McpTransport for StdioTransport {
    async fn open(&mut self, sink: MessageSink) -> McpResult<()> {
        let (program, args) = shell_wrap(&self.command, &self.args);
        info!("Spawning MCP server '{}': {} {:?}", self.name, program, args);

        let mut child = Command::new(&program)
            .args(&args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                McpError::Transport(format!("failed to spawn '{}': {}", self.command, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("failed to capture child stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("failed to capture child stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::Transport("failed to capture child stderr".to_string()))?;

        // Reader task: line-delimited JSON from the child's stdout. Blank
        // lines are skipped; unparseable lines are logged and dropped.
        let name = self.name.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<serde_json::Value>(trimmed) {
                    Ok(message) => {
                        debug!("[{}] <- {}", name, trimmed);
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("[{}] unparseable line dropped: {} ({})", name, trimmed, e),
                }
            }
            info!("[{}] stdout closed", name);
            // `sink` drops here; the client observes the closed channel.
        });

        // Stderr drain: the server's diagnostics, logged as informational.
        let name = self.name.clone();
        let errdrain = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!("[{} stderr] {}", name, line);
            }
        });

        *self.stdin.lock().await = Some(stdin);
        self.child = Some(child);
        self.reader_handles.push(reader);
        self.reader_handles.push(errdrain);

        tokio::time::sleep(SPAWN_SETTLE).await;
        Ok(())
    }

    async fn send(&self, message: &serde_json::Value) -> McpResult<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(McpError::NotConnected)?;
        let json = serde_json::to_string(message)?;
        debug!("[{}] -> {}", self.name, json);
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> McpResult<()> {
        // Dropping stdin signals EOF, the polite request to exit.
        self.stdin.lock().await.take();

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("[{}] server exited: {}", self.name, status);
                }
                _ => {
                    warn!("[{}] server did not exit, killing", self.name);
                    let _ = child.kill().await;
                }
            }
        }

        for handle in self.reader_handles.drain(..) {
            handle.abort();
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "stdio"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_wrap_unix_passthrough() {
        if cfg!(windows) {
            return;
        }
        let (program, args) = shell_wrap("node", &["server.js".to_string()]);
        assert_eq!(program, "node");
        assert_eq!(args, vec!["server.js".to_string()]);
    }

    #[test]
    fn test_shell_wrap_windows() {
        if !cfg!(windows) {
            return;
        }
        let (program, args) = shell_wrap("npx", &["-y".to_string(), "server".to_string()]);
        assert_eq!(program, "cmd");
        assert_eq!(args[..2], ["/C".to_string(), "npx".to_string()]);

        // Already a shell invocation: left alone.
        let (program, _) = shell_wrap("cmd", &["/C".to_string(), "dir".to_string()]);
        assert_eq!(program, "cmd");
    }
}
