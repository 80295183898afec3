//! Runs the external discovery tool and collects its two output channels.
//!
//! stdout carries the result: one JSON array, parsed only after exit.
//! stderr is the live log, read line by line as the tool writes it.

use std::{path::PathBuf, process::Stdio, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::{Child, ChildStderr, Command},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::AppConfig,
    error::{InventoryError, InventoryResult},
    models::DiscoveredDevice,
};

/// Environment variable through which the probe receives the shared secret
/// for the fingerprint and next-id endpoints.
pub const PROBE_TOKEN_ENV: &str = "ASSETKEEPER_PROBE_TOKEN";

#[async_trait::async_trait]
pub trait ToolAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    async fn discover(&self, target: &str) -> InventoryResult<Vec<DiscoveredDevice>>;
}

/// How a run is consumed.
///
/// `Batch` keeps the stderr lines as failure detail and treats empty stdout
/// as malformed. `Streaming` forwards stderr live and reads empty stdout as
/// no devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    Batch,
    Streaming,
}

#[derive(Debug, Clone)]
pub struct ProbeRunner {
    program: String,
    script: PathBuf,
    api_base_url: String,
    token: String,
    timeout: Duration,
}

impl ProbeRunner {
    pub fn new(program: impl Into<String>, script: impl Into<PathBuf>, api_base_url: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            script: script.into(),
            api_base_url: api_base_url.into(),
            token: String::new(),
            timeout: Duration::from_secs(600),
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(&cfg.probe_program, &cfg.probe_script, cfg.api_base_url())
            .with_token(&cfg.probe_token)
            .with_timeout(Duration::from_secs(cfg.probe_timeout_secs))
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn args(&self, target: &str) -> Vec<String> {
        vec![
            self.script.to_string_lossy().into_owned(),
            "--target".to_string(),
            target.to_string(),
            "--api-url".to_string(),
            self.api_base_url.clone(),
            "--dry-run".to_string(),
            "--json".to_string(),
        ]
    }

    /// Starts the tool. In [`ProbeMode::Batch`] the stderr lines read through
    /// [`RunningProbe::next_log_line`] are kept and become the detail of an
    /// execution failure.
    pub fn spawn(&self, target: &str, mode: ProbeMode) -> InventoryResult<RunningProbe> {
        let args = self.args(target);
        info!(command = %self.program, ?args, ?mode, "audit: launching external tool");

        let mut child = Command::new(&self.program)
            .args(&args)
            .env(PROBE_TOKEN_ENV, &self.token)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(InventoryError::ProbeSpawn)?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| InventoryError::ProbeSpawn(std::io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| InventoryError::ProbeSpawn(std::io::Error::other("stderr not captured")))?;

        // Drained concurrently so a chatty tool never blocks on a full pipe.
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await?;
            Ok::<_, std::io::Error>(buf)
        });

        Ok(RunningProbe {
            child,
            stderr: BufReader::new(stderr),
            line: Vec::new(),
            stdout: stdout_task,
            captured: (mode == ProbeMode::Batch).then(Vec::new),
            mode,
        })
    }
}

#[async_trait::async_trait]
impl ToolAdapter for ProbeRunner {
    fn name(&self) -> &'static str {
        "probe"
    }

    /// Batch mode: waits for exit and returns the parsed result.
    async fn discover(&self, target: &str) -> InventoryResult<Vec<DiscoveredDevice>> {
        let mut probe = self.spawn(target, ProbeMode::Batch)?;
        let outcome = timeout(self.timeout, drain(&mut probe)).await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                probe.kill().await;
                Err(InventoryError::ProbeTimeout(self.timeout))
            }
        }
    }
}

async fn drain(probe: &mut RunningProbe) -> InventoryResult<Vec<DiscoveredDevice>> {
    while let Some(line) = probe.next_log_line().await? {
        debug!(%line, "probe");
    }
    probe.wait().await
}

pub struct RunningProbe {
    child: Child,
    stderr: BufReader<ChildStderr>,
    line: Vec<u8>,
    stdout: JoinHandle<std::io::Result<Vec<u8>>>,
    captured: Option<Vec<String>>,
    mode: ProbeMode,
}

impl RunningProbe {
    /// Next non-blank stderr line, trimmed; `None` once stderr is closed.
    ///
    /// Cancel safe: a partially read line stays buffered for the next call.
    pub async fn next_log_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let n = self.stderr.read_until(b'\n', &mut self.line).await?;
            if n == 0 && self.line.is_empty() {
                return Ok(None);
            }
            let line = String::from_utf8_lossy(&self.line).trim().to_string();
            self.line.clear();
            if line.is_empty() {
                continue;
            }
            if let Some(captured) = self.captured.as_mut() {
                captured.push(line.clone());
            }
            return Ok(Some(line));
        }
    }

    /// Waits for exit and parses stdout. Cancel safe.
    pub async fn wait(&mut self) -> InventoryResult<Vec<DiscoveredDevice>> {
        let status = self.child.wait().await?;
        let stdout = (&mut self.stdout)
            .await
            .map_err(|e| InventoryError::ProbeIo(std::io::Error::other(e)))??;

        if !status.success() {
            let detail = self.captured.as_deref().unwrap_or_default().join("\n");
            return Err(InventoryError::ProbeExecutionFailure {
                code: status.code(),
                detail,
            });
        }
        parse_output(&stdout, self.mode)
    }

    /// Best-effort kill; the tool gets no chance to shut down cleanly.
    pub async fn kill(&mut self) {
        self.stdout.abort();
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to kill probe");
        }
    }
}

/// Parses the tool's stdout. Anything that is not a JSON array of device
/// objects is malformed; empty output is no devices only when streaming.
pub fn parse_output(stdout: &[u8], mode: ProbeMode) -> InventoryResult<Vec<DiscoveredDevice>> {
    let text = String::from_utf8_lossy(stdout);
    if text.trim().is_empty() {
        return match mode {
            ProbeMode::Streaming => Ok(Vec::new()),
            ProbeMode::Batch => Err(InventoryError::ProbeOutputMalformed("empty output".to_string())),
        };
    }
    serde_json::from_str::<Vec<DiscoveredDevice>>(text.trim())
        .map_err(|e| InventoryError::ProbeOutputMalformed(e.to_string()))
}
