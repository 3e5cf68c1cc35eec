use crate::config::PipelineConfig;
use crate::error::PipelineError;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::instrument;

/// How long to keep draining pipes after the child exited. A grandchild that
/// inherited stdout can keep the pipe open long after the program itself.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Everything the inference program wrote while it ran.
#[derive(Debug, Default, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

/// The external inference program and the read-only artifacts it needs.
#[derive(Debug, Clone)]
pub struct InferenceProgram {
    interpreter: Option<String>,
    program: PathBuf,
    weights: PathBuf,
    confidence_threshold: Option<f32>,
    timeout: Duration,
}

impl InferenceProgram {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            program: config.program.clone(),
            weights: config.weights.clone(),
            confidence_threshold: config.confidence_threshold,
            timeout: config.get_timeout(),
        }
    }

    /// Fails fast when the program or the weights are not on disk.
    pub fn check_dependencies(&self) -> Result<(), PipelineError> {
        for path in [&self.program, &self.weights] {
            if !path.exists() {
                tracing::error!("Inference dependency missing: {}", path.display());
                return Err(PipelineError::MissingDependency { path: path.clone() });
            }
        }
        Ok(())
    }

    fn command(&self, input: &Path, output: &Path) -> Command {
        let mut command = match &self.interpreter {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(&self.program);
                command
            }
            None => Command::new(&self.program),
        };

        command
            .arg("--input")
            .arg(input)
            .arg("--output")
            .arg(output)
            .arg("--weights")
            .arg(&self.weights);
        if let Some(threshold) = self.confidence_threshold {
            command.arg("--conf").arg(threshold.to_string());
        }

        command
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Runs the program once against `input`, asking it to write `output`.
    ///
    /// The whole run is bounded by the configured timeout. On expiry the child
    /// is killed and reaped before `Timeout` is returned with whatever output
    /// had been captured up to that point.
    #[instrument(skip(self, input, output), fields(input = %input.display()))]
    pub async fn run(&self, input: &Path, output: &Path) -> Result<ProcessOutput, PipelineError> {
        self.check_dependencies()?;

        let mut child = self.command(input, output).spawn().map_err(|e| {
            tracing::error!("Failed to spawn inference program: {}", e);
            PipelineError::LaunchFailed(e.to_string())
        })?;
        let started = Instant::now();
        tracing::debug!("Spawned inference program with pid {:?}", child.id());

        let stdout = Arc::new(Mutex::new(String::new()));
        let stderr = Arc::new(Mutex::new(String::new()));
        let stdout_task = tokio::spawn(drain(child.stdout.take(), stdout.clone(), "stdout"));
        let stderr_task = tokio::spawn(drain(child.stderr.take(), stderr.clone(), "stderr"));

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                stdout_task.abort();
                stderr_task.abort();
                return Err(PipelineError::UnexpectedFailure(format!(
                    "failed to wait for inference program: {}",
                    e
                )));
            }
            Err(_) => {
                tracing::error!(
                    "Inference program exceeded {}s budget, killing it",
                    self.timeout.as_secs()
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!("Failed to kill inference program: {}", e);
                }
                // The pipes hit EOF once the child is gone, which flushes an
                // unterminated last line (progress bars redraw with `\r`).
                settle(stdout_task).await;
                settle(stderr_task).await;
                return Err(PipelineError::Timeout {
                    secs: self.timeout.as_secs(),
                    stdout: stdout.lock().clone(),
                    stderr: stderr.lock().clone(),
                });
            }
        };

        settle(stdout_task).await;
        settle(stderr_task).await;
        let captured = ProcessOutput {
            stdout: stdout.lock().clone(),
            stderr: stderr.lock().clone(),
        };

        tracing::info!(
            "Inference program finished with {} in {}ms",
            status,
            started.elapsed().as_millis()
        );

        if !status.success() {
            return Err(PipelineError::ExternalProcessFailed {
                code: status.code().unwrap_or(-1),
                stderr: captured.stderr,
            });
        }

        Ok(captured)
    }
}

/// Copies a child pipe into `buffer` one line at a time, as it is produced.
async fn drain<R>(pipe: Option<R>, buffer: Arc<Mutex<String>>, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return;
    };
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                tracing::debug!(stream, "{}", text.trim_end());
                buffer.lock().push_str(&text);
            }
            Err(e) => {
                tracing::warn!("Failed to read inference program {}: {}", stream, e);
                break;
            }
        }
    }
}

async fn settle(task: JoinHandle<()>) {
    let abort = task.abort_handle();
    if tokio::time::timeout(DRAIN_GRACE, task).await.is_err() {
        tracing::warn!("Output pipe still open after exit, abandoning it");
        abort.abort();
    }
}
