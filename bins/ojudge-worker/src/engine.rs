/// Sandbox Executor - runs one test case in a throwaway container
///
/// **Core Responsibility:**
/// Feed a test input to the submitted program inside an isolated container and
/// hand back raw stdout/stderr, or tell the caller the run timed out or crashed.
///
/// **Boundary:**
/// - Knows HOW to execute (Docker, mounts, limits, exit codes)
/// - Does NOT compare output or aggregate verdicts (evaluator's job)
///
/// Every run gets a fresh container named after the staged file and the test
/// index, the staged file's directory mounted at `/app`, and the program wrapped
/// in `timeout` + `/usr/bin/time -f "%U %M"` so CPU seconds and peak KB land on
/// the last line of stderr.

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use ojudge_common::config::LanguageRuntime;
use std::path::Path;
use std::time::{Duration, Instant};
use anyhow::{anyhow, Context};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Exit code of coreutils `timeout` when the limit is hit
pub const TIMEOUT_EXIT_CODE: i64 = 124;
/// Low exit code the runtime images also report for killed runs
pub const ABORT_EXIT_CODE: i64 = 2;
/// Where the staged source directory is mounted
pub const MOUNT_POINT: &str = "/app";
/// `/usr/bin/time` format: user CPU seconds, max RSS in KB
pub const TIME_FORMAT: &str = "%U %M";

/// One sandboxed execution of a staged source file
#[derive(Debug, Clone, Copy)]
pub struct SandboxRequest<'a> {
    pub runtime: &'a LanguageRuntime,
    pub source_path: &'a Path,
    pub test_index: usize,
    pub input: &'a str,
    pub time_limit_ms: u64,
}

/// Raw output of a run that exited with status 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Wall-clock limit hit, inside the container or by host supervision
    #[error("time limit exceeded")]
    TimedOut,
    /// The program exited non-zero on its own
    #[error("runtime failure (exit code {exit_code})")]
    RuntimeFailure { exit_code: i64, stderr: String },
    /// Docker unavailable, image missing, bad mount, ...
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn run(&self, request: SandboxRequest<'_>) -> Result<SandboxOutput, SandboxError>;
}

/// Map a container exit status to the executor contract
pub fn classify_exit(
    exit_code: i64,
    stdout: String,
    stderr: String,
) -> Result<SandboxOutput, SandboxError> {
    match exit_code {
        0 => Ok(SandboxOutput { stdout, stderr }),
        TIMEOUT_EXIT_CODE | ABORT_EXIT_CODE => Err(SandboxError::TimedOut),
        code => Err(SandboxError::RuntimeFailure {
            exit_code: code,
            stderr,
        }),
    }
}

/// `1000` → `"1"`, `1500` → `"1.5"`
pub fn limit_seconds(time_limit_ms: u64) -> String {
    format!("{}", time_limit_ms as f64 / 1000.0)
}

/// Unique per staged file and test index, so concurrent runs never collide
pub fn container_name(source_path: &Path, runtime: &LanguageRuntime, test_index: usize) -> String {
    let stem = source_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}-{}-{}", stem, runtime.container_name, test_index)
}

/// `timeout <s> /usr/bin/time -f "%U %M" <command...> /app/<file>`
pub fn sandbox_command(runtime: &LanguageRuntime, file_name: &str, time_limit_ms: u64) -> Vec<String> {
    let mut cmd = vec![
        "timeout".to_string(),
        limit_seconds(time_limit_ms),
        "/usr/bin/time".to_string(),
        "-f".to_string(),
        TIME_FORMAT.to_string(),
    ];
    cmd.extend(runtime.command.split_whitespace().map(str::to_string));
    cmd.push(format!("{}/{}", MOUNT_POINT, file_name));
    cmd
}

/// Container cleanup guard - guarantees container removal on drop
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let docker = self.docker.clone();
        let container_id = std::mem::take(&mut self.container_id);

        tokio::spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container = %container_id, error = %e, "Failed to remove container");
            }
        });
    }
}

/// Docker-backed sandbox
///
/// Network is disabled, memory and CPU are capped from the runtime descriptor,
/// and the host kills the container if it outlives `time limit + grace`.
pub struct DockerEngine {
    docker: Docker,
    grace: Duration,
}

impl DockerEngine {
    pub fn connect(grace: Duration) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;
        Ok(Self { docker, grace })
    }

    /// Images are built out of band; a missing one is reported, not pulled
    pub async fn ensure_image(&self, runtime: &LanguageRuntime) -> anyhow::Result<()> {
        let image = runtime.image_ref();
        self.docker
            .inspect_image(&image)
            .await
            .with_context(|| format!("Sandbox image '{}' is not available", image))?;
        debug!(image = %image, language = %runtime.name, "Image present");
        Ok(())
    }

    fn container_config(
        &self,
        request: &SandboxRequest<'_>,
    ) -> anyhow::Result<Config<String>> {
        let host_dir = request
            .source_path
            .parent()
            .ok_or_else(|| anyhow!("Staged file {} has no parent", request.source_path.display()))?;
        let file_name = request
            .source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("Staged file {} has no name", request.source_path.display()))?;

        let runtime = request.runtime;
        Ok(Config {
            image: Some(runtime.image_ref()),
            cmd: Some(sandbox_command(runtime, &file_name, request.time_limit_ms)),
            working_dir: Some(MOUNT_POINT.to_string()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                binds: Some(vec![format!("{}:{}", host_dir.display(), MOUNT_POINT)]),
                memory: Some(i64::from(runtime.memory_limit_mb) * 1024 * 1024),
                nano_cpus: Some((f64::from(runtime.cpu_limit) * 1_000_000_000.0) as i64),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Stream stdin in, collect stdout/stderr, then wait for the exit status
    async fn drive(
        &self,
        container_id: &str,
        attached: AttachContainerResults,
        input: &str,
    ) -> anyhow::Result<(String, String, i64)> {
        let AttachContainerResults { mut output, input: mut stdin } = attached;

        // Matches `echo "<input>" | ...`: the payload always ends with a newline
        let payload = format!("{}\n", input);
        let feed = async move {
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                debug!(error = %e, "stdin closed early");
            }
            if let Err(e) = stdin.shutdown().await {
                debug!(error = %e, "stdin shutdown failed");
            }
        };

        let collect = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdIn { .. }) => {}
                    Err(e) => {
                        warn!(container = %container_id, error = %e, "Error reading container output");
                        break;
                    }
                }
            }
            (stdout, stderr)
        };

        let (_, (stdout, stderr)) = tokio::join!(feed, collect);

        let mut wait = self.docker.wait_container(
            container_id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        let exit_code = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(anyhow::Error::new(e).context("Failed to wait for container")),
            None => anyhow::bail!("No wait response from container"),
        };

        Ok((stdout, stderr, exit_code))
    }
}

#[async_trait]
impl SandboxExecutor for DockerEngine {
    async fn run(&self, request: SandboxRequest<'_>) -> Result<SandboxOutput, SandboxError> {
        let name = container_name(request.source_path, request.runtime, request.test_index);
        let config = self.container_config(&request)?;

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .with_context(|| format!("Failed to create container {}", name))?;

        let _guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: created.id.clone(),
        };

        // Attach before start so no output is lost
        let attached = self
            .docker
            .attach_container(
                &created.id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .context("Failed to attach to container")?;

        let started = Instant::now();
        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start container")?;

        let hard_limit = Duration::from_millis(request.time_limit_ms) + self.grace;
        let outcome = tokio::time::timeout(hard_limit, self.drive(&created.id, attached, request.input)).await;

        match outcome {
            Ok(Ok((stdout, stderr, exit_code))) => {
                debug!(
                    container = %name,
                    exit_code,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Container exited"
                );
                classify_exit(exit_code, stdout, stderr)
            }
            Ok(Err(e)) => Err(SandboxError::Infrastructure(e)),
            Err(_) => {
                info!(
                    container = %name,
                    limit_ms = hard_limit.as_millis() as u64,
                    "Container outlived its limit, killing"
                );
                if let Err(e) = self
                    .docker
                    .kill_container(&created.id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(container = %name, error = %e, "Failed to kill timed-out container");
                }
                Err(SandboxError::TimedOut)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ojudge_common::config::default_runtimes;
    use std::path::PathBuf;

    fn python() -> LanguageRuntime {
        default_runtimes()
            .into_iter()
            .find(|r| r.name == "py")
            .unwrap()
    }

    #[test]
    fn test_limit_seconds() {
        assert_eq!(limit_seconds(1000), "1");
        assert_eq!(limit_seconds(1500), "1.5");
        assert_eq!(limit_seconds(250), "0.25");
    }

    #[test]
    fn test_sandbox_command_wraps_program() {
        let cmd = sandbox_command(&python(), "abc.py", 2000);
        assert_eq!(
            cmd,
            vec!["timeout", "2", "/usr/bin/time", "-f", "%U %M", "python3", "/app/abc.py"]
        );
    }

    #[test]
    fn test_sandbox_command_splits_interpreter_flags() {
        let mut runtime = python();
        runtime.command = "python3 -u".to_string();
        let cmd = sandbox_command(&runtime, "abc.py", 1000);
        assert_eq!(&cmd[5..], &["python3", "-u", "/app/abc.py"]);
    }

    #[test]
    fn test_container_name_is_unique_per_index() {
        let path = PathBuf::from("/srv/codes/5f1c.py");
        let a = container_name(&path, &python(), 0);
        let b = container_name(&path, &python(), 1);
        assert_eq!(a, "5f1c-python_oj-0");
        assert_ne!(a, b);
    }

    #[test]
    fn test_exit_zero_is_success() {
        let out = classify_exit(0, "4\n".into(), "0.01 9000\n".into()).unwrap();
        assert_eq!(out.stdout, "4\n");
        assert_eq!(out.stderr, "0.01 9000\n");
    }

    #[test]
    fn test_timeout_exit_codes() {
        assert!(matches!(
            classify_exit(124, String::new(), String::new()),
            Err(SandboxError::TimedOut)
        ));
        assert!(matches!(
            classify_exit(2, String::new(), String::new()),
            Err(SandboxError::TimedOut)
        ));
    }

    #[test]
    fn test_other_exit_codes_are_runtime_failures() {
        match classify_exit(1, String::new(), "ZeroDivisionError".into()) {
            Err(SandboxError::RuntimeFailure { exit_code, stderr }) => {
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "ZeroDivisionError");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            classify_exit(137, String::new(), String::new()),
            Err(SandboxError::RuntimeFailure { exit_code: 137, .. })
        ));
    }

    /// Needs a Docker daemon with the `online_python` image built
    #[tokio::test]
    #[ignore]
    async fn test_docker_python_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sum.py");
        std::fs::write(&path, "a, b = map(int, input().split())\nprint(a + b)\n").unwrap();

        let engine = DockerEngine::connect(Duration::from_millis(1000)).unwrap();
        let runtime = python();
        let out = engine
            .run(SandboxRequest {
                runtime: &runtime,
                source_path: &path,
                test_index: 0,
                input: "1 2",
                time_limit_ms: 2000,
            })
            .await
            .unwrap();
        assert_eq!(out.stdout, "3\n");
    }
}
