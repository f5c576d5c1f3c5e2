//! Terraform subprocess driver

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{IacConfig, IacEngine, PlanResult, StateKey, CONFIG_FILE_NAME};
use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub struct TerraformOptions {
    pub binary: PathBuf,
    /// Root under which every state key gets its own working directory
    pub work_root: PathBuf,
    /// Upper bound on a single invocation
    pub timeout: Duration,
    /// Time between interrupting a timed-out or cancelled run and killing it
    pub grace_period: Duration,
}

impl Default for TerraformOptions {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("terraform"),
            work_root: PathBuf::from("/var/lib/lattice/terraform"),
            timeout: Duration::from_secs(30 * 60),
            grace_period: Duration::from_secs(30),
        }
    }
}

struct Completed {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

/// Runs the `terraform` binary in per-state working directories.
///
/// Invocations against the same working directory are serialized.
pub struct Terraform {
    options: TerraformOptions,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    token: CancellationToken,
}

impl Terraform {
    pub fn new(options: TerraformOptions, token: CancellationToken) -> Self {
        Self {
            options,
            locks: Mutex::new(HashMap::new()),
            token,
        }
    }

    fn lock_for(&self, dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(dir.to_path_buf())
            .or_default()
            .clone()
    }

    /// Write the configuration and initialize the working directory
    async fn prepare(&self, key: &StateKey, config: &IacConfig) -> Result<PathBuf> {
        let dir = key.work_dir(&self.options.work_root);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(CONFIG_FILE_NAME), config.to_json()?).await?;
        let init = self.run(&dir, "init", &["init", "-input=false"]).await?;
        if init.code != Some(0) {
            return Err(failure("init", &dir, &init));
        }
        Ok(dir)
    }

    async fn run(&self, dir: &Path, operation: &str, args: &[&str]) -> Result<Completed> {
        debug!(work_dir = %dir.display(), ?args, "Running terraform");
        let mut child = Command::new(&self.options.binary)
            .args(args)
            .current_dir(dir)
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = tokio::time::sleep(self.options.timeout) => {
                self.interrupt(&mut child).await?;
                #[cfg(feature = "metrics")]
                crate::controller::metrics::record_iac_invocation(operation, "timeout");
                return Err(Error::IacTimeout {
                    operation: operation.to_string(),
                    work_dir: dir.display().to_string(),
                    seconds: self.options.timeout.as_secs(),
                });
            }
            _ = self.token.cancelled() => {
                self.interrupt(&mut child).await?;
                return Err(Error::Cancelled);
            }
        };

        let completed = Completed {
            code: status.code(),
            stdout: stdout.await.unwrap_or_default(),
            stderr: stderr.await.unwrap_or_default(),
        };
        #[cfg(feature = "metrics")]
        crate::controller::metrics::record_iac_invocation(
            operation,
            match completed.code {
                Some(0) => "success",
                Some(2) if operation == "plan" => "changes",
                _ => "error",
            },
        );
        Ok(completed)
    }

    /// Ask the engine to stop, then kill it once the grace period is over
    async fn interrupt(&self, child: &mut Child) -> Result<()> {
        if let Some(pid) = child.id() {
            if let Err(e) = send_interrupt(pid) {
                child.kill().await?;
                return Err(e);
            }
        }
        if tokio::time::timeout(self.options.grace_period, child.wait())
            .await
            .is_err()
        {
            warn!("Terraform ignored interrupt, killing it");
            child.kill().await?;
        }
        Ok(())
    }
}

/// SIGINT lets the engine release its state lock before exiting
#[cfg(unix)]
fn send_interrupt(pid: u32) -> Result<()> {
    let pid = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory preconditions. The pid belongs to a
    // child that has not been reaped yet, so it cannot have been reused.
    #[allow(unsafe_code)]
    let result = unsafe { libc::kill(pid, libc::SIGINT) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().into())
    }
}

#[cfg(not(unix))]
fn send_interrupt(_pid: u32) -> Result<()> {
    Ok(())
}

fn drain<R>(reader: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn failure(operation: &str, dir: &Path, completed: &Completed) -> Error {
    let message = if completed.stderr.trim().is_empty() {
        completed.stdout.trim().to_string()
    } else {
        completed.stderr.trim().to_string()
    };
    Error::IacError {
        operation: operation.to_string(),
        work_dir: dir.display().to_string(),
        message: format!("exit code {:?}: {message}", completed.code),
    }
}

/// `terraform output` prints strings quoted in newer releases
fn parse_output(raw: &str) -> String {
    let trimmed = raw.trim();
    serde_json::from_str::<String>(trimmed).unwrap_or_else(|_| trimmed.to_string())
}

#[async_trait]
impl IacEngine for Terraform {
    #[instrument(skip(self, config), fields(state_key = %key))]
    async fn plan(&self, key: &StateKey, config: &IacConfig, destroy: bool) -> Result<PlanResult> {
        let lock = self.lock_for(&key.work_dir(&self.options.work_root));
        let _guard = lock.lock().await;
        let dir = self.prepare(key, config).await?;

        let mut args = vec!["plan", "-input=false", "-detailed-exitcode"];
        if destroy {
            args.push("-destroy");
        }
        let completed = self.run(&dir, "plan", &args).await?;
        match completed.code {
            Some(0) => Ok(PlanResult::Empty),
            Some(2) => Ok(PlanResult::NonEmpty),
            _ => Err(failure("plan", &dir, &completed)),
        }
    }

    #[instrument(skip(self, config), fields(state_key = %key))]
    async fn apply(&self, key: &StateKey, config: &IacConfig) -> Result<()> {
        let lock = self.lock_for(&key.work_dir(&self.options.work_root));
        let _guard = lock.lock().await;
        let dir = self.prepare(key, config).await?;

        let completed = self
            .run(&dir, "apply", &["apply", "-input=false", "-auto-approve"])
            .await?;
        if completed.code != Some(0) {
            return Err(failure("apply", &dir, &completed));
        }
        info!("Applied infrastructure");
        Ok(())
    }

    #[instrument(skip(self, config), fields(state_key = %key))]
    async fn destroy(&self, key: &StateKey, config: &IacConfig) -> Result<()> {
        let lock = self.lock_for(&key.work_dir(&self.options.work_root));
        let _guard = lock.lock().await;
        let dir = self.prepare(key, config).await?;

        let completed = self.run(&dir, "destroy", &["destroy", "-force"]).await?;
        if completed.code != Some(0) {
            return Err(failure("destroy", &dir, &completed));
        }
        info!("Destroyed infrastructure");
        Ok(())
    }

    #[instrument(skip(self, config), fields(state_key = %key))]
    async fn output(
        &self,
        key: &StateKey,
        config: &IacConfig,
        names: &[&str],
    ) -> Result<BTreeMap<String, String>> {
        let lock = self.lock_for(&key.work_dir(&self.options.work_root));
        let _guard = lock.lock().await;
        let dir = self.prepare(key, config).await?;

        let mut outputs = BTreeMap::new();
        for name in names {
            let completed = self.run(&dir, "output", &["output", *name]).await?;
            if completed.code != Some(0) {
                return Err(failure("output", &dir, &completed));
            }
            outputs.insert(name.to_string(), parse_output(&completed.stdout));
        }
        Ok(outputs)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::iac::StateScope;

    /// Shell script standing in for the engine: the plan exit code comes
    /// from `PLAN_EXIT` in the working directory
    fn fake_engine(dir: &Path) -> PathBuf {
        let path = dir.join("fake-terraform");
        std::fs::write(
            &path,
            r#"#!/bin/sh
echo "$@" >> invocations.log
case "$1" in
  init) exit 0 ;;
  plan) exit "$(cat PLAN_EXIT 2>/dev/null || echo 0)" ;;
  apply) exit 0 ;;
  destroy) echo "destroy refused" >&2; exit 1 ;;
  output) echo "\"lb-123.elb.amazonaws.com\"" ;;
  sleep) sleep 30 ;;
  trap) trap 'echo interrupted > interrupted.log; exit 130' INT; sleep 30 & wait ;;
esac
"#,
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn engine(root: &Path) -> Terraform {
        Terraform::new(
            TerraformOptions {
                binary: fake_engine(root),
                work_root: root.join("work"),
                timeout: Duration::from_secs(10),
                grace_period: Duration::from_millis(100),
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_plan_exit_codes() {
        let root = tempfile::tempdir().unwrap();
        let terraform = engine(root.path());
        let key = StateKey::new("l1", StateScope::Cluster);
        let config = IacConfig::new();

        assert_eq!(
            terraform.plan(&key, &config, false).await.unwrap(),
            PlanResult::Empty
        );

        let dir = key.work_dir(&root.path().join("work"));
        std::fs::write(dir.join("PLAN_EXIT"), "2").unwrap();
        assert_eq!(
            terraform.plan(&key, &config, false).await.unwrap(),
            PlanResult::NonEmpty
        );

        std::fs::write(dir.join("PLAN_EXIT"), "1").unwrap();
        let err = terraform.plan(&key, &config, false).await.unwrap_err();
        assert!(matches!(err, Error::IacError { .. }));

        assert!(dir.join(CONFIG_FILE_NAME).exists());
        let log = std::fs::read_to_string(dir.join("invocations.log")).unwrap();
        assert!(log.contains("plan -input=false -detailed-exitcode"));
    }

    #[tokio::test]
    async fn test_destroy_failure_surfaces_stderr() {
        let root = tempfile::tempdir().unwrap();
        let terraform = engine(root.path());
        let key = StateKey::node_pool("l1", "ns.default", 1);
        let err = terraform.destroy(&key, &IacConfig::new()).await.unwrap_err();
        assert!(err.to_string().contains("destroy refused"));
    }

    #[tokio::test]
    async fn test_output_is_unquoted() {
        let root = tempfile::tempdir().unwrap();
        let terraform = engine(root.path());
        let key = StateKey::address_load_balancer("l1", "ns.api");
        let outputs = terraform
            .output(&key, &IacConfig::new(), &["dns_name"])
            .await
            .unwrap();
        assert_eq!(outputs["dns_name"], "lb-123.elb.amazonaws.com");
    }

    #[tokio::test]
    async fn test_timeout_kills_engine() {
        let root = tempfile::tempdir().unwrap();
        let mut terraform = engine(root.path());
        terraform.options.timeout = Duration::from_millis(200);
        let dir = root.path().join("work");
        std::fs::create_dir_all(&dir).unwrap();
        let err = terraform.run(&dir, "sleep", &["sleep"]).await.err().unwrap();
        assert!(matches!(err, Error::IacTimeout { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_engine() {
        let root = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let terraform = Terraform::new(
            TerraformOptions {
                binary: fake_engine(root.path()),
                work_root: root.path().join("work"),
                timeout: Duration::from_secs(10),
                grace_period: Duration::from_secs(5),
            },
            token.clone(),
        );
        let dir = root.path().join("work");
        std::fs::create_dir_all(&dir).unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
        });
        let err = terraform.run(&dir, "trap", &["trap"]).await.err().unwrap();
        canceller.await.unwrap();
        assert!(matches!(err, Error::Cancelled));
        let marker = std::fs::read_to_string(dir.join("interrupted.log")).unwrap();
        assert_eq!(marker.trim(), "interrupted");
    }

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output("\"a.b\"\n"), "a.b");
        assert_eq!(parse_output("a.b\n"), "a.b");
    }
}
