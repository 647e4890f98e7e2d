//! External programs as command values.
//!
//! Each external program (container runtime, import CLI) is modelled as a
//! value — executable, argv, env, bind mounts — and executed with stdout
//! and stderr captured whole. Output is appended to the per-order log
//! files rather than piped through the service logger, so concurrent
//! orders never interleave.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::{AdiError, Result};

/// A host-path to container-path bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub host: PathBuf,
    pub container: PathBuf,
}

impl MountSpec {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
        }
    }

    /// Render as a `-v host:container` argument value.
    pub fn as_volume_arg(&self) -> String {
        format!("{}:{}", self.host.display(), self.container.display())
    }
}

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }

    /// Last non-empty line of stdout, if any.
    pub fn stdout_tail(&self) -> Option<&str> {
        self.stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
    }
}

/// An external program invocation: executable, argv, env.
#[derive(Debug, Clone)]
pub struct CapturedCommand {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CapturedCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn argv(&self) -> &[String] {
        &self.args
    }

    /// The full command line, for logging and tests.
    pub fn render(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    /// Spawn the process and wait for it, capturing stdout and stderr.
    #[instrument(skip(self), fields(program = %self.program))]
    pub async fn run(&self) -> Result<CapturedOutput> {
        debug!(command = %self.render(), "spawning subprocess");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let output = cmd.output().await.map_err(|e| {
            AdiError::Subprocess(format!("failed to spawn {}: {e}", self.program))
        })?;

        Ok(CapturedOutput {
            status_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run and append the captured streams to the given log files.
    pub async fn run_with_logs(&self, log_file: &Path, err_file: &Path) -> Result<CapturedOutput> {
        let output = self.run().await?;
        append_log(log_file, &self.render(), &output.stdout)?;
        append_log(err_file, &self.render(), &output.stderr)?;
        Ok(output)
    }
}

fn append_log(path: &Path, header: &str, content: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "$ {header}")?;
    if !content.is_empty() {
        file.write_all(content.as_bytes())?;
        if !content.ends_with('\n') {
            writeln!(file)?;
        }
    }
    Ok(())
}
