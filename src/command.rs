//! External command invocation
//!
//! talosctl and clusterctl are driven as subprocesses. Commands are built as
//! plain [`CommandSpec`] values so argument construction can be tested
//! without spawning anything.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::Error;

/// A program invocation: binary, arguments and extra environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    /// Binary to execute
    pub program: PathBuf,
    /// Arguments in order
    pub args: Vec<String>,
    /// Extra environment variables
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    /// Start a command for `program`
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append `--flag value`
    pub fn flag(self, name: &str, value: impl fmt::Display) -> Self {
        self.arg(format!("--{name}")).arg(value.to_string())
    }

    /// Append `--flag=value`, for flags that take optional values
    pub fn flag_eq(self, name: &str, value: impl fmt::Display) -> Self {
        self.arg(format!("--{name}={value}"))
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Value following `--name`, if present
    pub fn flag_value(&self, name: &str) -> Option<&str> {
        let flag = format!("--{name}");
        self.args
            .iter()
            .position(|a| *a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);
        command
    }

    /// Run the command, streaming stdout into the log; stderr goes to the terminal
    pub async fn run(&self) -> Result<(), Error> {
        debug!(command = %self, "Running");

        let mut child = self
            .command()
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::command(format!("failed to start {}: {}", self.name(), e)))?;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                info!("{}", line);
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(Error::command(format!("{} failed: {}", self, status)));
        }

        Ok(())
    }

    /// Run the command and return its stdout
    pub async fn output(&self) -> Result<String, Error> {
        debug!(command = %self, "Running");

        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::command(format!("failed to start {}: {}", self.name(), e)))?;

        if !output.status.success() {
            return Err(Error::command(format!(
                "{} failed: {}: {}",
                self,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
