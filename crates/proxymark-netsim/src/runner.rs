//! Command execution capability.
//!
//! Everything the harness does to the outside world (namespace and link
//! management, qdisc shaping, service and load-generator processes) goes
//! through a [`CommandRunner`]. `SysRunner` shells out for real, escalating
//! through `sudo` when not already root; `RecordingRunner` logs
//! every invocation and returns scripted outputs, so provisioning and
//! orchestration logic can be unit-tested on unprivileged machines.

use std::io;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::sync::Mutex;

use serde::Serialize;

/// Executes external commands on behalf of the harness.
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output.
    fn run(&self, program: &str, args: &[&str]) -> io::Result<Output>;

    /// Spawn a long-lived child process (stdout/stderr discarded).
    fn spawn(&self, program: &str, args: &[&str]) -> io::Result<Box<dyn ManagedChild>>;
}

/// A spawned process the harness can poll, signal, and reap.
pub trait ManagedChild: Send {
    fn id(&self) -> u32;
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;
    fn kill(&mut self) -> io::Result<()>;
    fn wait(&mut self) -> io::Result<ExitStatus>;
}

impl ManagedChild for Child {
    fn id(&self) -> u32 {
        Child::id(self)
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        Child::try_wait(self)
    }

    fn kill(&mut self) -> io::Result<()> {
        Child::kill(self)
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        Child::wait(self)
    }
}

/// Real execution. Namespace tooling needs root, so commands are wrapped in
/// `sudo` unless the process is already running as root (e.g., inside a
/// container without sudo installed).
#[derive(Debug)]
pub struct SysRunner {
    sudo: bool,
}

impl Default for SysRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SysRunner {
    pub fn new() -> Self {
        // SAFETY: geteuid cannot fail.
        Self {
            sudo: unsafe { libc::geteuid() } != 0,
        }
    }

    fn command(&self, program: &str, args: &[&str]) -> Command {
        let mut cmd = if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(program);
            cmd
        } else {
            Command::new(program)
        };
        cmd.args(args);
        cmd
    }
}

impl CommandRunner for SysRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<Output> {
        self.command(program, args).output()
    }

    fn spawn(&self, program: &str, args: &[&str]) -> io::Result<Box<dyn ManagedChild>> {
        let child = self
            .command(program, args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Box::new(child))
    }
}

/// One recorded command invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Space-joined rendering, convenient for substring assertions in tests.
    pub fn line(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

type ScriptFn = dyn Fn(&str, &[&str]) -> ScriptedOutput + Send + Sync;

/// Scripted result for a recorded invocation.
#[derive(Debug, Clone)]
pub struct ScriptedOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptedOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Records every invocation; replies come from an optional script closure
/// (default: success with empty output). Spawned children report as already
/// exited successfully.
pub struct RecordingRunner {
    calls: Mutex<Vec<Invocation>>,
    script: Option<Box<ScriptFn>>,
}

impl Default for RecordingRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            script: None,
        }
    }

    /// Replies to each invocation are produced by `script`.
    pub fn with_script<F>(script: F) -> Self
    where
        F: Fn(&str, &[&str]) -> ScriptedOutput + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            script: Some(Box::new(script)),
        }
    }

    /// Snapshot of all invocations so far, in order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Space-joined command lines, in order.
    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(Invocation::line).collect()
    }

    fn record(&self, program: &str, args: &[&str]) -> ScriptedOutput {
        self.calls.lock().unwrap().push(Invocation {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        });
        match &self.script {
            Some(f) => f(program, args),
            None => ScriptedOutput::ok(""),
        }
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<Output> {
        let scripted = self.record(program, args);
        Ok(Output {
            status: exit_status(scripted.code),
            stdout: scripted.stdout.into_bytes(),
            stderr: scripted.stderr.into_bytes(),
        })
    }

    fn spawn(&self, program: &str, args: &[&str]) -> io::Result<Box<dyn ManagedChild>> {
        let scripted = self.record(program, args);
        Ok(Box::new(ExitedChild {
            status: exit_status(scripted.code),
        }))
    }
}

fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    // wait(2) status encoding: exit code in the high byte
    ExitStatus::from_raw((code & 0xff) << 8)
}

/// Fake child handle used by [`RecordingRunner`].
struct ExitedChild {
    status: ExitStatus,
}

impl ManagedChild for ExitedChild {
    fn id(&self) -> u32 {
        0
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        Ok(Some(self.status))
    }

    fn kill(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        Ok(self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_runner_logs_in_order() {
        let runner = RecordingRunner::new();
        runner.run("ip", &["netns", "add", "pmk_proxy"]).unwrap();
        runner.run("tc", &["qdisc", "show"]).unwrap();

        let lines = runner.lines();
        assert_eq!(lines[0], "ip netns add pmk_proxy");
        assert_eq!(lines[1], "tc qdisc show");
    }

    #[test]
    fn scripted_failure_surfaces_in_output() {
        let runner = RecordingRunner::with_script(|program, _| {
            if program == "tc" {
                ScriptedOutput::fail(2, "qdisc kind is unknown")
            } else {
                ScriptedOutput::ok("")
            }
        });

        let out = runner.run("tc", &["qdisc", "add"]).unwrap();
        assert!(!out.status.success());
        assert_eq!(String::from_utf8_lossy(&out.stderr), "qdisc kind is unknown");

        let out = runner.run("ip", &["link"]).unwrap();
        assert!(out.status.success());
    }

    #[test]
    fn call_log_serializes_for_diagnostics() {
        let runner = RecordingRunner::new();
        runner.run("ip", &["netns", "list"]).unwrap();

        let json = serde_json::to_string(&runner.calls()).unwrap();
        assert_eq!(json, r#"[{"program":"ip","args":["netns","list"]}]"#);
    }
}
