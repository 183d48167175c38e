// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::ffi::OsStr;
use std::fmt;
use std::io::{self, Read};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use thiserror::Error;
use wait_timeout::ChildExt;

/// Grace period between SIGTERM and SIGKILL when stopping a child.
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("spawning `{0}` failed")]
    Spawn(String, #[source] io::Error),
    #[error("waiting for `{0}` failed")]
    Wait(String, #[source] io::Error),
    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

/// Outcome of one external process invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandResult {
    pub command: String,
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandResult {
    pub fn new(command: &str, exit_status: i32, stdout: &str, stderr: &str) -> Self {
        CommandResult {
            command: command.to_string(),
            exit_status,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            duration: Duration::ZERO,
        }
    }

    fn from_output(command: String, output: &Output, duration: Duration) -> Self {
        CommandResult {
            command,
            exit_status: exit_code(&output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// Stdout followed by stderr, which is what most checks look at.
    pub fn output(&self) -> String {
        let mut s = self.stdout.clone();
        if !s.is_empty() && !s.ends_with('\n') && !self.stderr.is_empty() {
            s.push('\n');
        }
        s.push_str(&self.stderr);
        s
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "command=\"{}\"\nexit_status={}\nduration={:?}\n---stdout---\n{}\n---stderr---\n{}",
            self.command, self.exit_status, self.duration, self.stdout, self.stderr
        )
    }
}

// Shell convention: a child killed by signal N reports 128 + N.
fn exit_code(status: &ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or_default(),
    }
}

/// Builder around `std::process::Command` that always yields a
/// `CommandResult` and can bound the run time of the child.
pub struct HostCommand {
    command: Command,
    line: Vec<String>,
    timeout: Option<Duration>,
    print_cmd: bool,
}

impl HostCommand {
    pub fn new(program: &str) -> Self {
        Self {
            command: Command::new(program),
            line: vec![program.to_string()],
            timeout: None,
            print_cmd: true,
        }
    }

    /// Runs `command_line` through `bash -c`.
    pub fn shell(command_line: &str) -> Self {
        let mut cmd = Self::new("bash");
        cmd.args(["-c", command_line]);
        cmd
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.line.push(arg.as_ref().to_string_lossy().into_owned());
        self.command.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(&mut self, key: K, value: V) -> &mut Self {
        self.command.env(key, value);
        self
    }

    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn set_print_cmd(&mut self, print_cmd: bool) -> &mut Self {
        self.print_cmd = print_cmd;
        self
    }

    pub fn command_line(&self) -> String {
        self.line.join(" ")
    }

    pub fn run(&mut self) -> Result<CommandResult, CommandError> {
        let line = self.command_line();
        if self.print_cmd {
            debug!("Running `{line}`");
        }

        let start = Instant::now();
        self.command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = match self.timeout {
            None => self
                .command
                .output()
                .map_err(|e| CommandError::Spawn(line.clone(), e))?,
            Some(timeout) => {
                let mut child = self
                    .command
                    .spawn()
                    .map_err(|e| CommandError::Spawn(line.clone(), e))?;
                // Both pipes are drained while waiting, a child writing more
                // than the pipe buffer would otherwise block until the timeout.
                let stdout = drain(child.stdout.take());
                let stderr = drain(child.stderr.take());

                let status = match child.wait_timeout(timeout) {
                    Ok(Some(status)) => status,
                    Ok(None) => {
                        kill_child(&mut child);
                        // Readers still blocked belong to a leftover
                        // grandchild holding the pipe, they are not waited for.
                        let partial = |r: thread::JoinHandle<Vec<u8>>| {
                            if r.is_finished() {
                                r.join().unwrap_or_default()
                            } else {
                                Vec::new()
                            }
                        };
                        warn!(
                            "\n\n==== Start '{line}' (TIMED OUT) ====\n\n\
                             ---stdout---\n{}\n---stderr---\n{}\
                             \n\n==== End '{line}' ====\n\n",
                            String::from_utf8_lossy(&partial(stdout)),
                            String::from_utf8_lossy(&partial(stderr)),
                        );
                        return Err(CommandError::Timeout {
                            command: line,
                            timeout,
                        });
                    }
                    Err(e) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(CommandError::Wait(line, e));
                    }
                };

                Output {
                    status,
                    stdout: stdout.join().unwrap_or_default(),
                    stderr: stderr.join().unwrap_or_default(),
                }
            }
        };

        let result = CommandResult::from_output(line, &output, start.elapsed());
        debug!(
            "`{}` exited with {} after {:?}",
            result.command, result.exit_status, result.duration
        );
        Ok(result)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf) {
                warn!("Reading child output failed: {e}");
            }
        }
        buf
    })
}

/// Sends SIGTERM, then SIGKILL if the child is still around after the
/// grace period.
pub fn kill_child(child: &mut Child) {
    // SAFETY: kill(2) only takes plain integers
    let r = unsafe { libc::kill(child.id() as i32, libc::SIGTERM) };
    if r != 0 {
        let e = io::Error::last_os_error();
        if e.raw_os_error() == Some(libc::ESRCH) {
            return;
        }
        warn!("Failed to kill child with SIGTERM: {e:?}");
    }

    match child.wait_timeout(KILL_GRACE_PERIOD) {
        Ok(Some(_)) => {}
        Ok(None) | Err(_) => {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

pub fn exec_host_command_output(command: &str) -> Result<CommandResult, CommandError> {
    let result = HostCommand::shell(command).run()?;

    if !result.success() {
        warn!(
            "\n\n==== Start 'exec_host_command' failed ==== \
            \n\n---stdout---\n{}\n---stderr---{} \
            \n\n==== End 'exec_host_command' failed ====",
            result.stdout, result.stderr
        );
    }

    Ok(result)
}

pub fn exec_host_command_status(command: &str) -> Result<i32, CommandError> {
    Ok(exec_host_command_output(command)?.exit_status)
}

pub fn exec_host_command_with_retries(command: &str, retries: u32, interval: Duration) -> bool {
    for _ in 0..retries {
        match exec_host_command_output(command) {
            Ok(result) if result.success() => return true,
            Ok(_) => {}
            Err(e) => warn!("{e}"),
        }
        debug!("\n\n==== retrying in {interval:?} ===\n\n");
        thread::sleep(interval);
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_command_result() {
        let r = HostCommand::shell("echo out; echo err >&2; exit 3")
            .run()
            .unwrap();
        assert_eq!(r.exit_status, 3);
        assert!(!r.success());
        assert_eq!(r.stdout, "out\n");
        assert_eq!(r.stderr, "err\n");
        assert_eq!(r.output(), "out\nerr\n");
        assert_eq!(r.command, "bash -c echo out; echo err >&2; exit 3");
    }

    #[test]
    fn test_command_args() {
        let r = HostCommand::new("echo").args(["a", "b"]).arg("c").run().unwrap();
        assert!(r.success());
        assert_eq!(r.stdout_trimmed(), "a b c");
    }

    #[test]
    fn test_command_timeout() {
        let err = HostCommand::new("sleep")
            .arg("30")
            .timeout(Duration::from_millis(200))
            .run()
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[test]
    fn test_command_within_timeout() {
        let r = HostCommand::shell("echo done")
            .timeout(Duration::from_secs(10))
            .run()
            .unwrap();
        assert_eq!(r.stdout_trimmed(), "done");
    }

    #[test]
    fn test_large_output_within_timeout() {
        // Far beyond any pipe buffer, on both streams
        let r = HostCommand::shell("head -c 40000000 /dev/zero; head -c 1000000 /dev/zero >&2")
            .timeout(Duration::from_secs(60))
            .run()
            .unwrap();
        assert!(r.success());
        assert_eq!(r.stdout.len(), 40_000_000);
        assert_eq!(r.stderr.len(), 1_000_000);
        assert!(r.duration < Duration::from_secs(60));
    }

    #[test]
    fn test_spawn_failure() {
        let err = HostCommand::new("/nonexistent/virt-scenario-binary")
            .run()
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn(..)));
    }

    #[test]
    fn test_signal_exit_code() {
        let r = HostCommand::shell("kill -9 $$").run().unwrap();
        assert_eq!(r.exit_status, 128 + 9);
    }

    #[test]
    fn test_exec_host_command_helpers() {
        assert_eq!(exec_host_command_status("true").unwrap(), 0);
        assert_eq!(exec_host_command_status("exit 7").unwrap(), 7);
        assert!(exec_host_command_with_retries(
            "true",
            2,
            Duration::from_millis(10)
        ));
        assert!(!exec_host_command_with_retries(
            "false",
            2,
            Duration::from_millis(10)
        ));
    }
}
