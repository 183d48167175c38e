// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io::Read;
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use ssh2::Session;
use thiserror::Error;

use crate::command::CommandResult;

pub const DEFAULT_SSH_RETRIES: u8 = 6;
pub const DEFAULT_SSH_TIMEOUT: u8 = 10;
pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Clone)]
pub struct PasswordAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum SshCommandError {
    #[error("ssh connection failed")]
    Connection(#[source] std::io::Error),
    #[error("ssh session creation failed")]
    Session(#[source] ssh2::Error),
    #[error("ssh handshake failed")]
    Handshake(#[source] ssh2::Error),
    #[error("ssh authentication failed")]
    Authentication(#[source] ssh2::Error),
    #[error("ssh channel session failed")]
    ChannelSession(#[source] ssh2::Error),
    #[error("ssh command failed")]
    Command(#[source] ssh2::Error),
    #[error("retrieving exit status from ssh command failed")]
    ExitStatus(#[source] ssh2::Error),
    #[error("the exit code indicates failure: {0}")]
    NonZeroExitStatus(i32),
}

// One attempt: connect, authenticate, run, collect output and status.
fn ssh_exec(
    command: &str,
    auth: &PasswordAuth,
    ip: &str,
    port: u16,
    timeout: u8,
) -> Result<CommandResult, SshCommandError> {
    let start = Instant::now();
    let tcp = TcpStream::connect(format!("{ip}:{port}")).map_err(SshCommandError::Connection)?;
    let mut sess = Session::new().map_err(SshCommandError::Session)?;
    sess.set_tcp_stream(tcp);
    sess.set_timeout(u32::from(timeout) * 1000);
    sess.handshake().map_err(SshCommandError::Handshake)?;

    sess.userauth_password(&auth.username, &auth.password)
        .map_err(SshCommandError::Authentication)?;

    let mut channel = sess
        .channel_session()
        .map_err(SshCommandError::ChannelSession)?;
    channel.exec(command).map_err(SshCommandError::Command)?;

    let mut stdout = String::new();
    let mut stderr = String::new();
    // Intentionally ignore these results here as their failure
    // does not precipitate a repeat
    let _ = channel.read_to_string(&mut stdout);
    let _ = channel.stderr().read_to_string(&mut stderr);
    let _ = channel.close();
    let _ = channel.wait_close();

    let status = channel.exit_status().map_err(SshCommandError::ExitStatus)?;

    Ok(CommandResult {
        command: command.to_string(),
        exit_status: status,
        stdout,
        stderr,
        duration: start.elapsed(),
    })
}

/// Runs `command` in the guest, retrying with a growing back-off until it
/// exits with status 0 or `retries` attempts were made.
pub fn ssh_command_ip_with_auth(
    command: &str,
    auth: &PasswordAuth,
    ip: &str,
    retries: u8,
    timeout: u8,
) -> Result<String, SshCommandError> {
    let mut counter = 0;
    loop {
        let e = match ssh_exec(command, auth, ip, DEFAULT_SSH_PORT, timeout) {
            Ok(r) if r.success() => return Ok(r.stdout),
            Ok(r) => SshCommandError::NonZeroExitStatus(r.exit_status),
            Err(e) => e,
        };

        counter += 1;
        if counter >= retries {
            warn!(
                "\n\n==== Start ssh command output (FAILED) ====\n\n\
                 command=\"{command}\"\n\
                 auth=\"{auth:#?}\"\n\
                 ip=\"{ip}\"\n\
                 error=\"{e:?}\"\n\
                 \n==== End ssh command outout ====\n\n"
            );

            return Err(e);
        }
        thread::sleep(Duration::new((timeout * counter).into(), 0));
    }
}

/// Logged-in handle on a guest, as returned by `Subject::wait_for_login`.
#[derive(Clone, Debug)]
pub struct GuestSession {
    ip: String,
    auth: PasswordAuth,
    retries: u8,
    timeout: u8,
}

impl GuestSession {
    /// Opens a session, checking that the guest accepts the credentials.
    pub fn connect(ip: &str, auth: PasswordAuth) -> Result<Self, SshCommandError> {
        let session = GuestSession {
            ip: ip.to_string(),
            auth,
            retries: DEFAULT_SSH_RETRIES,
            timeout: DEFAULT_SSH_TIMEOUT,
        };
        session.cmd("true")?;
        debug!("Logged in to guest {ip}");
        Ok(session)
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// Runs `command`, retrying until it succeeds. Returns stdout.
    pub fn cmd(&self, command: &str) -> Result<String, SshCommandError> {
        ssh_command_ip_with_auth(command, &self.auth, &self.ip, self.retries, self.timeout)
    }

    /// Runs `command` once and returns its result whatever the exit status.
    pub fn cmd_output(&self, command: &str) -> Result<CommandResult, SshCommandError> {
        ssh_exec(command, &self.auth, &self.ip, DEFAULT_SSH_PORT, self.timeout)
    }
}
