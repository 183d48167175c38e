// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Handles on the virtual machines a scenario acts upon.

use std::fmt;
use std::fs;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info};
use thiserror::Error;
use vmm_sys_util::tempdir::TempDir;

use crate::command::{CommandError, CommandResult};
use crate::params::{Params, ParamsError};
use crate::ssh::{GuestSession, PasswordAuth, SshCommandError};
use crate::virsh::{parse_domifaddr_ipv4, Virsh};
use crate::wait::{wait_until, WaitError};
use crate::xml;

pub const DEFAULT_LOGIN_TIMEOUT: u64 = 240;

#[derive(Error, Debug)]
pub enum SubjectError {
    #[error("subject '{0}' does not exist")]
    NotFound(String),
    #[error("invoking virsh for '{0}' failed")]
    Command(String, #[source] CommandError),
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("unknown domain state '{0}'")]
    UnknownState(String),
    #[error("staging configuration of '{0}' failed")]
    Stage(String, #[source] std::io::Error),
    #[error("'{0}' does not support guest login")]
    LoginUnsupported(String),
    #[error("no guest address for '{0}'")]
    Address(String, #[source] WaitError),
    #[error("guest login to '{0}' failed")]
    Login(String, #[source] SshCommandError),
}

impl SubjectError {
    fn failed(result: &CommandResult) -> Self {
        SubjectError::CommandFailed {
            command: result.command.clone(),
            stderr: result.stderr.trim().to_string(),
        }
    }
}

/// Domain states as printed by `virsh domstate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainState {
    NoState,
    Running,
    Idle,
    Paused,
    InShutdown,
    ShutOff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    pub fn is_alive(&self) -> bool {
        !matches!(self, DomainState::ShutOff | DomainState::Crashed)
    }
}

impl FromStr for DomainState {
    type Err = SubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use DomainState::*;
        Ok(match s.trim() {
            "no state" => NoState,
            "running" => Running,
            "idle" | "blocked" => Idle,
            "paused" => Paused,
            "in shutdown" => InShutdown,
            "shut off" => ShutOff,
            "crashed" => Crashed,
            "pmsuspended" => PmSuspended,
            other => return Err(SubjectError::UnknownState(other.to_string())),
        })
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use DomainState::*;
        let s = match self {
            NoState => "no state",
            Running => "running",
            Idle => "idle",
            Paused => "paused",
            InShutdown => "in shutdown",
            ShutOff => "shut off",
            Crashed => "crashed",
            PmSuspended => "pmsuspended",
        };
        write!(f, "{s}")
    }
}

/// The contract a scenario relies on to drive a virtual machine.
///
/// Lifecycle operations hand back the raw `CommandResult` so that scenarios
/// can assert on failures as well as on successes; `Err` is reserved for
/// cases where the operation could not be attempted at all.
pub trait Subject: Send + Sync {
    fn name(&self) -> &str;

    fn exists(&self) -> Result<bool, SubjectError>;

    fn state(&self) -> Result<DomainState, SubjectError>;

    fn is_alive(&self) -> Result<bool, SubjectError> {
        Ok(self.state()?.is_alive())
    }

    fn start(&self) -> Result<CommandResult, SubjectError>;

    fn destroy(&self) -> Result<CommandResult, SubjectError>;

    /// Serialized configuration. `inactive` selects the persistent
    /// definition rather than the one of the running instance.
    fn dump_config(&self, inactive: bool) -> Result<String, SubjectError>;

    fn define_config(&self, config: &str) -> Result<CommandResult, SubjectError>;

    fn info(&self) -> Result<CommandResult, SubjectError>;

    fn wait_for_login(&self, timeout: Duration) -> Result<GuestSession, SubjectError>;
}

/// A libvirt domain driven through `virsh`.
pub struct VirshDomain {
    name: String,
    virsh: Virsh,
    auth: PasswordAuth,
}

impl VirshDomain {
    pub fn new(name: &str, virsh: Virsh, auth: PasswordAuth) -> Self {
        VirshDomain {
            name: name.to_string(),
            virsh,
            auth,
        }
    }

    /// Guest credentials come from `username`/`password`.
    pub fn from_params(name: &str, params: &Params) -> Result<Self, ParamsError> {
        Ok(Self::new(
            name,
            Virsh::from_params(params)?,
            PasswordAuth {
                username: params.get_or("username", "root"),
                password: params.get_or("password", "123456"),
            },
        ))
    }

    fn command_error(&self, e: CommandError) -> SubjectError {
        SubjectError::Command(self.name.clone(), e)
    }
}

// Only a lookup failure means the domain is missing. Anything else, such as
// an unreachable daemon, is an error of its own.
fn domain_exists(result: &CommandResult) -> Result<bool, SubjectError> {
    if result.success() {
        return Ok(true);
    }
    let stderr = result.stderr.to_lowercase();
    if stderr.contains("failed to get domain") || stderr.contains("domain not found") {
        return Ok(false);
    }
    Err(SubjectError::failed(result))
}

impl Subject for VirshDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self) -> Result<bool, SubjectError> {
        let r = self
            .virsh
            .domuuid(&self.name)
            .map_err(|e| self.command_error(e))?;
        domain_exists(&r)
    }

    fn state(&self) -> Result<DomainState, SubjectError> {
        let r = self
            .virsh
            .domstate(&self.name)
            .map_err(|e| self.command_error(e))?;
        if !r.success() {
            return Err(SubjectError::failed(&r));
        }
        // `domstate --reason` style output may carry more lines
        r.stdout.lines().next().unwrap_or_default().parse()
    }

    fn start(&self) -> Result<CommandResult, SubjectError> {
        self.virsh
            .start(&self.name)
            .map_err(|e| self.command_error(e))
    }

    fn destroy(&self) -> Result<CommandResult, SubjectError> {
        self.virsh
            .destroy(&self.name)
            .map_err(|e| self.command_error(e))
    }

    fn dump_config(&self, inactive: bool) -> Result<String, SubjectError> {
        let r = self
            .virsh
            .dumpxml(&self.name, inactive)
            .map_err(|e| self.command_error(e))?;
        if !r.success() {
            return Err(SubjectError::failed(&r));
        }
        Ok(r.stdout)
    }

    fn define_config(&self, config: &str) -> Result<CommandResult, SubjectError> {
        let stage = |e| SubjectError::Stage(self.name.clone(), e);
        let tmp_dir = TempDir::new_with_prefix("/tmp/virt-scenario")
            .map_err(|e| stage(std::io::Error::from_raw_os_error(e.errno())))?;
        let path = tmp_dir.as_path().join(format!("{}.xml", self.name));
        fs::write(&path, config).map_err(stage)?;

        self.virsh.define(&path).map_err(|e| self.command_error(e))
    }

    fn info(&self) -> Result<CommandResult, SubjectError> {
        self.virsh
            .dominfo(&self.name)
            .map_err(|e| self.command_error(e))
    }

    fn wait_for_login(&self, timeout: Duration) -> Result<GuestSession, SubjectError> {
        let description = format!("guest address of '{}'", self.name);
        let ip = wait_until(&description, timeout, Duration::from_secs(2), || {
            let r = self.virsh.domifaddr(&self.name).ok()?;
            r.success().then(|| parse_domifaddr_ipv4(&r.stdout)).flatten()
        })
        .map_err(|e| SubjectError::Address(self.name.clone(), e))?;

        info!("Logging in to '{}' at {ip}", self.name);
        GuestSession::connect(&ip, self.auth.clone())
            .map_err(|e| SubjectError::Login(self.name.clone(), e))
    }
}

struct InMemoryState {
    persistent: Option<String>,
    live: Option<String>,
    state: DomainState,
    reject_defines: bool,
}

/// A domain that only lives in memory. It answers like virsh would, which
/// makes it suitable for dry runs and for exercising scenarios without a
/// libvirt host.
pub struct InMemoryDomain {
    name: String,
    inner: Mutex<InMemoryState>,
}

impl InMemoryDomain {
    pub fn new(name: &str, config: &str) -> Self {
        InMemoryDomain {
            name: name.to_string(),
            inner: Mutex::new(InMemoryState {
                persistent: Some(config.to_string()),
                live: None,
                state: DomainState::ShutOff,
                reject_defines: false,
            }),
        }
    }

    /// A handle whose domain is not defined.
    pub fn undefined(name: &str) -> Self {
        let domain = Self::new(name, "");
        domain.undefine();
        domain
    }

    /// Minimal persistent definition named `name`.
    pub fn default_config(name: &str) -> String {
        format!(
            "<domain type='kvm'>\n  <name>{name}</name>\n  \
             <memory unit='KiB'>1048576</memory>\n  \
             <currentMemory unit='KiB'>1048576</currentMemory>\n  \
             <vcpu placement='static'>2</vcpu>\n  \
             <os>\n    <type arch='x86_64' machine='q35'>hvm</type>\n  </os>\n\
             </domain>\n"
        )
    }

    pub fn undefine(&self) {
        let mut inner = self.lock();
        inner.persistent = None;
        inner.live = None;
        inner.state = DomainState::ShutOff;
    }

    /// Makes every following define fail, as a read-only connection would.
    pub fn reject_defines(&self, reject: bool) {
        self.lock().reject_defines = reject;
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryState> {
        // State is plain data, a panic while holding the lock cannot break it
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn result(&self, verb: &str, exit_status: i32, stdout: &str, stderr: &str) -> CommandResult {
        let result = CommandResult::new(
            &format!("virsh {verb} {}", self.name),
            exit_status,
            stdout,
            stderr,
        );
        debug!("In-memory `{}` exited with {}", result.command, exit_status);
        result
    }

    fn no_domain(&self, verb: &str) -> CommandResult {
        self.result(
            verb,
            1,
            "",
            &format!("error: failed to get domain '{}'\n", self.name),
        )
    }
}

impl Subject for InMemoryDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self) -> Result<bool, SubjectError> {
        Ok(self.lock().persistent.is_some())
    }

    fn state(&self) -> Result<DomainState, SubjectError> {
        let inner = self.lock();
        if inner.persistent.is_none() {
            return Err(SubjectError::NotFound(self.name.clone()));
        }
        Ok(inner.state)
    }

    fn start(&self) -> Result<CommandResult, SubjectError> {
        let mut inner = self.lock();
        if inner.persistent.is_none() {
            return Ok(self.no_domain("start"));
        }
        if inner.state.is_alive() {
            return Ok(self.result(
                "start",
                1,
                "",
                &format!(
                    "error: Failed to start domain '{}'\n\
                     error: Requested operation is not valid: domain is already active\n",
                    self.name
                ),
            ));
        }

        inner.live = inner.persistent.clone();
        inner.state = DomainState::Running;
        Ok(self.result(
            "start",
            0,
            &format!("Domain '{}' started\n", self.name),
            "",
        ))
    }

    fn destroy(&self) -> Result<CommandResult, SubjectError> {
        let mut inner = self.lock();
        if inner.persistent.is_none() {
            return Ok(self.no_domain("destroy"));
        }
        if !inner.state.is_alive() {
            return Ok(self.result(
                "destroy",
                1,
                "",
                &format!(
                    "error: Failed to destroy domain '{}'\n\
                     error: Requested operation is not valid: domain is not running\n",
                    self.name
                ),
            ));
        }

        inner.live = None;
        inner.state = DomainState::ShutOff;
        Ok(self.result(
            "destroy",
            0,
            &format!("Domain '{}' destroyed\n", self.name),
            "",
        ))
    }

    fn dump_config(&self, inactive: bool) -> Result<String, SubjectError> {
        let inner = self.lock();
        let config = if inactive {
            inner.persistent.as_ref()
        } else {
            inner.live.as_ref().or(inner.persistent.as_ref())
        };
        config
            .cloned()
            .ok_or_else(|| SubjectError::NotFound(self.name.clone()))
    }

    fn define_config(&self, config: &str) -> Result<CommandResult, SubjectError> {
        let mut inner = self.lock();
        if inner.reject_defines {
            return Ok(self.result(
                "define",
                1,
                "",
                "error: Failed to define domain\n\
                 error: operation forbidden: read only access prevents virDomainDefineXML\n",
            ));
        }

        match xml::element_text(config, &["domain", "name"]) {
            Ok(Some(name)) if name == self.name => {}
            Ok(_) => {
                return Ok(self.result(
                    "define",
                    1,
                    "",
                    &format!(
                        "error: Failed to define domain\n\
                         error: XML error: expected domain name '{}'\n",
                        self.name
                    ),
                ))
            }
            Err(e) => {
                return Ok(self.result(
                    "define",
                    1,
                    "",
                    &format!("error: Failed to define domain\nerror: {e}\n"),
                ))
            }
        }

        inner.persistent = Some(config.to_string());
        Ok(self.result(
            "define",
            0,
            &format!("Domain '{}' defined\n", self.name),
            "",
        ))
    }

    fn info(&self) -> Result<CommandResult, SubjectError> {
        let inner = self.lock();
        let Some(config) = inner.live.as_ref().or(inner.persistent.as_ref()) else {
            return Ok(self.no_domain("dominfo"));
        };

        let field = |path: &[&str]| {
            xml::element_text(config, path)
                .ok()
                .flatten()
                .unwrap_or_default()
        };
        let stdout = format!(
            "Id:             {}\n\
             Name:           {}\n\
             OS Type:        {}\n\
             State:          {}\n\
             CPU(s):         {}\n\
             Max memory:     {} KiB\n\
             Used memory:    {} KiB\n\
             Persistent:     yes\n",
            if inner.state.is_alive() { "1" } else { "-" },
            self.name,
            field(&["domain", "os", "type"]),
            inner.state,
            field(&["domain", "vcpu"]),
            field(&["domain", "memory"]),
            field(&["domain", "currentMemory"]),
        );
        Ok(self.result("dominfo", 0, &stdout, ""))
    }

    fn wait_for_login(&self, _timeout: Duration) -> Result<GuestSession, SubjectError> {
        Err(SubjectError::LoginUnsupported(self.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_exists() {
        let found = CommandResult::new("virsh domuuid vm1", 0, "0b1b2c3d\n", "");
        assert!(domain_exists(&found).unwrap());

        let missing = CommandResult::new(
            "virsh domuuid vm9",
            1,
            "",
            "error: failed to get domain 'vm9'\n",
        );
        assert!(!domain_exists(&missing).unwrap());
        let missing = CommandResult::new(
            "virsh domuuid vm9",
            1,
            "",
            "error: Domain not found: no domain with matching name 'vm9'\n",
        );
        assert!(!domain_exists(&missing).unwrap());

        let unreachable = CommandResult::new(
            "virsh domuuid vm1",
            1,
            "",
            "error: failed to connect to the hypervisor\n\
             error: Failed to connect socket to '/var/run/libvirt/libvirt-sock': Connection refused\n",
        );
        match domain_exists(&unreachable) {
            Err(SubjectError::CommandFailed { command, stderr }) => {
                assert_eq!(command, "virsh domuuid vm1");
                assert!(stderr.ends_with("Connection refused"));
            }
            r => panic!("unexpected {r:?}"),
        }
    }

    #[test]
    fn test_virsh_domain_exists_command_failure() {
        // Fails without saying anything about the domain
        let vm = VirshDomain::new(
            "vm1",
            Virsh::new("false", None, Some(Duration::from_secs(10))),
            PasswordAuth {
                username: "root".to_string(),
                password: "123456".to_string(),
            },
        );
        assert!(matches!(
            vm.exists(),
            Err(SubjectError::CommandFailed { .. })
        ));
    }

    #[test]
    fn test_domain_state() {
        assert_eq!(
            "running".parse::<DomainState>().unwrap(),
            DomainState::Running
        );
        assert_eq!(
            "shut off\n".parse::<DomainState>().unwrap(),
            DomainState::ShutOff
        );
        assert!(DomainState::Paused.is_alive());
        assert!(!DomainState::Crashed.is_alive());
        assert!(matches!(
            "exploded".parse::<DomainState>(),
            Err(SubjectError::UnknownState(s)) if s == "exploded"
        ));

        for s in ["running", "paused", "in shutdown", "shut off", "pmsuspended"] {
            assert_eq!(s.parse::<DomainState>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_in_memory_lifecycle() {
        let vm = InMemoryDomain::new("vm1", &InMemoryDomain::default_config("vm1"));
        assert!(vm.exists().unwrap());
        assert!(!vm.is_alive().unwrap());

        let r = vm.start().unwrap();
        assert!(r.success());
        assert_eq!(r.command, "virsh start vm1");
        assert_eq!(vm.state().unwrap(), DomainState::Running);

        let r = vm.start().unwrap();
        assert_eq!(r.exit_status, 1);
        assert!(r.output().contains("already active"));

        assert!(vm.destroy().unwrap().success());
        let r = vm.destroy().unwrap();
        assert!(!r.success());
        assert!(r.stderr.contains("domain is not running"));
    }

    #[test]
    fn test_in_memory_configs() {
        let vm = InMemoryDomain::new("vm1", &InMemoryDomain::default_config("vm1"));
        vm.start().unwrap();

        let edited = xml::set_element_text(
            &vm.dump_config(true).unwrap(),
            &["domain", "memory"],
            "2097152",
        )
        .unwrap();
        assert!(vm.define_config(&edited).unwrap().success());

        // The running instance keeps its configuration until restarted
        assert!(!vm.dump_config(false).unwrap().contains("2097152"));
        assert!(vm.dump_config(true).unwrap().contains("2097152"));
        vm.destroy().unwrap();
        vm.start().unwrap();
        assert!(vm.dump_config(false).unwrap().contains("2097152"));

        let info = vm.info().unwrap();
        assert!(info.stdout.contains("Max memory:     2097152 KiB"));
        assert!(info.stdout.contains("State:          running"));
    }

    #[test]
    fn test_in_memory_define_failures() {
        let vm = InMemoryDomain::new("vm1", &InMemoryDomain::default_config("vm1"));
        let r = vm
            .define_config(&InMemoryDomain::default_config("vm2"))
            .unwrap();
        assert!(!r.success());
        assert!(!vm.define_config("<domain>").unwrap().success());

        vm.reject_defines(true);
        let r = vm
            .define_config(&InMemoryDomain::default_config("vm1"))
            .unwrap();
        assert!(r.stderr.contains("read only"));
    }

    #[test]
    fn test_in_memory_undefined() {
        let vm = InMemoryDomain::undefined("vm1");
        assert!(!vm.exists().unwrap());
        assert!(matches!(vm.state(), Err(SubjectError::NotFound(_))));
        assert!(matches!(
            vm.dump_config(true),
            Err(SubjectError::NotFound(_))
        ));
        let r = vm.start().unwrap();
        assert!(r.stderr.contains("failed to get domain 'vm1'"));
        assert!(matches!(
            vm.wait_for_login(Duration::from_secs(1)),
            Err(SubjectError::LoginUnsupported(_))
        ));

        // Defining brings it back
        assert!(vm
            .define_config(&InMemoryDomain::default_config("vm1"))
            .unwrap()
            .success());
        assert!(vm.exists().unwrap());
    }

    #[test]
    fn test_virsh_domain_missing_binary() {
        let virsh = Virsh::new("/nonexistent/virsh", None, None);
        let vm = VirshDomain::new(
            "vm1",
            virsh,
            PasswordAuth {
                username: "root".to_string(),
                password: "123456".to_string(),
            },
        );
        assert!(matches!(vm.exists(), Err(SubjectError::Command(..))));
        assert!(matches!(vm.start(), Err(SubjectError::Command(..))));
    }
}
