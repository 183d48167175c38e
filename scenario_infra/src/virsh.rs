// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::env;
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

use crate::command::{CommandError, CommandResult, HostCommand};
use crate::params::{Params, ParamsError};

pub const DEFAULT_COMMAND_TIMEOUT: u64 = 120;

/// Thin wrapper around the `virsh` binary. Every call returns the raw
/// `CommandResult`, interpreting it is up to the caller.
#[derive(Clone, Debug)]
pub struct Virsh {
    binary: String,
    uri: Option<String>,
    timeout: Option<Duration>,
}

impl Default for Virsh {
    fn default() -> Self {
        Virsh {
            binary: virsh_binary(),
            uri: None,
            timeout: Some(Duration::from_secs(DEFAULT_COMMAND_TIMEOUT)),
        }
    }
}

/// `VIRSH` overrides the binary picked from `PATH`.
pub fn virsh_binary() -> String {
    env::var("VIRSH").unwrap_or_else(|_| "virsh".to_string())
}

impl Virsh {
    pub fn new(binary: &str, uri: Option<&str>, timeout: Option<Duration>) -> Self {
        Virsh {
            binary: binary.to_string(),
            uri: uri.map(|u| u.to_string()),
            timeout,
        }
    }

    /// Honours `connect_uri` and `command_timeout` (seconds, 0 disables it).
    pub fn from_params(params: &Params) -> Result<Self, ParamsError> {
        let timeout = params.convert_or::<u64>("command_timeout", DEFAULT_COMMAND_TIMEOUT)?;
        Ok(Virsh {
            binary: virsh_binary(),
            uri: params
                .get("connect_uri")
                .filter(|u| !u.is_empty())
                .map(|u| u.to_string()),
            timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
        })
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn command<I, S>(&self, args: I) -> HostCommand
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = HostCommand::new(&self.binary);
        if let Some(uri) = &self.uri {
            cmd.args(["-c", uri.as_str()]);
        }
        cmd.args(args);
        if let Some(timeout) = self.timeout {
            cmd.timeout(timeout);
        }
        cmd
    }

    pub fn run<I, S>(&self, args: I) -> Result<CommandResult, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command(args).run()
    }

    pub fn start(&self, name: &str) -> Result<CommandResult, CommandError> {
        self.run(["start", name])
    }

    pub fn destroy(&self, name: &str) -> Result<CommandResult, CommandError> {
        self.run(["destroy", name])
    }

    pub fn domstate(&self, name: &str) -> Result<CommandResult, CommandError> {
        self.run(["domstate", name])
    }

    pub fn domuuid(&self, name: &str) -> Result<CommandResult, CommandError> {
        self.run(["domuuid", name])
    }

    pub fn dominfo(&self, name: &str) -> Result<CommandResult, CommandError> {
        self.run(["dominfo", name])
    }

    pub fn domifaddr(&self, name: &str) -> Result<CommandResult, CommandError> {
        self.run(["domifaddr", name])
    }

    pub fn dumpxml(&self, name: &str, inactive: bool) -> Result<CommandResult, CommandError> {
        if inactive {
            self.run(["dumpxml", "--inactive", "--security-info", name])
        } else {
            self.run(["dumpxml", name])
        }
    }

    pub fn define(&self, xml_path: &Path) -> Result<CommandResult, CommandError> {
        self.run([OsStr::new("define"), xml_path.as_os_str()])
    }
}

/// First IPv4 address listed by `virsh domifaddr`, without prefix length.
///
/// ```text
///  Name       MAC address          Protocol     Address
/// -------------------------------------------------------------------------------
///  vnet0      52:54:00:6b:29:1d    ipv4         192.168.122.45/24
/// ```
pub fn parse_domifaddr_ipv4(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let idx = fields.iter().position(|f| *f == "ipv4")?;
        let addr = fields.get(idx + 1)?;
        Some(addr.split('/').next().unwrap_or(addr).to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line() {
        let virsh = Virsh::new("virsh", Some("qemu:///system"), None);
        assert_eq!(
            virsh.command(["start", "vm1"]).command_line(),
            "virsh -c qemu:///system start vm1"
        );

        let virsh = Virsh::new("/usr/bin/virsh", None, None);
        assert_eq!(
            virsh.command(["dumpxml", "vm1"]).command_line(),
            "/usr/bin/virsh dumpxml vm1"
        );
    }

    #[test]
    fn test_from_params() {
        let params = Params::from_pairs(&[
            ("connect_uri", "qemu:///session"),
            ("command_timeout", "0"),
        ]);
        let virsh = Virsh::from_params(&params).unwrap();
        assert_eq!(virsh.uri.as_deref(), Some("qemu:///session"));
        assert_eq!(virsh.timeout, None);

        let virsh = Virsh::from_params(&Params::new()).unwrap();
        assert_eq!(virsh.uri, None);
        assert_eq!(
            virsh.timeout,
            Some(Duration::from_secs(DEFAULT_COMMAND_TIMEOUT))
        );

        let params = Params::from_pairs(&[("command_timeout", "soon")]);
        Virsh::from_params(&params).unwrap_err();
    }

    #[test]
    fn test_fake_virsh_binary() {
        // Any executable stands in for virsh, arguments are passed through
        let virsh = Virsh::new("echo", Some("test:///default"), Some(Duration::from_secs(5)));
        let r = virsh.dumpxml("vm1", true).unwrap();
        assert!(r.success());
        assert_eq!(
            r.stdout_trimmed(),
            "-c test:///default dumpxml --inactive --security-info vm1"
        );
    }

    #[test]
    fn test_parse_domifaddr() {
        let output = " Name       MAC address          Protocol     Address\n\
            -------------------------------------------------------------------------------\n \
            vnet0      52:54:00:6b:29:1d    ipv6         fe80::5054:ff:fe6b:291d/64\n \
            vnet0      52:54:00:6b:29:1d    ipv4         192.168.122.45/24\n";
        assert_eq!(
            parse_domifaddr_ipv4(output),
            Some("192.168.122.45".to_string())
        );
        assert_eq!(parse_domifaddr_ipv4(" Name MAC address Protocol Address\n"), None);
        assert_eq!(parse_domifaddr_ipv4(""), None);
    }
}
