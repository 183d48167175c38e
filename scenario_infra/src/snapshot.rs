// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::time::SystemTime;

use log::{debug, info};
use thiserror::Error;

use crate::subject::{Subject, SubjectError};

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("capture error: subject '{0}' does not exist")]
    Missing(String),
    #[error("capture error: reading configuration of '{0}' failed")]
    Capture(String, #[source] SubjectError),
    #[error("restore error: snapshot of '{snapshot}' cannot be applied to '{subject}'")]
    SubjectMismatch { snapshot: String, subject: String },
    #[error("restore error: redefining '{0}' failed")]
    Restore(String, #[source] SubjectError),
    #[error("restore error: `{command}` exited with {exit_status}: {stderr}")]
    RestoreCommand {
        command: String,
        exit_status: i32,
        stderr: String,
    },
}

/// Persistent configuration of a subject, taken before a scenario mutates
/// it. A snapshot is never modified after capture, the only thing it can do
/// is write itself back.
#[derive(Clone, Debug)]
pub struct ConfigSnapshot {
    subject: String,
    content: String,
    captured_at: SystemTime,
}

impl PartialEq for ConfigSnapshot {
    // Capture time is informational
    fn eq(&self, other: &Self) -> bool {
        self.subject == other.subject && self.content == other.content
    }
}

impl Eq for ConfigSnapshot {}

impl ConfigSnapshot {
    pub fn capture(subject: &dyn Subject) -> Result<Self, SnapshotError> {
        let name = subject.name();
        let exists = subject
            .exists()
            .map_err(|e| SnapshotError::Capture(name.to_owned(), e))?;
        if !exists {
            return Err(SnapshotError::Missing(name.to_owned()));
        }

        let content = subject
            .dump_config(true)
            .map_err(|e| SnapshotError::Capture(name.to_owned(), e))?;
        debug!("Captured {} bytes of configuration for '{name}'", content.len());

        Ok(ConfigSnapshot {
            subject: name.to_owned(),
            content,
            captured_at: SystemTime::now(),
        })
    }

    /// Defines `subject` from the captured content in a single operation.
    /// Restoring twice leaves the same state as restoring once.
    pub fn restore(&self, subject: &dyn Subject) -> Result<(), SnapshotError> {
        if subject.name() != self.subject {
            return Err(SnapshotError::SubjectMismatch {
                snapshot: self.subject.clone(),
                subject: subject.name().to_owned(),
            });
        }

        let result = subject
            .define_config(&self.content)
            .map_err(|e| SnapshotError::Restore(self.subject.clone(), e))?;
        if !result.success() {
            return Err(SnapshotError::RestoreCommand {
                command: result.command,
                exit_status: result.exit_status,
                stderr: result.stderr.trim().to_owned(),
            });
        }

        info!("Restored configuration of '{}'", self.subject);
        Ok(())
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::InMemoryDomain;
    use crate::xml;

    fn vm1() -> InMemoryDomain {
        InMemoryDomain::new("vm1", &InMemoryDomain::default_config("vm1"))
    }

    #[test]
    fn test_restore_then_capture_round_trip() {
        let vm = vm1();
        let snapshot = ConfigSnapshot::capture(&vm).unwrap();

        let mutated = xml::set_element_text(snapshot.content(), &["domain", "vcpu"], "8").unwrap();
        assert!(vm.define_config(&mutated).unwrap().success());
        assert_ne!(ConfigSnapshot::capture(&vm).unwrap(), snapshot);

        snapshot.restore(&vm).unwrap();
        assert_eq!(ConfigSnapshot::capture(&vm).unwrap(), snapshot);

        // Idempotent
        snapshot.restore(&vm).unwrap();
        assert_eq!(ConfigSnapshot::capture(&vm).unwrap(), snapshot);
    }

    #[test]
    fn test_equality_ignores_capture_time() {
        let vm = vm1();
        let a = ConfigSnapshot::capture(&vm).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = ConfigSnapshot::capture(&vm).unwrap();
        assert_ne!(a.captured_at(), b.captured_at());
        assert_eq!(a, b);
    }

    #[test]
    fn test_capture_missing_subject() {
        let vm = InMemoryDomain::undefined("vm1");
        let e = ConfigSnapshot::capture(&vm).unwrap_err();
        assert!(matches!(e, SnapshotError::Missing(ref n) if n == "vm1"));
        assert!(e.to_string().starts_with("capture error"));
    }

    #[test]
    fn test_restore_recreates_undefined_subject() {
        let vm = vm1();
        let snapshot = ConfigSnapshot::capture(&vm).unwrap();
        vm.undefine();
        snapshot.restore(&vm).unwrap();
        assert!(vm.exists().unwrap());
        assert_eq!(ConfigSnapshot::capture(&vm).unwrap(), snapshot);
    }

    #[test]
    fn test_restore_failures() {
        let vm = vm1();
        let snapshot = ConfigSnapshot::capture(&vm).unwrap();

        let other = InMemoryDomain::new("vm2", &InMemoryDomain::default_config("vm2"));
        let e = snapshot.restore(&other).unwrap_err();
        assert!(matches!(e, SnapshotError::SubjectMismatch { .. }));

        vm.reject_defines(true);
        let e = snapshot.restore(&vm).unwrap_err();
        assert!(matches!(e, SnapshotError::RestoreCommand { exit_status: 1, .. }));
        assert!(e.to_string().starts_with("restore error"));
    }
}
