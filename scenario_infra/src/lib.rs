// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Building blocks for libvirt test scenarios: running host commands and
//! `virsh`, checking their results, snapshotting domain configuration and
//! sequencing setup, run and teardown with guaranteed cleanup.

pub mod checker;
pub mod command;
pub mod env;
pub mod params;
pub mod report;
pub mod runner;
pub mod snapshot;
pub mod ssh;
pub mod subject;
pub mod virsh;
pub mod wait;
pub mod xml;

pub use checker::{check_patterns, check_status, CheckError, ExpectationSet, Pattern};
pub use command::{CommandError, CommandResult, HostCommand};
pub use env::{Env, EnvError};
pub use params::{Params, ParamsError};
pub use runner::{
    Failure, LogReporter, Reporter, Scenario, ScenarioContext, ScenarioOutcome, ScenarioRunner,
    StepResult, Verdict,
};
pub use snapshot::{ConfigSnapshot, SnapshotError};
pub use subject::{DomainState, InMemoryDomain, Subject, SubjectError, VirshDomain};
pub use virsh::Virsh;
