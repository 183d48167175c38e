// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Registered scenarios, selected by name from the command line.

mod dominfo;
mod domstate_poll;
mod lifecycle;
mod setmem;
mod setvcpu;

use std::cell::Cell;
use std::rc::Rc;

use scenario_infra::params::{Params, ParamsError};
use scenario_infra::runner::{Failure, Scenario, ScenarioContext, StepResult};
use scenario_infra::subject::Subject;

pub struct ScenarioEntry {
    pub name: &'static str,
    pub description: &'static str,
    pub build: fn(&Params) -> Result<Scenario, ParamsError>,
}

pub static SCENARIOS: &[ScenarioEntry] = &[
    ScenarioEntry {
        name: "virsh.destroy_start",
        description: "Destroy and restart the domain, optionally logging into the guest",
        build: lifecycle::destroy_start,
    },
    ScenarioEntry {
        name: "virsh.dominfo",
        description: "Check the fields reported by virsh dominfo",
        build: dominfo::dominfo,
    },
    ScenarioEntry {
        name: "virsh.domstate_poll",
        description: "Observe state transitions from a background poller",
        build: domstate_poll::domstate_poll,
    },
    ScenarioEntry {
        name: "virsh.setmem_config",
        description: "Define a new memory size and check the started domain uses it",
        build: setmem::setmem_config,
    },
    ScenarioEntry {
        name: "virsh.setvcpu_config",
        description: "Define a new vcpu count and check the persistent configuration",
        build: setvcpu::setvcpu_config,
    },
    ScenarioEntry {
        name: "virsh.start_active",
        description: "Starting an already running domain must fail",
        build: lifecycle::start_active,
    },
];

pub fn find(name: &str) -> Option<&'static ScenarioEntry> {
    SCENARIOS.iter().find(|s| s.name == name)
}

/// Entries whose name contains any of `filters`, all of them if empty.
pub fn filtered<'a>(filters: &'a [String]) -> impl Iterator<Item = &'static ScenarioEntry> + 'a {
    SCENARIOS
        .iter()
        .filter(move |s| filters.is_empty() || filters.iter().any(|f| s.name.contains(f.as_str())))
}

/// Subject the scenario acts on: `main_vm`, else the first of `vms`.
pub fn main_vm(params: &Params) -> String {
    params
        .get("main_vm")
        .map(|v| v.to_string())
        .or_else(|| params.get_list("vms").into_iter().next())
        .unwrap_or_else(|| "vm1".to_string())
}

/// `status_error=yes` means the scenario expects its command to fail.
pub fn expect_success(params: &Params, status_error_default: bool) -> Result<bool, ParamsError> {
    Ok(!params.get_bool("status_error", status_error_default)?)
}

/// Starts or destroys `vm` until it is in the requested state. Used by
/// setup and cleanup code, so any refusal is an error rather than a
/// judgement on the subject.
pub fn ensure_alive(vm: &dyn Subject, alive: bool) -> StepResult {
    if vm.is_alive()? == alive {
        return Ok(());
    }

    let result = if alive { vm.start()? } else { vm.destroy()? };
    if !result.success() {
        return Err(Failure::error(format!(
            "`{}` failed: {}",
            result.command,
            result.output().trim()
        )));
    }
    Ok(())
}

/// Whether the subject was running before setup, shared between steps.
pub type WasAlive = Rc<Cell<Option<bool>>>;

// Records the state found before setup so cleanup can put it back.
fn remember_state(was_alive: &WasAlive, ctx: &ScenarioContext) -> StepResult {
    was_alive.set(Some(ctx.subject()?.is_alive()?));
    Ok(())
}

fn restore_state(was_alive: &WasAlive, ctx: &ScenarioContext) -> StepResult {
    match (ctx.bound_subject(), was_alive.get()) {
        (Some(vm), Some(alive)) => ensure_alive(vm.as_ref(), alive),
        _ => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use scenario_infra::env::Env;
    use scenario_infra::params::Params;
    use scenario_infra::runner::{LogReporter, ScenarioOutcome, ScenarioRunner};
    use scenario_infra::subject::InMemoryDomain;

    use super::find;

    pub fn vm1() -> Arc<InMemoryDomain> {
        Arc::new(InMemoryDomain::new(
            "vm1",
            &InMemoryDomain::default_config("vm1"),
        ))
    }

    pub fn run(name: &str, vm: Arc<InMemoryDomain>, params: Params) -> ScenarioOutcome {
        let mut env = Env::new();
        env.register(vm);
        let scenario = (find(name).unwrap().build)(&params).unwrap();
        ScenarioRunner::new(env, params).execute(scenario, &mut LogReporter)
    }
}
