// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::debug;
use scenario_infra::params::{Params, ParamsError};
use scenario_infra::runner::{Failure, Scenario};
use scenario_infra::subject::DomainState;
use scenario_infra::wait::wait_until;

use super::lifecycle::DEFAULT_STATE_TIMEOUT;
use super::{ensure_alive, main_vm, remember_state, restore_state, WasAlive};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

type Transitions = Arc<Mutex<Vec<DomainState>>>;

fn seen(transitions: &Transitions) -> Vec<DomainState> {
    transitions
        .lock()
        .map(|t| t.clone())
        .unwrap_or_else(|e| e.into_inner().clone())
}

// Running followed by shut off, in that order
fn saw_cycle(states: &[DomainState]) -> bool {
    states
        .iter()
        .position(|s| *s == DomainState::Running)
        .is_some_and(|i| states[i..].contains(&DomainState::ShutOff))
}

/// A background thread records every state change of the subject while the
/// main thread starts and destroys it. The poller must have observed the
/// domain running and then shut off.
pub fn domstate_poll(params: &Params) -> Result<Scenario, ParamsError> {
    let interval = Duration::from_millis(
        params.convert_or::<u64>("poll_interval_ms", DEFAULT_POLL_INTERVAL_MS)?,
    );
    let state_timeout = params.duration_secs("state_timeout", DEFAULT_STATE_TIMEOUT)?;

    let was_alive = WasAlive::default();
    let setup_state = was_alive.clone();

    let scenario = Scenario::new(
        "virsh.domstate_poll",
        move |ctx| {
            let vm = ctx.subject()?;
            let transitions: Transitions = Arc::new(Mutex::new(Vec::new()));

            let poller_vm = vm.clone();
            let recorded = transitions.clone();
            let poller = ctx.spawn_background("domstate-poller", move |stop| {
                while !stop.is_set() {
                    if let Ok(state) = poller_vm.state() {
                        let mut t = recorded.lock().unwrap_or_else(|e| e.into_inner());
                        if t.last() != Some(&state) {
                            debug!("Observed '{}' {state}", poller_vm.name());
                            t.push(state);
                        }
                    }
                    thread::sleep(interval);
                }
            })?;

            let observed = |description: &str, state: DomainState| {
                wait_until(description, state_timeout, interval, || {
                    seen(&transitions).contains(&state).then_some(())
                })
            };

            ctx.check_status(&vm.start()?)?;
            observed("poller saw running", DomainState::Running)?;
            ctx.check_status(&vm.destroy()?)?;
            wait_until("poller saw the cycle", state_timeout, interval, || {
                saw_cycle(&seen(&transitions)).then_some(())
            })?;

            poller.stop_and_join(state_timeout)?;

            let states = seen(&transitions);
            if !saw_cycle(&states) {
                return Err(Failure::fail(format!(
                    "expected running then shut off, observed {states:?}"
                )));
            }
            Ok(())
        },
        move |ctx| restore_state(&was_alive, ctx),
    )
    .with_setup(move |ctx| {
        remember_state(&setup_state, ctx)?;
        ensure_alive(ctx.subject()?.as_ref(), false)
    })
    .subject(&main_vm(params));

    Ok(scenario)
}
