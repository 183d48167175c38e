// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::time::Duration;

use log::info;
use scenario_infra::checker::{check_patterns, Pattern};
use scenario_infra::params::{Params, ParamsError};
use scenario_infra::runner::{Scenario, StepResult};
use scenario_infra::subject::{Subject, DEFAULT_LOGIN_TIMEOUT};
use scenario_infra::wait::wait_until;

use super::{ensure_alive, expect_success, main_vm, remember_state, restore_state, WasAlive};

pub const DEFAULT_STATE_TIMEOUT: u64 = 60;

fn wait_for_alive(vm: &dyn Subject, alive: bool, timeout: Duration) -> StepResult {
    let description = format!(
        "'{}' {}",
        vm.name(),
        if alive { "running" } else { "shut off" }
    );
    wait_until(&description, timeout, Duration::from_millis(500), || {
        vm.is_alive().ok().filter(|a| *a == alive).map(|_| ())
    })?;
    Ok(())
}

/// `virsh start` on a running domain must be refused.
pub fn start_active(params: &Params) -> Result<Scenario, ParamsError> {
    let was_alive = WasAlive::default();
    let setup_state = was_alive.clone();

    let scenario = Scenario::new(
        "virsh.start_active",
        |ctx| {
            let result = ctx.subject()?.start()?;
            ctx.check_status(&result)?;
            check_patterns(
                &result.output(),
                &[Pattern::substring("already active")],
                !ctx.expect_success(),
            )?;
            Ok(())
        },
        move |ctx| restore_state(&was_alive, ctx),
    )
    .with_setup(move |ctx| {
        remember_state(&setup_state, ctx)?;
        ensure_alive(ctx.subject()?.as_ref(), true)
    })
    .subject(&main_vm(params))
    .expect_success(expect_success(params, true)?);

    Ok(scenario)
}

/// Destroys a running domain and starts it again, waiting for each state
/// change. With `check_login=yes` the guest must also accept a login.
pub fn destroy_start(params: &Params) -> Result<Scenario, ParamsError> {
    let state_timeout = params.duration_secs("state_timeout", DEFAULT_STATE_TIMEOUT)?;
    let login_timeout = params.duration_secs("login_timeout", DEFAULT_LOGIN_TIMEOUT)?;
    let check_login = params.get_bool("check_login", false)?;

    let was_alive = WasAlive::default();
    let setup_state = was_alive.clone();

    let scenario = Scenario::new(
        "virsh.destroy_start",
        move |ctx| {
            let vm = ctx.subject()?;

            ctx.check_status(&vm.destroy()?)?;
            wait_for_alive(vm.as_ref(), false, state_timeout)?;

            ctx.check_status(&vm.start()?)?;
            wait_for_alive(vm.as_ref(), true, state_timeout)?;

            if check_login {
                let session = vm.wait_for_login(login_timeout)?;
                let kernel = session.cmd("uname -r")?;
                info!("Guest {} runs kernel {}", session.ip(), kernel.trim());
            }
            Ok(())
        },
        move |ctx| restore_state(&was_alive, ctx),
    )
    .with_setup(move |ctx| {
        remember_state(&setup_state, ctx)?;
        ensure_alive(ctx.subject()?.as_ref(), true)
    })
    .subject(&main_vm(params))
    .expect_success(expect_success(params, false)?);

    Ok(scenario)
}
