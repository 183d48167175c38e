// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use scenario_infra::checker::{check_patterns, Pattern};
use scenario_infra::params::{Params, ParamsError};
use scenario_infra::runner::{Failure, Scenario};
use scenario_infra::xml;

use super::{ensure_alive, expect_success, main_vm, remember_state, restore_state, WasAlive};

pub const DEFAULT_SETMEM_SIZE: u64 = 2097152;

/// Defines `setmem_size` KiB as memory of the subject, starts it and checks
/// the live configuration carries the new size. The original definition is
/// restored from the snapshot and a domain found running is started again
/// with it.
pub fn setmem_config(params: &Params) -> Result<Scenario, ParamsError> {
    let vm_name = main_vm(params);
    let size = params
        .convert_or::<u64>("setmem_size", DEFAULT_SETMEM_SIZE)?
        .to_string();

    let was_alive = WasAlive::default();
    let setup_state = was_alive.clone();

    let scenario = Scenario::new(
        "virsh.setmem_config",
        move |ctx| {
            let vm = ctx.subject()?;
            let config = ctx
                .snapshot()
                .ok_or_else(|| Failure::error("no snapshot taken"))?
                .content()
                .to_string();

            let unit = [("unit", "KiB")];
            let mut config = xml::set_element(&config, &["domain", "memory"], &size, &unit)?;
            if xml::element_text(&config, &["domain", "currentMemory"])?.is_some() {
                config = xml::set_element(&config, &["domain", "currentMemory"], &size, &unit)?;
            }

            let result = vm.define_config(&config)?;
            ctx.check_status(&result)?;
            if !result.success() {
                return Ok(());
            }

            ctx.check_status(&vm.start()?)?;

            let live = vm.dump_config(false)?;
            check_patterns(&live, &[Pattern::substring(&size)], true)?;
            Ok(())
        },
        |ctx| match ctx.bound_subject() {
            Some(vm) => ensure_alive(vm.as_ref(), false),
            None => Ok(()),
        },
    )
    .with_setup(move |ctx| {
        remember_state(&setup_state, ctx)?;
        ensure_alive(ctx.subject()?.as_ref(), false)
    })
    .after_restore(move |ctx| restore_state(&was_alive, ctx))
    .subject(&vm_name)
    .snapshot()
    .expect_success(expect_success(params, false)?);

    Ok(scenario)
}
