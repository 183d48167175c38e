// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use scenario_infra::params::{Params, ParamsError};
use scenario_infra::runner::{Failure, Scenario};
use scenario_infra::xml;

use super::{ensure_alive, expect_success, main_vm, remember_state, restore_state, WasAlive};

pub const DEFAULT_VCPU_COUNT: u32 = 4;

const VCPU: &[&str] = &["domain", "vcpu"];

pub fn setvcpu_config(params: &Params) -> Result<Scenario, ParamsError> {
    let count = params
        .convert_or::<u32>("setvcpu_count", DEFAULT_VCPU_COUNT)?
        .to_string();

    let was_alive = WasAlive::default();
    let setup_state = was_alive.clone();

    let scenario = Scenario::new(
        "virsh.setvcpu_config",
        move |ctx| {
            let vm = ctx.subject()?;
            let config = vm.dump_config(true)?;

            // A `current` attribute above the new maximum is rejected by libvirt
            let config = match xml::element_attr(&config, VCPU, "current")? {
                Some(_) => xml::set_element(&config, VCPU, &count, &[("current", count.as_str())])?,
                None => xml::set_element_text(&config, VCPU, &count)?,
            };

            let result = vm.define_config(&config)?;
            ctx.check_status(&result)?;
            if !result.success() {
                return Ok(());
            }

            let defined = xml::element_text(&vm.dump_config(true)?, VCPU)?;
            if defined.as_deref() != Some(count.as_str()) {
                return Err(Failure::fail(format!(
                    "expected {count} vcpus in the persistent definition, found {defined:?}"
                )));
            }
            Ok(())
        },
        |_| Ok(()),
    )
    .with_setup(move |ctx| {
        remember_state(&setup_state, ctx)?;
        ensure_alive(ctx.subject()?.as_ref(), false)
    })
    .after_restore(move |ctx| restore_state(&was_alive, ctx))
    .subject(&main_vm(params))
    .snapshot()
    .expect_success(expect_success(params, false)?);

    Ok(scenario)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::test_support::{run, vm1};
    use scenario_infra::runner::Verdict;
    use scenario_infra::subject::Subject;

    #[test]
    fn test_setvcpu_config() {
        let vm = vm1();
        let original = vm.dump_config(true).unwrap();
        let outcome = run(
            "virsh.setvcpu_config",
            vm.clone(),
            Params::from_pairs(&[("setvcpu_count", "8")]),
        );
        assert_eq!(outcome.verdict, Verdict::Pass);
        assert_eq!(vm.dump_config(true).unwrap(), original);
        assert!(!vm.is_alive().unwrap());
    }

    #[test]
    fn test_setvcpu_config_running_domain() {
        let vm = vm1();
        vm.start().unwrap();
        let original = vm.dump_config(false).unwrap();

        let outcome = run("virsh.setvcpu_config", vm.clone(), Params::new());
        assert_eq!(outcome.verdict, Verdict::Pass);
        assert!(vm.is_alive().unwrap());
        assert_eq!(vm.dump_config(false).unwrap(), original);
    }

    #[test]
    fn test_setvcpu_current_attribute() {
        let vm = vm1();
        let config = xml::set_element(
            &vm.dump_config(true).unwrap(),
            VCPU,
            "2",
            &[("current", "1")],
        )
        .unwrap();
        vm.define_config(&config).unwrap();

        let outcome = run("virsh.setvcpu_config", vm.clone(), Params::new());
        assert_eq!(outcome.verdict, Verdict::Pass);
        assert_eq!(
            xml::element_attr(&vm.dump_config(true).unwrap(), VCPU, "current").unwrap(),
            Some("1".to_string())
        );
    }

    #[test]
    fn test_setvcpu_invalid_count() {
        setvcpu_config(&Params::from_pairs(&[("setvcpu_count", "-1")]))
            .err()
            .unwrap();
    }
}
