// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use regex::escape;
use scenario_infra::checker::{check_matched_lines_count, ExpectationSet, Pattern};
use scenario_infra::params::{Params, ParamsError};
use scenario_infra::runner::Scenario;

use super::{expect_success, main_vm};

pub fn dominfo(params: &Params) -> Result<Scenario, ParamsError> {
    let vm_name = main_vm(params);

    let scenario = Scenario::new(
        "virsh.dominfo",
        |ctx| {
            let vm = ctx.subject()?;
            let result = vm.info()?;

            let state = vm.state()?;
            ExpectationSet::new(ctx.expect_success())
                .present(Pattern::regex(&format!(
                    r"(?m)^Name:\s+{}$",
                    escape(vm.name())
                ))?)
                .present(Pattern::regex(&format!(r"(?m)^State:\s+{state}$"))?)
                .present(Pattern::regex(r"(?m)^CPU\(s\):\s+\d+$")?)
                .absent("error:")
                .check(&result)?;

            if ctx.expect_success() {
                check_matched_lines_count(&result.stdout, &["memory:", "KiB"], 2)?;
            }
            Ok(())
        },
        |_| Ok(()),
    )
    .subject(&vm_name)
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
    fn test_dominfo() {
        let vm = vm1();
        let outcome = run("virsh.dominfo", vm.clone(), Params::new());
        assert_eq!(outcome.verdict, Verdict::Pass);

        vm.start().unwrap();
        let outcome = run("virsh.dominfo", vm, Params::new());
        assert_eq!(outcome.verdict, Verdict::Pass);
    }

    #[test]
    fn test_dominfo_expecting_failure() {
        let outcome = run(
            "virsh.dominfo",
            vm1(),
            Params::from_pairs(&[("status_error", "yes")]),
        );
        assert_eq!(outcome.verdict.kind(), "fail");
    }
}
