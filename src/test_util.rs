// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[cfg(test)]
pub mod tests {
    use clap::Command;

    /// Keeps `--help` output predictable: argument ids must be strictly
    /// increasing, and a long option is spelled like its id.
    pub fn assert_args_sorted(cmd: &Command) {
        let args: Vec<_> = cmd.get_arguments().collect();
        for pair in args.windows(2) {
            assert!(
                pair[0].get_id() < pair[1].get_id(),
                "args not strictly sorted: arg={}, next={}",
                pair[0].get_id(),
                pair[1].get_id()
            );
        }
        for arg in args {
            if let Some(long) = arg.get_long() {
                assert_eq!(arg.get_id().as_str(), long, "--{long} has id {}", arg.get_id());
            }
        }
    }
}
