// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::process::Command;

fn main() {
    let mut version = format!("v{}", env!("CARGO_PKG_VERSION"));

    // Outside of a git checkout the package version is used as is
    if let Ok(git_out) = Command::new("git").args(["describe", "--dirty"]).output() {
        if git_out.status.success() {
            if let Ok(git_version) = String::from_utf8(git_out.stdout) {
                version = git_version.trim().to_string();
            }
        }
    }

    // Sets BUILD_VERSION for src/main.rs, which reports it through
    // `--version` and in the run report.
    println!("cargo:rustc-env=BUILD_VERSION={version}");
    println!("cargo:rerun-if-changed=.git/HEAD");
}
