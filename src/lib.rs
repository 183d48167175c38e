// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::error::Error;
use std::io::{self, Write};

pub mod scenarios;

/// Writes `top_error` and each of its sources on a line of its own, then the
/// debug representation of the top level error.
pub fn write_error_chain(
    out: &mut dyn Write,
    top_error: &dyn Error,
    component: &str,
) -> io::Result<()> {
    writeln!(out, "Error: {component} failed: {top_error}")?;
    let mut source = top_error.source();
    while let Some(cause) = source {
        writeln!(out, "  caused by: {cause}")?;
        source = cause.source();
    }
    writeln!(out)?;
    writeln!(out, "Debug Info: {top_error:?}")
}

/// Reports a fatal error on standard error.
pub fn cli_print_error_chain(top_error: &dyn Error, component: &str) {
    // Nothing left to report to if stderr is gone
    let _ = write_error_chain(&mut io::stderr().lock(), top_error, component);
}
