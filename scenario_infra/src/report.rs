// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io::Write;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::command::exec_host_command_output;
use crate::runner::ScenarioOutcome;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ScenarioReport {
    pub name: String,
    pub verdict: String,
    pub message: Option<String>,
    pub teardown_errors: Vec<String>,
    pub duration_ms: u64,
}

impl From<&ScenarioOutcome> for ScenarioReport {
    fn from(outcome: &ScenarioOutcome) -> Self {
        ScenarioReport {
            name: outcome.name.clone(),
            verdict: outcome.verdict.kind().to_string(),
            message: outcome.verdict.message().map(|m| m.to_string()),
            teardown_errors: outcome.teardown_errors.clone(),
            duration_ms: u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RunReport {
    pub version: String,
    pub date: String,
    pub results: Vec<ScenarioReport>,
}

impl RunReport {
    pub fn new(version: &str) -> Self {
        RunReport {
            version: version.to_string(),
            date: date(),
            results: Vec::new(),
        }
    }

    pub fn add(&mut self, outcome: &ScenarioOutcome) {
        self.results.push(outcome.into());
    }

    /// Number of results with the given verdict kind.
    pub fn count(&self, verdict: &str) -> usize {
        self.results.iter().filter(|r| r.verdict == verdict).count()
    }

    pub fn write_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        out.write_all(json.as_bytes())?;
        out.write_all(b"\n")
    }
}

fn date() -> String {
    match exec_host_command_output("date") {
        Ok(r) if r.success() => r.stdout_trimmed().to_string(),
        Ok(r) => {
            warn!("`date` exited with {}", r.exit_status);
            String::new()
        }
        Err(e) => {
            warn!("Error running `date`: {e}");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::Verdict;
    use std::time::Duration;

    #[test]
    fn test_run_report() {
        let mut report = RunReport::new("v1.0");
        assert!(!report.date.is_empty());

        report.add(&ScenarioOutcome {
            name: "virsh.start_active".into(),
            verdict: Verdict::Pass,
            duration: Duration::from_millis(1500),
            teardown_errors: Vec::new(),
        });
        report.add(&ScenarioOutcome {
            name: "virsh.setmem_config".into(),
            verdict: Verdict::Fail("pattern '2097152' not found in output".into()),
            duration: Duration::from_millis(20),
            teardown_errors: vec!["restore error: boom".into()],
        });
        assert_eq!(report.count("pass"), 1);
        assert_eq!(report.count("fail"), 1);
        assert_eq!(report.count("error"), 0);

        let mut out = Vec::new();
        report.write_to(&mut out).unwrap();
        let parsed: RunReport = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed.version, "v1.0");
        assert_eq!(parsed.results, report.results);
        assert_eq!(parsed.results[0].duration_ms, 1500);
        assert_eq!(parsed.results[0].message, None);
    }
}
