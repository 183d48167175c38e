// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Turns raw command results into pass/fail signals.
//!
//! Every check is pure: it looks at a `CommandResult` (or a piece of its
//! output) and either returns `Ok(())` or a `CheckError` describing the
//! mismatch. Nothing is retried here, polling belongs to `wait`.

use std::fmt;

use log::debug;
use regex::Regex;
use thiserror::Error;

use crate::command::CommandResult;

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("`{command}` exited with {actual}, expected {}", status_text(.expect_success))]
    StatusMismatch {
        command: String,
        actual: i32,
        expect_success: bool,
    },
    #[error("pattern '{pattern}' {} in output", presence_text(.expect_present))]
    PatternMismatch {
        pattern: String,
        expect_present: bool,
        output: String,
    },
    #[error("invalid regular expression '{0}'")]
    InvalidRegex(String, #[source] regex::Error),
    #[error("expected {expected} lines, found {actual}")]
    LinesCount { expected: usize, actual: usize },
    #[error("expected {expected} lines matching {keywords:?}, found {actual}")]
    MatchedLinesCount {
        keywords: Vec<String>,
        expected: usize,
        actual: usize,
    },
}

fn status_text(expect_success: &bool) -> &'static str {
    if *expect_success {
        "success"
    } else {
        "failure"
    }
}

fn presence_text(expect_present: &bool) -> &'static str {
    if *expect_present {
        "not found"
    } else {
        "unexpectedly found"
    }
}

/// A plain substring or a regular expression searched in command output.
#[derive(Clone, Debug)]
pub enum Pattern {
    Substring(String),
    Regex(Regex),
}

impl Pattern {
    pub fn substring(s: &str) -> Self {
        Pattern::Substring(s.to_string())
    }

    pub fn regex(re: &str) -> Result<Self, CheckError> {
        Regex::new(re)
            .map(Pattern::Regex)
            .map_err(|e| CheckError::InvalidRegex(re.to_string(), e))
    }

    pub fn is_match(&self, output: &str) -> bool {
        match self {
            Pattern::Substring(s) => output.contains(s.as_str()),
            Pattern::Regex(re) => re.is_match(output),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Pattern::Substring(s) => s,
            Pattern::Regex(re) => re.as_str(),
        }
    }
}

impl From<&str> for Pattern {
    fn from(s: &str) -> Self {
        Pattern::substring(s)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Pattern::Substring(s) => write!(f, "'{s}'"),
            Pattern::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

pub fn check_status(result: &CommandResult, expect_success: bool) -> Result<(), CheckError> {
    if result.success() == expect_success {
        return Ok(());
    }

    debug!(
        "\n\n==== Start 'check_status' failed ==== \
        \n\n{result}\
        \n\n==== End 'check_status' failed ===="
    );
    Err(CheckError::StatusMismatch {
        command: result.command.clone(),
        actual: result.exit_status,
        expect_success,
    })
}

/// All `patterns` share the same polarity: either every one of them must be
/// found in `output`, or none of them may be.
pub fn check_patterns(
    output: &str,
    patterns: &[Pattern],
    expect_present: bool,
) -> Result<(), CheckError> {
    match patterns
        .iter()
        .find(|p| p.is_match(output) != expect_present)
    {
        None => Ok(()),
        Some(p) => {
            debug!(
                "\n\n==== Start 'check_patterns' failed ==== \
                \n\npattern = {p}, expect_present = {expect_present} \
                \n\noutput = {output} \
                \n\n==== End 'check_patterns' failed ===="
            );
            Err(CheckError::PatternMismatch {
                pattern: p.as_str().to_string(),
                expect_present,
                output: output.to_string(),
            })
        }
    }
}

pub fn check_lines_count(input: &str, line_count: usize) -> Result<(), CheckError> {
    let actual = input.lines().count();
    if actual == line_count {
        Ok(())
    } else {
        debug!(
            "\n\n==== Start 'check_lines_count' failed ==== \
            \n\ninput = {input}\nline_count = {line_count} \
            \n\n==== End 'check_lines_count' failed ====",
        );
        Err(CheckError::LinesCount {
            expected: line_count,
            actual,
        })
    }
}

/// Counts the lines containing every one of `keywords`.
pub fn check_matched_lines_count(
    input: &str,
    keywords: &[&str],
    line_count: usize,
) -> Result<(), CheckError> {
    let actual = input
        .lines()
        .filter(|line| keywords.iter().all(|k| line.contains(k)))
        .count();

    if actual == line_count {
        Ok(())
    } else {
        debug!(
            "\n\n==== Start 'check_matched_lines_count' failed ==== \
            \nkeywords = {keywords:?}, line_count = {line_count} \
            \n\ninput = {input} \
            \n\n==== End 'check_matched_lines_count' failed ====",
        );
        Err(CheckError::MatchedLinesCount {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            expected: line_count,
            actual,
        })
    }
}

/// Expected exit status polarity plus patterns that must, or must not,
/// show up in the combined output of a command.
#[derive(Clone, Debug)]
pub struct ExpectationSet {
    pub expect_success: bool,
    pub present: Vec<Pattern>,
    pub absent: Vec<Pattern>,
}

impl Default for ExpectationSet {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ExpectationSet {
    pub fn new(expect_success: bool) -> Self {
        ExpectationSet {
            expect_success,
            present: Vec::new(),
            absent: Vec::new(),
        }
    }

    pub fn present<P: Into<Pattern>>(mut self, pattern: P) -> Self {
        self.present.push(pattern.into());
        self
    }

    pub fn absent<P: Into<Pattern>>(mut self, pattern: P) -> Self {
        self.absent.push(pattern.into());
        self
    }

    pub fn check(&self, result: &CommandResult) -> Result<(), CheckError> {
        check_status(result, self.expect_success)?;
        let output = result.output();
        check_patterns(&output, &self.present, true)?;
        check_patterns(&output, &self.absent, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALREADY_ACTIVE: &str = "error: Failed to start domain 'vm1'\n\
         error: Requested operation is not valid: domain is already active\n";

    #[test]
    fn test_check_status() {
        let ok = CommandResult::new("virsh start vm1", 0, "Domain 'vm1' started\n", "");
        let failed = CommandResult::new("virsh start vm1", 1, "", ALREADY_ACTIVE);

        check_status(&ok, true).unwrap();
        check_status(&failed, false).unwrap();
        assert!(matches!(
            check_status(&ok, false),
            Err(CheckError::StatusMismatch {
                actual: 0,
                expect_success: false,
                ..
            })
        ));
        assert!(matches!(
            check_status(&failed, true),
            Err(CheckError::StatusMismatch { actual: 1, .. })
        ));

        for code in [-1, 1, 2, 127, 255] {
            let r = CommandResult::new("x", code, "", "");
            assert!(check_status(&r, true).is_err());
        }
    }

    #[test]
    fn test_check_patterns_present() {
        let patterns = [Pattern::substring("already active"), "domain".into()];
        check_patterns(ALREADY_ACTIVE, &patterns, true).unwrap();

        let missing = [Pattern::substring("shut off"), Pattern::substring("paused")];
        match check_patterns(ALREADY_ACTIVE, &missing, true) {
            Err(CheckError::PatternMismatch {
                pattern,
                expect_present: true,
                ..
            }) => assert_eq!(pattern, "shut off"),
            r => panic!("unexpected result {r:?}"),
        }

        // One missing pattern is enough to fail
        let mixed = [Pattern::substring("already active"), "paused".into()];
        assert!(check_patterns(ALREADY_ACTIVE, &mixed, true).is_err());
    }

    #[test]
    fn test_check_patterns_absent() {
        check_patterns(ALREADY_ACTIVE, &["shut off".into(), "paused".into()], false).unwrap();

        let err = check_patterns(
            ALREADY_ACTIVE,
            &["paused".into(), "already active".into()],
            false,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "pattern 'already active' unexpectedly found in output"
        );
    }

    #[test]
    fn test_check_patterns_regex() {
        let dominfo = "Id:             3\nName:           vm1\nMax memory:     2097152 KiB\n";
        let re = Pattern::regex(r"Max memory:\s+\d+ KiB").unwrap();
        check_patterns(dominfo, &[re.clone()], true).unwrap();
        assert!(check_patterns(dominfo, &[re], false).is_err());

        assert!(matches!(
            Pattern::regex("(unclosed"),
            Err(CheckError::InvalidRegex(..))
        ));
    }

    #[test]
    fn test_check_patterns_empty() {
        check_patterns("anything", &[], true).unwrap();
        check_patterns("anything", &[], false).unwrap();
    }

    #[test]
    fn test_expectation_set() {
        let failed = CommandResult::new("virsh start vm1", 1, "", ALREADY_ACTIVE);

        ExpectationSet::new(false)
            .present("already active")
            .absent("started")
            .check(&failed)
            .unwrap();

        assert!(matches!(
            ExpectationSet::default().check(&failed),
            Err(CheckError::StatusMismatch { .. })
        ));
        assert!(matches!(
            ExpectationSet::new(false).absent("already").check(&failed),
            Err(CheckError::PatternMismatch {
                expect_present: false,
                ..
            })
        ));
    }

    #[test]
    fn test_lines_count() {
        check_lines_count("a\nb\nc\n", 3).unwrap();
        assert!(matches!(
            check_lines_count("a\nb\n", 3),
            Err(CheckError::LinesCount {
                expected: 3,
                actual: 2
            })
        ));

        let input = " 1  vm1  running\n 2  vm2  running\n -  vm3  shut off\n";
        check_matched_lines_count(input, &["running"], 2).unwrap();
        check_matched_lines_count(input, &["vm", "shut off"], 1).unwrap();
        assert!(check_matched_lines_count(input, &["paused"], 1).is_err());
    }
}
