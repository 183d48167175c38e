// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Drives one scenario through setup, run and teardown.
//!
//! Steps report their outcome through [`Failure`], one variant per severity.
//! The runner records the first failure, always runs the teardown step
//! exactly once and restores the configuration snapshot if one was taken.
//! Only then is the verdict handed to the [`Reporter`].

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::checker::{self, CheckError};
use crate::command::{CommandError, CommandResult};
use crate::env::{Env, EnvError};
use crate::params::{Params, ParamsError};
use crate::snapshot::{ConfigSnapshot, SnapshotError};
use crate::ssh::SshCommandError;
use crate::subject::{Subject, SubjectError};
use crate::wait::{BackgroundTask, StopFlag, TaskWatcher, WaitError};
use crate::xml::XmlError;

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a step stopped early.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// An expectation about the system under test was not met.
    Fail(String),
    /// The scenario could not be judged.
    Error(String),
    /// A precondition was not met, nothing was judged.
    Cancel(String),
}

impl Failure {
    pub fn fail<S: Into<String>>(msg: S) -> Self {
        Failure::Fail(msg.into())
    }

    pub fn error<S: Into<String>>(msg: S) -> Self {
        Failure::Error(msg.into())
    }

    pub fn cancel<S: Into<String>>(msg: S) -> Self {
        Failure::Cancel(msg.into())
    }

    pub fn message(&self) -> &str {
        match self {
            Failure::Fail(m) | Failure::Error(m) | Failure::Cancel(m) => m,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Verdict::from(self.clone()).fmt(f)
    }
}

/// Flattens an error and its sources into one line.
pub fn error_chain(e: &dyn StdError) -> String {
    let mut msg = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        msg.push_str(": ");
        msg.push_str(&s.to_string());
        source = s.source();
    }
    msg
}

impl From<CheckError> for Failure {
    fn from(e: CheckError) -> Self {
        match e {
            // A broken pattern is a bug in the scenario, not in the subject
            CheckError::InvalidRegex(..) => Failure::Error(error_chain(&e)),
            e => Failure::Fail(error_chain(&e)),
        }
    }
}

macro_rules! error_failure {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Failure {
                fn from(e: $t) -> Self {
                    Failure::Error(error_chain(&e))
                }
            }
        )*
    };
}

error_failure!(
    CommandError,
    EnvError,
    ParamsError,
    SnapshotError,
    SshCommandError,
    SubjectError,
    WaitError,
    XmlError
);

pub type StepResult = Result<(), Failure>;

type Step = Box<dyn FnOnce(&mut ScenarioContext) -> StepResult>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(String),
    Error(String),
    Cancel(String),
}

impl Verdict {
    pub fn kind(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Fail(_) => "fail",
            Verdict::Error(_) => "error",
            Verdict::Cancel(_) => "cancel",
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Verdict::Pass => None,
            Verdict::Fail(m) | Verdict::Error(m) | Verdict::Cancel(m) => Some(m),
        }
    }

    /// Passed or skipped, nothing to look at.
    pub fn is_ok(&self) -> bool {
        matches!(self, Verdict::Pass | Verdict::Cancel(_))
    }
}

impl From<Failure> for Verdict {
    fn from(f: Failure) -> Self {
        match f {
            Failure::Fail(m) => Verdict::Fail(m),
            Failure::Error(m) => Verdict::Error(m),
            Failure::Cancel(m) => Verdict::Cancel(m),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.message() {
            Some(m) => write!(f, "{}: {m}", self.kind().to_uppercase()),
            None => write!(f, "{}", self.kind().to_uppercase()),
        }
    }
}

/// Receives the verdict of each executed scenario.
pub trait Reporter {
    fn pass(&mut self, scenario: &str);
    fn fail(&mut self, scenario: &str, msg: &str);
    fn error(&mut self, scenario: &str, msg: &str);
    fn cancel(&mut self, scenario: &str, msg: &str);
}

/// Reports through the `log` facade.
#[derive(Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn pass(&mut self, scenario: &str) {
        info!("{scenario}: PASS");
    }

    fn fail(&mut self, scenario: &str, msg: &str) {
        error!("{scenario}: FAIL: {msg}");
    }

    fn error(&mut self, scenario: &str, msg: &str) {
        error!("{scenario}: ERROR: {msg}");
    }

    fn cancel(&mut self, scenario: &str, msg: &str) {
        warn!("{scenario}: CANCEL: {msg}");
    }
}

pub struct Scenario {
    name: String,
    subject: Option<String>,
    snapshot: bool,
    expect_success: bool,
    setup: Option<Step>,
    run: Step,
    teardown: Step,
    after_restore: Option<Step>,
}

impl Scenario {
    pub fn new<R, T>(name: &str, run: R, teardown: T) -> Self
    where
        R: FnOnce(&mut ScenarioContext) -> StepResult + 'static,
        T: FnOnce(&mut ScenarioContext) -> StepResult + 'static,
    {
        Scenario {
            name: name.to_owned(),
            subject: None,
            snapshot: false,
            expect_success: true,
            setup: None,
            run: Box::new(run),
            teardown: Box::new(teardown),
            after_restore: None,
        }
    }

    pub fn with_setup<S>(mut self, setup: S) -> Self
    where
        S: FnOnce(&mut ScenarioContext) -> StepResult + 'static,
    {
        self.setup = Some(Box::new(setup));
        self
    }

    /// Subject looked up in the environment and bound before setup.
    pub fn subject(mut self, name: &str) -> Self {
        self.subject = Some(name.to_owned());
        self
    }

    /// Capture the subject's configuration before setup and restore it
    /// after teardown.
    pub fn snapshot(mut self) -> Self {
        self.snapshot = true;
        self
    }

    pub fn expect_success(mut self, expect_success: bool) -> Self {
        self.expect_success = expect_success;
        self
    }

    /// Cleanup that needs the restored configuration, such as starting the
    /// subject again. Runs after the snapshot is restored, or right after
    /// teardown when there is no snapshot.
    pub fn after_restore<A>(mut self, after_restore: A) -> Self
    where
        A: FnOnce(&mut ScenarioContext) -> StepResult + 'static,
    {
        self.after_restore = Some(Box::new(after_restore));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Everything a step can reach. Lives as long as the scenario.
pub struct ScenarioContext {
    name: String,
    params: Params,
    env: Env,
    subject: Option<Arc<dyn Subject>>,
    snapshot: Option<ConfigSnapshot>,
    expect_success: bool,
    background: Vec<TaskWatcher>,
}

impl ScenarioContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    /// The bound subject. Teardown steps should prefer `bound_subject()`,
    /// which lets them skip work when binding never happened.
    pub fn subject(&self) -> Result<Arc<dyn Subject>, Failure> {
        self.subject
            .clone()
            .ok_or_else(|| Failure::error(format!("scenario '{}' has no bound subject", self.name)))
    }

    pub fn bound_subject(&self) -> Option<Arc<dyn Subject>> {
        self.subject.clone()
    }

    pub fn snapshot(&self) -> Option<&ConfigSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn expect_success(&self) -> bool {
        self.expect_success
    }

    /// Checks `result` against the scenario's status expectation.
    pub fn check_status(&self, result: &CommandResult) -> StepResult {
        checker::check_status(result, self.expect_success)?;
        Ok(())
    }

    /// Spawns a task that the runner stops and waits for before teardown.
    pub fn spawn_background<T, F>(&mut self, name: &str, f: F) -> Result<BackgroundTask<T>, Failure>
    where
        T: Send + 'static,
        F: FnOnce(StopFlag) -> T + Send + 'static,
    {
        let task = BackgroundTask::spawn(name, f)?;
        self.background.push(task.watcher());
        Ok(task)
    }

    /// Cancels the scenario when `tool` is not on `PATH`.
    pub fn require_tool(&self, tool: &str) -> StepResult {
        match which::which(tool) {
            Ok(path) => {
                debug!("Found {tool} at {}", path.display());
                Ok(())
            }
            Err(_) => Err(Failure::cancel(format!("required tool '{tool}' not found in PATH"))),
        }
    }
}

#[derive(Debug)]
pub struct ScenarioOutcome {
    pub name: String,
    pub verdict: Verdict,
    pub duration: Duration,
    /// Cleanup problems, including those hidden by an earlier failure.
    pub teardown_errors: Vec<String>,
}

pub struct ScenarioRunner {
    env: Env,
    params: Params,
    join_timeout: Duration,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn run_step(scenario: &str, step_name: &str, step: Step, ctx: &mut ScenarioContext) -> StepResult {
    debug!("{scenario}: {step_name}");
    match panic::catch_unwind(AssertUnwindSafe(|| step(ctx))) {
        Ok(r) => r,
        Err(payload) => Err(Failure::error(format!(
            "{step_name} panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

impl ScenarioRunner {
    pub fn new(env: Env, params: Params) -> Self {
        ScenarioRunner {
            env,
            params,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    // Looks the subject up and takes the snapshot. The subject is only bound
    // once it is known to exist, so cleanup never acts on a missing one.
    fn bind(&self, scenario: &Scenario, ctx: &mut ScenarioContext) -> StepResult {
        let Some(name) = scenario.subject.as_deref() else {
            return Ok(());
        };
        let subject = self.env.get(name)?;

        if scenario.snapshot {
            ctx.snapshot = Some(ConfigSnapshot::capture(subject.as_ref())?);
        } else if !subject.exists()? {
            return Err(Failure::error(format!("subject '{name}' does not exist")));
        }

        ctx.subject = Some(subject);
        Ok(())
    }

    pub fn execute(&self, scenario: Scenario, reporter: &mut dyn Reporter) -> ScenarioOutcome {
        let start = Instant::now();
        info!("\n\n==== Start scenario {} ====\n", scenario.name);

        let mut ctx = ScenarioContext {
            name: scenario.name.clone(),
            params: self.params.clone(),
            env: self.env.clone(),
            subject: None,
            snapshot: None,
            expect_success: scenario.expect_success,
            background: Vec::new(),
        };

        let mut failure = self.bind(&scenario, &mut ctx).err();

        let Scenario {
            name,
            setup,
            run,
            teardown,
            after_restore,
            ..
        } = scenario;

        if failure.is_none() {
            if let Some(setup) = setup {
                failure = run_step(&name, "setup", setup, &mut ctx).err();
            }
        }
        if failure.is_none() {
            failure = run_step(&name, "run", run, &mut ctx).err();
        }
        if let Some(f) = &failure {
            debug!("{name}: recorded {f}");
        }

        let mut cleanup_failure: Option<Failure> = None;
        let mut teardown_errors = Vec::new();
        let mut record = |f: Failure| {
            warn!("{name}: cleanup: {f}");
            teardown_errors.push(f.message().to_owned());
            cleanup_failure.get_or_insert(f);
        };

        for watcher in ctx.background.drain(..) {
            if let Err(e) = watcher.stop_and_wait(self.join_timeout) {
                record(e.into());
            }
        }

        if let Err(f) = run_step(&name, "teardown", teardown, &mut ctx) {
            record(f);
        }

        if let (Some(snapshot), Some(subject)) = (ctx.snapshot.take(), ctx.subject.as_ref()) {
            if let Err(e) = snapshot.restore(subject.as_ref()) {
                record(e.into());
            }
        }

        if let Some(after_restore) = after_restore {
            if let Err(f) = run_step(&name, "after restore", after_restore, &mut ctx) {
                record(f);
            }
        }

        let verdict = match failure.or(cleanup_failure) {
            Some(f) => Verdict::from(f),
            None => Verdict::Pass,
        };

        match &verdict {
            Verdict::Pass => reporter.pass(&name),
            Verdict::Fail(m) => reporter.fail(&name, m),
            Verdict::Error(m) => reporter.error(&name, m),
            Verdict::Cancel(m) => reporter.cancel(&name, m),
        }

        let duration = start.elapsed();
        info!("\n\n==== End scenario {name}: {} ({duration:?}) ====\n", verdict.kind());

        ScenarioOutcome {
            name,
            verdict,
            duration,
            teardown_errors,
        }
    }
}
