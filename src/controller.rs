//! The control loop.
//!
//! Every step runs the same pipeline, strictly in order: interpret against the
//! current snapshot, perform through the driver, re-perceive, verify. Failed
//! attempts are retried up to `max_step_retries`; a plan step that runs out
//! of attempts has the rest of its plan replaced by the planner, within the
//! `max_replans` budget. Retries wait out a doubling backoff. A step that
//! reads as a session command ("run the plan") rather than a browser action
//! is skipped.
//!
//! Cancellation is cooperative. A driver call already issued is allowed to
//! finish and the page is re-read before the step is reported as cancelled,
//! so the session snapshot never describes a half-applied action.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ControlConfig};
use crate::driver::{BrowserDriver, bounded};
use crate::error::{ActionFailure, ControlError, InterpretationError, ResolverError};
use crate::interpreter::Interpreter;
use crate::oracle::Oracle;
use crate::perception::Perceiver;
use crate::plan::{Plan, PlanStatus, PlanStep};
use crate::planner::{Planner, ReplanRequest};
use crate::report::{ActionReport, ControllerEvent, Outcome, PlanReport};
use crate::session::{LogOutcome, Session};
use crate::snapshot::{PageSnapshot, Role};
use crate::types::{Action, ActionOutput, ScrollDirection, TargetSpec};
use crate::vision::{Resolution, VisionQuery, VisionResolver};

const EVENT_CAPACITY: usize = 256;
/// Log lines handed to the oracle as conversational context.
const CONTEXT_LINES: usize = 8;
const SEARCH_FIELD_NAMES: [&str; 5] = ["q", "query", "search", "s", "keywords"];

/// Where an attempt gets its action from.
enum Source {
    /// Re-interpreted against the fresh snapshot on every attempt.
    Describe(String),
    Fixed(Action),
}

/// What performing an action left behind for verification.
#[derive(Default)]
struct Effect {
    locator: Option<String>,
    output: Option<ActionOutput>,
}

impl Effect {
    fn at(locator: String) -> Self {
        Self {
            locator: Some(locator),
            output: None,
        }
    }

    fn output(output: ActionOutput) -> Self {
        Self {
            locator: None,
            output: Some(output),
        }
    }
}

struct Attempted {
    action: Action,
    output: Option<ActionOutput>,
}

struct AttemptFailed {
    action: Option<Action>,
    failure: ActionFailure,
}

impl AttemptFailed {
    fn new(action: Option<Action>, failure: impl Into<ActionFailure>) -> Self {
        Self {
            action,
            failure: failure.into(),
        }
    }
}

struct RunResult {
    action: Option<Action>,
    attempts: u32,
    result: Result<Option<ActionOutput>, ActionFailure>,
}

pub struct Controller {
    driver: Arc<dyn BrowserDriver>,
    perceiver: Perceiver,
    interpreter: Interpreter,
    vision: VisionResolver,
    planner: Planner,
    session: Session,
    control: ControlConfig,
    search_url: String,
    driver_timeout: Duration,
    events: broadcast::Sender<ControllerEvent>,
    cancel: CancellationToken,
}

impl Controller {
    /// Wires the components together and captures the initial snapshot.
    pub async fn start(
        driver: Arc<dyn BrowserDriver>,
        oracle: Arc<dyn Oracle>,
        config: &Config,
    ) -> Result<Self, ControlError> {
        let driver_timeout = config.driver_timeout();
        let oracle_timeout = config.oracle_timeout();

        let perceiver = Perceiver::new(Arc::clone(&driver), driver_timeout);
        let vision = VisionResolver::new(Arc::clone(&oracle), oracle_timeout);
        let interpreter = Interpreter::new(
            Arc::clone(&oracle),
            vision.clone(),
            oracle_timeout,
            config.control.vision_attempts,
            config.interpreter.clone(),
            config.locator_overrides.clone(),
        );
        let planner = Planner::new(oracle, oracle_timeout);

        let initial = perceiver.capture().await?;
        info!(page = %initial.summary(), "session started");
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            driver,
            perceiver,
            interpreter,
            vision,
            planner,
            session: Session::new(initial),
            control: config.control.clone(),
            search_url: config.interpreter.search_url.clone(),
            driver_timeout,
            events,
            cancel: CancellationToken::new(),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// Token that cancels the command in flight. Once a token has fired the
    /// next call hands out a fresh one.
    pub fn cancellation_token(&mut self) -> CancellationToken {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        self.cancel.clone()
    }

    /// Interprets one utterance and carries it out.
    pub async fn handle(&mut self, utterance: &str) -> Result<Outcome, ControlError> {
        self.cancellation_token();
        let utterance = utterance.trim();
        info!(utterance, "handling command");

        let snapshot = self.session.snapshot();
        let recent = self.session.recent_log(CONTEXT_LINES);
        let action = match self
            .interpreter
            .interpret(utterance, &snapshot, self.session.history(), &recent)
            .await
        {
            Ok(action) => action,
            Err(e) => {
                warn!(error = %e, "command not interpreted");
                self.session
                    .record(Some(utterance), None, LogOutcome::Failed, e.to_string());
                self.emit(ControllerEvent::ActionFinished {
                    action: None,
                    succeeded: false,
                    detail: e.to_string(),
                });
                return Err(e.into());
            }
        };

        match action {
            Action::Plan { task } => self.plan_task(&task).await.map(Outcome::Planned),
            Action::ExecutePlan => self.run_plan().await.map(Outcome::Plan),
            action => {
                let report = self
                    .run_action(Source::Describe(utterance.to_string()), Some(action))
                    .await;
                Ok(Outcome::Action(report))
            }
        }
    }

    /// Runs an already-built action. Session-level actions create or execute
    /// the plan.
    pub async fn execute_action(&mut self, action: Action) -> Result<Outcome, ControlError> {
        self.cancellation_token();
        match action {
            Action::Plan { task } => self.plan_task(&task).await.map(Outcome::Planned),
            Action::ExecutePlan => self.run_plan().await.map(Outcome::Plan),
            action => Ok(Outcome::Action(
                self.run_action(Source::Fixed(action), None).await,
            )),
        }
    }

    /// Plans `task` from the current page and makes it the active plan.
    pub async fn create_plan(&mut self, task: &str) -> Result<Plan, ControlError> {
        self.cancellation_token();
        self.plan_task(task).await
    }

    pub async fn execute_plan(&mut self) -> Result<PlanReport, ControlError> {
        self.cancellation_token();
        self.run_plan().await
    }

    /// Plans and executes `task` in one go.
    pub async fn run_task(&mut self, task: &str) -> Result<PlanReport, ControlError> {
        self.cancellation_token();
        self.plan_task(task).await?;
        self.run_plan().await
    }

    fn emit(&self, event: ControllerEvent) {
        debug!(%event, "event");
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn active_plan(&mut self) -> Result<&mut Plan, ControlError> {
        self.session.plan_mut().ok_or(ControlError::NoActivePlan)
    }

    async fn plan_task(&mut self, task: &str) -> Result<Plan, ControlError> {
        let attempts = self.control.oracle_attempts.max(1);
        let mut attempt = 0;
        let plan = loop {
            attempt += 1;
            let snapshot = self.session.snapshot();
            let recent = self.session.recent_log(CONTEXT_LINES);
            match self.planner.plan(task, &snapshot, &recent).await {
                Ok(plan) => break plan,
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(attempt, error = %e, "planning failed, retrying");
                    if !self.back_off(attempt).await {
                        return Err(ControlError::Cancelled);
                    }
                }
                Err(e) => {
                    error!(task, error = %e, "planning failed");
                    self.session
                        .record(Some(task), None, LogOutcome::Failed, e.to_string());
                    return Err(e.into());
                }
            }
        };

        self.emit(ControllerEvent::PlanCreated {
            task: plan.task.clone(),
            steps: plan.steps.iter().map(|s| s.description.clone()).collect(),
        });
        self.session.record(
            Some(task),
            None,
            LogOutcome::Info,
            format!("planned {} step(s)", plan.steps.len()),
        );
        if let Some(previous) = self.session.set_plan(plan.clone()) {
            if !previous.is_finished() {
                info!(task = %previous.task, "unfinished plan replaced");
            }
        }
        Ok(plan)
    }

    async fn run_plan(&mut self) -> Result<PlanReport, ControlError> {
        let task = {
            let plan = self
                .session
                .plan_mut()
                .filter(|plan| !plan.is_finished())
                .ok_or(ControlError::NoActivePlan)?;
            plan.begin();
            plan.task.clone()
        };
        info!(%task, "executing plan");

        let mut outputs = Vec::new();
        let mut failed_step: Option<PlanStep> = None;

        loop {
            let Some(index) = self.active_plan()?.next_pending() else {
                break;
            };
            if self.cancel.is_cancelled() {
                warn!(%task, "plan cancelled between steps");
                self.active_plan()?.abort();
                break;
            }

            let (step_id, description) = {
                let step = &mut self.active_plan()?.steps[index];
                step.start()?;
                (step.id, step.description.clone())
            };
            info!(step_id, %description, "step started");
            self.emit(ControllerEvent::StepStarted {
                step_id,
                description: description.clone(),
            });

            let run = self
                .run_attempts(Source::Describe(description.clone()), None, Some(index))
                .await;

            let step = {
                let step = &mut self.active_plan()?.steps[index];
                step.action = run.action.clone();
                match &run.result {
                    Ok(_) => step.succeed()?,
                    Err(ActionFailure::NotExecutable(_)) => step.skip()?,
                    Err(failure) => step.fail(failure.to_string())?,
                }
                step.clone()
            };
            self.emit(ControllerEvent::StepFinished {
                step_id,
                status: step.status.clone(),
            });

            match run.result {
                Ok(output) => {
                    info!(step_id, attempts = run.attempts, "step succeeded");
                    self.session.record(
                        Some(description.as_str()),
                        run.action.as_ref(),
                        LogOutcome::Succeeded,
                        format!("step {step_id} succeeded after {} attempt(s)", run.attempts),
                    );
                    if let Some(output) = output {
                        outputs.push((step_id, output));
                    }
                }
                Err(ActionFailure::NotExecutable(what)) => {
                    info!(step_id, %what, "step is not a browser action, skipped");
                    self.session.record(
                        Some(description.as_str()),
                        run.action.as_ref(),
                        LogOutcome::Info,
                        format!("step {step_id} skipped: {what} is not a browser action"),
                    );
                }
                Err(failure) => {
                    let reason = failure.to_string();
                    warn!(step_id, attempts = run.attempts, %reason, "step failed");
                    self.session.record(
                        Some(description.as_str()),
                        run.action.as_ref(),
                        LogOutcome::Failed,
                        format!("step {step_id} failed: {reason}"),
                    );

                    if matches!(failure, ActionFailure::Cancelled) {
                        self.active_plan()?.abort();
                        failed_step = Some(step);
                        break;
                    }
                    if let Err(why) = self.replan(index, &reason).await {
                        error!(step_id, %why, "aborting plan");
                        self.session
                            .record(None, None, LogOutcome::Failed, format!("plan aborted: {why}"));
                        self.active_plan()?.abort();
                        failed_step = Some(step);
                        break;
                    }
                }
            }
        }

        let summary = self.session.snapshot().summary();
        let plan = self.active_plan()?;
        if plan.status == PlanStatus::Executing && !plan.try_complete() {
            plan.abort();
        }
        let report = PlanReport::new(plan, failed_step, outputs, summary);

        info!(%task, status = ?report.status, replans = report.replans, "plan finished");
        self.emit(ControllerEvent::PlanFinished {
            task: task.clone(),
            status: report.status,
        });
        let outcome = if report.completed() {
            LogOutcome::Succeeded
        } else {
            LogOutcome::Failed
        };
        self.session
            .record(Some(task.as_str()), None, outcome, format!("plan {:?}", report.status));
        Ok(report)
    }

    /// Replaces the failed step at `index` and everything after it.
    async fn replan(&mut self, index: usize, reason: &str) -> Result<(), String> {
        let max_replans = self.control.max_replans;
        let (request, failed_id) = {
            let plan = self.active_plan().map_err(|e| e.to_string())?;
            if plan.replans >= max_replans {
                return Err(format!("replan budget of {max_replans} exhausted"));
            }
            (
                ReplanRequest::for_plan(plan, index, reason),
                plan.steps[index].id,
            )
        };
        warn!(step_id = failed_id, reason, "replanning remaining steps");

        let attempts = self.control.oracle_attempts.max(1);
        let mut attempt = 0;
        let steps = loop {
            attempt += 1;
            let snapshot = self.session.snapshot();
            let recent = self.session.recent_log(CONTEXT_LINES);
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err("cancelled".to_string()),
                result = self.planner.replan(&request, &snapshot, &recent) => result,
            };
            match result {
                Ok(steps) => break steps,
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(attempt, error = %e, "replanning failed, retrying");
                    if !self.back_off(attempt).await {
                        return Err("cancelled".to_string());
                    }
                }
                Err(e) => return Err(format!("replanning failed: {e}")),
            }
        };

        self.active_plan()
            .map_err(|e| e.to_string())?
            .replace_suffix(index, steps.clone())
            .map_err(|e| e.to_string())?;

        self.session.record(
            None,
            None,
            LogOutcome::Info,
            format!("replanned after step {failed_id}: {}", steps.join("; ")),
        );
        self.emit(ControllerEvent::Replanned {
            failed_step: failed_id,
            reason: reason.to_string(),
            steps,
        });
        Ok(())
    }

    async fn run_action(&mut self, source: Source, first: Option<Action>) -> ActionReport {
        let utterance = match &source {
            Source::Describe(text) => Some(text.clone()),
            Source::Fixed(_) => None,
        };
        let run = self.run_attempts(source, first, None).await;
        let snapshot = self.session.snapshot().summary();

        let (succeeded, output, error) = match run.result {
            Ok(output) => (true, output, None),
            Err(failure) => (false, None, Some(failure.to_string())),
        };
        let detail = match &error {
            Some(error) => format!("failed after {} attempt(s): {error}", run.attempts),
            None => format!("succeeded after {} attempt(s)", run.attempts),
        };
        if succeeded {
            info!(attempts = run.attempts, "action succeeded");
        } else {
            warn!(attempts = run.attempts, %detail, "action failed");
        }

        self.session.record(
            utterance.as_deref(),
            run.action.as_ref(),
            if succeeded {
                LogOutcome::Succeeded
            } else {
                LogOutcome::Failed
            },
            detail.clone(),
        );
        self.emit(ControllerEvent::ActionFinished {
            action: run.action.clone(),
            succeeded,
            detail,
        });

        ActionReport {
            action: run.action,
            succeeded,
            attempts: run.attempts,
            output,
            error,
            snapshot,
        }
    }

    /// Attempts until success, a non-transient failure, or
    /// `max_step_retries + 1` attempts.
    async fn run_attempts(
        &mut self,
        source: Source,
        mut first: Option<Action>,
        step: Option<usize>,
    ) -> RunResult {
        let max_retries = self.control.max_step_retries;
        let step_id = step.and_then(|index| {
            self.session
                .plan()
                .and_then(|plan| plan.steps.get(index))
                .map(|s| s.id)
        });

        let mut attempts = 0;
        let mut last_action = None;
        loop {
            attempts += 1;
            match self.attempt(&source, first.take(), step_id, attempts).await {
                Ok(done) => {
                    return RunResult {
                        action: Some(done.action),
                        attempts,
                        result: Ok(done.output),
                    };
                }
                Err(failed) => {
                    if failed.action.is_some() {
                        last_action = failed.action;
                    }
                    let will_retry = failed.failure.is_transient() && attempts <= max_retries;
                    warn!(
                        step = ?step_id,
                        attempt = attempts,
                        error = %failed.failure,
                        will_retry,
                        "attempt failed"
                    );
                    self.emit(ControllerEvent::AttemptFailed {
                        step_id,
                        attempt: attempts,
                        error: failed.failure.to_string(),
                        will_retry,
                    });
                    if !will_retry {
                        return RunResult {
                            action: last_action,
                            attempts,
                            result: Err(failed.failure),
                        };
                    }

                    if let Some(index) = step {
                        if let Some(step) = self
                            .session
                            .plan_mut()
                            .and_then(|plan| plan.steps.get_mut(index))
                        {
                            step.retries += 1;
                        }
                    }
                    if matches!(failed.failure, ActionFailure::Perception(_)) {
                        self.recover().await;
                    }
                    if !self.back_off(attempts).await {
                        warn!(step = ?step_id, "cancelled while waiting to retry");
                        return RunResult {
                            action: last_action,
                            attempts,
                            result: Err(ActionFailure::Cancelled),
                        };
                    }
                }
            }
        }
    }

    /// One pass of interpret, perform, perceive, verify.
    async fn attempt(
        &mut self,
        source: &Source,
        preset: Option<Action>,
        step_id: Option<u32>,
        attempt: u32,
    ) -> Result<Attempted, AttemptFailed> {
        if self.cancel.is_cancelled() {
            return Err(AttemptFailed::new(None, ActionFailure::Cancelled));
        }
        let before = self.session.snapshot();

        let action = match (preset, source) {
            (Some(action), _) => action,
            (None, Source::Fixed(action)) => action.clone(),
            (None, Source::Describe(text)) => {
                let recent = self.session.recent_log(CONTEXT_LINES);
                let history = self.session.history();
                let interpreted = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        return Err(AttemptFailed::new(None, ActionFailure::Cancelled));
                    }
                    result = self.interpreter.interpret(text, &before, history, &recent) => result,
                };
                interpreted.map_err(|e| AttemptFailed::new(None, e))?
            }
        };
        if action.is_session_level() {
            let failure = ActionFailure::NotExecutable(action.to_string());
            return Err(AttemptFailed::new(Some(action), failure));
        }

        debug!(%action, attempt, "performing");
        self.emit(ControllerEvent::ActionResolved {
            step_id,
            attempt,
            action: action.clone(),
        });

        let effect = match self.perform(&action, &before).await {
            Ok(effect) => effect,
            Err(failure) => {
                if matches!(failure, ActionFailure::Driver(_)) {
                    self.refresh().await;
                }
                return Err(AttemptFailed::new(Some(action), failure));
            }
        };

        let after = if mutates_page(&action) {
            match self.perceiver.capture().await {
                Ok(snapshot) => {
                    self.session.replace_snapshot(snapshot);
                    self.session.snapshot()
                }
                Err(e) => return Err(AttemptFailed::new(Some(action), e)),
            }
        } else {
            Arc::clone(&before)
        };

        // The driver call has finished and the page has been re-read; the
        // result is discarded.
        if self.cancel.is_cancelled() {
            return Err(AttemptFailed::new(Some(action), ActionFailure::Cancelled));
        }

        match self.verify(&action, &before, &after, effect).await {
            Ok(output) => Ok(Attempted { action, output }),
            Err(failure) => Err(AttemptFailed::new(Some(action), failure)),
        }
    }

    async fn perform(
        &self,
        action: &Action,
        snapshot: &PageSnapshot,
    ) -> Result<Effect, ActionFailure> {
        let limit = self.driver_timeout;
        let driver = self.driver.as_ref();

        match action {
            Action::Navigate { url } => {
                bounded("navigate", limit, driver.navigate(url)).await?;
                Ok(Effect::default())
            }
            Action::Search { term } => {
                match search_field(snapshot) {
                    Some(locator) => {
                        bounded("type", limit, driver.type_text(&locator, term)).await?;
                        bounded("press_key", limit, driver.press_key("Enter")).await?;
                    }
                    None => {
                        let url = self.search_url.replace("{}", &encode(term));
                        bounded("navigate", limit, driver.navigate(&url)).await?;
                    }
                }
                Ok(Effect::default())
            }
            Action::Click { target } => {
                let locator = self.locate(target, snapshot, None).await?;
                bounded("click", limit, driver.click(&locator)).await?;
                Ok(Effect::at(locator))
            }
            Action::TypeText { target, value } => {
                let locator = self.locate(target, snapshot, Some(Role::Input)).await?;
                bounded("type", limit, driver.type_text(&locator, value)).await?;
                Ok(Effect::at(locator))
            }
            Action::Submit { form } => {
                let locator = match form {
                    Some(target) => self.locate(target, snapshot, None).await?,
                    None => snapshot
                        .form_fields
                        .first()
                        .map(|field| field.locator.clone())
                        .ok_or_else(|| {
                            InterpretationError::Unresolvable("no form on the page".into())
                        })?,
                };
                bounded("submit", limit, driver.submit(&locator)).await?;
                Ok(Effect::at(locator))
            }
            Action::Scroll { direction, amount } => {
                bounded("scroll", limit, driver.scroll(*direction, *amount)).await?;
                Ok(Effect::default())
            }
            Action::Extract { schema_hint } => {
                let query = VisionQuery::Extract {
                    schema_hint: schema_hint.clone(),
                };
                match self.vision.resolve(&query, snapshot, &snapshot.screenshot).await? {
                    Resolution::Data(value) => Ok(Effect::output(ActionOutput::Data { value })),
                    other => Err(unexpected(other)),
                }
            }
            Action::Analyze { query } => {
                let query = VisionQuery::Judge {
                    question: query.clone(),
                };
                match self.vision.resolve(&query, snapshot, &snapshot.screenshot).await? {
                    Resolution::Judgment(text) => {
                        Ok(Effect::output(ActionOutput::Judgment { text }))
                    }
                    other => Err(unexpected(other)),
                }
            }
            Action::Screenshot => {
                let png = bounded("capture_screenshot", limit, driver.capture_screenshot()).await?;
                Ok(Effect::output(ActionOutput::Screenshot { bytes: png.len() }))
            }
            Action::Plan { .. } | Action::ExecutePlan => {
                Err(ActionFailure::NotExecutable(action.to_string()))
            }
        }
    }

    /// Turns a target into a locator on `snapshot`, asking the vision
    /// resolver when the text does not pick out exactly one element. Among
    /// several matches, a single one with the `prefer` role is taken.
    async fn locate(
        &self,
        target: &TargetSpec,
        snapshot: &PageSnapshot,
        prefer: Option<Role>,
    ) -> Result<String, ActionFailure> {
        let (description, candidates): (&String, Vec<String>) = match target {
            TargetSpec::Selector(selector) => return Ok(selector.clone()),
            TargetSpec::VisibleText(text) => {
                let matches = snapshot.elements_matching_text(text);
                if let [only] = matches.as_slice() {
                    return Ok(only.locator.clone());
                }
                if let Some(role) = prefer {
                    let preferred: Vec<_> = matches.iter().filter(|el| el.role == role).collect();
                    if let [only] = preferred.as_slice() {
                        return Ok(only.locator.clone());
                    }
                }
                (text, matches.iter().map(|el| el.locator.clone()).collect())
            }
            TargetSpec::VisualDescription(description) => (description, Vec::new()),
        };

        let query = VisionQuery::Locate {
            description: description.clone(),
            candidates,
        };
        match self.vision.resolve(&query, snapshot, &snapshot.screenshot).await? {
            Resolution::Element(locator) => Ok(locator),
            other => Err(unexpected(other)),
        }
    }

    async fn verify(
        &self,
        action: &Action,
        before: &PageSnapshot,
        after: &PageSnapshot,
        effect: Effect,
    ) -> Result<Option<ActionOutput>, ActionFailure> {
        let moved = before.url != after.url || before.fingerprint() != after.fingerprint();

        match action {
            Action::Navigate { url } => {
                if reached(url, &after.url) {
                    Ok(None)
                } else {
                    Err(ActionFailure::PostCondition(format!(
                        "expected {url}, landed on {}",
                        after.url
                    )))
                }
            }
            Action::Search { term } => {
                let url = after.url.to_lowercase();
                let found = url.contains(&encode(term).to_lowercase())
                    || url.contains(&term.to_lowercase())
                    || after.mentions(term);
                if moved && found {
                    Ok(None)
                } else {
                    Err(ActionFailure::PostCondition(format!(
                        "no results for \"{term}\" on {}",
                        after.url
                    )))
                }
            }
            Action::Click { target } if !moved => {
                self.confirm_effect(
                    &format!(
                        "The element {target} was just clicked. Did the page visibly respond, \
                         for example by opening, expanding, selecting or changing content?"
                    ),
                    after,
                )
                .await
            }
            Action::Click { .. } => Ok(None),
            Action::TypeText { target, value } => {
                let field = effect
                    .locator
                    .as_deref()
                    .and_then(|locator| after.field_by_locator(locator));
                match field {
                    Some(field) if field.value == *value => Ok(None),
                    Some(field) => Err(ActionFailure::PostCondition(format!(
                        "{target} holds \"{}\" instead of \"{value}\"",
                        field.value
                    ))),
                    None => {
                        self.confirm_effect(
                            &format!("Does the field {target} now show the text \"{value}\"?"),
                            after,
                        )
                        .await
                    }
                }
            }
            Action::Submit { .. } if !moved => {
                self.confirm_effect(
                    "A form was just submitted. Did the page respond, for example with \
                     results, an error message or a confirmation?",
                    after,
                )
                .await
            }
            Action::Submit { .. } => Ok(None),
            Action::Scroll { direction, .. } => {
                let dx = after.scroll_x - before.scroll_x;
                let dy = after.scroll_y - before.scroll_y;
                let moved_that_way = match direction {
                    ScrollDirection::Down => dy > 0,
                    ScrollDirection::Up => dy < 0,
                    ScrollDirection::Right => dx > 0,
                    ScrollDirection::Left => dx < 0,
                };
                if moved_that_way {
                    Ok(None)
                } else {
                    Err(ActionFailure::PostCondition(format!(
                        "scrolling {direction:?} did not move the page"
                    )))
                }
            }
            Action::Extract { .. } | Action::Analyze { .. } | Action::Screenshot => {
                match effect.output {
                    Some(ActionOutput::Data { value }) if !is_blank(&value) => {
                        Ok(Some(ActionOutput::Data { value }))
                    }
                    Some(ActionOutput::Judgment { text }) if !text.trim().is_empty() => {
                        Ok(Some(ActionOutput::Judgment { text }))
                    }
                    Some(ActionOutput::Screenshot { bytes }) if bytes > 0 => {
                        Ok(Some(ActionOutput::Screenshot { bytes }))
                    }
                    _ => Err(ActionFailure::PostCondition(format!(
                        "{} produced nothing",
                        action.name()
                    ))),
                }
            }
            Action::Plan { .. } | Action::ExecutePlan => {
                Err(ActionFailure::NotExecutable(action.to_string()))
            }
        }
    }

    async fn confirm_effect(
        &self,
        question: &str,
        after: &PageSnapshot,
    ) -> Result<Option<ActionOutput>, ActionFailure> {
        if self.vision.confirm(question, after).await? {
            Ok(None)
        } else {
            Err(ActionFailure::PostCondition(
                "no visible effect on the page".into(),
            ))
        }
    }

    /// Waits before retry number `retry`. Returns false if the command was
    /// cancelled while waiting.
    async fn back_off(&self, retry: u32) -> bool {
        let delay = self.control.backoff(retry);
        if delay.is_zero() {
            return true;
        }
        debug!(retry, delay_ms = delay.as_millis() as u64, "backing off");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Best-effort re-read after a failed driver call.
    async fn refresh(&mut self) {
        match self.perceiver.capture().await {
            Ok(snapshot) => self.session.replace_snapshot(snapshot),
            Err(e) => debug!(error = %e, "snapshot refresh failed"),
        }
    }

    /// Reloads the last known page so the next attempt starts from a live one.
    async fn recover(&mut self) {
        let Some(url) = self.session.history().last().cloned() else {
            return;
        };
        info!(%url, "reloading page after perception failure");
        if let Err(e) = bounded("navigate", self.driver_timeout, self.driver.navigate(&url)).await {
            warn!(error = %e, "recovery navigation failed");
            return;
        }
        self.refresh().await;
    }
}

fn mutates_page(action: &Action) -> bool {
    matches!(
        action,
        Action::Navigate { .. }
            | Action::Search { .. }
            | Action::Click { .. }
            | Action::TypeText { .. }
            | Action::Submit { .. }
            | Action::Scroll { .. }
    )
}

fn unexpected(resolution: Resolution) -> ActionFailure {
    ResolverError::OracleFailure(format!("unexpected resolution {resolution:?}")).into()
}

fn encode(term: &str) -> String {
    url::form_urlencoded::byte_serialize(term.as_bytes()).collect()
}

fn host_of(url: &url::Url) -> Option<String> {
    url.host_str()
        .map(|host| host.trim_start_matches("www.").to_ascii_lowercase())
}

/// Whether the page at `actual` is where a navigation to `target` should end:
/// same host (ignoring `www.`) and a path at or below the target's path.
/// Addresses without a host must match exactly.
fn reached(target: &str, actual: &str) -> bool {
    let (Ok(wanted), Ok(got)) = (url::Url::parse(target), url::Url::parse(actual)) else {
        return target.trim_end_matches('/') == actual.trim_end_matches('/');
    };
    match (host_of(&wanted), host_of(&got)) {
        (Some(wanted_host), Some(got_host)) => {
            let want_path = wanted.path().trim_end_matches('/');
            let got_path = got.path().trim_end_matches('/');
            wanted_host == got_host
                && (got_path == want_path || got_path.starts_with(&format!("{want_path}/")))
        }
        (None, None) => wanted.as_str().trim_end_matches('/') == got.as_str().trim_end_matches('/'),
        _ => false,
    }
}

/// The page's own search box, if it has one.
fn search_field(snapshot: &PageSnapshot) -> Option<String> {
    snapshot
        .form_fields
        .iter()
        .find(|field| {
            field.field_type.eq_ignore_ascii_case("search")
                || SEARCH_FIELD_NAMES
                    .iter()
                    .any(|name| field.name.eq_ignore_ascii_case(name))
        })
        .map(|field| field.locator.clone())
        .or_else(|| {
            snapshot
                .elements
                .iter()
                .find(|el| {
                    el.role == Role::Input && el.display_name().to_lowercase().contains("search")
                })
                .map(|el| el.locator.clone())
        })
}

fn is_blank(value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{Bounds, FormField, InteractiveElement};
    use serde_json::json;

    #[test]
    fn navigation_check_compares_hosts() {
        assert!(reached("https://example.com", "https://www.example.com/"));
        assert!(reached("https://example.com/docs", "https://example.com/docs/"));
        assert!(reached("https://example.com/docs", "https://example.com/docs/intro?x=1"));
        assert!(!reached("https://example.com", "https://example.org/"));
        assert!(reached("about:blank", "about:blank"));
    }

    #[test]
    fn navigation_check_rejects_lookalike_hosts_and_paths() {
        assert!(!reached("https://example.com", "https://example.com.evil.test/"));
        assert!(!reached("https://example.com", "https://evil.test/?u=https://example.com"));
        assert!(!reached("https://example.com/docs", "https://example.com/docsearch"));
        assert!(!reached("https://example.com/docs", "https://example.com/login"));
        assert!(!reached("about:blank", "https://example.com/"));
    }

    #[test]
    fn search_terms_are_form_encoded() {
        assert_eq!(encode("rust books"), "rust+books");
        assert_eq!(encode("a&b"), "a%26b");
    }

    #[test]
    fn finds_search_box_by_field_or_label() {
        let mut snap = PageSnapshot::default();
        assert_eq!(search_field(&snap), None);

        snap.elements.push(InteractiveElement {
            role: Role::Input,
            text: String::new(),
            label: Some("Search products".into()),
            bounds: Bounds::default(),
            locator: "#site-search".into(),
        });
        assert_eq!(search_field(&snap).as_deref(), Some("#site-search"));

        snap.form_fields.push(FormField {
            name: "q".into(),
            field_type: "text".into(),
            value: String::new(),
            required: false,
            locator: "input[name=\"q\"]".into(),
        });
        assert_eq!(search_field(&snap).as_deref(), Some("input[name=\"q\"]"));
    }

    #[test]
    fn blank_outputs() {
        assert!(is_blank(&json!(null)));
        assert!(is_blank(&json!({})));
        assert!(is_blank(&json!("  ")));
        assert!(!is_blank(&json!({"price": 3})));
        assert!(!is_blank(&json!(0)));
    }

    #[test]
    fn only_page_actions_trigger_recapture() {
        assert!(mutates_page(&Action::Navigate { url: "x".into() }));
        assert!(!mutates_page(&Action::Screenshot));
        assert!(!mutates_page(&Action::Analyze { query: "q".into() }));
    }
}
