//! Progress events and end-of-command reports.

use std::fmt;

use serde::Serialize;

use crate::plan::{Plan, PlanStatus, PlanStep, StepStatus};
use crate::types::{Action, ActionOutput};

/// Published by the controller as it works; receivers that lag simply miss
/// events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControllerEvent {
    PlanCreated {
        task: String,
        steps: Vec<String>,
    },
    StepStarted {
        step_id: u32,
        description: String,
    },
    ActionResolved {
        step_id: Option<u32>,
        attempt: u32,
        action: Action,
    },
    AttemptFailed {
        step_id: Option<u32>,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    Replanned {
        failed_step: u32,
        reason: String,
        steps: Vec<String>,
    },
    StepFinished {
        step_id: u32,
        status: StepStatus,
    },
    PlanFinished {
        task: String,
        status: PlanStatus,
    },
    ActionFinished {
        action: Option<Action>,
        succeeded: bool,
        detail: String,
    },
}

impl fmt::Display for ControllerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlanCreated { task, steps } => {
                writeln!(f, "plan for \"{task}\":")?;
                for (i, step) in steps.iter().enumerate() {
                    writeln!(f, "  {}. {step}", i + 1)?;
                }
                Ok(())
            }
            Self::StepStarted {
                step_id,
                description,
            } => write!(f, "[step {step_id}] {description}"),
            Self::ActionResolved {
                step_id: _,
                attempt,
                action,
            } => write!(f, "  -> {action} (attempt {attempt})"),
            Self::AttemptFailed {
                attempt,
                error,
                will_retry,
                ..
            } => write!(
                f,
                "  attempt {attempt} failed: {error}{}",
                if *will_retry { ", retrying" } else { "" }
            ),
            Self::Replanned {
                failed_step,
                reason,
                steps,
            } => write!(
                f,
                "replanned after step {failed_step} ({reason}): {} new step(s)",
                steps.len()
            ),
            Self::StepFinished { step_id, status } => {
                write!(f, "[step {step_id}] {}", status_label(status))
            }
            Self::PlanFinished { task, status } => write!(f, "plan \"{task}\" {status:?}"),
            Self::ActionFinished {
                action,
                succeeded,
                detail,
            } => {
                let what = action
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "command".to_string());
                let verdict = if *succeeded { "done" } else { "failed" };
                write!(f, "{what}: {verdict} ({detail})")
            }
        }
    }
}

fn status_label(status: &StepStatus) -> String {
    match status {
        StepStatus::Pending => "pending".into(),
        StepStatus::InProgress => "in progress".into(),
        StepStatus::Succeeded => "succeeded".into(),
        StepStatus::Failed { reason } => format!("failed: {reason}"),
        StepStatus::Skipped => "skipped".into(),
    }
}

/// Result of a standalone action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionReport {
    /// The last action attempted, if interpretation got that far.
    pub action: Option<Action>,
    pub succeeded: bool,
    pub attempts: u32,
    pub output: Option<ActionOutput>,
    pub error: Option<String>,
    /// Summary of the page as last seen.
    pub snapshot: String,
}

impl fmt::Display for ActionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = self
            .action
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "command".to_string());
        if self.succeeded {
            write!(f, "{what}: succeeded")?;
        } else {
            write!(
                f,
                "{what}: failed after {} attempt(s): {}",
                self.attempts,
                self.error.as_deref().unwrap_or("unknown error")
            )?;
        }
        match &self.output {
            Some(ActionOutput::Data { value }) => write!(f, "\n{value:#}")?,
            Some(ActionOutput::Judgment { text }) => write!(f, "\n{text}")?,
            Some(ActionOutput::Screenshot { bytes }) => write!(f, " ({bytes} byte screenshot)")?,
            None => {}
        }
        write!(f, "\npage: {}", self.snapshot)
    }
}

/// Result of running the active plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanReport {
    pub task: String,
    pub status: PlanStatus,
    pub steps: Vec<PlanStep>,
    pub replans: u32,
    /// The step whose failure ended the plan.
    pub failed_step: Option<PlanStep>,
    pub outputs: Vec<(u32, ActionOutput)>,
    pub snapshot: String,
}

impl PlanReport {
    pub(crate) fn new(
        plan: &Plan,
        failed_step: Option<PlanStep>,
        outputs: Vec<(u32, ActionOutput)>,
        snapshot: String,
    ) -> Self {
        Self {
            task: plan.task.clone(),
            status: plan.status,
            steps: plan.steps.clone(),
            replans: plan.replans,
            failed_step,
            outputs,
            snapshot,
        }
    }

    pub fn completed(&self) -> bool {
        self.status == PlanStatus::Completed
    }
}

impl fmt::Display for PlanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "plan \"{}\": {:?} ({} replan(s))",
            self.task, self.status, self.replans
        )?;
        for step in &self.steps {
            let mark = match step.status {
                StepStatus::Succeeded => "x",
                StepStatus::Failed { .. } => "!",
                StepStatus::Skipped => "-",
                StepStatus::InProgress => ">",
                StepStatus::Pending => " ",
            };
            writeln!(f, "  [{mark}] {}. {}", step.id, step.description)?;
        }
        for (id, output) in &self.outputs {
            match output {
                ActionOutput::Data { value } => writeln!(f, "  step {id} data: {value}")?,
                ActionOutput::Judgment { text } => writeln!(f, "  step {id} answer: {text}")?,
                ActionOutput::Screenshot { bytes } => {
                    writeln!(f, "  step {id} screenshot: {bytes} bytes")?
                }
            }
        }
        if let Some(step) = &self.failed_step {
            writeln!(
                f,
                "failed at step {} \"{}\": {}",
                step.id,
                step.description,
                status_label(&step.status)
            )?;
        }
        write!(f, "page: {}", self.snapshot)
    }
}

/// What a handled command amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Action(ActionReport),
    Planned(Plan),
    Plan(PlanReport),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        match self {
            Outcome::Action(report) => report.succeeded,
            Outcome::Planned(_) => true,
            Outcome::Plan(report) => report.completed(),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Action(report) => fmt::Display::fmt(report, f),
            Outcome::Plan(report) => fmt::Display::fmt(report, f),
            Outcome::Planned(plan) => {
                writeln!(f, "planned \"{}\" (say \"run the plan\" to start):", plan.task)?;
                for step in &plan.steps {
                    writeln!(f, "  {}. {}", step.id, step.description)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_event_tag() {
        let event = ControllerEvent::StepFinished {
            step_id: 2,
            status: StepStatus::Failed {
                reason: "element not found".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "step_finished");
        assert_eq!(json["status"]["state"], "failed");
        assert_eq!(event.to_string(), "[step 2] failed: element not found");
    }

    #[test]
    fn plan_report_names_the_failed_step() {
        let mut plan = Plan::new("find docs", ["go to a.test", "click \"Docs\""]);
        plan.begin();
        plan.steps[0].start().unwrap();
        plan.steps[0].succeed().unwrap();
        plan.steps[1].start().unwrap();
        plan.steps[1].fail("no such element").unwrap();
        plan.abort();

        let report = PlanReport::new(
            &plan,
            Some(plan.steps[1].clone()),
            Vec::new(),
            "https://a.test/ \"A\" (0 elements, 0 fields, 0 regions)".into(),
        );
        assert!(!report.completed());
        let text = report.to_string();
        assert!(text.contains("[x] 1. go to a.test"));
        assert!(text.contains("failed at step 2 \"click \"Docs\"\": failed: no such element"));
        assert!(text.ends_with("(0 elements, 0 fields, 0 regions)"));
    }
}
