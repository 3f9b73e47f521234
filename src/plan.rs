//! Plan and step state machines.
//!
//! Steps move forward only: `Pending -> InProgress -> {Succeeded, Failed, Skipped}`.
//! Replanning never rewrites a step in place; it retires the unfinished suffix
//! and appends fresh `Pending` steps.

use serde::{Deserialize, Serialize};

use crate::error::TransitionError;
use crate::types::Action;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed { reason: String },
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed { .. } | StepStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: u32,
    pub description: String,
    /// Derived just before execution, against the page as it is then.
    pub action: Option<Action>,
    pub status: StepStatus,
    pub retries: u32,
}

impl PlanStep {
    pub fn new(id: u32, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            action: None,
            status: StepStatus::Pending,
            retries: 0,
        }
    }

    pub fn start(&mut self) -> Result<(), TransitionError> {
        match self.status {
            StepStatus::Pending => {
                self.status = StepStatus::InProgress;
                Ok(())
            }
            _ => Err(self.invalid("in_progress")),
        }
    }

    pub fn succeed(&mut self) -> Result<(), TransitionError> {
        self.finish(StepStatus::Succeeded, "succeeded")
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.finish(
            StepStatus::Failed {
                reason: reason.into(),
            },
            "failed",
        )
    }

    /// Pending steps may be skipped without ever running.
    pub fn skip(&mut self) -> Result<(), TransitionError> {
        match self.status {
            StepStatus::Pending | StepStatus::InProgress => {
                self.status = StepStatus::Skipped;
                Ok(())
            }
            _ => Err(self.invalid("skipped")),
        }
    }

    fn finish(&mut self, next: StepStatus, name: &'static str) -> Result<(), TransitionError> {
        if self.status != StepStatus::InProgress {
            return Err(self.invalid(name));
        }
        self.status = next;
        Ok(())
    }

    fn invalid(&self, to: &'static str) -> TransitionError {
        TransitionError {
            from: self.status.clone(),
            to,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Planned,
    Executing,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub task: String,
    pub steps: Vec<PlanStep>,
    pub status: PlanStatus,
    pub replans: u32,
    /// Steps retired by replanning, kept for diagnostics.
    pub superseded: Vec<PlanStep>,
    next_id: u32,
}

impl Plan {
    pub fn new<I, S>(task: impl Into<String>, descriptions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut plan = Self {
            task: task.into(),
            steps: Vec::new(),
            status: PlanStatus::Planned,
            replans: 0,
            superseded: Vec::new(),
            next_id: 1,
        };
        for description in descriptions {
            plan.push_step(description.into());
        }
        plan
    }

    fn push_step(&mut self, description: String) {
        self.steps.push(PlanStep::new(self.next_id, description));
        self.next_id += 1;
    }

    /// Index of the first step still waiting to run.
    pub fn next_pending(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|step| step.status == StepStatus::Pending)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, PlanStatus::Completed | PlanStatus::Aborted)
    }

    /// True when every step ended in `Succeeded` or `Skipped`.
    pub fn all_steps_done(&self) -> bool {
        self.steps
            .iter()
            .all(|step| matches!(step.status, StepStatus::Succeeded | StepStatus::Skipped))
    }

    pub fn begin(&mut self) {
        if self.status == PlanStatus::Planned {
            self.status = PlanStatus::Executing;
        }
    }

    /// Moves to `Completed` if every step is done; returns whether it did.
    pub fn try_complete(&mut self) -> bool {
        if self.status == PlanStatus::Executing && self.all_steps_done() {
            self.status = PlanStatus::Completed;
            true
        } else {
            false
        }
    }

    pub fn abort(&mut self) {
        if !self.is_finished() {
            self.status = PlanStatus::Aborted;
        }
    }

    /// Descriptions of steps from `from` onwards that are still replaceable.
    pub fn replaceable_suffix(&self, from: usize) -> Vec<String> {
        self.steps[from.min(self.steps.len())..]
            .iter()
            .filter(|step| {
                matches!(
                    step.status,
                    StepStatus::Pending | StepStatus::Failed { .. }
                )
            })
            .map(|step| step.description.clone())
            .collect()
    }

    /// Retires every step from `from` onwards and appends `descriptions` as new
    /// pending steps. Fails without touching the plan if any retired step is in
    /// progress or already finished successfully.
    pub fn replace_suffix(
        &mut self,
        from: usize,
        descriptions: Vec<String>,
    ) -> Result<(), TransitionError> {
        let from = from.min(self.steps.len());
        if let Some(step) = self.steps[from..].iter().find(|step| {
            !matches!(
                step.status,
                StepStatus::Pending | StepStatus::Failed { .. }
            )
        }) {
            return Err(TransitionError {
                from: step.status.clone(),
                to: "replaced",
            });
        }

        let retired = self.steps.split_off(from);
        self.superseded.extend(retired);
        for description in descriptions {
            self.push_step(description);
        }
        self.replans += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_only_move_forward() {
        let mut step = PlanStep::new(1, "open the page");
        assert!(step.succeed().is_err());
        step.start().unwrap();
        assert!(step.start().is_err());
        step.succeed().unwrap();
        assert!(step.fail("late").is_err());
        assert!(step.skip().is_err());
        assert_eq!(step.status, StepStatus::Succeeded);
    }

    #[test]
    fn plan_completes_only_when_all_steps_done() {
        let mut plan = Plan::new("task", ["a", "b"]);
        plan.begin();
        plan.steps[0].start().unwrap();
        plan.steps[0].succeed().unwrap();
        assert!(!plan.try_complete());
        plan.steps[1].skip().unwrap();
        assert!(plan.try_complete());
        assert_eq!(plan.status, PlanStatus::Completed);
    }

    #[test]
    fn replace_suffix_keeps_succeeded_prefix() {
        let mut plan = Plan::new("task", ["one", "two", "three"]);
        plan.begin();
        plan.steps[0].start().unwrap();
        plan.steps[0].succeed().unwrap();
        plan.steps[1].start().unwrap();
        plan.steps[1].fail("no button").unwrap();

        assert_eq!(plan.replaceable_suffix(1), vec!["two", "three"]);
        plan.replace_suffix(1, vec!["two again".into(), "three".into()])
            .unwrap();

        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].status, StepStatus::Succeeded);
        assert_eq!(plan.steps[0].id, 1);
        assert_eq!(plan.steps[1].description, "two again");
        assert_eq!(plan.steps[1].status, StepStatus::Pending);
        assert_eq!(plan.steps[1].id, 4);
        assert_eq!(plan.superseded.len(), 2);
        assert_eq!(plan.replans, 1);
    }

    #[test]
    fn replace_suffix_refuses_to_touch_succeeded_steps() {
        let mut plan = Plan::new("task", ["one", "two"]);
        plan.steps[0].start().unwrap();
        plan.steps[0].succeed().unwrap();
        let before = plan.clone();
        assert!(plan.replace_suffix(0, vec!["x".into()]).is_err());
        assert_eq!(plan, before);
    }
}
