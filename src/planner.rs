//! Task decomposition and suffix replanning.
//!
//! Plans are advisory: steps are free-text sub-tasks, turned into actions only
//! when they are about to run.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::PlanningError;
use crate::oracle::{Oracle, OracleRequest, Purpose, complete_within, parse_json, push_activity};
use crate::plan::{Plan, StepStatus};
use crate::snapshot::PageSnapshot;

/// Upper bound on steps in one plan or one replacement suffix.
pub const MAX_PLAN_STEPS: usize = 20;

const SYSTEM_PROMPT: &str = r#"You plan browser tasks for an automation agent.
Break the task into short, ordered sub-tasks. Each sub-task is ONE browser command in plain English, for example:
- go to example.com
- search for "wireless keyboard"
- click "Add to cart"
- type "alice@example.com" into the email field
- submit the form
- scroll down
- extract the order total
- check whether the cart shows 1 item?

Reply with ONE JSON object and nothing else:
{"feasible": true, "steps": ["...", "..."]}
If the task cannot be done from the current page state, reply:
{"feasible": false, "steps": [], "reason": "<why>"}"#;

#[derive(Debug, Deserialize)]
struct PlanReply {
    #[serde(default = "default_feasible")]
    feasible: bool,
    #[serde(default)]
    steps: Vec<String>,
    #[serde(default)]
    reason: Option<String>,
}

fn default_feasible() -> bool {
    true
}

/// What the planner needs to know to replace the unfinished part of a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplanRequest {
    pub task: String,
    /// Descriptions of steps that already succeeded, in order.
    pub completed: Vec<String>,
    /// The step that exhausted its retries.
    pub failed: String,
    pub reason: String,
    /// Steps being replaced, starting with the failed one.
    pub replaced: Vec<String>,
}

impl ReplanRequest {
    /// Builds a request for replacing everything from `failed_index` on.
    pub fn for_plan(plan: &Plan, failed_index: usize, reason: impl Into<String>) -> Self {
        Self {
            task: plan.task.clone(),
            completed: plan.steps[..failed_index.min(plan.steps.len())]
                .iter()
                .filter(|s| s.status == StepStatus::Succeeded)
                .map(|s| s.description.clone())
                .collect(),
            failed: plan
                .steps
                .get(failed_index)
                .map(|s| s.description.clone())
                .unwrap_or_default(),
            reason: reason.into(),
            replaced: plan.replaceable_suffix(failed_index),
        }
    }
}

pub struct Planner {
    oracle: Arc<dyn Oracle>,
    timeout: Duration,
}

impl Planner {
    pub fn new(oracle: Arc<dyn Oracle>, timeout: Duration) -> Self {
        Self { oracle, timeout }
    }

    /// One planning call. Retries are the caller's business. `recent` is the
    /// tail of the session log, oldest first.
    pub async fn plan(
        &self,
        task: &str,
        snapshot: &PageSnapshot,
        recent: &[String],
    ) -> Result<Plan, PlanningError> {
        let mut prompt = format!("Task: {task}\n\n");
        push_activity(&mut prompt, recent);
        prompt.push_str("Current page:\n");
        prompt.push_str(&snapshot.describe());

        let steps = self.ask(prompt).await?;
        info!(task, steps = steps.len(), "plan created");
        Ok(Plan::new(task, steps))
    }

    /// Asks for a replacement for the failed step and everything after it.
    pub async fn replan(
        &self,
        request: &ReplanRequest,
        snapshot: &PageSnapshot,
        recent: &[String],
    ) -> Result<Vec<String>, PlanningError> {
        let mut prompt = format!("Task: {}\n\n", request.task);
        push_activity(&mut prompt, recent);
        if request.completed.is_empty() {
            prompt.push_str("No steps have succeeded yet.\n");
        } else {
            prompt.push_str("Already done (do not repeat):\n");
            for (i, step) in request.completed.iter().enumerate() {
                let _ = writeln!(prompt, "{}. {step}", i + 1);
            }
        }
        let _ = writeln!(
            prompt,
            "\nThis step failed: {}\nReason: {}",
            request.failed, request.reason
        );
        if request.replaced.len() > 1 {
            prompt.push_str("Steps that were still to come:\n");
            for step in &request.replaced[1..] {
                let _ = writeln!(prompt, "- {step}");
            }
        }
        prompt.push_str(
            "\nGive the remaining steps needed to finish the task from the page as it is now, \
             taking a different approach to the failed step.\n\nCurrent page:\n",
        );
        prompt.push_str(&snapshot.describe());

        let steps = self.ask(prompt).await?;
        info!(failed = %request.failed, steps = steps.len(), "replacement steps planned");
        Ok(steps)
    }

    async fn ask(&self, prompt: String) -> Result<Vec<String>, PlanningError> {
        debug!(prompt_chars = prompt.len(), "planning request");
        let request = OracleRequest::new(Purpose::Plan, SYSTEM_PROMPT, prompt);
        let reply = complete_within(self.oracle.as_ref(), request, self.timeout).await?;
        parse_steps(&reply)
    }
}

fn parse_steps(reply: &str) -> Result<Vec<String>, PlanningError> {
    let parsed: PlanReply = match parse_json(reply) {
        Ok(parsed) => parsed,
        // Some models answer with a bare array of steps.
        Err(e) => match serde_json::from_str::<Vec<String>>(crate::oracle::strip_fences(reply)) {
            Ok(steps) => PlanReply {
                feasible: true,
                steps,
                reason: None,
            },
            Err(_) => return Err(PlanningError::Malformed(e)),
        },
    };

    if !parsed.feasible {
        return Err(PlanningError::Infeasible(
            parsed
                .reason
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| "no reason given".to_string()),
        ));
    }

    let steps: Vec<String> = parsed
        .steps
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if steps.is_empty() {
        return Err(PlanningError::Malformed("plan has no steps".into()));
    }
    if steps.len() > MAX_PLAN_STEPS {
        return Err(PlanningError::Malformed(format!(
            "plan has {} steps, limit is {MAX_PLAN_STEPS}",
            steps.len()
        )));
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedOracle;

    fn planner(oracle: &Arc<ScriptedOracle>) -> Planner {
        Planner::new(oracle.clone(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn builds_pending_plan_from_reply() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.reply(r#"```json
{"feasible": true, "steps": ["go to shop.test", "search for \"kettle\"", "  "]}
```"#);
        let plan = planner(&oracle)
            .plan("buy a kettle", &PageSnapshot::blank(), &[])
            .await
            .unwrap();
        assert_eq!(plan.task, "buy a kettle");
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].id, 2);
        assert!(plan.steps.iter().all(|s| s.status == StepStatus::Pending));
        let prompt = oracle.requests()[0].user_text().to_string();
        assert!(prompt.contains("buy a kettle"));
        assert!(!prompt.contains("Recent activity"));
    }

    #[tokio::test]
    async fn infeasible_and_malformed_replies() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle
            .reply(r#"{"feasible": false, "reason": "site requires a login we lack"}"#)
            .reply(r#"{"feasible": true, "steps": []}"#)
            .reply("I would start by opening the site.");
        let p = planner(&oracle);
        let snap = PageSnapshot::blank();

        assert_eq!(
            p.plan("t", &snap, &[]).await.unwrap_err(),
            PlanningError::Infeasible("site requires a login we lack".into())
        );
        assert!(matches!(
            p.plan("t", &snap, &[]).await.unwrap_err(),
            PlanningError::Malformed(_)
        ));
        assert!(matches!(
            p.plan("t", &snap, &[]).await.unwrap_err(),
            PlanningError::Malformed(_)
        ));
    }

    #[test]
    fn accepts_bare_arrays() {
        assert_eq!(
            parse_steps(r#"["open a.test", "click \"Go\""]"#).unwrap(),
            vec!["open a.test".to_string(), "click \"Go\"".to_string()]
        );
    }

    #[tokio::test]
    async fn replan_prompt_carries_failure_context() {
        let mut plan = Plan::new("log in", ["go to a.test", "click \"Sign In\"", "submit"]);
        plan.begin();
        plan.steps[0].start().unwrap();
        plan.steps[0].succeed().unwrap();
        plan.steps[1].start().unwrap();
        plan.steps[1].fail("no such element").unwrap();

        let request = ReplanRequest::for_plan(&plan, 1, "no such element");
        assert_eq!(request.completed, vec!["go to a.test"]);
        assert_eq!(request.failed, "click \"Sign In\"");
        assert_eq!(request.replaced, vec!["click \"Sign In\"", "submit"]);

        let oracle = Arc::new(ScriptedOracle::new());
        oracle.reply(r#"{"feasible": true, "steps": ["click \"Log in\"", "submit"]}"#);
        let steps = planner(&oracle)
            .replan(
                &request,
                &PageSnapshot::blank(),
                &["Failed: click \"Sign In\" (no such element)".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(steps, vec!["click \"Log in\"", "submit"]);

        let prompt = oracle.requests()[0].user_text().to_string();
        assert!(prompt.contains("This step failed: click \"Sign In\""));
        assert!(prompt.contains("Reason: no such element"));
        assert!(prompt.contains("1. go to a.test"));
        assert!(prompt.contains("- Failed: click \"Sign In\" (no such element)"));
    }
}
