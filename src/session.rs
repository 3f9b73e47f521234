//! Session state: the current snapshot, navigation history, active plan and
//! the append-only action log. Only the controller holds a `&mut Session`.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::Plan;
use crate::snapshot::PageSnapshot;
use crate::types::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    Succeeded,
    Failed,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub utterance: Option<String>,
    pub action: Option<Action>,
    pub outcome: LogOutcome,
    pub detail: String,
}

pub struct Session {
    snapshot: Arc<PageSnapshot>,
    history: Vec<String>,
    plan: Option<Plan>,
    log: Vec<LogEntry>,
}

impl Session {
    pub fn new(initial: PageSnapshot) -> Self {
        let mut session = Self {
            snapshot: Arc::new(PageSnapshot::blank()),
            history: Vec::new(),
            plan: None,
            log: Vec::new(),
        };
        session.replace_snapshot(initial);
        session
    }

    pub fn snapshot(&self) -> Arc<PageSnapshot> {
        Arc::clone(&self.snapshot)
    }

    /// Swaps in a fresh capture and records a navigation when the URL moved.
    /// Landing on the page before the current one pops the history, so it
    /// stays a stack of pages to go back to.
    pub fn replace_snapshot(&mut self, snapshot: PageSnapshot) {
        let url = snapshot.url.clone();
        self.snapshot = Arc::new(snapshot);
        if url == "about:blank" || self.history.last() == Some(&url) {
            return;
        }
        let len = self.history.len();
        if len >= 2 && self.history[len - 2] == url {
            self.history.pop();
        } else {
            self.history.push(url);
        }
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub(crate) fn plan_mut(&mut self) -> Option<&mut Plan> {
        self.plan.as_mut()
    }

    pub(crate) fn set_plan(&mut self, plan: Plan) -> Option<Plan> {
        self.plan.replace(plan)
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    pub(crate) fn record(
        &mut self,
        utterance: Option<&str>,
        action: Option<&Action>,
        outcome: LogOutcome,
        detail: impl Into<String>,
    ) {
        self.log.push(LogEntry {
            at: Utc::now(),
            utterance: utterance.map(str::to_string),
            action: action.cloned(),
            outcome,
            detail: detail.into(),
        });
    }

    /// Last `n` log entries rendered as plain lines for oracle context.
    pub fn recent_log(&self, n: usize) -> Vec<String> {
        let start = self.log.len().saturating_sub(n);
        self.log[start..]
            .iter()
            .map(|entry| {
                let what = match (&entry.action, &entry.utterance) {
                    (Some(action), _) => action.to_string(),
                    (None, Some(utterance)) => utterance.clone(),
                    (None, None) => String::from("-"),
                };
                format!("{:?}: {} ({})", entry.outcome, what, entry.detail)
            })
            .collect()
    }

    pub fn save_log(&self, path: &Path) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &self.log).map_err(std::io::Error::other)
    }

    pub fn load_log(path: &Path) -> std::io::Result<Vec<LogEntry>> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(std::io::Error::other)
    }
}
