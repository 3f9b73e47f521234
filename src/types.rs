use std::fmt;

use serde::{Deserialize, Serialize};

/// How an action refers to a page element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum TargetSpec {
    VisibleText(String),
    Selector(String),
    VisualDescription(String),
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSpec::VisibleText(text) => write!(f, "\"{text}\""),
            TargetSpec::Selector(selector) => write!(f, "{selector}"),
            TargetSpec::VisualDescription(desc) => write!(f, "<{desc}>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }

    /// Pixel delta (dx, dy) for an amount in this direction.
    pub fn delta(self, amount: u32) -> (i64, i64) {
        let amount = i64::from(amount);
        match self {
            Self::Up => (0, -amount),
            Self::Down => (0, amount),
            Self::Left => (-amount, 0),
            Self::Right => (amount, 0),
        }
    }
}

/// A single concrete thing the controller can do to (or learn from) the page.
///
/// The vocabulary is closed: anything outside it is either mapped onto one of
/// these variants by the interpreter or rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Action {
    Navigate { url: String },
    Search { term: String },
    Click { target: TargetSpec },
    TypeText { target: TargetSpec, value: String },
    Submit { form: Option<TargetSpec> },
    Scroll { direction: ScrollDirection, amount: u32 },
    Extract { schema_hint: String },
    Analyze { query: String },
    Screenshot,
    Plan { task: String },
    ExecutePlan,
}

impl Action {
    /// Session-level actions manage plans instead of touching the page.
    pub fn is_session_level(&self) -> bool {
        matches!(self, Action::Plan { .. } | Action::ExecutePlan)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Navigate { .. } => "navigate",
            Action::Search { .. } => "search",
            Action::Click { .. } => "click",
            Action::TypeText { .. } => "type",
            Action::Submit { .. } => "submit",
            Action::Scroll { .. } => "scroll",
            Action::Extract { .. } => "extract",
            Action::Analyze { .. } => "analyze",
            Action::Screenshot => "screenshot",
            Action::Plan { .. } => "plan",
            Action::ExecutePlan => "execute_plan",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Navigate { url } => write!(f, "navigate to {url}"),
            Action::Search { term } => write!(f, "search for \"{term}\""),
            Action::Click { target } => write!(f, "click {target}"),
            Action::TypeText { target, value } => write!(f, "type \"{value}\" into {target}"),
            Action::Submit { form: Some(target) } => write!(f, "submit {target}"),
            Action::Submit { form: None } => write!(f, "submit form"),
            Action::Scroll { direction, amount } => write!(f, "scroll {direction:?} {amount}px"),
            Action::Extract { schema_hint } => write!(f, "extract {schema_hint}"),
            Action::Analyze { query } => write!(f, "analyze \"{query}\""),
            Action::Screenshot => write!(f, "screenshot"),
            Action::Plan { task } => write!(f, "plan \"{task}\""),
            Action::ExecutePlan => write!(f, "execute plan"),
        }
    }
}

/// What a successful action produced besides a page change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionOutput {
    Data { value: serde_json::Value },
    Judgment { text: String },
    Screenshot { bytes: usize },
}

/// A message in the conversation sent to the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_json_uses_action_tag() {
        let action: Action =
            serde_json::from_str(r#"{"action":"Click","target":{"by":"visible_text","value":"Sign In"}}"#)
                .unwrap();
        assert_eq!(
            action,
            Action::Click {
                target: TargetSpec::VisibleText("Sign In".into())
            }
        );

        let action: Action = serde_json::from_str(r#"{"action":"Screenshot"}"#).unwrap();
        assert_eq!(action, Action::Screenshot);
    }

    #[test]
    fn scroll_delta_follows_direction() {
        assert_eq!(ScrollDirection::Down.delta(300), (0, 300));
        assert_eq!(ScrollDirection::Left.delta(50), (-50, 0));
    }
}
