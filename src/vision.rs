//! Vision-assisted resolution: one oracle round-trip per call with the
//! screenshot and the structural listing side by side. No retries here.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::ResolverError;
use crate::oracle::{Oracle, OracleRequest, Purpose, complete_within, parse_json};
use crate::snapshot::{PageSnapshot, Screenshot};

const SYSTEM_PROMPT: &str = r#"You help a browser automation agent understand a web page.
You receive a screenshot of the page and a structural listing of its interactive elements, each with a locator.
Use both: the screenshot for layout and appearance, the listing for labels and locators.

Reply with ONE JSON object and nothing else:
- Locating an element: {"locator": "<one locator copied exactly from the listing>"} or {"locator": null} if none fits.
- Extracting data: {"data": <JSON value shaped after the requested schema>}
- Answering a question: {"answer": "<short answer>"}"#;

#[derive(Debug, Clone, PartialEq)]
pub enum VisionQuery {
    /// Pick one element. An empty candidate list means any element on the page.
    Locate {
        description: String,
        candidates: Vec<String>,
    },
    Extract {
        schema_hint: String,
    },
    Judge {
        question: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Element(String),
    Data(Value),
    Judgment(String),
}

#[derive(Debug, Deserialize)]
struct LocateReply {
    locator: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnswerReply {
    answer: String,
}

#[derive(Clone)]
pub struct VisionResolver {
    oracle: Arc<dyn Oracle>,
    timeout: Duration,
}

impl VisionResolver {
    pub fn new(oracle: Arc<dyn Oracle>, timeout: Duration) -> Self {
        Self { oracle, timeout }
    }

    pub async fn resolve(
        &self,
        query: &VisionQuery,
        snapshot: &PageSnapshot,
        screenshot: &Screenshot,
    ) -> Result<Resolution, ResolverError> {
        let prompt = build_prompt(query, snapshot);
        let request =
            OracleRequest::new(Purpose::Vision, SYSTEM_PROMPT, prompt).with_image(screenshot.clone());
        let reply = complete_within(self.oracle.as_ref(), request, self.timeout).await?;
        debug!(?query, reply = %reply, "vision reply");
        interpret_reply(query, snapshot, &reply)
    }

    /// Yes/no judgment about the page as captured in `snapshot`.
    pub async fn confirm(
        &self,
        question: &str,
        snapshot: &PageSnapshot,
    ) -> Result<bool, ResolverError> {
        let query = VisionQuery::Judge {
            question: format!("{question} Answer \"yes\" or \"no\"."),
        };
        match self.resolve(&query, snapshot, &snapshot.screenshot).await? {
            Resolution::Judgment(text) => parse_yes_no(&text).ok_or_else(|| {
                ResolverError::OracleFailure(format!("expected yes or no, got {text:?}"))
            }),
            other => Err(ResolverError::OracleFailure(format!(
                "expected a judgment, got {other:?}"
            ))),
        }
    }
}

fn build_prompt(query: &VisionQuery, snapshot: &PageSnapshot) -> String {
    let mut prompt = String::new();
    match query {
        VisionQuery::Locate {
            description,
            candidates,
        } => {
            let _ = writeln!(prompt, "Find the element described as: {description}");
            if !candidates.is_empty() {
                let _ = writeln!(prompt, "It must be one of these candidates:");
                for locator in candidates {
                    let name = snapshot
                        .element_by_locator(locator)
                        .map(|el| format!("{} \"{}\"", el.role.as_str(), el.display_name()))
                        .unwrap_or_default();
                    let _ = writeln!(prompt, "- {locator} {name}");
                }
            }
        }
        VisionQuery::Extract { schema_hint } => {
            let _ = writeln!(prompt, "Extract from the page: {schema_hint}");
        }
        VisionQuery::Judge { question } => {
            let _ = writeln!(prompt, "Question: {question}");
        }
    }
    let _ = write!(prompt, "\nPage listing:\n{}", snapshot.describe());
    prompt
}

fn interpret_reply(
    query: &VisionQuery,
    snapshot: &PageSnapshot,
    reply: &str,
) -> Result<Resolution, ResolverError> {
    match query {
        VisionQuery::Locate { candidates, .. } => {
            let parsed: LocateReply = parse_json(reply).map_err(ResolverError::OracleFailure)?;
            let locator = parsed.locator.ok_or_else(|| {
                ResolverError::OracleFailure("oracle found no matching element".into())
            })?;
            let allowed = if candidates.is_empty() {
                snapshot.element_by_locator(&locator).is_some()
            } else {
                candidates.contains(&locator)
            };
            if !allowed {
                return Err(ResolverError::OracleFailure(format!(
                    "oracle chose unknown locator {locator:?}"
                )));
            }
            Ok(Resolution::Element(locator))
        }
        VisionQuery::Extract { .. } => {
            let value: Value = parse_json(reply).map_err(ResolverError::OracleFailure)?;
            let data = match value {
                Value::Object(mut map) if map.contains_key("data") => {
                    map.remove("data").unwrap_or(Value::Null)
                }
                other => other,
            };
            Ok(Resolution::Data(data))
        }
        VisionQuery::Judge { .. } => {
            let text = match parse_json::<AnswerReply>(reply) {
                Ok(parsed) => parsed.answer,
                // Plain prose is an acceptable judgment.
                Err(_) => reply.trim().to_string(),
            };
            Ok(Resolution::Judgment(text))
        }
    }
}

fn parse_yes_no(text: &str) -> Option<bool> {
    let word = text
        .trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .split(|c: char| !c.is_alphanumeric())
        .next()?
        .to_ascii_lowercase();
    match word.as_str() {
        "yes" | "true" => Some(true),
        "no" | "false" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{Bounds, InteractiveElement, Role};
    use crate::testing::ScriptedOracle;

    fn snapshot() -> PageSnapshot {
        let el = |text: &str, locator: &str| InteractiveElement {
            role: Role::Button,
            text: text.into(),
            label: None,
            bounds: Bounds::default(),
            locator: locator.into(),
        };
        PageSnapshot {
            url: "https://a.test/".into(),
            elements: vec![el("Sign In", "#top-signin"), el("Sign In", "#footer-signin")],
            screenshot: Screenshot::new(vec![1, 2, 3]),
            ..PageSnapshot::default()
        }
    }

    fn resolver(oracle: &Arc<ScriptedOracle>) -> VisionResolver {
        VisionResolver::new(oracle.clone(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn locate_accepts_only_listed_candidates() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.reply(r##"{"locator": "#footer-signin"}"##);
        oracle.reply(r##"{"locator": "#nowhere"}"##);
        let snap = snapshot();
        let query = VisionQuery::Locate {
            description: "Sign In".into(),
            candidates: vec!["#top-signin".into(), "#footer-signin".into()],
        };

        let first = resolver(&oracle)
            .resolve(&query, &snap, &snap.screenshot)
            .await
            .unwrap();
        assert_eq!(first, Resolution::Element("#footer-signin".into()));

        let second = resolver(&oracle).resolve(&query, &snap, &snap.screenshot).await;
        assert!(matches!(second, Err(ResolverError::OracleFailure(_))));

        let requests = oracle.requests();
        assert!(requests[0].image.is_some());
        assert!(requests[0].user_text().contains("#top-signin"));
    }

    #[tokio::test]
    async fn extract_unwraps_data_field() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.reply(r#"{"data": {"price": "$10"}}"#);
        let snap = snapshot();
        let res = resolver(&oracle)
            .resolve(
                &VisionQuery::Extract {
                    schema_hint: "price".into(),
                },
                &snap,
                &snap.screenshot,
            )
            .await
            .unwrap();
        assert_eq!(res, Resolution::Data(serde_json::json!({"price": "$10"})));
    }

    #[tokio::test]
    async fn confirm_parses_yes_no_and_rejects_waffle() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.reply(r#"{"answer": "Yes, the menu opened."}"#);
        oracle.reply("no");
        oracle.reply("it is hard to say");
        let snap = snapshot();
        let vision = resolver(&oracle);
        assert!(vision.confirm("Did it open?", &snap).await.unwrap());
        assert!(!vision.confirm("Did it open?", &snap).await.unwrap());
        assert!(vision.confirm("Did it open?", &snap).await.is_err());
    }

    #[tokio::test]
    async fn oracle_failure_is_not_retried() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.fail("connection reset");
        let snap = snapshot();
        let res = resolver(&oracle)
            .resolve(
                &VisionQuery::Judge {
                    question: "anything?".into(),
                },
                &snap,
                &snap.screenshot,
            )
            .await;
        assert!(matches!(res, Err(ResolverError::OracleFailure(_))));
        assert_eq!(oracle.calls(), 1);
    }
}
