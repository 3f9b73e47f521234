//! Natural-language command to [`Action`].
//!
//! Known verbs are matched with patterns and their slots pulled out; target
//! references are then checked against the snapshot. A reference that does not
//! pick out exactly one element is handed to the vision resolver instead of
//! being guessed. Utterances that match no pattern may be offered to the
//! oracle as a closed-vocabulary classification.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::{InterpreterConfig, LocatorOverrides};
use crate::error::InterpretationError;
use crate::oracle::{Oracle, OracleRequest, Purpose, complete_within, parse_json, push_activity};
use crate::snapshot::{PageSnapshot, Role};
use crate::types::{Action, ScrollDirection, TargetSpec};
use crate::vision::{Resolution, VisionQuery, VisionResolver};

static EXECUTE_PLAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:execute|run|start|go\s+with)(?:\s+the)?(?:\s+current)?\s+plan$")
        .expect("valid regex")
});
static PLAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^plan(?:\s+(?:to|for|how\s+to))?\s*:?\s+(.+)$").expect("valid regex")
});
static BACK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:go\s+)?back$").expect("valid regex"));
static NAVIGATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:go\s+to|navigate\s+to|open|visit|load|browse\s+to)\s+(\S+)$")
        .expect("valid regex")
});
static SEARCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:search(?:\s+for)?|look\s+up|google)\s+(.+)$").expect("valid regex")
});
static TYPE_INTO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^(?:type|enter|write|input)\s+("[^"]*"|'[^']*'|\S+)\s+(?:into|in|on)\s+(?:the\s+)?(.+)$"#)
        .expect("valid regex")
});
static FILL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^fill(?:\s+in)?\s+(?:the\s+)?(.+?)\s+with\s+("[^"]*"|'[^']*'|.+)$"#)
        .expect("valid regex")
});
static SUBMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^submit(?:\s+(?:the\s+)?(.+?))?$").expect("valid regex")
});
static SCROLL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^scroll(?:\s+(up|down|left|right))?(?:\s+(?:by\s+)?(\d+)(?:\s*px)?)?$")
        .expect("valid regex")
});
static SCREENSHOT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:(?:take\s+(?:a\s+)?)?screenshot|capture\s+(?:the\s+)?screen)$")
        .expect("valid regex")
});
static CLICK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:click|press|tap|hit|choose)(?:\s+on)?\s+(?:the\s+)?(.+)$")
        .expect("valid regex")
});
static EXTRACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:extract|scrape|collect|get)\s+(?:the\s+)?(.+)$").expect("valid regex")
});
static ANALYZE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:analy[sz]e|describe|check(?:\s+(?:whether|if))?)\s+(.+)$")
        .expect("valid regex")
});

const FALLBACK_PROMPT: &str = r#"You translate one browser command into ONE JSON action. Reply with JSON only, no markdown.

Available actions:
- {"action":"Navigate","url":"https://..."}
- {"action":"Search","term":"..."}
- {"action":"Click","target":{"by":"visible_text","value":"..."}}
- {"action":"TypeText","target":{"by":"visible_text","value":"..."},"value":"..."}
- {"action":"Submit","form":null}
- {"action":"Scroll","direction":"down","amount":600}
- {"action":"Extract","schema_hint":"..."}
- {"action":"Analyze","query":"..."}
- {"action":"Screenshot"}
- {"action":"Plan","task":"..."}
- {"action":"ExecutePlan"}
Targets may also be {"by":"selector","value":"<locator from the listing>"} or {"by":"visual_description","value":"..."}.
If the command does not fit any action, reply {"action":"Unknown"}."#;

/// Element reference as written by the user, before checking the page.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TargetRef {
    Quoted(String),
    Selector(String),
    Phrase(String),
}

impl TargetRef {
    fn parse(raw: &str) -> Self {
        let raw = raw.trim().trim_end_matches(['.', '!']);
        if let Some(inner) = unquote(raw) {
            return Self::Quoted(inner.to_string());
        }
        if raw.starts_with(['#', '[']) || raw.contains(" > ") || raw.contains("[name=") {
            return Self::Selector(raw.to_string());
        }
        Self::Phrase(raw.to_string())
    }

    fn from_spec(spec: TargetSpec) -> Self {
        match spec {
            TargetSpec::VisibleText(text) => Self::Quoted(text),
            TargetSpec::Selector(selector) => Self::Selector(selector),
            TargetSpec::VisualDescription(desc) => Self::Phrase(desc),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Intent {
    Navigate(String),
    Back,
    Search(String),
    Click(TargetRef),
    Type { target: TargetRef, value: String },
    Submit(Option<TargetRef>),
    Scroll {
        direction: ScrollDirection,
        amount: Option<u32>,
    },
    Extract(String),
    Analyze(String),
    Screenshot,
    Plan(String),
    ExecutePlan,
}

fn unquote(s: &str) -> Option<&str> {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

fn strip_quotes(s: &str) -> String {
    unquote(s).unwrap_or(s.trim()).to_string()
}

/// Pattern pass. Returns `None` when no known verb matches.
fn parse_intent(utterance: &str) -> Option<Intent> {
    let u = utterance.trim();
    if u.is_empty() {
        return None;
    }

    if EXECUTE_PLAN.is_match(u) {
        return Some(Intent::ExecutePlan);
    }
    if let Some(c) = PLAN.captures(u) {
        return Some(Intent::Plan(c[1].trim().to_string()));
    }
    if BACK.is_match(u) {
        return Some(Intent::Back);
    }
    if let Some(c) = NAVIGATE.captures(u) {
        return Some(Intent::Navigate(c[1].to_string()));
    }
    if let Some(c) = SEARCH.captures(u) {
        return Some(Intent::Search(strip_quotes(&c[1])));
    }
    if let Some(c) = TYPE_INTO.captures(u) {
        return Some(Intent::Type {
            target: TargetRef::parse(&c[2]),
            value: strip_quotes(&c[1]),
        });
    }
    if let Some(c) = FILL.captures(u) {
        return Some(Intent::Type {
            target: TargetRef::parse(&c[1]),
            value: strip_quotes(&c[2]),
        });
    }
    if let Some(c) = SUBMIT.captures(u) {
        let target = c.get(1).map(|m| {
            let phrase = m.as_str().trim();
            let phrase = phrase
                .strip_suffix(" form")
                .filter(|p| !p.is_empty())
                .unwrap_or(phrase);
            TargetRef::parse(phrase)
        });
        let target = target.filter(|t| *t != TargetRef::Phrase("form".into()));
        return Some(Intent::Submit(target));
    }
    if let Some(c) = SCROLL.captures(u) {
        let direction = c
            .get(1)
            .and_then(|m| ScrollDirection::parse(m.as_str()))
            .unwrap_or(ScrollDirection::Down);
        let amount = c.get(2).and_then(|m| m.as_str().parse().ok());
        return Some(Intent::Scroll { direction, amount });
    }
    if SCREENSHOT.is_match(u) {
        return Some(Intent::Screenshot);
    }
    if let Some(c) = CLICK.captures(u) {
        return Some(Intent::Click(TargetRef::parse(&c[1])));
    }
    if let Some(c) = EXTRACT.captures(u) {
        return Some(Intent::Extract(c[1].trim().to_string()));
    }
    if let Some(c) = ANALYZE.captures(u) {
        return Some(Intent::Analyze(c[1].trim().to_string()));
    }
    if let Some(question) = u.strip_suffix('?') {
        return Some(Intent::Analyze(question.trim().to_string()));
    }
    None
}

/// Turns a typed address into an absolute URL, using history for relative
/// paths.
fn normalize_url(raw: &str, history: &[String]) -> Result<String, InterpretationError> {
    let raw = raw.trim().trim_end_matches([',', '.', ';']);
    let lower = raw.to_ascii_lowercase();

    if lower.starts_with("http://") || lower.starts_with("https://") {
        return url::Url::parse(raw)
            .map(|_| raw.to_string())
            .map_err(|e| InterpretationError::Unresolvable(format!("bad URL {raw:?}: {e}")));
    }

    if raw.starts_with('/') {
        let base = history.last().ok_or_else(|| {
            InterpretationError::Unresolvable(format!("relative path {raw:?} with no current page"))
        })?;
        let base = url::Url::parse(base)
            .map_err(|e| InterpretationError::Unresolvable(format!("bad base URL {base:?}: {e}")))?;
        return base
            .join(raw)
            .map(String::from)
            .map_err(|e| InterpretationError::Unresolvable(format!("bad path {raw:?}: {e}")));
    }

    if raw.contains('.') && !raw.contains(char::is_whitespace) {
        let candidate = format!("https://{raw}");
        return url::Url::parse(&candidate)
            .map(|_| candidate)
            .map_err(|e| InterpretationError::Unresolvable(format!("bad URL {raw:?}: {e}")));
    }

    Err(InterpretationError::Unresolvable(format!(
        "{raw:?} does not look like an address"
    )))
}

pub struct Interpreter {
    oracle: Arc<dyn Oracle>,
    vision: VisionResolver,
    timeout: Duration,
    vision_attempts: u32,
    config: InterpreterConfig,
    overrides: LocatorOverrides,
}

impl Interpreter {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        vision: VisionResolver,
        timeout: Duration,
        vision_attempts: u32,
        config: InterpreterConfig,
        overrides: LocatorOverrides,
    ) -> Self {
        Self {
            oracle,
            vision,
            timeout,
            vision_attempts: vision_attempts.max(1),
            config,
            overrides,
        }
    }

    /// `history` is the navigation history, `recent` the tail of the session
    /// log; the log only matters when the oracle is asked to classify.
    pub async fn interpret(
        &self,
        utterance: &str,
        snapshot: &PageSnapshot,
        history: &[String],
        recent: &[String],
    ) -> Result<Action, InterpretationError> {
        let intent = match parse_intent(utterance) {
            Some(intent) => intent,
            None if self.config.oracle_fallback => {
                self.classify_with_oracle(utterance, snapshot, history, recent)
                    .await?
            }
            None => return Err(InterpretationError::Unrecognized(utterance.to_string())),
        };
        debug!(?intent, "matched intent");
        self.build_action(intent, snapshot, history).await
    }

    async fn build_action(
        &self,
        intent: Intent,
        snapshot: &PageSnapshot,
        history: &[String],
    ) -> Result<Action, InterpretationError> {
        Ok(match intent {
            Intent::Navigate(raw) => Action::Navigate {
                url: normalize_url(&raw, history)?,
            },
            Intent::Back => {
                let previous = history
                    .len()
                    .checked_sub(2)
                    .and_then(|i| history.get(i))
                    .ok_or_else(|| {
                        InterpretationError::Unresolvable("no previous page to go back to".into())
                    })?;
                Action::Navigate {
                    url: previous.clone(),
                }
            }
            Intent::Search(term) if term.is_empty() => {
                return Err(InterpretationError::Unresolvable("empty search term".into()));
            }
            Intent::Search(term) => Action::Search { term },
            Intent::Click(target) => Action::Click {
                target: self.resolve_target(&target, snapshot, None).await?,
            },
            Intent::Type { target, value } => Action::TypeText {
                target: self.resolve_target(&target, snapshot, Some(Role::Input)).await?,
                value,
            },
            Intent::Submit(None) => Action::Submit { form: None },
            Intent::Submit(Some(target)) => Action::Submit {
                form: Some(self.resolve_target(&target, snapshot, None).await?),
            },
            Intent::Scroll { direction, amount } => Action::Scroll {
                direction,
                amount: amount.unwrap_or(self.config.default_scroll),
            },
            Intent::Extract(schema_hint) => Action::Extract { schema_hint },
            Intent::Analyze(query) => Action::Analyze { query },
            Intent::Screenshot => Action::Screenshot,
            Intent::Plan(task) => Action::Plan { task },
            Intent::ExecutePlan => Action::ExecutePlan,
        })
    }

    /// Checks a reference against the page. Exactly one match is accepted
    /// as-is; anything else goes to the vision resolver.
    async fn resolve_target(
        &self,
        target: &TargetRef,
        snapshot: &PageSnapshot,
        prefer: Option<Role>,
    ) -> Result<TargetSpec, InterpretationError> {
        let text = match target {
            TargetRef::Selector(selector) => return Ok(TargetSpec::Selector(selector.clone())),
            TargetRef::Quoted(text) | TargetRef::Phrase(text) => text.as_str(),
        };

        if let Some(selector) = self.override_for(snapshot, text) {
            debug!(%text, %selector, "using site locator override");
            return Ok(TargetSpec::Selector(selector));
        }

        let mut candidates = self.text_candidates(snapshot, text, prefer);
        if candidates.is_empty() {
            if let TargetRef::Phrase(phrase) = target {
                if let Some(stripped) = strip_role_word(phrase) {
                    candidates = self.text_candidates(snapshot, stripped, prefer);
                    if let [only] = candidates.as_slice() {
                        return Ok(settled(snapshot, stripped, only));
                    }
                }
            }
        }

        if let [only] = candidates.as_slice() {
            return Ok(settled(snapshot, text, only));
        }

        if prefer == Some(Role::Input) && candidates.is_empty() {
            let field = snapshot.form_fields.iter().find(|f| {
                f.name.eq_ignore_ascii_case(text)
                    || strip_role_word(text).is_some_and(|s| f.name.eq_ignore_ascii_case(s))
            });
            if let Some(field) = field {
                return Ok(TargetSpec::Selector(field.locator.clone()));
            }
        }

        self.disambiguate(text, candidates, snapshot).await
    }

    fn text_candidates(
        &self,
        snapshot: &PageSnapshot,
        text: &str,
        prefer: Option<Role>,
    ) -> Vec<String> {
        let matches = snapshot.elements_matching_text(text);
        let preferred: Vec<_> = match prefer {
            Some(role) => matches.iter().filter(|el| el.role == role).collect(),
            None => Vec::new(),
        };
        if preferred.is_empty() {
            matches.iter().map(|el| el.locator.clone()).collect()
        } else {
            preferred.iter().map(|el| el.locator.clone()).collect()
        }
    }

    fn override_for(&self, snapshot: &PageSnapshot, text: &str) -> Option<String> {
        let host = snapshot.host()?;
        let table = self.overrides.get(&host)?;
        let wanted = text.trim().to_lowercase();
        table
            .iter()
            .find(|(label, _)| label.to_lowercase() == wanted)
            .map(|(_, selector)| selector.clone())
    }

    async fn disambiguate(
        &self,
        description: &str,
        candidates: Vec<String>,
        snapshot: &PageSnapshot,
    ) -> Result<TargetSpec, InterpretationError> {
        if snapshot.elements.is_empty() {
            return Err(InterpretationError::Unresolvable(format!(
                "{description:?}: page has no interactive elements"
            )));
        }

        debug!(%description, candidates = candidates.len(), "target ambiguous, asking vision resolver");
        let query = VisionQuery::Locate {
            description: description.to_string(),
            candidates,
        };
        let mut last_error = String::new();
        for attempt in 1..=self.vision_attempts {
            match self
                .vision
                .resolve(&query, snapshot, &snapshot.screenshot)
                .await
            {
                Ok(Resolution::Element(locator)) => return Ok(TargetSpec::Selector(locator)),
                Ok(other) => last_error = format!("unexpected resolution {other:?}"),
                Err(e) => last_error = e.to_string(),
            }
            warn!(attempt, error = %last_error, "vision disambiguation failed");
        }
        Err(InterpretationError::Unresolvable(format!(
            "{description:?}: {last_error}"
        )))
    }

    async fn classify_with_oracle(
        &self,
        utterance: &str,
        snapshot: &PageSnapshot,
        history: &[String],
        recent: &[String],
    ) -> Result<Intent, InterpretationError> {
        let unrecognized = || InterpretationError::Unrecognized(utterance.to_string());
        let visited: Vec<&str> = history.iter().rev().take(5).map(String::as_str).collect();
        let mut prompt = format!(
            "Command: {utterance}\n\nRecently visited: {}\n\n",
            if visited.is_empty() {
                "(none)".to_string()
            } else {
                visited.join(", ")
            },
        );
        push_activity(&mut prompt, recent);
        prompt.push_str(&snapshot.describe());
        let request = OracleRequest::new(Purpose::Interpret, FALLBACK_PROMPT, prompt);
        let reply = match complete_within(self.oracle.as_ref(), request, self.timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "oracle classification failed");
                return Err(unrecognized());
            }
        };

        let action: Action = parse_json(&reply).map_err(|e| {
            debug!(error = %e, "oracle did not return a known action");
            unrecognized()
        })?;

        Ok(match action {
            Action::Navigate { url } => Intent::Navigate(url),
            Action::Search { term } => Intent::Search(term),
            Action::Click { target } => Intent::Click(TargetRef::from_spec(target)),
            Action::TypeText { target, value } => Intent::Type {
                target: TargetRef::from_spec(target),
                value,
            },
            Action::Submit { form } => Intent::Submit(form.map(TargetRef::from_spec)),
            Action::Scroll { direction, amount } => Intent::Scroll {
                direction,
                amount: Some(amount),
            },
            Action::Extract { schema_hint } => Intent::Extract(schema_hint),
            Action::Analyze { query } => Intent::Analyze(query),
            Action::Screenshot => Intent::Screenshot,
            Action::Plan { task } => Intent::Plan(task),
            Action::ExecutePlan => Intent::ExecutePlan,
        })
    }
}

/// The text alone is kept only when it names a single element on the page.
/// When the role preference did the narrowing, the element's locator is used
/// so nothing downstream has to repeat that choice.
fn settled(snapshot: &PageSnapshot, text: &str, locator: &str) -> TargetSpec {
    if snapshot.elements_matching_text(text).len() == 1 {
        TargetSpec::VisibleText(text.to_string())
    } else {
        TargetSpec::Selector(locator.to_string())
    }
}

/// "Sign In button" -> "Sign In".
fn strip_role_word(phrase: &str) -> Option<&str> {
    ["button", "link", "field", "box", "input", "tab", "menu"]
        .iter()
        .find_map(|word| {
            phrase
                .strip_suffix(word)
                .filter(|rest| rest.ends_with(char::is_whitespace))
                .map(str::trim_end)
                .filter(|rest| !rest.is_empty())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{Bounds, FormField, InteractiveElement, Screenshot};
    use crate::testing::ScriptedOracle;

    fn element(role: Role, text: &str, locator: &str) -> InteractiveElement {
        InteractiveElement {
            role,
            text: text.into(),
            label: None,
            bounds: Bounds::default(),
            locator: locator.into(),
        }
    }

    fn page(elements: Vec<InteractiveElement>) -> PageSnapshot {
        PageSnapshot {
            url: "https://shop.test/".into(),
            elements,
            screenshot: Screenshot::new(vec![1]),
            ..PageSnapshot::default()
        }
    }

    fn interpreter(oracle: &Arc<ScriptedOracle>) -> Interpreter {
        interpreter_with(oracle, LocatorOverrides::new())
    }

    fn interpreter_with(oracle: &Arc<ScriptedOracle>, overrides: LocatorOverrides) -> Interpreter {
        let timeout = Duration::from_secs(1);
        Interpreter::new(
            oracle.clone(),
            VisionResolver::new(oracle.clone(), timeout),
            timeout,
            2,
            InterpreterConfig::default(),
            overrides,
        )
    }

    #[test]
    fn parses_the_verb_vocabulary() {
        assert_eq!(
            parse_intent("go to example.com"),
            Some(Intent::Navigate("example.com".into()))
        );
        assert_eq!(
            parse_intent("search for \"rust books\""),
            Some(Intent::Search("rust books".into()))
        );
        assert_eq!(
            parse_intent("type \"alice\" into the username field"),
            Some(Intent::Type {
                target: TargetRef::Phrase("username field".into()),
                value: "alice".into()
            })
        );
        assert_eq!(
            parse_intent("fill #email with bob@example.com"),
            Some(Intent::Type {
                target: TargetRef::Selector("#email".into()),
                value: "bob@example.com".into()
            })
        );
        assert_eq!(
            parse_intent("scroll up 200"),
            Some(Intent::Scroll {
                direction: ScrollDirection::Up,
                amount: Some(200)
            })
        );
        assert_eq!(
            parse_intent("scroll"),
            Some(Intent::Scroll {
                direction: ScrollDirection::Down,
                amount: None
            })
        );
        assert_eq!(parse_intent("submit the form"), Some(Intent::Submit(None)));
        assert_eq!(
            parse_intent("submit the login form"),
            Some(Intent::Submit(Some(TargetRef::Phrase("login".into()))))
        );
        assert_eq!(parse_intent("take a screenshot"), Some(Intent::Screenshot));
        assert_eq!(
            parse_intent("plan: buy a kettle"),
            Some(Intent::Plan("buy a kettle".into()))
        );
        assert_eq!(parse_intent("run the plan"), Some(Intent::ExecutePlan));
        assert_eq!(
            parse_intent("is the cart empty?"),
            Some(Intent::Analyze("is the cart empty".into()))
        );
        assert_eq!(parse_intent("dance a little"), None);
    }

    #[test]
    fn urls_are_normalized() {
        assert_eq!(normalize_url("example.com", &[]).unwrap(), "https://example.com");
        assert_eq!(
            normalize_url("http://localhost:8080/x", &[]).unwrap(),
            "http://localhost:8080/x"
        );
        let history = vec!["https://example.com/shop/cart".to_string()];
        assert_eq!(
            normalize_url("/login", &history).unwrap(),
            "https://example.com/login"
        );
        assert!(normalize_url("/login", &[]).is_err());
        assert!(normalize_url("kitchen", &[]).is_err());
    }

    #[tokio::test]
    async fn go_to_with_empty_history_navigates_over_https() {
        let oracle = Arc::new(ScriptedOracle::new());
        let action = interpreter(&oracle)
            .interpret("go to example.com", &PageSnapshot::blank(), &[], &[])
            .await
            .unwrap();
        assert_eq!(
            action,
            Action::Navigate {
                url: "https://example.com".into()
            }
        );
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn unique_visible_text_needs_no_vision() {
        let oracle = Arc::new(ScriptedOracle::new());
        let snap = page(vec![
            element(Role::Button, "Sign In", "#signin"),
            element(Role::Link, "Help", "#help"),
        ]);
        let action = interpreter(&oracle)
            .interpret("click \"Sign In\"", &snap, &[], &[])
            .await
            .unwrap();
        assert_eq!(
            action,
            Action::Click {
                target: TargetSpec::VisibleText("Sign In".into())
            }
        );
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn duplicate_text_is_resolved_by_vision() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.reply(r##"{"locator": "#footer-signin"}"##);
        let snap = page(vec![
            element(Role::Button, "Sign In", "#top-signin"),
            element(Role::Button, "Sign In", "#footer-signin"),
        ]);
        let action = interpreter(&oracle)
            .interpret("click \"Sign In\"", &snap, &[], &[])
            .await
            .unwrap();
        assert_eq!(
            action,
            Action::Click {
                target: TargetSpec::Selector("#footer-signin".into())
            }
        );
        assert_eq!(oracle.calls_for(Purpose::Vision), 1);
    }

    #[tokio::test]
    async fn vision_failing_twice_is_unresolvable() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.fail("timeout").fail("timeout");
        let snap = page(vec![
            element(Role::Button, "Sign In", "#top-signin"),
            element(Role::Button, "Sign In", "#footer-signin"),
        ]);
        let err = interpreter(&oracle)
            .interpret("click \"Sign In\"", &snap, &[], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, InterpretationError::Unresolvable(_)));
        assert_eq!(oracle.calls_for(Purpose::Vision), 2);
    }

    #[tokio::test]
    async fn phrase_with_role_word_matches_text() {
        let oracle = Arc::new(ScriptedOracle::new());
        let snap = page(vec![element(Role::Button, "Checkout", "#checkout")]);
        let action = interpreter(&oracle)
            .interpret("click the Checkout button", &snap, &[], &[])
            .await
            .unwrap();
        assert_eq!(
            action,
            Action::Click {
                target: TargetSpec::VisibleText("Checkout".into())
            }
        );
    }

    #[tokio::test]
    async fn typing_prefers_fields_by_name() {
        let oracle = Arc::new(ScriptedOracle::new());
        let mut snap = page(vec![element(Role::Input, "", "input[name=\"username\"]")]);
        snap.form_fields.push(FormField {
            name: "username".into(),
            field_type: "text".into(),
            value: String::new(),
            required: true,
            locator: "input[name=\"username\"]".into(),
        });
        let action = interpreter(&oracle)
            .interpret("type \"alice\" into the username field", &snap, &[], &[])
            .await
            .unwrap();
        assert_eq!(
            action,
            Action::TypeText {
                target: TargetSpec::Selector("input[name=\"username\"]".into()),
                value: "alice".into()
            }
        );
    }

    #[tokio::test]
    async fn typing_settles_on_the_input_when_a_link_shares_its_text() {
        let oracle = Arc::new(ScriptedOracle::new());
        let mut field = element(Role::Input, "", "input[name=\"email\"]");
        field.label = Some("Email".into());
        let snap = page(vec![element(Role::Link, "Email", "body > a:nth-of-type(1)"), field]);

        let action = interpreter(&oracle)
            .interpret("type \"a@b.c\" into Email", &snap, &[], &[])
            .await
            .unwrap();

        assert_eq!(
            action,
            Action::TypeText {
                target: TargetSpec::Selector("input[name=\"email\"]".into()),
                value: "a@b.c".into()
            }
        );
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn site_overrides_win_over_page_text() {
        let oracle = Arc::new(ScriptedOracle::new());
        let mut overrides = LocatorOverrides::new();
        overrides.insert(
            "shop.test".into(),
            [("sign in".to_string(), "#real-login".to_string())].into(),
        );
        let snap = page(vec![
            element(Role::Button, "Sign In", "#a"),
            element(Role::Button, "Sign In", "#b"),
        ]);
        let action = interpreter_with(&oracle, overrides)
            .interpret("click \"Sign In\"", &snap, &[], &[])
            .await
            .unwrap();
        assert_eq!(
            action,
            Action::Click {
                target: TargetSpec::Selector("#real-login".into())
            }
        );
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn back_uses_history() {
        let oracle = Arc::new(ScriptedOracle::new());
        let history = vec!["https://a.test/".to_string(), "https://a.test/b".to_string()];
        let action = interpreter(&oracle)
            .interpret("go back", &PageSnapshot::blank(), &history, &[])
            .await
            .unwrap();
        assert_eq!(
            action,
            Action::Navigate {
                url: "https://a.test/".into()
            }
        );
        let err = interpreter(&oracle)
            .interpret("back", &PageSnapshot::blank(), &history[..1], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, InterpretationError::Unresolvable(_)));
    }

    #[tokio::test]
    async fn unknown_verbs_fall_back_to_oracle() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.reply_to(Purpose::Interpret, r#"{"action":"Screenshot"}"#);
        oracle.reply_to(Purpose::Interpret, r#"{"action":"Unknown"}"#);
        let interp = interpreter(&oracle);
        let snap = page(vec![]);

        assert_eq!(
            interp.interpret("grab me a picture of this", &snap, &[], &[]).await,
            Ok(Action::Screenshot)
        );
        assert_eq!(
            interp.interpret("make me a sandwich", &snap, &[], &[]).await,
            Err(InterpretationError::Unrecognized("make me a sandwich".into()))
        );
        // Script exhausted: oracle failure also means unrecognized.
        assert!(matches!(
            interp.interpret("do the thing", &snap, &[], &[]).await,
            Err(InterpretationError::Unrecognized(_))
        ));
    }

    #[tokio::test]
    async fn oracle_classification_sees_recent_activity() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.reply_to(Purpose::Interpret, r#"{"action":"Scroll","direction":"down","amount":600}"#);
        let recent = vec!["Succeeded: click \"Catalog\" (succeeded after 1 attempt(s))".to_string()];

        let action = interpreter(&oracle)
            .interpret("show me more of that", &page(vec![]), &[], &recent)
            .await
            .unwrap();

        assert_eq!(
            action,
            Action::Scroll {
                direction: ScrollDirection::Down,
                amount: 600
            }
        );
        let prompt = oracle.requests()[0].user_text().to_string();
        assert!(prompt.contains("- Succeeded: click \"Catalog\""), "{prompt}");
    }
}
