//! Deterministic stand-ins for the oracle and the browser, for tests and
//! offline runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{BrowserDriver, LocatorCandidate, RawBlock, RawBounds, RawElement, RawPage};
use crate::error::{DriverError, OracleError};
use crate::oracle::{Oracle, OracleRequest, Purpose};
use crate::types::ScrollDirection;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Oracle that replays queued replies in order. A reply queued for a specific
/// [`Purpose`] is only handed to requests with that purpose; an exhausted
/// script answers with a transport error.
#[derive(Default)]
pub struct ScriptedOracle {
    script: Mutex<Vec<(Option<Purpose>, Result<String, OracleError>)>>,
    requests: Mutex<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, text: impl Into<String>) -> &Self {
        lock(&self.script).push((None, Ok(text.into())));
        self
    }

    pub fn fail(&self, message: impl Into<String>) -> &Self {
        lock(&self.script).push((None, Err(OracleError::Transport(message.into()))));
        self
    }

    pub fn reply_to(&self, purpose: Purpose, text: impl Into<String>) -> &Self {
        lock(&self.script).push((Some(purpose), Ok(text.into())));
        self
    }

    pub fn fail_for(&self, purpose: Purpose, message: impl Into<String>) -> &Self {
        lock(&self.script).push((Some(purpose), Err(OracleError::Transport(message.into()))));
        self
    }

    pub fn requests(&self) -> Vec<OracleRequest> {
        lock(&self.requests).clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn calls_for(&self, purpose: Purpose) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| r.purpose == purpose)
            .count()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.script).len()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn complete(&self, request: OracleRequest) -> Result<String, OracleError> {
        let purpose = request.purpose;
        lock(&self.requests).push(request);
        let mut script = lock(&self.script);
        match script
            .iter()
            .position(|(p, _)| p.is_none_or(|p| p == purpose))
        {
            Some(index) => script.remove(index).1,
            None => Err(OracleError::Transport(format!(
                "script exhausted for {purpose:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClickEffect {
    Nothing,
    Navigate(String),
    /// Adds an element to the current page (menus, dialogs).
    Reveal(Box<FakeElement>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FakeElement {
    pub tag: String,
    pub text: String,
    pub label: Option<String>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub input_type: Option<String>,
    pub value: String,
    pub required: bool,
    pub visible: bool,
    pub enabled: bool,
    pub broken: bool,
    /// Removed from the page once typed into (overlays that close on input).
    pub vanishes_on_type: bool,
    pub on_click: ClickEffect,
}

impl FakeElement {
    fn new(tag: &str, text: &str) -> Self {
        Self {
            tag: tag.to_string(),
            text: text.to_string(),
            label: None,
            id: None,
            name: None,
            input_type: None,
            value: String::new(),
            required: false,
            visible: true,
            enabled: true,
            broken: false,
            vanishes_on_type: false,
            on_click: ClickEffect::Nothing,
        }
    }

    pub fn button(text: &str) -> Self {
        Self::new("button", text)
    }

    pub fn link(text: &str, href: &str) -> Self {
        Self::new("a", text).on_click(ClickEffect::Navigate(href.to_string()))
    }

    pub fn input(name: &str) -> Self {
        let mut el = Self::new("input", "");
        el.name = Some(name.to_string());
        el.input_type = Some("text".to_string());
        el
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn input_type(mut self, kind: &str) -> Self {
        self.input_type = Some(kind.to_string());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Inspection of this node throws.
    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    pub fn vanishes_on_type(mut self) -> Self {
        self.vanishes_on_type = true;
        self
    }

    pub fn on_click(mut self, effect: ClickEffect) -> Self {
        self.on_click = effect;
        self
    }

    fn selectors(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(id) = &self.id {
            out.push(format!("#{id}"));
        }
        if let Some(name) = &self.name {
            out.push(format!("{}[name=\"{name}\"]", self.tag));
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FakePage {
    pub title: String,
    pub elements: Vec<FakeElement>,
    pub blocks: Vec<RawBlock>,
    /// Scrollable height beyond the viewport, in pixels.
    pub scroll_height: i64,
    /// Where submitting a form on this page leads; `{}` takes the last typed value.
    pub on_submit: Option<String>,
}

impl FakePage {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Self::default()
        }
    }

    pub fn element(mut self, element: FakeElement) -> Self {
        self.elements.push(element);
        self
    }

    pub fn heading(mut self, level: u8, text: &str) -> Self {
        self.blocks.push(RawBlock::Heading {
            level,
            text: text.to_string(),
        });
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.blocks.push(RawBlock::Text {
            text: text.to_string(),
        });
        self
    }

    pub fn scrollable(mut self, height: i64) -> Self {
        self.scroll_height = height;
        self
    }

    pub fn submits_to(mut self, url: &str) -> Self {
        self.on_submit = Some(url.to_string());
        self
    }

    fn path(&self, index: usize) -> String {
        let tag = &self.elements[index].tag;
        let nth = self.elements[..=index]
            .iter()
            .filter(|el| &el.tag == tag)
            .count();
        format!("body > {tag}:nth-of-type({nth})")
    }

    fn matches(&self, selector: &str) -> Vec<usize> {
        (0..self.elements.len())
            .filter(|&i| {
                self.path(i) == selector || self.elements[i].selectors().iter().any(|s| s == selector)
            })
            .collect()
    }

    fn raw(&self, url: &str, scroll: (i64, i64)) -> RawPage {
        let elements = self
            .elements
            .iter()
            .enumerate()
            .map(|(i, el)| {
                if el.broken {
                    return RawElement {
                        error: Some("node detached during inspection".into()),
                        ..RawElement::default()
                    };
                }
                let is_field = matches!(el.tag.as_str(), "input" | "textarea" | "select");
                RawElement {
                    tag: el.tag.clone(),
                    role: None,
                    input_type: el.input_type.clone(),
                    text: el.text.clone(),
                    label: el.label.clone(),
                    visible: el.visible,
                    enabled: el.enabled,
                    bounds: RawBounds {
                        x: 10.0,
                        y: 40.0 * i as f64,
                        width: 120.0,
                        height: 32.0,
                    },
                    candidates: el
                        .selectors()
                        .into_iter()
                        .map(|selector| LocatorCandidate {
                            matches: self.matches(&selector).len() as u32,
                            selector,
                        })
                        .collect(),
                    path: self.path(i),
                    name: el.name.clone(),
                    value: is_field.then(|| el.value.clone()),
                    required: el.required,
                    error: None,
                }
            })
            .collect();

        RawPage {
            url: url.to_string(),
            title: self.title.clone(),
            scroll_x: scroll.0,
            scroll_y: scroll.1,
            elements,
            blocks: self.blocks.clone(),
        }
    }
}

#[derive(Default)]
struct FakeState {
    pages: HashMap<String, FakePage>,
    current: String,
    scroll: (i64, i64),
    last_typed: String,
    calls: Vec<String>,
    failures: HashMap<String, u32>,
    delays: HashMap<String, Duration>,
    crashed: bool,
    captures: u8,
}

impl FakeState {
    fn page(&self) -> Option<&FakePage> {
        self.pages.get(&key(&self.current))
    }

    fn page_mut(&mut self) -> Option<&mut FakePage> {
        let key = key(&self.current);
        self.pages.get_mut(&key)
    }

    fn go(&mut self, url: &str) -> Result<(), DriverError> {
        if !self.pages.contains_key(&key(url)) {
            return Err(DriverError::Unreachable(format!("{url}: no such page")));
        }
        self.current = url.to_string();
        self.scroll = (0, 0);
        Ok(())
    }

    fn locate(&self, locator: &str) -> Result<usize, DriverError> {
        let page = self
            .page()
            .ok_or_else(|| DriverError::Unreachable(self.current.clone()))?;
        match page.matches(locator).as_slice() {
            [index] => Ok(*index),
            _ => Err(DriverError::ElementNotFound(locator.to_string())),
        }
    }
}

fn key(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// In-memory site map implementing the driver primitives, with call
/// recording, injected failures and artificial latency.
pub struct FakeDriver {
    state: Mutex<FakeState>,
}

const READ_OPS: [&str; 3] = ["query", "screenshot", "current_url"];

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                current: "about:blank".to_string(),
                ..FakeState::default()
            }),
        }
    }

    pub fn page(self, url: &str, page: FakePage) -> Self {
        lock(&self.state).pages.insert(key(url), page);
        self
    }

    pub fn start_at(self, url: &str) -> Self {
        lock(&self.state).current = url.to_string();
        self
    }

    /// The next `times` calls to `op` fail.
    pub fn fail_next(&self, op: &str, times: u32) {
        lock(&self.state).failures.insert(op.to_string(), times);
    }

    pub fn delay(&self, op: &str, by: Duration) {
        lock(&self.state).delays.insert(op.to_string(), by);
    }

    pub fn crash(&self) {
        lock(&self.state).crashed = true;
    }

    pub fn recover(&self) {
        lock(&self.state).crashed = false;
    }

    pub fn current(&self) -> String {
        lock(&self.state).current.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Calls that could change the page.
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| !READ_OPS.iter().any(|op| call.split(' ').next() == Some(op)))
            .collect()
    }

    /// Indexes of elements on the current page matched by `locator`.
    pub fn resolve(&self, locator: &str) -> Vec<usize> {
        let state = lock(&self.state);
        state.page().map(|p| p.matches(locator)).unwrap_or_default()
    }

    pub fn value_of(&self, locator: &str) -> Option<String> {
        let state = lock(&self.state);
        let index = state.locate(locator).ok()?;
        state.page().map(|p| p.elements[index].value.clone())
    }

    /// Records the call and applies injected latency and failures.
    async fn enter(&self, op: &str, detail: &str) -> Result<(), DriverError> {
        let delay = {
            let mut state = lock(&self.state);
            state.calls.push(if detail.is_empty() {
                op.to_string()
            } else {
                format!("{op} {detail}")
            });
            state.delays.get(op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = lock(&self.state);
        if let Some(left) = state.failures.get_mut(op) {
            if *left > 0 {
                *left -= 1;
                return Err(DriverError::browser(format!("injected {op} failure")));
            }
        }
        Ok(())
    }
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.enter("navigate", url).await?;
        lock(&self.state).go(url)
    }

    async fn query_interactive_elements(&self) -> Result<RawPage, DriverError> {
        self.enter("query", "").await?;
        let state = lock(&self.state);
        if state.crashed {
            return Err(DriverError::Unreachable("renderer crashed".into()));
        }
        match state.page() {
            Some(page) => Ok(page.raw(&state.current, state.scroll)),
            None if state.current == "about:blank" => Ok(RawPage {
                url: state.current.clone(),
                ..RawPage::default()
            }),
            None => Err(DriverError::Unreachable(state.current.clone())),
        }
    }

    async fn click(&self, locator: &str) -> Result<(), DriverError> {
        self.enter("click", locator).await?;
        let mut state = lock(&self.state);
        let index = state.locate(locator)?;
        let effect = state
            .page()
            .map(|p| p.elements[index].on_click.clone())
            .unwrap_or(ClickEffect::Nothing);
        match effect {
            ClickEffect::Nothing => Ok(()),
            ClickEffect::Navigate(url) => state.go(&url),
            ClickEffect::Reveal(element) => {
                if let Some(page) = state.page_mut() {
                    page.elements.push(*element);
                }
                Ok(())
            }
        }
    }

    async fn type_text(&self, locator: &str, text: &str) -> Result<(), DriverError> {
        self.enter("type", &format!("{locator} {text}")).await?;
        let mut state = lock(&self.state);
        let index = state.locate(locator)?;
        state.last_typed = text.to_string();
        if let Some(page) = state.page_mut() {
            if page.elements[index].vanishes_on_type {
                page.elements.remove(index);
            } else {
                page.elements[index].value = text.to_string();
            }
        }
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), DriverError> {
        self.enter("press_key", key).await?;
        let mut state = lock(&self.state);
        if key == "Enter" {
            let target = state.page().and_then(|p| p.on_submit.clone());
            if let Some(target) = target {
                let url = target.replace("{}", &state.last_typed.replace(' ', "+"));
                return state.go(&url);
            }
        }
        Ok(())
    }

    async fn submit(&self, locator: &str) -> Result<(), DriverError> {
        self.enter("submit", locator).await?;
        let mut state = lock(&self.state);
        state.locate(locator)?;
        let target = state.page().and_then(|p| p.on_submit.clone());
        match target {
            Some(target) => {
                let url = target.replace("{}", &state.last_typed.replace(' ', "+"));
                state.go(&url)
            }
            None => Err(DriverError::browser(format!("{locator} is not inside a form"))),
        }
    }

    async fn scroll(&self, direction: ScrollDirection, amount: u32) -> Result<(), DriverError> {
        self.enter("scroll", &format!("{direction:?} {amount}")).await?;
        let mut state = lock(&self.state);
        let max = state.page().map(|p| p.scroll_height).unwrap_or(0);
        let (dx, dy) = direction.delta(amount);
        let (x, y) = state.scroll;
        state.scroll = ((x + dx).clamp(0, max), (y + dy).clamp(0, max));
        Ok(())
    }

    async fn capture_screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.enter("screenshot", "").await?;
        let mut state = lock(&self.state);
        state.captures = state.captures.wrapping_add(1);
        Ok(vec![0x89, b'P', b'N', b'G', state.captures])
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        self.enter("current_url", "").await?;
        let state = lock(&self.state);
        if state.crashed {
            return Err(DriverError::Unreachable("renderer crashed".into()));
        }
        Ok(state.current.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_oracle_routes_by_purpose() {
        let oracle = ScriptedOracle::new();
        oracle.reply_to(Purpose::Plan, "plan reply").reply("anything");

        let vision = oracle
            .complete(OracleRequest::new(Purpose::Vision, "s", "u".into()))
            .await
            .unwrap();
        assert_eq!(vision, "anything");
        let plan = oracle
            .complete(OracleRequest::new(Purpose::Plan, "s", "u".into()))
            .await
            .unwrap();
        assert_eq!(plan, "plan reply");
        assert!(
            oracle
                .complete(OracleRequest::new(Purpose::Plan, "s", "u".into()))
                .await
                .is_err()
        );
        assert_eq!(oracle.calls_for(Purpose::Plan), 2);
    }

    #[tokio::test]
    async fn fake_driver_follows_links_and_records_calls() {
        let driver = FakeDriver::new()
            .page(
                "https://a.test/",
                FakePage::new("Home").element(FakeElement::link("Docs", "https://a.test/docs").id("docs")),
            )
            .page("https://a.test/docs", FakePage::new("Docs"))
            .start_at("https://a.test/");

        driver.click("#docs").await.unwrap();
        assert_eq!(driver.current(), "https://a.test/docs");
        assert!(driver.click("#docs").await.is_err());
        assert_eq!(driver.mutations(), vec!["click #docs", "click #docs"]);

        driver.fail_next("navigate", 1);
        assert!(driver.navigate("https://a.test/").await.is_err());
        driver.navigate("https://a.test/").await.unwrap();
    }
}
