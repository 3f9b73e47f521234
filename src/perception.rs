//! Turns a live page into a [`PageSnapshot`].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::driver::{BrowserDriver, RawBlock, RawElement, RawPage, bounded};
use crate::error::{DriverError, PerceptionFailure};
use crate::snapshot::{Bounds, ContentRegion, FormField, InteractiveElement, PageSnapshot, Role, Screenshot};

/// Structural reads retried when the URL moves between the read and the
/// screenshot.
const CONSISTENCY_ATTEMPTS: usize = 2;
const MAX_BLOCKS_PER_REGION: usize = 20;

pub struct Perceiver {
    driver: Arc<dyn BrowserDriver>,
    timeout: Duration,
    seq: AtomicU64,
}

impl Perceiver {
    pub fn new(driver: Arc<dyn BrowserDriver>, timeout: Duration) -> Self {
        Self {
            driver,
            timeout,
            seq: AtomicU64::new(0),
        }
    }

    /// Reads the page structure and a screenshot of the same moment.
    ///
    /// If the URL changes between the structural read and the screenshot the
    /// capture is repeated; a page that never settles is reported as
    /// [`PerceptionFailure::Inconsistent`].
    pub async fn capture(&self) -> Result<PageSnapshot, PerceptionFailure> {
        let mut last = None;
        for _ in 0..CONSISTENCY_ATTEMPTS {
            let raw = bounded(
                "query_interactive_elements",
                self.timeout,
                self.driver.query_interactive_elements(),
            )
            .await
            .map_err(unreachable)?;

            let png = bounded("capture_screenshot", self.timeout, self.driver.capture_screenshot())
                .await
                .map_err(|e| PerceptionFailure::Screenshot(e.to_string()))?;

            let url_after = bounded("current_url", self.timeout, self.driver.current_url())
                .await
                .map_err(unreachable)?;

            if same_page(&raw.url, &url_after) {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
                let snapshot = normalize(seq, raw, Screenshot::new(png));
                debug!(
                    seq,
                    url = %snapshot.url,
                    elements = snapshot.elements.len(),
                    fields = snapshot.form_fields.len(),
                    "captured snapshot"
                );
                return Ok(snapshot);
            }

            warn!(before = %raw.url, after = %url_after, "page moved during capture, retrying");
            last = Some((raw.url, url_after));
        }

        let (before, after) = last.unwrap_or_default();
        Err(PerceptionFailure::Inconsistent { before, after })
    }
}

fn unreachable(err: DriverError) -> PerceptionFailure {
    PerceptionFailure::Unreachable(err.to_string())
}

fn same_page(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

/// Maps tag/role/type onto the closed role set; `None` means not interactive.
fn classify(el: &RawElement) -> Option<Role> {
    if let Some(role) = el.role.as_deref() {
        match role.to_ascii_lowercase().as_str() {
            "link" => return Some(Role::Link),
            "button" | "menuitem" | "tab" => return Some(Role::Button),
            "textbox" | "searchbox" | "checkbox" | "radio" | "switch" => return Some(Role::Input),
            "combobox" | "listbox" => return Some(Role::Select),
            _ => {}
        }
    }
    match el.tag.as_str() {
        "a" => Some(Role::Link),
        "button" => Some(Role::Button),
        "select" => Some(Role::Select),
        "textarea" => Some(Role::Input),
        "input" => match el.input_type.as_deref().unwrap_or("text") {
            "hidden" => None,
            "submit" | "button" | "reset" | "image" => Some(Role::Button),
            _ => Some(Role::Input),
        },
        _ => None,
    }
}

/// First explicit selector that matches exactly one node, else the path.
fn derive_locator(el: &RawElement) -> Option<String> {
    el.candidates
        .iter()
        .find(|c| c.matches == 1 && !c.selector.is_empty())
        .map(|c| c.selector.clone())
        .or_else(|| (!el.path.is_empty()).then(|| el.path.clone()))
}

/// Builds the normalized snapshot from a raw read. Elements that failed
/// inspection, are hidden, disabled, unrecognized, or have no locator are
/// dropped one by one; nothing here fails the whole capture.
pub fn normalize(seq: u64, raw: RawPage, screenshot: Screenshot) -> PageSnapshot {
    let mut elements = Vec::new();
    let mut form_fields = Vec::new();
    let mut seen = HashSet::new();

    for el in raw.elements {
        if let Some(err) = &el.error {
            debug!(error = %err, "element failed inspection, omitted");
            continue;
        }
        if !el.visible || !el.enabled {
            continue;
        }
        let Some(role) = classify(&el) else {
            continue;
        };
        let Some(locator) = derive_locator(&el) else {
            debug!(tag = %el.tag, "element has no usable locator, omitted");
            continue;
        };
        if !seen.insert(locator.clone()) {
            // Same node reported twice (e.g. matched by tag and by role).
            continue;
        }

        if matches!(el.tag.as_str(), "input" | "textarea" | "select") && role != Role::Button {
            form_fields.push(FormField {
                name: el
                    .name
                    .clone()
                    .or_else(|| el.label.clone())
                    .unwrap_or_else(|| locator.clone()),
                field_type: el.input_type.clone().unwrap_or_else(|| el.tag.clone()),
                value: el.value.clone().unwrap_or_default(),
                required: el.required,
                locator: locator.clone(),
            });
        }

        elements.push(InteractiveElement {
            role,
            text: el.text.trim().to_string(),
            label: el.label.filter(|l| !l.trim().is_empty()),
            bounds: Bounds {
                x: el.bounds.x,
                y: el.bounds.y,
                width: el.bounds.width,
                height: el.bounds.height,
            },
            locator,
        });
    }

    PageSnapshot {
        seq,
        url: raw.url,
        title: raw.title,
        scroll_x: raw.scroll_x,
        scroll_y: raw.scroll_y,
        elements,
        form_fields,
        regions: build_regions(raw.blocks),
        screenshot,
    }
}

/// Groups blocks under their nearest heading and records the heading chain.
fn build_regions(blocks: Vec<RawBlock>) -> Vec<ContentRegion> {
    let mut regions: Vec<ContentRegion> = Vec::new();
    let mut stack: Vec<(u8, String)> = Vec::new();

    for block in blocks {
        match block {
            RawBlock::Heading { level, text } => {
                let level = level.clamp(1, 6);
                while stack.last().is_some_and(|(l, _)| *l >= level) {
                    stack.pop();
                }
                stack.push((level, text));
                regions.push(ContentRegion {
                    headings: stack.iter().map(|(_, t)| t.clone()).collect(),
                    level,
                    blocks: Vec::new(),
                });
            }
            RawBlock::Text { text } => {
                if regions.is_empty() {
                    regions.push(ContentRegion::default());
                }
                if let Some(region) = regions.last_mut() {
                    if region.blocks.len() < MAX_BLOCKS_PER_REGION {
                        region.blocks.push(text);
                    }
                }
            }
        }
    }
    regions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::LocatorCandidate;

    fn raw(tag: &str, text: &str, path: &str) -> RawElement {
        RawElement {
            tag: tag.to_string(),
            text: text.to_string(),
            visible: true,
            enabled: true,
            path: path.to_string(),
            ..RawElement::default()
        }
    }

    #[test]
    fn locator_prefers_unique_explicit_selector() {
        let mut el = raw("button", "Go", "body > button:nth-of-type(1)");
        el.candidates = vec![
            LocatorCandidate {
                selector: "#go".into(),
                matches: 2,
            },
            LocatorCandidate {
                selector: "button[name=\"go\"]".into(),
                matches: 1,
            },
        ];
        assert_eq!(derive_locator(&el).as_deref(), Some("button[name=\"go\"]"));

        el.candidates[1].matches = 3;
        assert_eq!(
            derive_locator(&el).as_deref(),
            Some("body > button:nth-of-type(1)")
        );
    }

    #[test]
    fn normalize_drops_broken_hidden_and_unknown_nodes() {
        let mut hidden = raw("a", "Hidden", "body > a:nth-of-type(2)");
        hidden.visible = false;
        let mut disabled = raw("button", "Off", "body > button:nth-of-type(2)");
        disabled.enabled = false;
        let mut field = raw("input", "", "body > input:nth-of-type(1)");
        field.input_type = Some("email".into());
        field.name = Some("email".into());
        field.value = Some("a@b.c".into());
        field.required = true;

        let page = RawPage {
            url: "https://a.test/".into(),
            elements: vec![
                RawElement {
                    error: Some("node detached".into()),
                    ..RawElement::default()
                },
                raw("a", "Home", "body > a:nth-of-type(1)"),
                hidden,
                disabled,
                raw("div", "Decor", "body > div:nth-of-type(1)"),
                field,
            ],
            ..RawPage::default()
        };

        let snap = normalize(7, page, Screenshot::new(vec![1, 2, 3]));
        assert_eq!(snap.seq, 7);
        assert_eq!(snap.elements.len(), 2);
        assert_eq!(snap.elements[0].role, Role::Link);
        assert_eq!(snap.elements[1].role, Role::Input);
        assert_eq!(snap.form_fields.len(), 1);
        assert_eq!(snap.form_fields[0].name, "email");
        assert_eq!(snap.form_fields[0].value, "a@b.c");
        assert!(snap.form_fields[0].required);
    }

    #[test]
    fn submit_inputs_are_buttons_not_fields() {
        let mut submit = raw("input", "Send", "body > input:nth-of-type(1)");
        submit.input_type = Some("submit".into());
        let snap = normalize(
            1,
            RawPage {
                elements: vec![submit],
                ..RawPage::default()
            },
            Screenshot::default(),
        );
        assert_eq!(snap.elements[0].role, Role::Button);
        assert!(snap.form_fields.is_empty());
    }

    #[test]
    fn regions_follow_heading_hierarchy() {
        let blocks = vec![
            RawBlock::Text {
                text: "intro".into(),
            },
            RawBlock::Heading {
                level: 1,
                text: "Docs".into(),
            },
            RawBlock::Heading {
                level: 2,
                text: "Install".into(),
            },
            RawBlock::Text {
                text: "cargo add".into(),
            },
            RawBlock::Heading {
                level: 2,
                text: "Usage".into(),
            },
            RawBlock::Heading {
                level: 1,
                text: "FAQ".into(),
            },
        ];
        let regions = build_regions(blocks);
        assert_eq!(regions.len(), 5);
        assert!(regions[0].headings.is_empty());
        assert_eq!(regions[0].blocks, vec!["intro"]);
        assert_eq!(regions[2].headings, vec!["Docs", "Install"]);
        assert_eq!(regions[2].blocks, vec!["cargo add"]);
        assert_eq!(regions[3].headings, vec!["Docs", "Usage"]);
        assert_eq!(regions[4].headings, vec!["FAQ"]);
    }
}
