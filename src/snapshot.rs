//! Normalized, point-in-time view of a page.
//!
//! A [`PageSnapshot`] is never patched: every capture produces a new value and
//! the previous one is dropped by the session.

use std::collections::hash_map::DefaultHasher;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// Upper bound on the element listing sent to the oracle.
pub const PROMPT_SNAPSHOT_MAX_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Link,
    Button,
    Input,
    Select,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Link => "link",
            Role::Button => "button",
            Role::Input => "input",
            Role::Select => "select",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveElement {
    pub role: Role,
    pub text: String,
    pub label: Option<String>,
    pub bounds: Bounds,
    /// Selector that matches this element and nothing else on the page.
    pub locator: String,
}

impl InteractiveElement {
    /// Case-insensitive match against the visible text or accessible label.
    pub fn matches_text(&self, needle: &str) -> bool {
        let needle = needle.trim();
        self.text.trim().eq_ignore_ascii_case(needle)
            || self
                .label
                .as_deref()
                .is_some_and(|label| label.trim().eq_ignore_ascii_case(needle))
    }

    pub fn display_name(&self) -> &str {
        if !self.text.trim().is_empty() {
            self.text.trim()
        } else {
            self.label.as_deref().unwrap_or("").trim()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    pub field_type: String,
    pub value: String,
    pub required: bool,
    pub locator: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentRegion {
    /// Heading chain from the outermost section down to this region's heading.
    pub headings: Vec<String>,
    pub level: u8,
    pub blocks: Vec<String>,
}

/// PNG bytes shared between the snapshot and anything that needs to ship them.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Screenshot {
    png: Arc<Vec<u8>>,
}

impl Screenshot {
    pub fn new(png: Vec<u8>) -> Self {
        Self { png: Arc::new(png) }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.png
    }

    pub fn len(&self) -> usize {
        self.png.len()
    }

    pub fn is_empty(&self) -> bool {
        self.png.is_empty()
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.png.as_slice())
    }

    pub fn data_url(&self) -> String {
        format!("data:image/png;base64,{}", self.to_base64())
    }
}

impl std::fmt::Debug for Screenshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Screenshot({} bytes)", self.png.len())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    /// Monotonic capture number within a session.
    pub seq: u64,
    pub url: String,
    pub title: String,
    pub scroll_x: i64,
    pub scroll_y: i64,
    pub elements: Vec<InteractiveElement>,
    pub form_fields: Vec<FormField>,
    pub regions: Vec<ContentRegion>,
    pub screenshot: Screenshot,
}

impl PageSnapshot {
    /// Placeholder for a session that has not looked at a page yet.
    pub fn blank() -> Self {
        Self {
            url: "about:blank".to_string(),
            ..Self::default()
        }
    }

    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
    }

    pub fn elements_matching_text(&self, text: &str) -> Vec<&InteractiveElement> {
        self.elements.iter().filter(|el| el.matches_text(text)).collect()
    }

    pub fn element_by_locator(&self, locator: &str) -> Option<&InteractiveElement> {
        self.elements.iter().find(|el| el.locator == locator)
    }

    pub fn field_by_locator(&self, locator: &str) -> Option<&FormField> {
        self.form_fields.iter().find(|f| f.locator == locator)
    }

    /// Whether any heading or text block mentions `needle` (case-insensitive).
    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.title.to_lowercase().contains(&needle)
            || self.regions.iter().any(|region| {
                region
                    .headings
                    .iter()
                    .chain(region.blocks.iter())
                    .any(|text| text.to_lowercase().contains(&needle))
            })
            || self
                .elements
                .iter()
                .any(|el| el.text.to_lowercase().contains(&needle))
    }

    /// Hash of the structural content, ignoring capture number and screenshot.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.url.hash(&mut hasher);
        self.title.hash(&mut hasher);
        for el in &self.elements {
            el.role.hash(&mut hasher);
            el.text.hash(&mut hasher);
            el.locator.hash(&mut hasher);
        }
        for field in &self.form_fields {
            field.locator.hash(&mut hasher);
            field.value.hash(&mut hasher);
        }
        self.regions.hash(&mut hasher);
        hasher.finish()
    }

    /// One-line description used in reports and logs.
    pub fn summary(&self) -> String {
        let title = if self.title.is_empty() {
            "untitled"
        } else {
            self.title.as_str()
        };
        format!(
            "{} \"{}\" ({} elements, {} fields, {} regions)",
            self.url,
            title,
            self.elements.len(),
            self.form_fields.len(),
            self.regions.len()
        )
    }

    /// Compact listing of the page for oracle prompts, one element per line.
    pub fn describe(&self) -> String {
        let mut out = format!("URL: {}\nTitle: {}\n", self.url, self.title);
        for el in &self.elements {
            let _ = write!(out, "{} \"{}\"", el.role.as_str(), el.display_name());
            if let Some(label) = el.label.as_deref().filter(|l| *l != el.text) {
                let _ = write!(out, " label=\"{label}\"");
            }
            let _ = writeln!(out, " locator={}", el.locator);
        }
        for field in &self.form_fields {
            let _ = writeln!(
                out,
                "field {} type={} value=\"{}\"{}",
                field.name,
                field.field_type,
                field.value,
                if field.required { " required" } else { "" }
            );
        }
        for region in &self.regions {
            if let Some(heading) = region.headings.last() {
                let _ = writeln!(out, "# {heading}");
            }
            for block in region.blocks.iter().take(3) {
                let _ = writeln!(out, "  \"{block}\"");
            }
        }

        if out.len() > PROMPT_SNAPSHOT_MAX_CHARS {
            let mut cut = PROMPT_SNAPSHOT_MAX_CHARS;
            while !out.is_char_boundary(cut) {
                cut -= 1;
            }
            let total = out.len();
            out.truncate(cut);
            let _ = write!(out, "\n... [truncated, {total} total chars]");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(text: &str, locator: &str) -> InteractiveElement {
        InteractiveElement {
            role: Role::Button,
            text: text.to_string(),
            label: None,
            bounds: Bounds::default(),
            locator: locator.to_string(),
        }
    }

    #[test]
    fn text_match_ignores_case_and_whitespace() {
        let el = element("  Sign In ", "#signin");
        assert!(el.matches_text("sign in"));
        assert!(!el.matches_text("sign"));
    }

    #[test]
    fn fingerprint_ignores_capture_number() {
        let a = PageSnapshot {
            seq: 1,
            url: "https://example.com/".into(),
            elements: vec![element("Go", "#go")],
            ..PageSnapshot::default()
        };
        let b = PageSnapshot { seq: 2, ..a.clone() };
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = PageSnapshot {
            elements: vec![element("Stop", "#go")],
            ..a.clone()
        };
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn host_strips_www() {
        let snap = PageSnapshot {
            url: "https://www.example.com/path".into(),
            ..PageSnapshot::default()
        };
        assert_eq!(snap.host().as_deref(), Some("example.com"));
        assert_eq!(PageSnapshot::blank().host(), None);
    }

    #[test]
    fn describe_truncates_long_pages() {
        let snap = PageSnapshot {
            elements: (0..400)
                .map(|i| element(&format!("button number {i}"), &format!("#b{i}")))
                .collect(),
            ..PageSnapshot::blank()
        };
        let text = snap.describe();
        assert!(text.contains("[truncated"));
        assert!(text.len() < PROMPT_SNAPSHOT_MAX_CHARS + 64);
    }
}
