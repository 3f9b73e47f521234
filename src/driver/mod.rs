//! Browser-driver primitives.
//!
//! The control loop never talks to a browser directly; it goes through
//! [`BrowserDriver`], which the Chrome backend and the test fake both implement.

pub mod chrome;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::DriverError;
use crate::types::ScrollDirection;

pub use chrome::ChromeDriver;

/// A candidate selector together with how many nodes it matches page-wide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LocatorCandidate {
    pub selector: String,
    pub matches: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct RawBounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Unprocessed element report. Every field is optional because a half-loaded
/// node may fail partway through inspection.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawElement {
    pub tag: String,
    pub role: Option<String>,
    pub input_type: Option<String>,
    pub text: String,
    pub label: Option<String>,
    pub visible: bool,
    pub enabled: bool,
    pub bounds: RawBounds,
    /// Preferred selectors, most explicit first.
    pub candidates: Vec<LocatorCandidate>,
    /// Structural path from `body`; unique by construction.
    pub path: String,
    pub name: Option<String>,
    pub value: Option<String>,
    pub required: bool,
    /// Set when inspecting this node threw.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawBlock {
    Heading { level: u8, text: String },
    Text { text: String },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawPage {
    pub url: String,
    pub title: String,
    pub scroll_x: i64,
    pub scroll_y: i64,
    pub elements: Vec<RawElement>,
    pub blocks: Vec<RawBlock>,
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    /// Structural read of the live page.
    async fn query_interactive_elements(&self) -> Result<RawPage, DriverError>;

    async fn click(&self, locator: &str) -> Result<(), DriverError>;

    async fn type_text(&self, locator: &str, text: &str) -> Result<(), DriverError>;

    async fn press_key(&self, key: &str) -> Result<(), DriverError>;

    /// Submits the form that owns `locator` (or the form it names).
    async fn submit(&self, locator: &str) -> Result<(), DriverError>;

    async fn scroll(&self, direction: ScrollDirection, amount: u32) -> Result<(), DriverError>;

    async fn capture_screenshot(&self) -> Result<Vec<u8>, DriverError>;

    async fn current_url(&self) -> Result<String, DriverError>;
}

/// Runs a driver call under a deadline; expiry reports as [`DriverError::Timeout`].
pub async fn bounded<T, F>(operation: &str, limit: Duration, call: F) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout {
            operation: operation.to_string(),
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_page_tolerates_missing_fields() {
        let page: RawPage = serde_json::from_str(
            r#"{"url":"https://a.test/","elements":[{"error":"detached"},{"tag":"a","text":"Home","visible":true,"enabled":true,"path":"body > a:nth-of-type(1)"}],"blocks":[{"kind":"heading","level":1,"text":"Welcome"}]}"#,
        )
        .unwrap();
        assert_eq!(page.elements.len(), 2);
        assert_eq!(page.elements[0].error.as_deref(), Some("detached"));
        assert_eq!(page.elements[1].tag, "a");
        assert_eq!(
            page.blocks[0],
            RawBlock::Heading {
                level: 1,
                text: "Welcome".into()
            }
        );
    }

    #[tokio::test]
    async fn bounded_reports_timeout() {
        let result: Result<(), DriverError> = bounded("click", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(DriverError::Timeout { timeout_ms: 10, .. })));
    }
}
