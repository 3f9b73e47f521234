use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions, Tab};
use tracing::{debug, info, warn};

use super::{BrowserDriver, RawPage};
use crate::config::BrowserConfig;
use crate::error::DriverError;
use crate::types::ScrollDirection;

/// JavaScript injected into the page to read its structure. Read-only: it does
/// not tag or restyle anything.
///
/// For each candidate interactive node it reports visibility, enablement, a
/// list of explicit selectors with their page-wide match counts, and a
/// structural `nth-of-type` path. Nodes that throw during inspection are
/// reported with an `error` field so the caller can drop them individually.
/// Headings and short text blocks are returned in document order.
const SNAPSHOT_JS: &str = r#"
(() => {
  const out = {
    url: location.href,
    title: document.title,
    scroll_x: Math.round(window.scrollX),
    scroll_y: Math.round(window.scrollY),
    elements: [],
    blocks: []
  };
  const count = (sel) => { try { return document.querySelectorAll(sel).length; } catch (_) { return 0; } };
  const quote = (v) => '"' + String(v).replace(/\\/g, '\\\\').replace(/"/g, '\\"') + '"';

  function path(el) {
    const parts = [];
    while (el && el.nodeType === 1 && el !== document.body && el !== document.documentElement) {
      let i = 1;
      let sib = el;
      while ((sib = sib.previousElementSibling)) if (sib.tagName === el.tagName) i++;
      parts.unshift(el.tagName.toLowerCase() + ':nth-of-type(' + i + ')');
      el = el.parentElement;
    }
    return 'body > ' + parts.join(' > ');
  }

  function visible(el) {
    const r = el.getBoundingClientRect();
    const s = getComputedStyle(el);
    return r.width > 0 && r.height > 0 && s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  const nodes = document.querySelectorAll('a[href], button, input, textarea, select, [role]');
  for (const el of nodes) {
    try {
      const tag = el.tagName.toLowerCase();
      const candidates = [];
      if (el.id) candidates.push('#' + CSS.escape(el.id));
      const testId = el.getAttribute('data-testid');
      if (testId) candidates.push('[data-testid=' + quote(testId) + ']');
      const name = el.getAttribute('name');
      if (name) candidates.push(tag + '[name=' + quote(name) + ']');
      const aria = el.getAttribute('aria-label');
      if (aria) candidates.push(tag + '[aria-label=' + quote(aria) + ']');
      const r = el.getBoundingClientRect();
      const label = aria
        || (el.labels && el.labels.length ? el.labels[0].innerText.trim() : null)
        || el.getAttribute('placeholder')
        || el.getAttribute('title');
      const isField = tag === 'input' || tag === 'textarea' || tag === 'select';
      out.elements.push({
        tag,
        role: el.getAttribute('role'),
        input_type: isField ? (el.type || 'text') : null,
        text: (tag === 'input' ? (el.type === 'submit' || el.type === 'button' ? el.value : '') : (el.innerText || '')).trim().slice(0, 120),
        label: label || null,
        visible: visible(el),
        enabled: !el.disabled && el.getAttribute('aria-disabled') !== 'true',
        bounds: { x: r.x, y: r.y, width: r.width, height: r.height },
        candidates: candidates.map((s) => ({ selector: s, matches: count(s) })),
        path: path(el),
        name: name,
        value: isField ? String(el.value || '') : null,
        required: !!el.required
      });
    } catch (e) {
      out.elements.push({ error: String(e) });
    }
  }

  for (const el of document.querySelectorAll('h1, h2, h3, h4, h5, h6, p, li, td, blockquote')) {
    const text = (el.innerText || '').trim();
    if (!text || text.length > 400) continue;
    if (/^H[1-6]$/.test(el.tagName)) {
      out.blocks.push({ kind: 'heading', level: Number(el.tagName[1]), text: text.slice(0, 160) });
    } else if (el.children.length === 0 || el.tagName === 'P') {
      out.blocks.push({ kind: 'text', text: text.slice(0, 200) });
    }
  }
  return JSON.stringify(out);
})()
"#;

/// Chrome session driven over the DevTools protocol. Created once per
/// browsing context.
pub struct ChromeDriver {
    _browser: Browser,
    tab: Arc<Tab>,
    settle: Duration,
}

impl ChromeDriver {
    /// Attaches to a running Chrome when `debug_endpoint` is set and reachable,
    /// otherwise launches a new one. Blocking; call from `spawn_blocking`.
    pub fn launch(config: &BrowserConfig) -> Result<Self, DriverError> {
        let settle = Duration::from_millis(config.settle_ms);

        if let Some(endpoint) = &config.debug_endpoint {
            info!(%endpoint, "attempting to attach to existing Chrome");
            match Browser::connect(endpoint.clone()) {
                Ok(browser) => {
                    let existing = browser
                        .get_tabs()
                        .lock()
                        .map_err(|_| DriverError::browser("tab list lock poisoned"))?
                        .first()
                        .cloned();
                    let tab = match existing {
                        Some(tab) => tab,
                        None => browser.new_tab().map_err(browser_error)?,
                    };
                    info!("attached to existing Chrome");
                    return Ok(Self {
                        _browser: browser,
                        tab,
                        settle,
                    });
                }
                Err(e) => warn!(error = %e, "could not attach, launching a new browser"),
            }
        }

        let options = LaunchOptions {
            headless: config.headless,
            path: config.chrome_path.clone(),
            user_data_dir: config.profile_dir.clone(),
            window_size: Some((config.window_width, config.window_height)),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(300),
            ..Default::default()
        };

        info!(headless = config.headless, "starting Chrome");
        let browser = Browser::new(options)
            .map_err(|e| DriverError::browser(format!("browser launch failed: {e:#}")))?;
        let tab = browser.new_tab().map_err(browser_error)?;
        tab.navigate_to("about:blank").map_err(browser_error)?;
        info!("Chrome ready");

        Ok(Self {
            _browser: browser,
            tab,
            settle,
        })
    }

    /// Runs a blocking tab operation on the blocking pool so tokio keeps moving.
    async fn with_tab<T, F>(&self, f: F) -> Result<T, DriverError>
    where
        F: FnOnce(&Tab, Duration) -> Result<T, DriverError> + Send + 'static,
        T: Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        let settle = self.settle;
        tokio::task::spawn_blocking(move || f(&tab, settle))
            .await
            .map_err(|e| DriverError::browser(format!("tab task panicked: {e}")))?
    }
}

fn browser_error(e: anyhow::Error) -> DriverError {
    DriverError::browser(format!("{e:#}"))
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn evaluate_string(tab: &Tab, script: &str) -> Result<Option<String>, DriverError> {
    let result = tab.evaluate(script, false).map_err(browser_error)?;
    Ok(result.value.and_then(|v| v.as_str().map(String::from)))
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let url = url.to_string();
        self.with_tab(move |tab, settle| {
            tab.navigate_to(&url).map_err(browser_error)?;
            tab.wait_until_navigated()
                .map_err(|e| DriverError::Unreachable(format!("{url}: {e:#}")))?;
            std::thread::sleep(settle);
            Ok(())
        })
        .await
    }

    async fn query_interactive_elements(&self) -> Result<RawPage, DriverError> {
        self.with_tab(|tab, _| {
            let raw = evaluate_string(tab, SNAPSHOT_JS)
                .map_err(|e| DriverError::Unreachable(e.to_string()))?
                .ok_or_else(|| DriverError::Unreachable("snapshot script returned nothing".into()))?;
            debug!(chars = raw.len(), "structural read complete");
            serde_json::from_str(&raw)
                .map_err(|e| DriverError::browser(format!("bad snapshot payload: {e}")))
        })
        .await
    }

    async fn click(&self, locator: &str) -> Result<(), DriverError> {
        let locator = locator.to_string();
        self.with_tab(move |tab, settle| {
            let el = tab
                .find_element(&locator)
                .map_err(|_| DriverError::ElementNotFound(locator.clone()))?;
            el.click().map_err(browser_error)?;
            std::thread::sleep(settle);
            Ok(())
        })
        .await
    }

    async fn type_text(&self, locator: &str, text: &str) -> Result<(), DriverError> {
        let locator = locator.to_string();
        let text = text.to_string();
        self.with_tab(move |tab, _| {
            let el = tab
                .find_element(&locator)
                .map_err(|_| DriverError::ElementNotFound(locator.clone()))?;
            el.click().map_err(browser_error)?;
            tab.evaluate(
                &format!(
                    "(() => {{ const el = document.querySelector({}); if (el) el.value = ''; }})()",
                    js_string(&locator)
                ),
                false,
            )
            .map_err(browser_error)?;
            tab.type_str(&text).map_err(browser_error)?;
            Ok(())
        })
        .await
    }

    async fn press_key(&self, key: &str) -> Result<(), DriverError> {
        let key = key.to_string();
        self.with_tab(move |tab, settle| {
            tab.press_key(&key).map_err(browser_error)?;
            std::thread::sleep(settle);
            Ok(())
        })
        .await
    }

    async fn submit(&self, locator: &str) -> Result<(), DriverError> {
        let locator = locator.to_string();
        self.with_tab(move |tab, settle| {
            let script = format!(
                r#"(() => {{
                    const el = document.querySelector({sel});
                    if (!el) return 'missing';
                    const form = el.tagName === 'FORM' ? el : el.closest('form');
                    if (!form) return 'no-form';
                    if (form.requestSubmit) form.requestSubmit(); else form.submit();
                    return 'ok';
                }})()"#,
                sel = js_string(&locator)
            );
            match evaluate_string(tab, &script)?.as_deref() {
                Some("ok") => {
                    std::thread::sleep(settle);
                    Ok(())
                }
                Some("no-form") => Err(DriverError::browser(format!(
                    "{locator} is not inside a form"
                ))),
                _ => Err(DriverError::ElementNotFound(locator)),
            }
        })
        .await
    }

    async fn scroll(&self, direction: ScrollDirection, amount: u32) -> Result<(), DriverError> {
        let (dx, dy) = direction.delta(amount);
        self.with_tab(move |tab, _| {
            tab.evaluate(&format!("window.scrollBy({dx}, {dy})"), false)
                .map_err(browser_error)?;
            std::thread::sleep(Duration::from_millis(150));
            Ok(())
        })
        .await
    }

    async fn capture_screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.with_tab(|tab, _| {
            tab.capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(browser_error)
        })
        .await
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        self.with_tab(|tab, _| {
            Ok(evaluate_string(tab, "window.location.href")?.unwrap_or_else(|| tab.get_url()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn js_string_escapes_quotes() {
        assert_eq!(js_string(r#"input[name="q"]"#), r#""input[name=\"q\"]""#);
    }
}
