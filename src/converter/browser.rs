use super::{ConvertError, Converter, ConverterResult, PageSetup, Strategy};
use crate::{config::Config, util::CancelToken};
use std::time::Duration;

/// Whether headless browser support was compiled in.
pub const COMPILED: bool = cfg!(feature = "browser");

/// Prints the source through a headless Chromium session.
#[cfg_attr(not(feature = "browser"), allow(dead_code))]
pub struct BrowserConverter {
    enabled: bool,
    chrome_path: String,
    no_sandbox: bool,
    page: PageSetup,
    timeout: Duration,
}

impl BrowserConverter {
    pub fn new(cfg: &Config, enabled: bool) -> Self {
        Self {
            enabled,
            chrome_path: cfg.browser.chrome_path.clone(),
            no_sandbox: cfg.browser.no_sandbox,
            page: PageSetup::from_config(cfg),
            timeout: Duration::from_secs(cfg.browser.timeout_seconds),
        }
    }
}

impl Converter for BrowserConverter {
    fn strategy(&self) -> Strategy {
        Strategy::Browser
    }

    fn is_available(&self) -> bool {
        self.enabled && COMPILED
    }

    fn convert(&self, source: &str, cancel: &CancelToken) -> ConverterResult {
        if !self.is_available() {
            return Err(ConvertError::LibraryUnavailable);
        }
        if cancel.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }
        let bytes = session::print(self, source, cancel)?;
        if bytes.is_empty() {
            return Err(ConvertError::EmptyOutput);
        }
        Ok(super::Document {
            bytes,
            producer: Strategy::Browser,
        })
    }
}

#[cfg(feature = "browser")]
mod session {
    use super::BrowserConverter;
    use crate::converter::ConvertError;
    use crate::util::CancelToken;
    use headless_chrome::protocol::cdp::Page;
    use headless_chrome::{Browser, LaunchOptions, types::PrintToPdfOptions};
    use std::path::PathBuf;
    use std::time::{Duration, Instant};
    use tracing::{debug, warn};

    // Resolves once the document has loaded and web fonts and every pending
    // <img> have settled.
    const SETTLE_SCRIPT: &str = r#"
        (document.readyState === "complete"
            ? Promise.resolve()
            : new Promise((done) => window.addEventListener("load", done, { once: true }))
        ).then(() => Promise.all([
            document.fonts ? document.fonts.ready : Promise.resolve(),
            ...Array.from(document.images)
                .filter((img) => !img.complete)
                .map((img) => new Promise((done) => { img.onload = img.onerror = done; })),
        ])).then(() => true)
    "#;

    /// Launch, load, settle, print. The browser is dropped (and its process
    /// killed) on every return path.
    pub(super) fn print(
        conv: &BrowserConverter,
        source: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, ConvertError> {
        let deadline = Instant::now() + conv.timeout;
        let remaining = || {
            deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
                .ok_or_else(|| ConvertError::ProcessTimedOut {
                    program: "chromium".into(),
                    seconds: conv.timeout.as_secs(),
                    stderr: String::new(),
                })
        };
        let checkpoint = || -> Result<Duration, ConvertError> {
            if cancel.is_cancelled() {
                return Err(ConvertError::Cancelled);
            }
            remaining()
        };

        let path = Some(conv.chrome_path.trim())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        // sandbox(false) makes the launcher pass --no-sandbox.
        let options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(!conv.no_sandbox)
            .path(path)
            .idle_browser_timeout(conv.timeout)
            .build()
            .map_err(|e| ConvertError::BrowserLaunchFailed(e.to_string()))?;

        let browser =
            Browser::new(options).map_err(|e| ConvertError::BrowserLaunchFailed(e.to_string()))?;
        let tab = browser
            .new_tab()
            .map_err(|e| ConvertError::BrowserLaunchFailed(e.to_string()))?;

        // Chromium caps data: URLs at 2 MiB; write into a blank page instead.
        tab.set_default_timeout(checkpoint()?);
        tab.navigate_to("about:blank")
            .and_then(|t| t.wait_until_navigated())
            .map_err(|e| ConvertError::NavigationFailed(e.to_string()))?;
        let frame_id = tab
            .call_method(Page::GetFrameTree(None))
            .map_err(|e| ConvertError::NavigationFailed(e.to_string()))?
            .frame_tree
            .frame
            .id;
        tab.call_method(Page::SetDocumentContent {
            frame_id,
            html: source.to_string(),
        })
        .map_err(|e| ConvertError::NavigationFailed(e.to_string()))?;

        tab.set_default_timeout(checkpoint()?);
        if let Err(err) = tab.evaluate(SETTLE_SCRIPT, true) {
            // Print whatever has loaded.
            warn!("waiting for page assets: {err}");
        }

        tab.set_default_timeout(checkpoint()?);
        let (paper_width, paper_height) = conv.page.paper_inches();
        let margin = conv.page.margin_inches();
        let pdf = tab
            .print_to_pdf(Some(PrintToPdfOptions {
                landscape: Some(false),
                print_background: Some(true),
                paper_width: Some(paper_width),
                paper_height: Some(paper_height),
                margin_top: Some(margin),
                margin_bottom: Some(margin),
                margin_left: Some(margin),
                margin_right: Some(margin),
                ..Default::default()
            }))
            .map_err(|e| ConvertError::RenderFailed(e.to_string()))?;

        debug!("browser printed {} bytes", pdf.len());
        drop(tab);
        drop(browser);
        Ok(pdf)
    }
}

#[cfg(not(feature = "browser"))]
mod session {
    use super::BrowserConverter;
    use crate::converter::ConvertError;
    use crate::util::CancelToken;

    pub(super) fn print(
        _conv: &BrowserConverter,
        _source: &str,
        _cancel: &CancelToken,
    ) -> Result<Vec<u8>, ConvertError> {
        Err(ConvertError::LibraryUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_browser_is_skipped() {
        let conv = BrowserConverter::new(&Config::default(), false);
        assert!(!conv.is_available());
        let err = conv.convert("<p>x</p>", &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ConvertError::LibraryUnavailable));
    }
}
