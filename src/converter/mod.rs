pub mod browser;
pub mod embedded;
pub mod process;
pub mod subprocess;

use crate::{config::Config, locate, util::CancelToken};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub use browser::BrowserConverter;
pub use embedded::{EmbeddedConverter, EmbeddedRuntime};
pub use subprocess::SubprocessConverter;

/// Conversion strategies, declared in chain priority order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Embedded,
    Subprocess,
    Browser,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [Strategy::Embedded, Strategy::Subprocess, Strategy::Browser];

    pub fn tag(self) -> &'static str {
        match self {
            Strategy::Embedded => "embedded",
            Strategy::Subprocess => "subprocess",
            Strategy::Browser => "browser",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A converted document. `bytes` is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub bytes: Vec<u8>,
    pub producer: Strategy,
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("no converter binary found")]
    BinaryNotFound,

    #[error("failed to spawn {program}: {source}")]
    ProcessSpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {seconds}s")]
    ProcessTimedOut {
        program: String,
        seconds: u64,
        stderr: String,
    },

    #[error("{program} exited with {status}")]
    ProcessExitedNonZero {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("converter produced no output")]
    EmptyOutput,

    #[error("embedded conversion library is unavailable")]
    LibraryUnavailable,

    #[error("browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("navigation failed: {0}")]
    NavigationFailed(String),

    #[error("render failed: {0}")]
    RenderFailed(String),

    #[error("temp artifact: {0}")]
    TempFile(#[from] std::io::Error),

    #[error("render cancelled")]
    Cancelled,

    #[error("piped attempt: {piped}; temp-file attempt: {temp_file}")]
    AttemptsExhausted {
        piped: Box<ConvertError>,
        temp_file: Box<ConvertError>,
    },
}

impl ConvertError {
    /// Captured stderr of the child process, when the failure carries one.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ConvertError::ProcessTimedOut { stderr, .. }
            | ConvertError::ProcessExitedNonZero { stderr, .. } => Some(stderr.as_str()),
            _ => None,
        }
    }
}

/// Exactly one of success or failure per invocation.
pub type ConverterResult = Result<Document, ConvertError>;

/// One conversion strategy in the fallback chain.
pub trait Converter: Send + Sync {
    fn strategy(&self) -> Strategy;

    /// Whether the capability this converter depends on was resolved at
    /// startup. Unavailable converters are skipped without being invoked.
    fn is_available(&self) -> bool {
        true
    }

    fn convert(&self, source: &str, cancel: &CancelToken) -> ConverterResult;
}

/// Paper size and margins shared by every strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct PageSetup {
    pub paper_size: String,
    pub margin_mm: f64,
}

impl PageSetup {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            paper_size: cfg.page.paper_size.clone(),
            margin_mm: cfg.page.margin_mm,
        }
    }

    pub fn margin(&self) -> String {
        format!("{}mm", self.margin_mm)
    }

    pub fn margin_inches(&self) -> f64 {
        self.margin_mm / 25.4
    }

    /// (width, height) in inches; unknown sizes fall back to A4.
    pub fn paper_inches(&self) -> (f64, f64) {
        match self.paper_size.to_ascii_uppercase().as_str() {
            "LETTER" => (8.5, 11.0),
            "LEGAL" => (8.5, 14.0),
            "A3" => (11.69, 16.54),
            "A5" => (5.83, 8.27),
            _ => (8.27, 11.69),
        }
    }

    pub fn wkhtmltopdf_args(&self) -> Vec<String> {
        let margin = self.margin();
        let mut args = vec![
            "--quiet".to_string(),
            "--page-size".to_string(),
            self.paper_size.clone(),
        ];
        for side in ["top", "bottom", "left", "right"] {
            args.push(format!("--margin-{side}"));
            args.push(margin.clone());
        }
        args.extend([
            "--encoding".to_string(),
            "UTF-8".to_string(),
            "--enable-local-file-access".to_string(),
        ]);
        args
    }
}

/// Optional capabilities resolved once at process start.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub embedded: Option<Arc<EmbeddedRuntime>>,
    pub browser: bool,
}

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn detect(cfg: &Config) -> Self {
        let embedded = if cfg.embedded.enabled {
            let located = locate::locate(&cfg.locator);
            let candidates = embedded::library_candidates(cfg, located.as_ref());
            EmbeddedRuntime::start(candidates).map(Arc::new)
        } else {
            None
        };
        let browser = cfg.browser.enabled && browser::COMPILED;
        info!(
            "capabilities embedded={} browser={}",
            embedded.is_some(),
            browser
        );
        Self { embedded, browser }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_args_carry_size_and_margins() {
        let page = PageSetup {
            paper_size: "A4".into(),
            margin_mm: 10.0,
        };
        let args = page.wkhtmltopdf_args();
        assert!(args.windows(2).any(|w| w[0] == "--page-size" && w[1] == "A4"));
        assert!(args.windows(2).any(|w| w[0] == "--margin-left" && w[1] == "10mm"));
        assert!(args.contains(&"--enable-local-file-access".to_string()));
    }

    #[test]
    fn unknown_paper_falls_back_to_a4() {
        let page = PageSetup {
            paper_size: "tabloid-ish".into(),
            margin_mm: 0.0,
        };
        assert_eq!(page.paper_inches(), (8.27, 11.69));
    }
}
