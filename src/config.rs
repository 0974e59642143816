use crate::converter::Strategy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub document: Document,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub page: Page,
    #[serde(default)]
    pub locator: Locator,
    #[serde(default)]
    pub subprocess: Subprocess,
    #[serde(default)]
    pub embedded: Embedded,
    #[serde(default)]
    pub browser: Browser,
    #[serde(default)]
    pub chain: Chain,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub debug: Debug,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Document {
    /// Logical document name; output filenames derive from it.
    pub name: String,
    pub static_file: String,
    pub test_file: String,
}
impl Default for Document {
    fn default() -> Self {
        Self {
            name: "SageAlpha_CRH_Report".into(),
            static_file: "sagealpha_report.pdf".into(),
            test_file: "test_report.pdf".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub template: String,
    pub static_dir: String,
    pub out_dir: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            template: "templates/sagealpha_report.html".into(),
            static_dir: "static".into(),
            out_dir: "out".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Page {
    pub paper_size: String,
    pub margin_mm: f64,
}
impl Default for Page {
    fn default() -> Self {
        Self {
            paper_size: "A4".into(),
            margin_mm: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Locator {
    /// Explicit binary path; wins over candidates and PATH when executable.
    pub binary: String,
    pub binary_name: String,
    pub candidates: Vec<String>,
}
impl Default for Locator {
    fn default() -> Self {
        Self {
            binary: "".into(),
            binary_name: "wkhtmltopdf".into(),
            candidates: vec![
                "bin/wkhtmltopdf".into(),
                "/usr/local/bin/wkhtmltopdf".into(),
                "/usr/bin/wkhtmltopdf".into(),
                "/usr/bin/wkhtmltopdf-amd64".into(),
                "/usr/local/bin/wkhtmltox".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Subprocess {
    pub timeout_seconds: u64,
    pub page_args: bool,
    pub extra_args: Vec<String>,
}
impl Default for Subprocess {
    fn default() -> Self {
        Self {
            timeout_seconds: 60,
            page_args: true,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Embedded {
    pub enabled: bool,
    pub library_candidates: Vec<String>,
    pub timeout_seconds: u64,
}
impl Default for Embedded {
    fn default() -> Self {
        Self {
            enabled: true,
            library_candidates: vec![
                "/usr/local/lib/libwkhtmltox.so".into(),
                "/usr/lib/libwkhtmltox.so".into(),
            ],
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Browser {
    pub enabled: bool,
    pub chrome_path: String,
    pub no_sandbox: bool,
    pub timeout_seconds: u64,
}
impl Default for Browser {
    fn default() -> Self {
        Self {
            enabled: true,
            chrome_path: "".into(),
            no_sandbox: true,
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Chain {
    pub strategies: Vec<Strategy>,
}
impl Default for Chain {
    fn default() -> Self {
        Self {
            strategies: vec![Strategy::Embedded, Strategy::Subprocess, Strategy::Browser],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub bind: String,
}
impl Default for Server {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Debug {
    pub keep_converter_stderr: bool,
}
impl Default for Debug {
    fn default() -> Self {
        Self {
            keep_converter_stderr: true,
        }
    }
}
