use crate::{config::Config, pipeline::RenderRequest};
use anyhow::{Context, Result};
use std::path::PathBuf;

/// Produces the HTML to render. Templating lives behind this seam.
pub trait SourceProvider: Send + Sync {
    fn render_source(&self) -> Result<RenderRequest>;
}

/// Reads an already rendered HTML file from disk on every call.
pub struct TemplateFile {
    path: PathBuf,
    name: String,
}

impl TemplateFile {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(&cfg.paths.template, &cfg.document.name)
    }
}

impl SourceProvider for TemplateFile {
    fn render_source(&self) -> Result<RenderRequest> {
        let source = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading template: {}", self.path.display()))?;
        Ok(RenderRequest::new(source, self.name.clone()))
    }
}

/// Fixed in-memory source.
pub struct StaticSource(pub RenderRequest);

impl SourceProvider for StaticSource {
    fn render_source(&self) -> Result<RenderRequest> {
        Ok(self.0.clone())
    }
}
