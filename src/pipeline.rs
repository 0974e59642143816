use crate::{
    config::Config,
    converter::{
        BrowserConverter, Capabilities, ConvertError, Converter, Document, EmbeddedConverter,
        Strategy, SubprocessConverter,
    },
    policy::RenderPolicy,
    report::{AttemptReport, AttemptStatus, RenderReport},
    util::{CancelToken, now_rfc3339, sha256_hex},
};
use std::time::Instant;
use tracing::{debug, info, info_span, warn};

/// One render: the source document and the logical name used for filenames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    pub source: String,
    pub name: String,
}

impl RenderRequest {
    pub fn new(source: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
        }
    }

    /// Short id for log correlation only.
    pub fn render_id(&self) -> String {
        let mut key = Vec::with_capacity(self.name.len() + self.source.len() + 1);
        key.extend_from_slice(self.name.as_bytes());
        key.push(0);
        key.extend_from_slice(self.source.as_bytes());
        sha256_hex(&key)[..12].to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    Converted(Document),
    /// Every eligible strategy failed; the caller serves the source itself.
    Passthrough,
}

#[derive(Debug, Clone)]
pub struct RenderRun {
    pub outcome: RenderOutcome,
    pub report: RenderReport,
}

/// The ordered fallback chain. Never fails: the worst case is passthrough.
pub struct Pipeline {
    chain: Vec<Box<dyn Converter>>,
}

impl Pipeline {
    pub fn new(cfg: &Config, caps: &Capabilities) -> Self {
        Self::with_converters(vec![
            Box::new(EmbeddedConverter::new(cfg, caps.embedded.clone())),
            Box::new(SubprocessConverter::new(cfg)),
            Box::new(BrowserConverter::new(cfg, caps.browser)),
        ])
    }

    /// Build a chain from arbitrary converters; they are ordered by strategy
    /// priority regardless of the order given.
    pub fn with_converters(mut chain: Vec<Box<dyn Converter>>) -> Self {
        chain.sort_by_key(|c| c.strategy());
        Self { chain }
    }

    pub fn converters(&self) -> impl Iterator<Item = &dyn Converter> {
        self.chain.iter().map(|c| c.as_ref())
    }

    pub fn render(&self, req: &RenderRequest, policy: &RenderPolicy, cancel: &CancelToken) -> RenderRun {
        let render_id = req.render_id();
        let span = info_span!("render", id = %render_id, name = %req.name);
        let _enter = span.enter();

        let started = now_rfc3339();
        let mut attempts = Vec::with_capacity(self.chain.len());
        let mut outcome = RenderOutcome::Passthrough;

        for conv in &self.chain {
            let strategy = conv.strategy();
            if !policy.allows(strategy) {
                attempts.push(skipped(strategy, AttemptStatus::Ineligible, None));
                continue;
            }
            if !conv.is_available() {
                debug!("{strategy} unavailable; skipping");
                attempts.push(skipped(
                    strategy,
                    AttemptStatus::Unavailable,
                    Some(ConvertError::LibraryUnavailable.to_string()),
                ));
                continue;
            }
            if cancel.is_cancelled() {
                warn!("render cancelled before {strategy}");
                break;
            }

            let t0 = Instant::now();
            let result = conv.convert(&req.source, cancel);
            let elapsed_ms = t0.elapsed().as_millis() as u64;
            match result {
                Ok(doc) if !doc.bytes.is_empty() => {
                    info!("{strategy} produced {} bytes in {elapsed_ms}ms", doc.bytes.len());
                    attempts.push(AttemptReport {
                        strategy,
                        status: AttemptStatus::Succeeded,
                        reason: None,
                        elapsed_ms,
                    });
                    outcome = RenderOutcome::Converted(doc);
                    break;
                }
                Ok(_) => {
                    warn!("{strategy} returned an empty document");
                    attempts.push(AttemptReport {
                        strategy,
                        status: AttemptStatus::Failed,
                        reason: Some(ConvertError::EmptyOutput.to_string()),
                        elapsed_ms,
                    });
                }
                Err(err) => {
                    if matches!(err, ConvertError::BinaryNotFound) {
                        info!("{strategy} skipped: {err}");
                    } else {
                        warn!("{strategy} failed after {elapsed_ms}ms: {err}");
                    }
                    attempts.push(AttemptReport {
                        strategy,
                        status: AttemptStatus::Failed,
                        reason: Some(err.to_string()),
                        elapsed_ms,
                    });
                }
            }
        }

        let producer = match &outcome {
            RenderOutcome::Converted(doc) => Some(doc.producer),
            RenderOutcome::Passthrough => {
                warn!("no strategy produced a document; passing source through");
                None
            }
        };

        RenderRun {
            outcome,
            report: RenderReport {
                render_id,
                name: req.name.clone(),
                started,
                finished: now_rfc3339(),
                producer,
                attempts,
            },
        }
    }
}

fn skipped(
    strategy: Strategy,
    status: AttemptStatus,
    reason: Option<String>,
) -> AttemptReport {
    AttemptReport {
        strategy,
        status,
        reason,
        elapsed_ms: 0,
    }
}
