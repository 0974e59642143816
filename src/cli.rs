use crate::{
    config::Config,
    converter::{Capabilities, Strategy},
    locate,
    pipeline::{Pipeline, RenderRequest},
    policy::RenderPolicy,
    response::RenderResponse,
    server::{self, AppState},
    source::TemplateFile,
    util::{CancelToken, ensure_dir},
};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "report-render")]
#[command(about = "Render an HTML report to PDF through a chain of fallback converters")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./report-render.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Report which strategies this host can run.
    Doctor {},
    /// Render one HTML file.
    Render {
        #[arg(long)]
        input: PathBuf,
        /// Logical document name; defaults to document.name from config.
        #[arg(long)]
        name: Option<String>,
        /// Output file; defaults to <paths.out_dir>/<generated filename>.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Restrict the chain to these strategies (repeatable).
        #[arg(long = "strategy", value_enum)]
        strategies: Vec<Strategy>,
    },
    /// Serve the report endpoints over HTTP.
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg = match resolve_config_path(args.config.as_deref()) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    let _guard = init_logging(&args, &cfg)?;

    match &args.cmd {
        Command::Doctor {} => doctor(&cfg),
        Command::Render {
            input,
            name,
            out,
            strategies,
        } => render(&cfg, input, name.as_deref(), out.as_deref(), strategies),
        Command::Serve { bind } => serve(&cfg, bind.as_deref()),
    }
}

fn resolve_config_path(user: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = user {
        return Some(p.to_path_buf());
    }
    ["report-render.toml", "report-render.example.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

fn init_logging(args: &Args, cfg: &Config) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file_layer, guard) = if cfg.logging.write_to_file {
        let path = resolve_log_path(cfg);
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::File::create(&path)
            .with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> PathBuf {
    if !cfg.logging.file_path.is_empty() {
        return PathBuf::from(&cfg.logging.file_path);
    }
    PathBuf::from(&cfg.paths.out_dir).join("report-render.log")
}

fn doctor(cfg: &Config) -> Result<()> {
    let caps = Capabilities::detect(cfg);
    let located = locate::locate(&cfg.locator);
    let policy = RenderPolicy::from_config(cfg);
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "binary": located,
            "embedded": {
                "enabled": cfg.embedded.enabled,
                "library": caps.embedded.as_ref().map(|rt| rt.library().display().to_string()),
            },
            "browser": {
                "compiled": crate::converter::browser::COMPILED,
                "enabled": caps.browser,
            },
            "chain": policy.eligible,
        }))?
    );
    Ok(())
}

fn render(
    cfg: &Config,
    input: &Path,
    name: Option<&str>,
    out: Option<&Path>,
    strategies: &[Strategy],
) -> Result<()> {
    let source = std::fs::read_to_string(input)
        .with_context(|| format!("reading input: {}", input.display()))?;
    let req = RenderRequest::new(source, name.unwrap_or(cfg.document.name.as_str()));

    let policy = if strategies.is_empty() {
        RenderPolicy::from_config(cfg)
    } else {
        RenderPolicy::only(strategies)
    };

    let caps = Capabilities::detect(cfg);
    let pipeline = Pipeline::new(cfg, &caps);
    let run = pipeline.render(&req, &policy, &CancelToken::new());
    let report = run.report;
    let response = RenderResponse::build(&req, run.outcome);

    let out_path = match out {
        Some(p) => p.to_path_buf(),
        None => {
            let dir = PathBuf::from(&cfg.paths.out_dir);
            ensure_dir(&dir)?;
            dir.join(response.filename().unwrap_or("document"))
        }
    };
    std::fs::write(&out_path, &response.body)
        .with_context(|| format!("writing output: {}", out_path.display()))?;
    info!("wrote {} ({} bytes)", out_path.display(), response.body.len());

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "output": out_path,
            "generated": response.generated,
            "report": report,
        }))?
    );
    Ok(())
}

fn serve(cfg: &Config, bind: Option<&str>) -> Result<()> {
    let bind = bind.unwrap_or(cfg.server.bind.as_str()).to_string();
    let caps = Capabilities::detect(cfg);
    let state = AppState {
        cfg: Arc::new(cfg.clone()),
        pipeline: Arc::new(Pipeline::new(cfg, &caps)),
        source: Arc::new(TemplateFile::from_config(cfg)),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "building tokio runtime")?;
    runtime.block_on(server::serve(state, &bind))
}
