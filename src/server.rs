use crate::{
    config::Config,
    converter::Strategy,
    pipeline::Pipeline,
    policy::RenderPolicy,
    response::RenderResponse,
    source::SourceProvider,
    util::{CancelOnDrop, CancelToken},
};
use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub pipeline: Arc<Pipeline>,
    pub source: Arc<dyn SourceProvider>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/download-report", get(download_report))
        .route("/download-report-browser", get(download_report_browser))
        .route("/download-report-playwright", get(download_report_browser))
        .route("/download-report-static", get(download_report_static))
        .route("/download-report-test", get(download_report_test))
        .with_state(state)
}

pub async fn serve(state: AppState, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("waiting for ctrl-c: {err}");
            }
        })
        .await
        .with_context(|| "serving HTTP")
}

async fn download_report(State(state): State<AppState>) -> Response {
    let policy = RenderPolicy::from_config(&state.cfg);
    render(state, policy).await
}

async fn download_report_browser(State(state): State<AppState>) -> Response {
    render(state, RenderPolicy::only(&[Strategy::Browser])).await
}

async fn download_report_static(State(state): State<AppState>) -> Response {
    let path = static_path(&state.cfg, &state.cfg.document.static_file);
    match read_static(&path).await {
        Some(bytes) => {
            let download = format!("{}.pdf", state.cfg.document.name);
            RenderResponse::static_file(bytes, &download).into_response()
        }
        None => download_report(State(state)).await,
    }
}

async fn download_report_test(State(state): State<AppState>) -> Response {
    let path = static_path(&state.cfg, &state.cfg.document.test_file);
    match read_static(&path).await {
        Some(bytes) => {
            RenderResponse::static_file(bytes, &state.cfg.document.test_file).into_response()
        }
        None => RenderResponse::not_found(&format!(
            "Test PDF not found. Place a small PDF at {}/{} and retry.",
            state.cfg.paths.static_dir, state.cfg.document.test_file
        ))
        .into_response(),
    }
}

/// Run source + pipeline off the async runtime. If this future is dropped
/// (client disconnect) the guard cancels the token, which kills any child
/// process and aborts browser or embedded waits.
async fn render(state: AppState, policy: RenderPolicy) -> Response {
    let cancel = CancelToken::new();
    let _guard = CancelOnDrop::new(cancel.clone());

    let task = tokio::task::spawn_blocking(move || -> Result<RenderResponse> {
        let req = state.source.render_source()?;
        let run = state.pipeline.render(&req, &policy, &cancel);
        Ok(RenderResponse::build(&req, run.outcome))
    });

    match task.await {
        Ok(Ok(response)) => response.into_response(),
        Ok(Err(err)) => {
            error!("producing report source: {err:#}");
            RenderResponse::plain(StatusCode::INTERNAL_SERVER_ERROR, "Report unavailable.")
                .into_response()
        }
        Err(err) => {
            error!("render task failed: {err}");
            RenderResponse::plain(StatusCode::INTERNAL_SERVER_ERROR, "Report unavailable.")
                .into_response()
        }
    }
}

fn static_path(cfg: &Config, file: &str) -> PathBuf {
    PathBuf::from(&cfg.paths.static_dir).join(file)
}

async fn read_static(path: &std::path::Path) -> Option<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(bytes),
        Err(err) if err.kind() == ErrorKind::NotFound => None,
        Err(err) => {
            error!("reading {}: {err}", path.display());
            None
        }
    }
}
