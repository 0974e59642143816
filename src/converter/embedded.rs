//! In-process conversion through the wkhtmltox C library.
//!
//! The library is opened at startup with `libloading`; when it is missing the
//! converter is disabled for the life of the process. wkhtmltox must be
//! initialised and driven from a single thread, so the library lives on a
//! dedicated worker thread and conversions are sent to it over a channel.

use super::{ConvertError, Converter, ConverterResult, Document, PageSetup, Strategy};
use crate::{config::Config, locate::LocatedBinary, util::CancelToken};
use libloading::Library;
use std::ffi::{CString, c_char, c_int, c_long, c_uchar, c_void};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub struct EmbeddedConverter {
    runtime: Option<Arc<EmbeddedRuntime>>,
    page: PageSetup,
    timeout: Duration,
}

impl EmbeddedConverter {
    pub fn new(cfg: &Config, runtime: Option<Arc<EmbeddedRuntime>>) -> Self {
        Self {
            runtime,
            page: PageSetup::from_config(cfg),
            timeout: Duration::from_secs(cfg.embedded.timeout_seconds),
        }
    }
}

impl Converter for EmbeddedConverter {
    fn strategy(&self) -> Strategy {
        Strategy::Embedded
    }

    fn is_available(&self) -> bool {
        self.runtime.as_ref().is_some_and(|rt| rt.is_ready())
    }

    fn convert(&self, source: &str, cancel: &CancelToken) -> ConverterResult {
        let Some(runtime) = &self.runtime else {
            return Err(ConvertError::LibraryUnavailable);
        };
        let bytes = runtime.convert(source, &self.page, self.timeout, cancel)?;
        if bytes.is_empty() {
            return Err(ConvertError::EmptyOutput);
        }
        Ok(Document {
            bytes,
            producer: Strategy::Embedded,
        })
    }
}

/// Library search order: configured candidates, the platform default name, then
/// `../lib/` beside the located converter binary.
pub fn library_candidates(cfg: &Config, located: Option<&LocatedBinary>) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = cfg
        .embedded
        .library_candidates
        .iter()
        .filter(|s| !s.trim().is_empty())
        .map(|s| crate::util::expand_tilde(s.trim()))
        .collect();
    out.push(PathBuf::from(libloading::library_filename("wkhtmltox")));
    if let Some(bin) = located {
        if let Some(prefix) = bin.path.parent().and_then(|p| p.parent()) {
            out.push(
                prefix
                    .join("lib")
                    .join(libloading::library_filename("wkhtmltox")),
            );
        }
    }
    out
}

/// Lifecycle of one submitted job, shared by the caller and the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Queued,
    Running,
    Abandoned,
    Finished,
}

struct Job {
    html: String,
    page: PageSetup,
    state: Arc<Mutex<JobState>>,
    reply: SyncSender<Result<Vec<u8>, String>>,
}

/// Handle to the worker thread that owns the loaded library.
pub struct EmbeddedRuntime {
    jobs: mpsc::Sender<Job>,
    library: PathBuf,
    // Set while the worker is still inside a call whose caller gave up.
    wedged: Arc<AtomicBool>,
}

impl EmbeddedRuntime {
    /// Load the library on a fresh worker thread. `None` when no candidate
    /// could be opened and initialised.
    pub fn start(candidates: Vec<PathBuf>) -> Option<Self> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>();
        let wedged = Arc::new(AtomicBool::new(false));
        let worker_wedged = Arc::clone(&wedged);

        let spawned = std::thread::Builder::new()
            .name("wkhtmltox".into())
            .spawn(move || {
                let lib = match Wkhtmltox::open_any(&candidates) {
                    Ok(lib) => lib,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(lib.path.clone()));
                for job in jobs_rx {
                    run_job(&lib, job, &worker_wedged);
                }
            });
        if let Err(err) = spawned {
            warn!("spawning wkhtmltox worker: {err}");
            return None;
        }

        match ready_rx.recv() {
            Ok(Ok(library)) => {
                info!("embedded library loaded: {}", library.display());
                Some(Self {
                    jobs: jobs_tx,
                    library,
                    wedged,
                })
            }
            Ok(Err(err)) => {
                debug!("embedded library unavailable: {err}");
                None
            }
            Err(_) => None,
        }
    }

    pub fn library(&self) -> &Path {
        &self.library
    }

    /// False while the worker is stuck in a call that already timed out.
    /// New jobs are refused until that call returns.
    pub fn is_ready(&self) -> bool {
        !self.wedged.load(Ordering::SeqCst)
    }

    /// Submit one conversion and wait for it, bounded by `timeout` and
    /// `cancel`. An in-process call cannot be killed: on timeout the worker
    /// finishes the job in the background, its result is discarded, and the
    /// runtime refuses work until it does.
    pub fn convert(
        &self,
        html: &str,
        page: &PageSetup,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, ConvertError> {
        if !self.is_ready() {
            warn!("embedded worker still busy with an abandoned call; skipping");
            return Err(ConvertError::LibraryUnavailable);
        }

        let state = Arc::new(Mutex::new(JobState::Queued));
        let (reply, rx) = mpsc::sync_channel(1);
        self.jobs
            .send(Job {
                html: html.to_string(),
                page: page.clone(),
                state: Arc::clone(&state),
                reply,
            })
            .map_err(|_| ConvertError::LibraryUnavailable)?;

        let start = Instant::now();
        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(result) => return result.map_err(ConvertError::RenderFailed),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ConvertError::RenderFailed("embedded worker exited".into()));
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
            let err = if cancel.is_cancelled() {
                ConvertError::Cancelled
            } else if start.elapsed() > timeout {
                ConvertError::ProcessTimedOut {
                    program: self.library.display().to_string(),
                    seconds: timeout.as_secs(),
                    stderr: String::new(),
                }
            } else {
                continue;
            };
            if self.abandon(&state) {
                // Finished between the last poll and the abandon.
                if let Ok(result) = rx.try_recv() {
                    return result.map_err(ConvertError::RenderFailed);
                }
            }
            return Err(err);
        }
    }

    /// Mark a job abandoned. Returns true if it had already finished.
    fn abandon(&self, state: &Mutex<JobState>) -> bool {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            JobState::Finished => true,
            JobState::Running => {
                warn!("embedded call outlived its caller; refusing work until it returns");
                self.wedged.store(true, Ordering::SeqCst);
                *state = JobState::Abandoned;
                false
            }
            JobState::Queued | JobState::Abandoned => {
                *state = JobState::Abandoned;
                false
            }
        }
    }
}

fn run_job(lib: &Wkhtmltox, job: Job, wedged: &AtomicBool) {
    {
        let mut state = job.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == JobState::Abandoned {
            debug!("skipping abandoned embedded job");
            return;
        }
        *state = JobState::Running;
    }

    let result = lib.convert(&job.html, &job.page);

    let mut state = job.state.lock().unwrap_or_else(PoisonError::into_inner);
    if *state == JobState::Abandoned {
        info!("abandoned embedded call returned; accepting work again");
        wedged.store(false, Ordering::SeqCst);
    }
    *state = JobState::Finished;
    drop(state);
    let _ = job.reply.send(result);
}

type Handle = *mut c_void;

struct Wkhtmltox {
    path: PathBuf,
    init: unsafe extern "C" fn(c_int) -> c_int,
    create_global_settings: unsafe extern "C" fn() -> Handle,
    create_object_settings: unsafe extern "C" fn() -> Handle,
    set_global_setting: unsafe extern "C" fn(Handle, *const c_char, *const c_char) -> c_int,
    set_object_setting: unsafe extern "C" fn(Handle, *const c_char, *const c_char) -> c_int,
    create_converter: unsafe extern "C" fn(Handle) -> Handle,
    destroy_converter: unsafe extern "C" fn(Handle),
    add_object: unsafe extern "C" fn(Handle, Handle, *const c_char),
    run: unsafe extern "C" fn(Handle) -> c_int,
    get_output: unsafe extern "C" fn(Handle, *mut *const c_uchar) -> c_long,
    // Older builds do not export these; settings then leak on the error paths.
    destroy_global_settings: Option<unsafe extern "C" fn(Handle)>,
    destroy_object_settings: Option<unsafe extern "C" fn(Handle)>,
    // Must outlive every function pointer above.
    _lib: Library,
}

impl Wkhtmltox {
    fn open_any(candidates: &[PathBuf]) -> Result<Self, String> {
        let mut last = String::from("no library candidates");
        for path in candidates {
            match Self::open(path) {
                Ok(lib) => return Ok(lib),
                Err(err) => {
                    debug!("wkhtmltox candidate {}: {err}", path.display());
                    last = err;
                }
            }
        }
        Err(last)
    }

    fn open(path: &Path) -> Result<Self, String> {
        // SAFETY: loading wkhtmltox runs no initialisers beyond its own; the
        // symbol signatures below match its public pdf.h.
        unsafe {
            let lib = Library::new(path).map_err(|e| e.to_string())?;
            let api = Self {
                path: path.to_path_buf(),
                init: sym(&lib, "wkhtmltopdf_init")?,
                create_global_settings: sym(&lib, "wkhtmltopdf_create_global_settings")?,
                create_object_settings: sym(&lib, "wkhtmltopdf_create_object_settings")?,
                set_global_setting: sym(&lib, "wkhtmltopdf_set_global_setting")?,
                set_object_setting: sym(&lib, "wkhtmltopdf_set_object_setting")?,
                create_converter: sym(&lib, "wkhtmltopdf_create_converter")?,
                destroy_converter: sym(&lib, "wkhtmltopdf_destroy_converter")?,
                add_object: sym(&lib, "wkhtmltopdf_add_object")?,
                run: sym(&lib, "wkhtmltopdf_convert")?,
                get_output: sym(&lib, "wkhtmltopdf_get_output")?,
                destroy_global_settings: sym(&lib, "wkhtmltopdf_destroy_global_settings").ok(),
                destroy_object_settings: sym(&lib, "wkhtmltopdf_destroy_object_settings").ok(),
                _lib: lib,
            };
            if (api.init)(0) != 1 {
                return Err("wkhtmltopdf_init failed".into());
            }
            Ok(api)
        }
    }

    fn convert(&self, html: &str, page: &PageSetup) -> Result<Vec<u8>, String> {
        let html = CString::new(html).map_err(|_| "source contains a NUL byte".to_string())?;
        let margin = page.margin();
        let global: [(&str, &str); 5] = [
            ("size.paperSize", page.paper_size.as_str()),
            ("margin.top", margin.as_str()),
            ("margin.bottom", margin.as_str()),
            ("margin.left", margin.as_str()),
            ("margin.right", margin.as_str()),
        ];
        let object: [(&str, &str); 2] = [
            ("web.defaultEncoding", "utf-8"),
            ("load.blockLocalFileAccess", "false"),
        ];

        // SAFETY: handles come from this library and are used on the thread
        // that initialised it. Settings are owned by the converter once added,
        // and the output buffer is copied before the converter is destroyed.
        unsafe {
            let gs = (self.create_global_settings)();
            if gs.is_null() {
                return Err("create_global_settings returned null".into());
            }
            if let Err(err) = global.iter().try_for_each(|(k, v)| set(self.set_global_setting, gs, k, v)) {
                free(self.destroy_global_settings, gs);
                return Err(err);
            }
            let os = (self.create_object_settings)();
            if os.is_null() {
                free(self.destroy_global_settings, gs);
                return Err("create_object_settings returned null".into());
            }
            if let Err(err) = object.iter().try_for_each(|(k, v)| set(self.set_object_setting, os, k, v)) {
                free(self.destroy_object_settings, os);
                free(self.destroy_global_settings, gs);
                return Err(err);
            }

            // From here the converter owns both settings handles.
            let conv = (self.create_converter)(gs);
            if conv.is_null() {
                free(self.destroy_object_settings, os);
                free(self.destroy_global_settings, gs);
                return Err("create_converter returned null".into());
            }
            (self.add_object)(conv, os, html.as_ptr());
            let ok = (self.run)(conv);

            let mut data: *const c_uchar = std::ptr::null();
            let len = (self.get_output)(conv, &mut data);
            let bytes = if ok == 1 && len > 0 && !data.is_null() {
                std::slice::from_raw_parts(data, len as usize).to_vec()
            } else {
                Vec::new()
            };
            (self.destroy_converter)(conv);

            if ok != 1 {
                return Err("wkhtmltopdf_convert reported failure".into());
            }
            Ok(bytes)
        }
    }
}

unsafe fn free(destroy: Option<unsafe extern "C" fn(Handle)>, handle: Handle) {
    if let Some(destroy) = destroy {
        // SAFETY: handle is a live settings handle not yet owned by a converter.
        unsafe { destroy(handle) };
    }
}

unsafe fn sym<T: Copy>(lib: &Library, name: &str) -> Result<T, String> {
    let mut symbol = name.as_bytes().to_vec();
    symbol.push(0);
    // SAFETY: T is the documented signature of `name`.
    let found: libloading::Symbol<T> =
        unsafe { lib.get(&symbol) }.map_err(|e| format!("{name}: {e}"))?;
    Ok(*found)
}

unsafe fn set(
    f: unsafe extern "C" fn(Handle, *const c_char, *const c_char) -> c_int,
    handle: Handle,
    key: &str,
    value: &str,
) -> Result<(), String> {
    let k = CString::new(key).map_err(|e| e.to_string())?;
    let v = CString::new(value).map_err(|e| e.to_string())?;
    // SAFETY: caller passes a live settings handle from the same library.
    if unsafe { f(handle, k.as_ptr(), v.as_ptr()) } != 1 {
        return Err(format!("rejected setting {key}={value}"));
    }
    Ok(())
}
