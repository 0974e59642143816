#![cfg(target_os = "linux")]

use report_render::{
    config::Config,
    converter::{ConvertError, Converter, EmbeddedConverter, EmbeddedRuntime, PageSetup},
    util::CancelToken,
};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// Minimal stand-in for libwkhtmltox. The source text steers its behaviour:
// "HANG" sleeps for 3s inside convert, "EMPTY" yields zero bytes, "FAIL"
// reports failure. Output echoes the configured paper size; a paper size of
// "REJECT" is refused. `stub_live_handles` counts settings not yet freed.
const STUB: &str = r#"
#include <stdlib.h>
#include <string.h>
#include <unistd.h>

typedef struct { char paper[32]; } gs_t;
typedef struct { int unused; } os_t;
typedef struct { gs_t *gs; os_t *os; char *html; char out[64]; int len; } conv_t;

static int live = 0;
int stub_live_handles(void) { return live; }

int wkhtmltopdf_init(int use_graphics) { (void)use_graphics; return 1; }
void *wkhtmltopdf_create_global_settings(void) { live++; return calloc(1, sizeof(gs_t)); }
void *wkhtmltopdf_create_object_settings(void) { live++; return calloc(1, sizeof(os_t)); }
void wkhtmltopdf_destroy_global_settings(void *gs) { live--; free(gs); }
void wkhtmltopdf_destroy_object_settings(void *os) { live--; free(os); }

int wkhtmltopdf_set_global_setting(void *gs, const char *name, const char *value) {
    if (strcmp(value, "REJECT") == 0) return 0;
    if (strcmp(name, "size.paperSize") == 0) {
        strncpy(((gs_t *)gs)->paper, value, 31);
    }
    return 1;
}
int wkhtmltopdf_set_object_setting(void *os, const char *name, const char *value) {
    (void)os; (void)name; (void)value;
    return 1;
}

void *wkhtmltopdf_create_converter(void *gs) {
    conv_t *c = calloc(1, sizeof(conv_t));
    c->gs = gs;
    return c;
}
void wkhtmltopdf_add_object(void *conv, void *os, const char *html) {
    conv_t *c = conv;
    c->os = os;
    c->html = strdup(html);
}
int wkhtmltopdf_convert(void *conv) {
    conv_t *c = conv;
    if (strstr(c->html, "HANG")) sleep(3);
    if (strstr(c->html, "FAIL")) return 0;
    if (strstr(c->html, "EMPTY")) { c->len = 0; return 1; }
    strcpy(c->out, "%PDF-stub ");
    strncat(c->out, c->gs->paper, 31);
    c->len = (int)strlen(c->out);
    return 1;
}
long wkhtmltopdf_get_output(void *conv, const unsigned char **data) {
    conv_t *c = conv;
    *data = (const unsigned char *)c->out;
    return c->len;
}
void wkhtmltopdf_destroy_converter(void *conv) {
    conv_t *c = conv;
    if (c->gs) { live--; free(c->gs); }
    if (c->os) { live--; free(c->os); }
    free(c->html);
    free(c);
}
"#;

/// Compile the stub into `dir`. `None` when no C compiler is installed.
fn build_stub(dir: &Path) -> Option<PathBuf> {
    let src = dir.join("stub.c");
    let lib = dir.join("libwkhtmltox.so");
    std::fs::write(&src, STUB).unwrap();
    for compiler in ["cc", "gcc", "clang"] {
        let status = Command::new(compiler)
            .args(["-shared", "-fPIC", "-o"])
            .arg(&lib)
            .arg(&src)
            .status();
        if matches!(status, Ok(s) if s.success()) {
            return Some(lib);
        }
    }
    eprintln!("no C compiler available; skipping embedded library test");
    None
}

fn page() -> PageSetup {
    PageSetup {
        paper_size: "A4".into(),
        margin_mm: 10.0,
    }
}

fn live_handles(lib: &Path) -> i32 {
    // SAFETY: the stub exports `int stub_live_handles(void)`; reopening the
    // same path returns the already loaded instance.
    unsafe {
        let lib = libloading::Library::new(lib).unwrap();
        let f: libloading::Symbol<unsafe extern "C" fn() -> i32> =
            lib.get(b"stub_live_handles\0").unwrap();
        f()
    }
}

fn runtime(dir: &TempDir) -> Option<Arc<EmbeddedRuntime>> {
    let lib = build_stub(dir.path())?;
    Some(Arc::new(
        EmbeddedRuntime::start(vec![lib]).expect("stub library loads"),
    ))
}

#[test]
fn successful_call_returns_library_output() {
    let dir = TempDir::new().unwrap();
    let Some(rt) = runtime(&dir) else { return };
    assert!(rt.library().ends_with("libwkhtmltox.so"));

    let mut cfg = Config::default();
    cfg.page.paper_size = "Letter".into();
    let conv = EmbeddedConverter::new(&cfg, Some(rt));
    assert!(conv.is_available());
    let doc = conv
        .convert("<p>report</p>", &CancelToken::new())
        .expect("embedded conversion");
    assert_eq!(doc.bytes, b"%PDF-stub Letter");
}

#[test]
fn zero_length_output_is_a_failure() {
    let dir = TempDir::new().unwrap();
    let Some(rt) = runtime(&dir) else { return };
    let conv = EmbeddedConverter::new(&Config::default(), Some(rt));
    let err = conv.convert("<p>EMPTY</p>", &CancelToken::new()).unwrap_err();
    assert!(matches!(err, ConvertError::EmptyOutput));
}

#[test]
fn rejected_setting_frees_settings_handles() {
    let dir = TempDir::new().unwrap();
    let Some(lib) = build_stub(dir.path()) else { return };
    let rt = EmbeddedRuntime::start(vec![lib.clone()]).expect("stub library loads");

    let ok = rt.convert("<p>x</p>", &page(), Duration::from_secs(5), &CancelToken::new());
    assert!(ok.is_ok());
    assert_eq!(live_handles(&lib), 0);

    let rejected = PageSetup {
        paper_size: "REJECT".into(),
        margin_mm: 10.0,
    };
    let err = rt
        .convert("<p>x</p>", &rejected, Duration::from_secs(5), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, ConvertError::RenderFailed(_)));
    assert_eq!(live_handles(&lib), 0);
}

#[test]
fn library_failure_is_reported() {
    let dir = TempDir::new().unwrap();
    let Some(rt) = runtime(&dir) else { return };
    let err = rt
        .convert("<p>FAIL</p>", &page(), Duration::from_secs(5), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, ConvertError::RenderFailed(_)));
}

#[test]
fn hung_call_is_bounded_and_later_calls_fail_fast() {
    let dir = TempDir::new().unwrap();
    let Some(rt) = runtime(&dir) else { return };
    let cancel = CancelToken::new();

    let started = Instant::now();
    let err = rt
        .convert("<p>HANG</p>", &page(), Duration::from_secs(1), &cancel)
        .unwrap_err();
    assert!(matches!(err, ConvertError::ProcessTimedOut { .. }));
    assert!(started.elapsed() < Duration::from_secs(2));

    // The worker is still inside the hung call: no queueing behind it.
    assert!(!rt.is_ready());
    let started = Instant::now();
    let err = rt
        .convert("<p>quick</p>", &page(), Duration::from_secs(1), &cancel)
        .unwrap_err();
    assert!(matches!(err, ConvertError::LibraryUnavailable));
    assert!(started.elapsed() < Duration::from_millis(200));

    let conv = EmbeddedConverter::new(&Config::default(), Some(Arc::clone(&rt)));
    assert!(!conv.is_available());

    // Once the abandoned call returns, work is accepted again.
    let deadline = Instant::now() + Duration::from_secs(10);
    while !rt.is_ready() {
        assert!(Instant::now() < deadline, "worker never recovered");
        std::thread::sleep(Duration::from_millis(50));
    }
    let bytes = rt
        .convert("<p>quick</p>", &page(), Duration::from_secs(1), &cancel)
        .expect("conversion after recovery");
    assert_eq!(bytes, b"%PDF-stub A4");
}

#[test]
fn cancellation_stops_the_wait() {
    let dir = TempDir::new().unwrap();
    let Some(rt) = runtime(&dir) else { return };
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        trigger.cancel();
    });

    let started = Instant::now();
    let err = rt
        .convert("<p>HANG</p>", &page(), Duration::from_secs(30), &cancel)
        .unwrap_err();
    canceller.join().unwrap();
    assert!(matches!(err, ConvertError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2));
}
