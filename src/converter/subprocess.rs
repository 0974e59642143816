use super::{
    ConvertError, Converter, ConverterResult, Document, PageSetup, Strategy,
    process::{self, ChildOutput},
};
use crate::{config::Config, locate, util::CancelToken};
use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Drives the located converter binary as a child process: first over
/// stdin/stdout, then through a pair of temp files.
pub struct SubprocessConverter {
    cfg: Config,
    page: PageSetup,
}

impl SubprocessConverter {
    pub fn new(cfg: &Config) -> Self {
        Self {
            cfg: cfg.clone(),
            page: PageSetup::from_config(cfg),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.subprocess.timeout_seconds)
    }

    /// Convert with an already located binary.
    pub fn convert_with(
        &self,
        binary: &Path,
        source: &str,
        cancel: &CancelToken,
    ) -> ConverterResult {
        let piped = match self.piped(binary, source, cancel) {
            Ok(bytes) => {
                return Ok(Document {
                    bytes,
                    producer: Strategy::Subprocess,
                });
            }
            Err(ConvertError::Cancelled) => return Err(ConvertError::Cancelled),
            Err(err) => err,
        };
        warn!("piped attempt failed, trying temp files: {piped}");
        if let Some(stderr) = piped.stderr().filter(|s| !s.is_empty()) {
            warn!("piped attempt stderr: {stderr}");
        }

        match self.temp_files(binary, source, cancel) {
            Ok(bytes) => Ok(Document {
                bytes,
                producer: Strategy::Subprocess,
            }),
            Err(ConvertError::Cancelled) => Err(ConvertError::Cancelled),
            Err(temp_file) => {
                warn!("temp-file attempt failed: {temp_file}");
                if let Some(stderr) = temp_file.stderr().filter(|s| !s.is_empty()) {
                    warn!("temp-file attempt stderr: {stderr}");
                }
                Err(ConvertError::AttemptsExhausted {
                    piped: Box::new(piped),
                    temp_file: Box::new(temp_file),
                })
            }
        }
    }

    fn command(&self, binary: &Path) -> Command {
        let mut cmd = Command::new(binary);
        if self.cfg.subprocess.page_args {
            cmd.args(self.page.wkhtmltopdf_args());
        }
        cmd.args(&self.cfg.subprocess.extra_args);
        cmd
    }

    fn piped(&self, binary: &Path, source: &str, cancel: &CancelToken) -> Result<Vec<u8>, ConvertError> {
        let mut cmd = self.command(binary);
        cmd.arg("-").arg("-");
        let out = process::run(cmd, Some(source.as_bytes().to_vec()), self.timeout(), cancel)?;
        self.check_exit(binary, &out)?;
        if out.stdout.is_empty() {
            return Err(ConvertError::EmptyOutput);
        }
        Ok(out.stdout)
    }

    fn temp_files(
        &self,
        binary: &Path,
        source: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, ConvertError> {
        let mut input = TempArtifact::create(".html")?;
        input.write_all(source.as_bytes())?;
        let output = TempArtifact::create(".pdf")?;

        let mut cmd = self.command(binary);
        cmd.arg(input.path()).arg(output.path());
        let result = process::run(cmd, None, self.timeout(), cancel).and_then(|out| {
            self.check_exit(binary, &out)?;
            let bytes = std::fs::read(output.path())?;
            if bytes.is_empty() {
                return Err(ConvertError::EmptyOutput);
            }
            Ok(bytes)
        });

        input.close();
        output.close();
        result
    }

    fn check_exit(&self, binary: &Path, out: &ChildOutput) -> Result<(), ConvertError> {
        if !out.status.success() {
            return Err(ConvertError::ProcessExitedNonZero {
                program: binary.display().to_string(),
                status: out.status.to_string(),
                stderr: out.stderr_lossy(),
            });
        }
        if self.cfg.debug.keep_converter_stderr && !out.stderr.is_empty() {
            debug!("{} stderr: {}", binary.display(), out.stderr_lossy());
        }
        Ok(())
    }
}

impl Converter for SubprocessConverter {
    fn strategy(&self) -> Strategy {
        Strategy::Subprocess
    }

    fn convert(&self, source: &str, cancel: &CancelToken) -> ConverterResult {
        let Some(binary) = locate::locate(&self.cfg.locator) else {
            info!("no {} binary located", self.cfg.locator.binary_name);
            return Err(ConvertError::BinaryNotFound);
        };
        debug!("using {} ({:?})", binary.path.display(), binary.origin);
        self.convert_with(&binary.path, source, cancel)
    }
}

/// A temp file owned by a single subprocess attempt. The file is removed on
/// drop, so every exit path (including unwinding) cleans it up.
pub struct TempArtifact {
    file: NamedTempFile,
}

impl TempArtifact {
    pub fn create(suffix: &str) -> std::io::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("report-render-")
            .suffix(suffix)
            .tempfile()?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.file.write_all(bytes)?;
        self.file.flush()
    }

    /// Remove now, logging rather than failing if removal does not succeed.
    pub fn close(self) {
        let path = self.file.path().to_path_buf();
        if let Err(err) = self.file.close() {
            warn!("removing temp artifact {}: {err}", path.display());
        }
    }
}
