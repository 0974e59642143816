use super::ConvertError;
use crate::util::CancelToken;
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
// Pipes inherited by grandchildren can stay open after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct ChildOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ChildOutput {
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Spawn `cmd`, optionally feed `stdin`, and collect its output.
///
/// Sequencing is spawn, write input, drain output, wait for exit. The wait is
/// bounded by `timeout`; on timeout or cancellation the child is killed and
/// reaped before returning.
pub fn run(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<ChildOutput, ConvertError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    if cancel.is_cancelled() {
        return Err(ConvertError::Cancelled);
    }

    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // Own process group, so a kill also reaches whatever the binary spawned
    // (wrapper scripts around xvfb-run and the like).
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

    let mut child = cmd
        .spawn()
        .map_err(|source| ConvertError::ProcessSpawnFailed {
            program: program.clone(),
            source,
        })?;
    debug!("spawned {} pid={}", program, child.id());

    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // Written off-thread so a child that emits output before consuming all
        // input cannot deadlock against us. Dropping the pipe closes stdin.
        std::thread::spawn(move || {
            if let Err(err) = pipe.write_all(&bytes) {
                debug!("writing child stdin: {err}");
            }
        });
    }

    let stdout_rx = drain(child.stdout.take());
    let stderr_rx = drain(child.stderr.take());

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(ChildOutput {
                    status,
                    stdout: collect(&stdout_rx),
                    stderr: collect(&stderr_rx),
                });
            }
            Ok(None) => {}
            Err(err) => {
                warn!("try_wait on {program} failed: {err}");
                kill(&mut child, &program);
                return Err(ConvertError::ProcessSpawnFailed {
                    program,
                    source: err,
                });
            }
        }

        if cancel.is_cancelled() {
            warn!("cancelling {program}");
            kill(&mut child, &program);
            return Err(ConvertError::Cancelled);
        }

        if start.elapsed() > timeout {
            warn!("{program} timed out after {:?}", timeout);
            kill(&mut child, &program);
            let stderr = collect(&stderr_rx);
            return Err(ConvertError::ProcessTimedOut {
                program,
                seconds: timeout.as_secs(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut r) = reader {
            if let Err(err) = r.read_to_end(&mut buf) {
                debug!("reading child pipe: {err}");
            }
        }
        let _ = tx.send(buf);
    });
    rx
}

fn collect(rx: &Receiver<Vec<u8>>) -> Vec<u8> {
    rx.recv_timeout(DRAIN_GRACE).unwrap_or_default()
}

fn kill(child: &mut Child, program: &str) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Err(err) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
            debug!("killpg {program}: {err}");
        }
    }
    if let Err(err) = child.kill() {
        debug!("kill {program}: {err}");
    }
    if let Err(err) = child.wait() {
        warn!("reaping {program}: {err}");
    }
}
