use std::collections::BTreeMap;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use sp_domain::{Error, Result};

use crate::credentials::Credential;

/// How long a SIGTERMed process group gets before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// One child invocation: argv, working directory, extra environment and
/// limits. The environment is layered on top of the daemon's own.
pub struct InvokeSpec<'a> {
    pub argv: &'a [String],
    pub cwd: &'a Path,
    pub env: &'a BTreeMap<String, String>,
    pub credentials: Option<Credential>,
    /// Zero means unbounded.
    pub time_limit: Duration,
    /// Byte cap on stdin; excess is silently truncated. Zero means
    /// unbounded.
    pub max_payload: u64,
}

/// Spawn the command, feed `input` to its stdin and stream its stdout into
/// `output`. Returns `Ok(())` only when the child exits with status 0 and
/// neither the deadline nor `cancel` fired first.
///
/// The child joins a fresh process group; cancellation and deadline SIGTERM
/// the whole group (SIGKILL after a short grace), so grandchildren do not
/// outlive the request. Stderr stays connected to the daemon's own stderr.
pub async fn invoke<W>(
    cancel: &CancellationToken,
    spec: InvokeSpec<'_>,
    input: impl AsyncRead + Send + 'static,
    output: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let (program, args) = spec
        .argv
        .split_first()
        .ok_or_else(|| Error::Validation("run is not defined in manifest".into()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(spec.cwd)
        .envs(spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    cmd.process_group(0);
    if let Some(creds) = spec.credentials {
        cmd.uid(creds.uid).gid(creds.gid);
    }
    #[cfg(target_os = "linux")]
    unsafe {
        cmd.pre_exec(|| {
            // deliver SIGTERM to the child when the daemon dies
            nix::sys::prctl::set_pdeathsig(Signal::SIGTERM)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::SpawnFailure(format!("{program}: {e}")))?;

    // Feed stdin from the (possibly capped) request body in a detached
    // task; the child may legitimately exit without draining it.
    let stdin = child.stdin.take();
    let cap = spec.max_payload;
    tokio::spawn(async move {
        if let Some(mut stdin) = stdin {
            let mut reader: Pin<Box<dyn AsyncRead + Send>> = if cap > 0 {
                Box::pin(input.take(cap))
            } else {
                Box::pin(input)
            };
            let _ = tokio::io::copy(&mut reader, &mut stdin).await;
        }
    });

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::SpawnFailure("child stdout not captured".into()))?;
    let pid = child.id();

    let drain_and_wait = async {
        let copied = tokio::io::copy(&mut stdout, output).await;
        let status = child.wait().await;
        (copied, status)
    };
    tokio::pin!(drain_and_wait);

    let time_limit = spec.time_limit;
    let deadline = async {
        if time_limit.is_zero() {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(time_limit).await;
        }
    };

    tokio::select! {
        (copied, status) = &mut drain_and_wait => {
            copied?;
            let status = status.map_err(|e| Error::RuntimeFailure(format!("wait: {e}")))?;
            if status.success() {
                Ok(())
            } else {
                Err(Error::RuntimeFailure(format!("{program} exited with {status}")))
            }
        }
        _ = deadline => {
            signal_group(pid, Signal::SIGTERM);
            if tokio::time::timeout(KILL_GRACE, &mut drain_and_wait).await.is_err() {
                signal_group(pid, Signal::SIGKILL);
                let _ = (&mut drain_and_wait).await;
            }
            Err(Error::Timeout(format!(
                "{program} exceeded time limit of {time_limit:?}"
            )))
        }
        _ = cancel.cancelled() => {
            signal_group(pid, Signal::SIGTERM);
            if tokio::time::timeout(KILL_GRACE, &mut drain_and_wait).await.is_err() {
                signal_group(pid, Signal::SIGKILL);
                let _ = (&mut drain_and_wait).await;
            }
            Err(Error::RuntimeFailure(format!("{program} killed: shutdown in progress")))
        }
    }
}

/// Signal the child's process group; the group id equals the child pid
/// (`process_group(0)`).
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else {
        return; // already reaped
    };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        tracing::debug!(pid, signal = %signal, error = %e, "signal to process group failed");
    }
}
