//! Plugin executable checks, spawning, handshake and termination.

use crate::error::{PluginError, Result};
use crate::protocol::{self, MAX_HANDSHAKE_LEN};
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

/// Verify that `path` names an executable file.
pub(crate) fn check_executable(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| PluginError::NotFound {
        path: path.to_path_buf(),
        source: Some(e),
    })?;

    if metadata.is_dir() {
        return Err(PluginError::NotFound {
            path: path.to_path_buf(),
            source: None,
        });
    }

    #[cfg(unix)]
    {
        use nix::unistd::{access, AccessFlags};

        if access(path, AccessFlags::X_OK).is_err() {
            return Err(PluginError::execution("plugin must be an executable"));
        }
    }

    Ok(())
}

/// Spawn the plugin with stdout captured for the handshake. Stderr is
/// inherited so plugin logs reach the host's terminal.
pub(crate) fn spawn(
    path: &Path,
    args: &[String],
    env: &std::collections::HashMap<String, String>,
) -> Result<Child> {
    Command::new(path)
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true) // Prevent orphaned plugins
        .spawn()
        .map_err(|e| PluginError::execution(format!("failed to start plugin: {e}")))
}

/// Read the port announced on the first stdout line.
pub(crate) async fn read_handshake(
    stdout: &mut BufReader<ChildStdout>,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<u16> {
    let mut line = String::new();
    let mut first_line = (&mut *stdout).take(MAX_HANDSHAKE_LEN);

    let read = tokio::select! {
        read = tokio::time::timeout(limit, first_line.read_line(&mut line)) => read,
        _ = cancel.cancelled() => return Err(PluginError::execution("plugin start cancelled")),
    };

    match read {
        Err(_) => Err(PluginError::execution(format!(
            "plugin did not announce its port within {}ms",
            limit.as_millis()
        ))),
        Ok(Err(e)) => Err(PluginError::execution(format!(
            "failed to read port from plugin: {e}"
        ))),
        Ok(Ok(0)) => Err(PluginError::execution(
            "plugin closed stdout before announcing its port",
        )),
        Ok(Ok(_)) => {
            protocol::parse_handshake(&line).map_err(|e| PluginError::execution(e.to_string()))
        }
    }
}

/// Keep draining stdout after the handshake so the plugin never blocks on a
/// full pipe. Lines are forwarded to the debug log.
pub(crate) fn forward_stdout(mut stdout: BufReader<ChildStdout>, pid: Option<u32>) {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match stdout.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    tracing::debug!(pid, line = %line.trim_end(), "plugin stdout");
                }
                Err(e) => {
                    tracing::debug!(pid, error = %e, "Stopped reading plugin stdout");
                    break;
                }
            }
        }
    });
}

/// Kill the process if it is still running and reap it.
///
/// A process that already exited is not an error.
pub(crate) async fn terminate(child: &mut Child) -> io::Result<()> {
    if let Some(status) = child.try_wait()? {
        tracing::debug!(pid = child.id(), %status, "Plugin process already exited");
        return Ok(());
    }

    child.start_kill()?;
    let status = child.wait().await?;
    tracing::debug!(%status, "Plugin process killed");
    Ok(())
}
