//! Control socket server.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use super::{ControlError, ControlHandler, FAILURE, PAUSE, RESUME, SUCCESS};

/// Listens on a Unix socket and serves one connection at a time.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Binds the socket, replacing a stale one left by a previous runner.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, ControlError> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            debug!("Removing stale control socket {}", path.display());
            fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path)?;
        info!("Control channel listening on {}", path.display());
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections until `cancel` fires.
    ///
    /// A failing connection is logged and dropped; the server keeps
    /// accepting.
    pub async fn serve(
        &self,
        handler: Arc<dyn ControlHandler>,
        cancel: CancellationToken,
    ) -> Result<(), ControlError> {
        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted?.0,
            };
            debug!("Control client connected");

            match serve_connection(stream, handler.as_ref(), &cancel).await {
                Ok(()) => debug!("Control client disconnected"),
                Err(e) => warn!("Control connection failed: {}", e),
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

async fn serve_connection(
    mut stream: UnixStream,
    handler: &dyn ControlHandler,
    cancel: &CancellationToken,
) -> std::io::Result<()> {
    let mut opcode = [0u8; 1];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = stream.read(&mut opcode) => read?,
        };
        if read == 0 {
            return Ok(());
        }

        let result = match opcode[0] {
            PAUSE => handler.pause().await,
            RESUME => handler.resume().await,
            other => {
                debug!("Ignoring unknown control opcode {:#04x}", other);
                continue;
            }
        };

        let reply = match result {
            Ok(()) => SUCCESS,
            Err(e) => {
                warn!("Control request failed: {}", e);
                FAILURE
            }
        };
        stream.write_all(&[reply]).await?;
    }
}
