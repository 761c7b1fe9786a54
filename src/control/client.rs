//! Control socket client.

use std::io::ErrorKind;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use super::{ControlError, FAILURE, PAUSE, RESUME, SUCCESS};

/// A persistent connection to a runner's control socket.
pub struct ControlClient {
    stream: UnixStream,
}

impl ControlClient {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ControlError> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        Ok(Self { stream })
    }

    /// Pauses the step the runner is executing.
    pub async fn pause(&mut self) -> Result<(), ControlError> {
        self.request(PAUSE).await
    }

    /// Resumes the paused step.
    pub async fn resume(&mut self) -> Result<(), ControlError> {
        self.request(RESUME).await
    }

    async fn request(&mut self, opcode: u8) -> Result<(), ControlError> {
        self.stream.write_all(&[opcode]).await?;

        let mut reply = [0u8; 1];
        match self.stream.read_exact(&mut reply).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(ControlError::Closed),
            Err(e) => return Err(e.into()),
        }

        match reply[0] {
            SUCCESS => Ok(()),
            FAILURE => Err(ControlError::Rejected),
            other => Err(ControlError::UnexpectedReply(other)),
        }
    }
}
