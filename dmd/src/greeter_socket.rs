//! The UNIX socket greeters connect to, and the per-connection protocol
//! state machine layered over `dmipc`'s wire format. Only one greeter is
//! ever attached; any other connection made while one is active is
//! accepted and immediately closed.

use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};

use dmipc::{ToDaemon, ToGreeter};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolState {
    Unconnected,
    Connected,
    Authenticating,
    AwaitingResponse,
    AuthComplete,
    StartingSession,
    Closed,
}

pub struct Greeter {
    stream: UnixStream,
    pub state: ProtocolState,
}

impl Greeter {
    pub async fn recv(&mut self) -> Result<Option<ToDaemon>> {
        Ok(dmipc::read_message(&mut self.stream).await?)
    }

    pub async fn send(&mut self, msg: &ToGreeter) -> Result<()> {
        Ok(dmipc::write_message(&mut self.stream, msg).await?)
    }

    /// Reports and rejects an out-of-order message (e.g. `CONTINUE` while
    /// not `AwaitingResponse`) without changing protocol state.
    pub async fn reject(&mut self, why: &str) -> Result<()> {
        self.send(&ToGreeter::Prompt {
            kind: dmipc::PromptKind::Error,
            text: why.to_string(),
        })
        .await
    }
}

pub struct GreeterSocket {
    listener: UnixListener,
    pub path: PathBuf,
    busy: bool,
}

impl GreeterSocket {
    pub fn bind(path: &Path) -> Result<GreeterSocket> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .map_err(|e| Error::Spawn(format!("bind {}: {}", path.display(), e)))?;
        Ok(GreeterSocket {
            listener,
            path: path.to_path_buf(),
            busy: false,
        })
    }

    /// Accepts the next greeter connection, silently closing any extra
    /// connections that arrive while one is already attached.
    pub async fn accept(&mut self) -> Result<Greeter> {
        loop {
            let (stream, _addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| Error::Spawn(format!("accept: {}", e)))?;

            if self.busy {
                drop(stream);
                continue;
            }

            self.busy = true;
            return Ok(Greeter {
                stream,
                state: ProtocolState::Connected,
            });
        }
    }

    /// Releases the "one greeter at a time" slot. Called by the owning
    /// Display once its Greeter disconnects or the Display stops.
    pub fn release(&mut self) {
        self.busy = false;
    }
}

impl Drop for GreeterSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn second_concurrent_connection_is_closed_not_queued() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greeter.sock");
        let mut socket = GreeterSocket::bind(&path).unwrap();

        let connect_path = path.clone();
        let client_a = tokio::spawn(async move { UnixStream::connect(connect_path).await.unwrap() });
        let _first = socket.accept().await.unwrap();
        let _client_a = client_a.await.unwrap();

        // Further accepts keep looping in the background, dropping any
        // connection that arrives while busy.
        tokio::spawn(async move {
            let _ = socket.accept().await;
        });

        let mut client_b = UnixStream::connect(&path).await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(std::time::Duration::from_secs(1), client_b.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
    }
}
