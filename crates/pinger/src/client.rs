use crate::DEFAULT_SOCKET_NAME;
use crate::protocol::{MAX_LINE_BYTES, Request, Response};
use anyhow::{Context, Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Client for the pinger daemon's Unix socket API.
pub struct PingerClient {
    reader: FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, LinesCodec>,
    pinger_id: String,
}

impl PingerClient {
    /// Connect to the daemon at the given socket path.
    /// Waits for the Hello response before returning.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
        let (r, w) = stream.into_split();
        let reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

        let mut client = Self {
            reader,
            writer,
            pinger_id: String::new(),
        };

        match client.next_response().await? {
            Response::Hello { pinger_id, .. } => {
                client.pinger_id = pinger_id;
                Ok(client)
            }
            other => Err(anyhow!("expected Hello, got {other:?}")),
        }
    }

    /// Host id of the daemon, received in the Hello handshake.
    pub fn pinger_id(&self) -> &str {
        &self.pinger_id
    }

    pub async fn send(&mut self, req: Request) -> Result<()> {
        let line = serde_json::to_string(&req)?;
        self.writer.send(line).await?;
        Ok(())
    }

    pub async fn next_response(&mut self) -> Result<Response> {
        let Some(line) = self.reader.next().await else {
            bail!("daemon disconnected");
        };
        Ok(serde_json::from_str(&line?)?)
    }

    /// Send a request and return the reply as-is, including Warn and Error.
    pub async fn call(&mut self, req: Request) -> Result<Response> {
        self.send(req).await?;
        loop {
            match self.next_response().await? {
                Response::Hello { .. } => continue,
                other => return Ok(other),
            }
        }
    }

    /// Send a request and return its data, failing on an Error reply.
    pub async fn request(&mut self, req: Request) -> Result<Option<serde_json::Value>> {
        match self.call(req).await? {
            Response::Ok { data, .. } | Response::Warn { data, .. } => Ok(data),
            Response::Error { code, message } => bail!("{message} ({code})"),
            Response::Hello { .. } => Ok(None),
        }
    }
}

/// Discover the default socket path.
///
/// Checks `$PINGER_SOCKET` env, then falls back to
/// `$XDG_RUNTIME_DIR/pinger/pinger.sock` or `/tmp/pinger-$UID/pinger.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(p) = std::env::var("PINGER_SOCKET") {
        return PathBuf::from(p);
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir)
            .join("pinger")
            .join(DEFAULT_SOCKET_NAME);
    }
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/pinger-{uid}/{DEFAULT_SOCKET_NAME}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn call_skips_hello_and_returns_error_replies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, w) = stream.into_split();
            let mut reader = FramedRead::new(r, LinesCodec::new());
            let mut writer = FramedWrite::new(w, LinesCodec::new());
            let hello = Response::Hello {
                pinger_id: "host-1".to_string(),
                version: "test".to_string(),
            };
            writer.send(serde_json::to_string(&hello).unwrap()).await.unwrap();

            let line = reader.next().await.unwrap().unwrap();
            let req: Request = serde_json::from_str(&line).unwrap();
            assert!(matches!(req, Request::AliveCheck));
            let resp = Response::Error {
                code: "not_found".to_string(),
                message: "Not Polling".to_string(),
            };
            writer.send(serde_json::to_string(&resp).unwrap()).await.unwrap();
        });

        let mut client = PingerClient::connect(&path).await.unwrap();
        assert_eq!(client.pinger_id(), "host-1");
        let resp = client.call(Request::AliveCheck).await.unwrap();
        assert_eq!(resp.message(), "Not Polling");
        server.await.unwrap();
    }
}
