use crate::handler::{NodeState, error_response, handle_request};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use pinger::protocol::{MAX_LINE_BYTES, Request, Response, error_code};
use std::path::Path;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Serve the control socket until the daemon starts shutting down.
pub async fn serve(state: Arc<NodeState>, socket_path: &Path) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).ok();
        }
    }

    // Stale socket from a previous run
    if socket_path.exists() {
        std::fs::remove_file(socket_path).ok();
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600)).ok();
    }

    tracing::info!(path = %socket_path.display(), "Unix socket listening");

    let mut shutdown = state.shutdown_signal();
    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.wait_for(|down| *down) => break,
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(state, stream).await {
                tracing::debug!(err = %e, "client disconnected");
            }
        });
    }
    tracing::debug!("accept loop stopped");
    Ok(())
}

async fn handle_client(state: Arc<NodeState>, stream: UnixStream) -> Result<()> {
    let (r, w) = stream.into_split();
    let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    let hello = Response::Hello {
        pinger_id: state.pinger_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    writer.send(serde_json::to_string(&hello)?).await?;

    while let Some(line) = reader.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let req: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                tracing::debug!(err = %e, "unparsable request");
                let resp = error_response(error_code::INVALID_REQUEST, &format!("invalid request: {e}"));
                writer.send(serde_json::to_string(&resp)?).await?;
                continue;
            }
        };

        let is_shutdown = matches!(req, Request::Shutdown);
        let resp = handle_request(&state, req).await;
        writer.send(serde_json::to_string(&resp)?).await?;

        if is_shutdown {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ProtocolAdapters;
    use crate::config::Config;
    use pinger::client::PingerClient;
    use pinger::protocol::ReplyCode;
    use pinger_push::{Dispatcher, MemoryGateway, PayloadSettings};
    use pinger_store::{DeviceRegistry, MemoryStore};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn node() -> Arc<NodeState> {
        let devices = DeviceRegistry::new(Arc::new(MemoryStore::new()), "sock-test");
        devices.touch_heartbeat().unwrap();
        let dispatcher = Dispatcher::new(Arc::new(MemoryGateway::new()), PayloadSettings::default());
        NodeState::new(
            Config::default(),
            devices,
            dispatcher,
            Arc::new(ProtocolAdapters::default()),
        )
    }

    fn spawn_server(state: Arc<NodeState>, path: std::path::PathBuf) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { serve(state, &path).await })
    }

    async fn wait_for_socket(path: &Path) {
        for _ in 0..100 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("socket never appeared");
    }

    #[tokio::test]
    async fn hello_then_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("pinger.sock");
        let state = node();
        let server = spawn_server(state.clone(), path.clone());
        wait_for_socket(&path).await;

        let mut client = PingerClient::connect(&path).await.unwrap();
        assert_eq!(client.pinger_id(), "sock-test");
        let resp = client.call(Request::AliveCheck).await.unwrap();
        assert_eq!(resp.reply_code(), ReplyCode::Ok);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let resp = client.call(Request::Shutdown).await.unwrap();
        assert_eq!(resp.reply_code(), ReplyCode::Ok);
        server.await.unwrap().unwrap();
        assert!(state.is_shutting_down());
    }

    #[tokio::test]
    async fn bad_json_gets_an_error_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pinger.sock");
        let state = node();
        let server = spawn_server(state.clone(), path.clone());
        wait_for_socket(&path).await;

        let stream = UnixStream::connect(&path).await.unwrap();
        let (r, mut w) = stream.into_split();
        let mut lines = BufReader::new(r).lines();
        let hello: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(hello, Response::Hello { .. }));

        w.write_all(b"{not json\n").await.unwrap();
        let reply: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        match reply {
            Response::Error { code, .. } => assert_eq!(code, error_code::INVALID_REQUEST),
            other => panic!("expected an error, got {other:?}"),
        }

        // The connection survives.
        w.write_all(b"{\"type\":\"alive_check\"}\n").await.unwrap();
        let reply: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply.reply_code(), ReplyCode::Ok);

        state.begin_shutdown();
        server.await.unwrap().unwrap();
    }
}
