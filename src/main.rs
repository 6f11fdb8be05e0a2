//! Staylens - 酒店比价请求编排层
//!
//! 入口：stdio JSON 行宿主。每行 stdin 是一个 `GatewayMessage`，应答与 resend 请求按行写到 stdout，日志写 stderr。
//!
//! 运行方式：
//! ```bash
//! STAYLENS__REMOTE__BASE_URL=http://127.0.0.1:8787 staylens [config.toml]
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use staylens::config::load_config;
use staylens::gateway::{Dispatcher, GatewayMessage, MessageType, Request};
use staylens::recovery::SessionOwner;
use staylens::remote::{HttpRemoteClient, RetryingRemoteClient};
use staylens::store::create_durable_store;
use staylens::{observability, OrchestratorError};

/// 把 request-context-resend 写回 stdout 的会话所有者
struct StdioSessionOwner {
    outbound: mpsc::UnboundedSender<GatewayMessage>,
}

#[async_trait]
impl SessionOwner for StdioSessionOwner {
    async fn request_context_resend(
        &self,
        session_id: &str,
        correlation_id: &str,
    ) -> Result<(), String> {
        self.outbound
            .send(GatewayMessage::context_resend(session_id, correlation_id))
            .map_err(|_| "stdout writer closed".to_string())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let http = HttpRemoteClient::new(
        cfg.remote.base_url.clone(),
        Duration::from_secs(cfg.remote.timeout_secs),
    )
    .context("Failed to build comparison client")?;
    let remote = Arc::new(RetryingRemoteClient::new(
        http,
        cfg.remote.retry.to_retry_config(),
    ));
    let durable = create_durable_store(cfg.storage.durable_path.as_deref());

    let (out_tx, out_rx) = mpsc::unbounded_channel::<GatewayMessage>();
    let dispatcher = Arc::new(Dispatcher::new(
        remote,
        durable,
        Arc::new(StdioSessionOwner {
            outbound: out_tx.clone(),
        }),
        &cfg.orchestrator,
    ));
    let writer = tokio::spawn(write_outbound(out_rx));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    tracing::info!("Staylens ready (remote {})", cfg.remote.base_url);

    let tracker = TaskTracker::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => handle_line(&line, &dispatcher, &out_tx, &tracker).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    }

    tracing::info!("Shutting down, waiting for {} requests", tracker.len());
    tracker.close();
    tracker.wait().await;
    drop(dispatcher);
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

async fn handle_line(
    line: &str,
    dispatcher: &Arc<Dispatcher>,
    out_tx: &mpsc::UnboundedSender<GatewayMessage>,
    tracker: &TaskTracker,
) {
    let msg: GatewayMessage = match serde_json::from_str(line) {
        Ok(msg) => msg,
        Err(e) => {
            let err = OrchestratorError::InvalidParams(format!("malformed message: {e}"));
            let _ = out_tx.send(GatewayMessage::error(&err));
            return;
        }
    };

    match msg.message.clone() {
        // 写上下文与握手应答很快，内联处理以保持与后续请求的先后顺序
        MessageType::Request {
            request: request @ (Request::RecordContext { .. } | Request::ContextResponse { .. }),
        } => {
            let response = dispatcher.dispatch(msg.session_id.as_deref(), request).await;
            let _ = out_tx.send(GatewayMessage::reply(&msg, response));
        }
        MessageType::Request { request } => {
            let dispatcher = Arc::clone(dispatcher);
            let out_tx = out_tx.clone();
            tracker.spawn(async move {
                let response = dispatcher.dispatch(msg.session_id.as_deref(), request).await;
                let _ = out_tx.send(GatewayMessage::reply(&msg, response));
            });
        }
        MessageType::SessionSpawned {
            parent_id,
            child_id,
        } => {
            dispatcher.on_session_spawned(&parent_id, &child_id).await;
        }
        MessageType::SessionClosed => match msg.session_id.as_deref() {
            Some(sid) => dispatcher.on_session_closed(sid).await,
            None => tracing::warn!("session_closed without session_id"),
        },
        MessageType::Response { .. } | MessageType::RequestContextResend { .. } => {
            tracing::warn!("Ignoring outbound-only message {}", msg.id);
        }
    }
}

async fn write_outbound(mut out_rx: mpsc::UnboundedReceiver<GatewayMessage>) {
    let mut stdout = tokio::io::stdout();
    while let Some(msg) = out_rx.recv().await {
        let line = match serde_json::to_string(&msg) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to encode message {}: {}", msg.id, e);
                continue;
            }
        };
        let written = async {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::warn!("Failed to write stdout: {}", e);
            break;
        }
    }
}
