//! Newline-delimited JSON bridge between the native window host and the
//! palette session, spoken over STDIO.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use kawai_client::{AnswerService, ApiKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    debounce::DebounceSettings,
    host::{HostBridge, HostError},
    runtime::{PaletteHandle, PaletteRuntimeBuilder},
    secret::SecretSource,
    session::SessionSnapshot,
};

pub async fn serve_stdio(
    service: AnswerService,
    secrets: SecretSource,
    debounce: DebounceSettings,
) -> Result<()> {
    let reader = BufReader::new(io::stdin());
    serve(reader, io::stdout(), service, secrets, debounce).await
}

/// Runs one palette session over an arbitrary reader/writer pair. Returns
/// once the host unmounts the palette or closes its input.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    service: AnswerService,
    secrets: SecretSource,
    debounce: DebounceSettings,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_outbound(writer, outbound_rx));

    let host = Arc::new(StdioHost {
        secrets,
        outbound: outbound_tx.clone(),
    });
    let (handle, session_task) = PaletteRuntimeBuilder::new(service, host)
        .debounce(debounce)
        .spawn();
    let forwarder = tokio::spawn(forward_snapshots(handle.clone(), outbound_tx.clone()));

    let pumped = pump_host_messages(reader, &handle, &outbound_tx).await;

    let _ = handle.unmount();
    session_task.await?;
    forwarder.await?;
    drop(outbound_tx);
    writer_task.await??;
    pumped
}

/// Feeds host lines into the session until `unmount` or end of input. Bad
/// frames are answered with a parse error and skipped.
async fn pump_host_messages<R>(
    mut reader: R,
    handle: &PaletteHandle,
    outbound: &mpsc::UnboundedSender<Outbound>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    loop {
        frame.clear();
        if reader.read_until(b'\n', &mut frame).await? == 0 {
            info!(target: "kawai_transport", "STDIO closed; unmounting palette");
            return Ok(());
        }

        let line = match std::str::from_utf8(&frame) {
            Ok(line) => line.trim(),
            Err(error) => {
                warn!(target: "kawai_transport", error = %error, "Host frame is not UTF-8");
                let _ = outbound.send(Outbound::error(-32700, "Parse error"));
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }

        debug!(target: "kawai_transport", request = line);
        match serde_json::from_str::<HostMessage>(line) {
            Ok(message) => {
                let unmount = message.method == "unmount";
                if let Err(reply) = route(handle, message) {
                    let _ = outbound.send(reply);
                }
                if unmount {
                    return Ok(());
                }
            }
            Err(error) => {
                warn!(target: "kawai_transport", error = %error, "Failed to parse host message");
                let _ = outbound.send(Outbound::error(-32700, "Parse error"));
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct HostMessage {
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct Outbound {
    method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl Outbound {
    fn notify(method: &'static str) -> Self {
        Self {
            method,
            params: None,
        }
    }

    fn state(snapshot: &SessionSnapshot) -> Self {
        Self {
            method: "state",
            params: serde_json::to_value(snapshot).ok(),
        }
    }

    fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            method: "error",
            params: Some(json!({ "code": code, "message": message.into() })),
        }
    }
}

/// Maps a host message onto the session. Problems are reported back as an
/// outbound `error` message.
fn route(handle: &PaletteHandle, message: HostMessage) -> Result<(), Outbound> {
    let param = |name: &str| {
        message
            .params
            .as_ref()
            .and_then(|params| params.get(name))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Outbound::error(-32602, format!("Missing string param `{name}`")))
    };

    let sent = match message.method.as_str() {
        "show" => handle.show(),
        "query" => handle.set_query(param("text")?),
        "clear_and_focus" => handle.clear_and_focus(),
        "key" => handle.key(&param("key")?),
        "unmount" => handle.unmount(),
        other => {
            return Err(Outbound::error(-32601, format!("Unknown method: {other}")))
        }
    };

    sent.map_err(|closed| Outbound::error(-32000, closed.to_string()))
}

async fn forward_snapshots(handle: PaletteHandle, outbound: mpsc::UnboundedSender<Outbound>) {
    let mut snapshots = handle.subscribe();
    let _ = outbound.send(Outbound::state(&snapshots.borrow_and_update()));
    while snapshots.changed().await.is_ok() {
        let message = Outbound::state(&snapshots.borrow_and_update());
        if outbound.send(message).is_err() {
            break;
        }
    }
}

async fn write_outbound<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let payload = serde_json::to_string(&message)?;
        writer.write_all(payload.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Host capabilities exposed through the STDIO channel. The key is resolved
/// locally on the host's behalf; hide and focus become outbound messages.
struct StdioHost {
    secrets: SecretSource,
    outbound: mpsc::UnboundedSender<Outbound>,
}

#[async_trait]
impl HostBridge for StdioHost {
    async fn retrieve_secret(&self) -> Result<Option<ApiKey>, HostError> {
        Ok(self.secrets.load().await?)
    }

    async fn hide_window(&self) -> Result<(), HostError> {
        self.outbound
            .send(Outbound::notify("hide_window"))
            .map_err(|_| HostError::Disconnected)
    }

    fn focus_input(&self) {
        if self.outbound.send(Outbound::notify("focus_input")).is_err() {
            warn!(target: "kawai_transport", "focus request dropped; host output closed");
        }
    }
}
