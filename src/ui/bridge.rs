// Bridge - JSON-lines transport between the UI host and the message router
//
// Incoming lines are requests, each dispatched on its own task so a slow
// handler never blocks the reader. Replies and push events share one bounded
// outbound queue drained by a single writer task, so lines are never
// interleaved.
//
// Push events come from a lossless subscription taken when the bridge is
// built. A UI that reads slowly applies backpressure; no event is skipped.

use crate::metrics::Metrics;
use crate::state::{BridgeEvent, StateManager};
use crate::ui::router::{MessageRouter, Reply, RequestEnvelope};
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// Bound of the outbound queue shared by replies and push events
pub const OUTBOUND_QUEUE_CAPACITY: usize = 100;

/// How long pending output may take to reach the UI once the bridge stops
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// One line written to the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Response { id: Option<u64>, result: Value },
    Event { name: String, payload: Value },
}

impl Outbound {
    /// `None` for events that never leave the bridge
    pub fn from_event(event: &BridgeEvent) -> Option<Self> {
        Some(Self::Event {
            name: event.wire_name()?.to_string(),
            payload: event.payload(),
        })
    }
}

impl From<Reply> for Outbound {
    fn from(reply: Reply) -> Self {
        Self::Response {
            id: reply.id,
            result: reply.result,
        }
    }
}

/// Serialize `message` as one line and flush it
pub async fn write_message<W>(writer: &mut W, message: &Outbound) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Write a single push event outside of a running bridge (startup failures)
pub async fn write_event<W>(writer: &mut W, event: &BridgeEvent) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match Outbound::from_event(event) {
        Some(message) => write_message(writer, &message).await,
        None => Ok(()),
    }
}

/// Connects a router and the push channel to a line-based transport
pub struct Bridge<C> {
    router: Arc<MessageRouter<C>>,
    events: mpsc::UnboundedReceiver<BridgeEvent>,
    metrics: Arc<Metrics>,
}

impl<C: Send + Sync + 'static> Bridge<C> {
    /// Events published from here on are delivered once [`run`](Self::run) starts
    pub fn new(router: Arc<MessageRouter<C>>, state: &StateManager, metrics: Arc<Metrics>) -> Self {
        Self {
            router,
            events: state.subscribe_lossless(),
            metrics,
        }
    }

    /// Serve requests from `reader` until it closes or `shutdown` turns true.
    ///
    /// Events published before shutdown are still written; the writer is
    /// flushed before this returns, unless the UI stops reading for longer
    /// than [`FLUSH_TIMEOUT`].
    pub async fn run<R, W>(self, reader: R, writer: W, shutdown: watch::Receiver<bool>) -> io::Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE_CAPACITY);
        let Self { router, events, metrics } = self;
        let writer_task = tokio::spawn(write_loop(writer, out_rx));
        let forwarder = tokio::spawn(forward_events(events, out_tx.clone(), Arc::clone(&metrics), shutdown.clone()));

        let mut shutdown = shutdown;
        let mut lines = BufReader::new(reader).lines();
        tracing::info!("Bridge listening for requests");

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if !line.trim().is_empty() {
                            handle_line(&router, &metrics, &line, &out_tx).await;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("UI closed the transport");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Failed to read from the transport: {}", e);
                        break;
                    }
                },
                _ = wait_for_shutdown(&mut shutdown) => {
                    tracing::info!("Shutdown requested, stopping bridge");
                    break;
                }
            }
        }

        // The forwarder only exits on shutdown; on EOF stop it here
        let stopping = *shutdown.borrow();
        if !stopping {
            forwarder.abort();
        }
        let forwarder_abort = forwarder.abort_handle();
        match timeout(FLUSH_TIMEOUT, forwarder).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => tracing::error!("Event forwarder failed: {}", e),
            Err(_) => {
                tracing::warn!("UI stopped reading, abandoning pending events");
                forwarder_abort.abort();
            }
        }

        drop(out_tx);
        let writer_abort = writer_task.abort_handle();
        match timeout(FLUSH_TIMEOUT, writer_task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(io::Error::other(e)),
            Err(_) => {
                tracing::warn!("UI stopped reading, abandoning pending output");
                writer_abort.abort();
                Ok(())
            }
        }
    }
}

async fn handle_line<C: Send + Sync + 'static>(
    router: &Arc<MessageRouter<C>>,
    metrics: &Metrics,
    line: &str,
    out_tx: &mpsc::Sender<Outbound>,
) {
    let envelope = match serde_json::from_str::<RequestEnvelope>(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Malformed request line: {}", e);
            metrics.record_request_rejected();
            let id = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|value| value.get("id").and_then(Value::as_u64));
            let _ = out_tx.send(Reply::rejected(id).into()).await;
            return;
        }
    };

    let router = Arc::clone(router);
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        let reply = router.dispatch(envelope).await;
        if out_tx.send(reply.into()).await.is_err() {
            tracing::debug!("Transport closed before the reply was written");
        }
    });
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let signalled = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !signalled {
        // Sender gone: shutdown can no longer be requested
        std::future::pending::<()>().await;
    }
}

async fn write_loop<W>(mut writer: W, mut out_rx: mpsc::Receiver<Outbound>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = out_rx.recv().await {
        write_message(&mut writer, &message).await?;
    }
    writer.flush().await
}

async fn forward_events(
    mut events: mpsc::UnboundedReceiver<BridgeEvent>,
    out_tx: mpsc::Sender<Outbound>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            received = events.recv() => match received {
                Some(event) => forward(&out_tx, &event, &metrics).await,
                None => break,
            },
            _ = wait_for_shutdown(&mut shutdown) => {
                while let Ok(event) = events.try_recv() {
                    forward(&out_tx, &event, &metrics).await;
                }
                break;
            }
        }
    }
}

async fn forward(out_tx: &mpsc::Sender<Outbound>, event: &BridgeEvent, metrics: &Metrics) {
    let Some(message) = Outbound::from_event(event) else {
        return;
    };

    // Waiting here backs up the lossless subscription, never the publishers
    if out_tx.send(message).await.is_err() {
        tracing::warn!("Transport closed, {:?} not delivered", event.wire_name());
        metrics.record_push_dropped();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::progress::ProgressEvent;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_outbound_shapes() {
        let response = serde_json::to_value(Outbound::from(Reply {
            id: Some(3),
            result: json!(true),
        }))
        .unwrap();
        assert_eq!(response, json!({ "type": "response", "id": 3, "result": true }));

        let event = Outbound::from_event(&BridgeEvent::WindowMaximized(true)).unwrap();
        assert_eq!(
            serde_json::to_value(event).unwrap(),
            json!({ "type": "event", "name": "window-maximized", "payload": true })
        );

        assert!(Outbound::from_event(&BridgeEvent::WindowMinimized(true)).is_none());
    }

    #[tokio::test]
    async fn test_write_event_is_one_line() {
        let mut buffer = Vec::new();
        write_event(
            &mut buffer,
            &BridgeEvent::FatalError {
                reason: "interpreter_unavailable".to_string(),
                message: "python3 not found".to_string(),
            },
        )
        .await
        .unwrap();

        let text = String::from_utf8(buffer).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.lines().count(), 1);
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["name"], "fatalError");
        assert_eq!(value["payload"]["reason"], "interpreter_unavailable");
    }

    fn progress(step: usize) -> BridgeEvent {
        BridgeEvent::GenerateSeedProgress(ProgressEvent {
            progress: (step % 101) as f64,
            message: format!("step {}", step),
        })
    }

    #[tokio::test]
    async fn test_full_queue_waits_instead_of_dropping() {
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let metrics = Arc::new(Metrics::new());

        forward(&out_tx, &progress(0), &metrics).await;
        let second = tokio::spawn({
            let out_tx = out_tx.clone();
            let metrics = Arc::clone(&metrics);
            async move { forward(&out_tx, &progress(1), &metrics).await }
        });

        let first = out_rx.recv().await.unwrap();
        second.await.unwrap();
        let next = out_rx.recv().await.unwrap();

        assert_eq!(first, Outbound::from_event(&progress(0)).unwrap());
        assert_eq!(next, Outbound::from_event(&progress(1)).unwrap());
        assert_eq!(metrics.push_events_dropped.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_slow_reader_gets_all_progress_then_terminal_event() {
        let state = StateManager::new();
        let metrics = Arc::new(Metrics::new());
        let router = Arc::new(MessageRouter::new(Arc::new(()), Arc::clone(&metrics)));
        let bridge = Bridge::new(router, &state, Arc::clone(&metrics));

        let (_requests, bridge_input) = tokio::io::duplex(64);
        let (bridge_output, ui_output) = tokio::io::duplex(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let served = tokio::spawn(bridge.run(bridge_input, bridge_output, shutdown_rx));

        // Nobody reads while the job runs, so the transport is full long before the end
        let total = 300;
        for step in 0..total {
            state.publish(progress(step));
            tokio::task::yield_now().await;
        }
        state.publish(BridgeEvent::GenerateSeedSuccess(json!({ "output": "seed.zpf" })));

        let mut lines = BufReader::new(ui_output).lines();
        let mut received = Vec::new();
        while received.len() < total + 1 {
            let line = timeout(Duration::from_secs(5), lines.next_line())
                .await
                .expect("event not delivered")
                .unwrap()
                .unwrap();
            received.push(serde_json::from_str::<Value>(&line).unwrap());
        }

        for (step, event) in received[..total].iter().enumerate() {
            assert_eq!(event["name"], "generateSeedProgress");
            assert_eq!(event["payload"]["message"], format!("step {}", step));
        }
        assert_eq!(received[total]["name"], "generateSeedSuccess");
        assert_eq!(received[total]["payload"]["output"], "seed.zpf");
        assert_eq!(metrics.push_events_dropped.load(Ordering::Relaxed), 0);

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(5), served).await.unwrap().unwrap().unwrap();
    }
}
