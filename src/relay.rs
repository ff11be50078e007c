//! Worker-driven sessions.
//!
//! Some batch flows run entirely inside the worker, which streams progress
//! over a WebSocket. Relaying forwards those frames into a
//! [`ProgressChannel`] so the caller sees the same event protocol as a local
//! batch, including exactly one terminal event even when the worker hangs up
//! early. The worker accounts for quota itself, so nothing is charged here.

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeClient, WorkerStream};
use crate::error::{AbortReason, ErrorKind};
use crate::progress::{ChannelError, ProgressChannel, ProgressEvent};
use crate::state_machine::{BatchSummary, JobOutcome};

/// Opens `endpoint` with `request` and relays it to completion.
pub async fn relay_session<R>(
    client: &BridgeClient,
    endpoint: &str,
    request: &R,
    progress: &mut ProgressChannel,
    cancel: &CancellationToken,
) -> Result<BatchSummary, AbortReason>
where
    R: Serialize + ?Sized,
{
    match client.open_stream(endpoint, request, cancel.clone()).await {
        Ok(stream) => forward(stream, progress, cancel).await,
        Err(e) => {
            tracing::error!(endpoint, error = %e, "could not open worker stream");
            let reason = AbortReason::new(e.kind(), e.to_string());
            deliver_failure(progress, reason.clone()).await;
            Err(reason)
        }
    }
}

/// Forwards every event of `stream` until a terminal one.
pub async fn forward(
    mut stream: WorkerStream,
    progress: &mut ProgressChannel,
    cancel: &CancellationToken,
) -> Result<BatchSummary, AbortReason> {
    let mut outcomes: Vec<JobOutcome> = Vec::new();

    loop {
        let event = match stream.next().await {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                stream.close().await;
                let reason = AbortReason::new(e.kind(), e.to_string());
                deliver_failure(progress, reason.clone()).await;
                return Err(reason);
            }
            None => {
                let reason = if cancel.is_cancelled() {
                    AbortReason::new(ErrorKind::Cancelled, "cancelled by caller")
                } else {
                    AbortReason::new(
                        ErrorKind::Upstream,
                        "worker closed the stream before finishing",
                    )
                };
                tracing::warn!(endpoint = stream.endpoint(), reason = %reason, "relay ended early");
                deliver_failure(progress, reason.clone()).await;
                return Err(reason);
            }
        };

        let event = match event {
            ProgressEvent::JobResult { outcome } => {
                outcomes.push(outcome.clone());
                ProgressEvent::JobResult { outcome }
            }
            ProgressEvent::Completed { summary } => ProgressEvent::Completed {
                summary: reconcile(summary, &outcomes),
            },
            other => other,
        };

        let terminal = event.clone();
        if let Err(e) = progress.emit(event).await {
            stream.close().await;
            let reason = match e {
                ChannelError::Closed => AbortReason::new(ErrorKind::Cancelled, e.to_string()),
                ChannelError::Terminated => AbortReason::new(ErrorKind::Validation, e.to_string()),
            };
            return Err(reason);
        }

        match terminal {
            ProgressEvent::Completed { summary } => {
                stream.close().await;
                tracing::info!(
                    endpoint = stream.endpoint(),
                    succeeded = summary.success_count,
                    failed = summary.failed_count,
                    "relayed session completed"
                );
                return Ok(summary);
            }
            ProgressEvent::Failed { error } => {
                stream.close().await;
                return Err(error);
            }
            _ => {}
        }
    }
}

/// Fills in counts the worker left out from the results seen on the stream.
fn reconcile(summary: BatchSummary, outcomes: &[JobOutcome]) -> BatchSummary {
    if summary.success_count + summary.failed_count > 0 || outcomes.is_empty() {
        return summary;
    }
    let mut rebuilt = BatchSummary::from_outcomes(
        summary.total.max(outcomes.len()),
        outcomes.len(),
        outcomes,
        summary.halted,
    );
    if !summary.message.is_empty() {
        rebuilt.message = summary.message;
    }
    rebuilt
}

async fn deliver_failure(progress: &mut ProgressChannel, reason: AbortReason) {
    if let Err(e) = progress.fail(reason).await {
        tracing::debug!(error = %e, "failure not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;
    use uuid::Uuid;

    async fn worker(frames: Vec<&'static str>) -> BridgeClient {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _request = ws.next().await;
            for frame in frames {
                ws.send(Message::Text(frame.to_string())).await.unwrap();
            }
            let _ = ws.close(None).await;
        });
        BridgeClient::attached(format!("http://{addr}"), Duration::from_secs(5)).unwrap()
    }

    async fn relay(client: BridgeClient) -> (Result<BatchSummary, AbortReason>, Vec<ProgressEvent>) {
        let (mut tx, rx) = progress::channel(Uuid::new_v4(), 32);
        let result = relay_session(
            &client,
            "/api/apply/ws/boss-apply",
            &serde_json::json!({"job_ids": ["1", "2"]}),
            &mut tx,
            &CancellationToken::new(),
        )
        .await;
        drop(tx);
        (result, rx.collect().await)
    }

    #[tokio::test]
    async fn legacy_session_is_relayed_and_counts_reconciled() {
        let client = worker(vec![
            r#"{"progress": 0.5, "current": 1, "total": 2, "job": "1", "success": true, "message": "sent"}"#,
            r#"{"progress": 1.0, "current": 2, "total": 2, "job": "2", "success": false, "message": "closed"}"#,
            r#"{"completed": true, "message": "all done"}"#,
        ])
        .await;

        let (result, events) = relay(client).await;
        let summary = result.unwrap();
        assert_eq!((summary.success_count, summary.failed_count), (1, 1));
        assert_eq!(summary.total, 2);
        assert_eq!(summary.message, "all done");

        assert_eq!(events.len(), 5);
        let fractions: Vec<_> = events.iter().filter_map(ProgressEvent::fraction).collect();
        assert_eq!(fractions, vec![0.5, 0.5, 1.0]);
        assert!(matches!(events.last(), Some(ProgressEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn worker_error_frame_fails_the_session() {
        let client = worker(vec![r#"{"error": true, "message": "please log in"}"#]).await;

        let (result, events) = relay(client).await;
        let reason = result.unwrap_err();
        assert_eq!(reason.kind, ErrorKind::Upstream);
        assert_eq!(reason.message, "please log in");
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn hang_up_without_terminal_still_fails_once() {
        let client = worker(vec![r#"{"stage": "searching", "progress": 0.1}"#]).await;

        let (result, events) = relay(client).await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::Upstream);
        assert_eq!(events.len(), 2);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn unreachable_worker_is_reported() {
        let client = BridgeClient::attached("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let (result, events) = relay(client).await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::Transport);
        assert!(matches!(events[..], [ProgressEvent::Failed { .. }]));
    }

    #[test]
    fn reconcile_keeps_worker_counts() {
        let summary = BatchSummary {
            total: 3,
            dispatched: 3,
            success_count: 3,
            failed_count: 0,
            halted: None,
            message: "ok".into(),
        };
        assert_eq!(reconcile(summary.clone(), &[]), summary);
    }
}
