use std::future::Future;
use std::time::Duration;

use futures::SinkExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::error::BridgeError;
use super::stream::WorkerStream;
use super::types::{
    ANALYZE_PATH, AnalyzeRequest, AnalyzeResponse, ApplicationRecord, COMPOSE_PATH,
    ComposeRequest, ComposeResponse, RECORDS_PATH, SEARCH_PATH, SUBMIT_PATH, SearchResponse,
    SubmitReceipt, SubmitRequest,
};
use super::WorkerApi;
use crate::state_machine::{JobDescriptor, SearchCriteria};
use crate::supervisor::{PROBE_TIMEOUT, WorkerPhase, WorkerStatus, probe_health};

/// Typed access to the worker over HTTP and WebSocket.
///
/// Every call checks the status published by the supervisor first and
/// refuses with [`BridgeError::Unavailable`] unless the worker is `READY`.
/// Calls are never retried. Only connection setup is bounded here; the
/// caller decides how long a whole call may take.
#[derive(Clone)]
pub struct BridgeClient {
    http: reqwest::Client,
    status: watch::Receiver<WorkerStatus>,
    connect_timeout: Duration,
}

impl BridgeClient {
    pub fn new(
        status: watch::Receiver<WorkerStatus>,
        connect_timeout: Duration,
    ) -> Result<Self, BridgeError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            status,
            connect_timeout,
        })
    }

    /// Client for a worker managed outside this process, taken as ready.
    pub fn attached(
        base_url: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, BridgeError> {
        let (_tx, rx) = watch::channel(WorkerStatus {
            phase: WorkerPhase::Ready,
            pid: None,
            base_url: base_url.into(),
        });
        Self::new(rx, connect_timeout)
    }

    fn ready_base_url(&self) -> Result<String, BridgeError> {
        let status = self.status.borrow();
        if !status.is_ready() {
            return Err(BridgeError::Unavailable {
                phase: status.phase,
            });
        }
        Ok(status.base_url.clone())
    }

    /// `GET /health` against the published endpoint, whatever its phase.
    pub async fn probe(&self) -> bool {
        let base_url = self.status.borrow().base_url.clone();
        probe_health(&self.http, &base_url, PROBE_TIMEOUT).await
    }

    /// `POST <base><endpoint>` with a JSON body, decoding a JSON answer.
    pub async fn call<Req, Resp>(&self, endpoint: &str, payload: &Req) -> Result<Resp, BridgeError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let bytes = self.post(endpoint, payload).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn post<Req>(&self, endpoint: &str, payload: &Req) -> Result<reqwest::Response, BridgeError>
    where
        Req: Serialize + ?Sized,
    {
        let base_url = self.ready_base_url()?;
        tracing::debug!(endpoint, "worker call");
        let response = self
            .http
            .post(format!("{base_url}{endpoint}"))
            .json(payload)
            .send()
            .await?;
        ensure_success(response).await
    }

    /// Bounds a connection handshake by the connect timeout.
    async fn connecting<T>(
        &self,
        handshake: impl Future<Output = Result<T, BridgeError>>,
    ) -> Result<T, BridgeError> {
        timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| BridgeError::Timeout(self.connect_timeout))?
    }

    /// Opens a streaming session at `endpoint`, sending `payload` as the
    /// first frame.
    pub async fn open_stream<Req>(
        &self,
        endpoint: &str,
        payload: &Req,
        cancel: CancellationToken,
    ) -> Result<WorkerStream, BridgeError>
    where
        Req: Serialize + ?Sized,
    {
        let url = ws_url(&self.ready_base_url()?, endpoint);
        let request = serde_json::to_string(payload)?;

        let socket = self
            .connecting(async {
                let (mut socket, _response) = connect_async(url.as_str()).await?;
                socket.send(Message::Text(request)).await?;
                Ok::<_, BridgeError>(socket)
            })
            .await?;

        tracing::info!(%url, "worker stream opened");
        Ok(WorkerStream::new(endpoint.to_string(), socket, cancel))
    }
}

/// Turns a non-2xx response into [`BridgeError::Upstream`].
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, BridgeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(BridgeError::Upstream {
        status: status.as_u16(),
        body,
    })
}

fn ws_url(base_url: &str, endpoint: &str) -> String {
    let base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    };
    format!("{base}{endpoint}")
}

impl WorkerApi for BridgeClient {
    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<JobDescriptor>, BridgeError> {
        let response: SearchResponse = self.call(SEARCH_PATH, criteria).await?;
        if !response.success {
            return Err(BridgeError::Upstream {
                status: 200,
                body: response.message,
            });
        }
        tracing::debug!(found = response.jobs.len(), total = ?response.total, "search finished");
        Ok(response.jobs)
    }

    async fn analyze_resume(&self, resume_text: &str) -> Result<serde_json::Value, BridgeError> {
        let response: AnalyzeResponse = self
            .call(ANALYZE_PATH, &AnalyzeRequest { resume_text })
            .await?;
        Ok(response.analysis)
    }

    async fn compose(
        &self,
        job: &JobDescriptor,
        resume_text: &str,
        analysis: Option<&serde_json::Value>,
    ) -> Result<String, BridgeError> {
        let request = ComposeRequest {
            job,
            resume_text,
            analysis,
        };
        let response: ComposeResponse = self.call(COMPOSE_PATH, &request).await?;
        Ok(response.message)
    }

    async fn submit(&self, job_id: &str, greeting: &str) -> Result<SubmitReceipt, BridgeError> {
        self.call(SUBMIT_PATH, &SubmitRequest { job_id, greeting })
            .await
    }

    async fn record(&self, record: &ApplicationRecord) -> Result<(), BridgeError> {
        self.post(RECORDS_PATH, record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::progress::ProgressEvent;
    use futures::StreamExt;
    use tokio::net::TcpListener;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> BridgeClient {
        BridgeClient::attached(server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn refuses_when_worker_not_ready() {
        let (_tx, rx) = watch::channel(WorkerStatus {
            phase: WorkerPhase::Starting,
            pid: Some(1),
            base_url: "http://127.0.0.1:1".into(),
        });
        let client = BridgeClient::new(rx, Duration::from_secs(1)).unwrap();

        let err = client.submit("1", "hi").await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Unavailable {
                phase: WorkerPhase::Starting
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn follows_published_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SUBMIT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "message": "sent"
            })))
            .mount(&server)
            .await;

        let (tx, rx) = watch::channel(WorkerStatus {
            phase: WorkerPhase::Starting,
            pid: None,
            base_url: server.uri(),
        });
        let client = BridgeClient::new(rx, Duration::from_secs(5)).unwrap();
        assert!(client.submit("1", "hi").await.is_err());

        tx.send_modify(|s| s.phase = WorkerPhase::Ready);
        let receipt = client.submit("1", "hi").await.unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.message, "sent");
    }

    #[tokio::test]
    async fn submit_posts_job_and_greeting() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SUBMIT_PATH))
            .and(body_json(serde_json::json!({"job_id": "42", "greeting": "Hello"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": false})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let receipt = client_for(&server).submit("42", "Hello").await.unwrap();
        assert!(!receipt.success);
    }

    #[tokio::test]
    async fn non_success_status_is_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(COMPOSE_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_string("model overloaded"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .compose(&JobDescriptor::new("1"), "cv", None)
            .await
            .unwrap_err();
        match err {
            BridgeError::Upstream { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "model overloaded");
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unexpected_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(COMPOSE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .compose(&JobDescriptor::new("1"), "cv", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Decode(_)));
        assert_eq!(err.kind(), ErrorKind::Upstream);
    }

    #[tokio::test]
    async fn slow_answer_is_left_to_the_caller() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SUBMIT_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"success": true}))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let client = BridgeClient::attached(server.uri(), Duration::from_millis(100)).unwrap();
        let receipt = client.submit("1", "hi").await.unwrap();
        assert!(receipt.success);
    }

    #[tokio::test]
    async fn stalled_stream_handshake_times_out() {
        // Accepts the connection but never answers the upgrade request.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let held = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(tcp);
        });

        let client =
            BridgeClient::attached(format!("http://{addr}"), Duration::from_millis(100)).unwrap();
        let err = client
            .open_stream("/api/apply/ws", &serde_json::json!({}), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
        assert!(err.is_transport_level());
        held.abort();
    }

    #[tokio::test]
    async fn unreachable_worker_is_transport() {
        let client = BridgeClient::attached("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let err = client.submit("1", "hi").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(!client.probe().await);
    }

    #[tokio::test]
    async fn search_returns_jobs_and_rejects_unsuccessful_answers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SEARCH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "jobs": [{"job_id": "a", "title": "Rust"}, {"job_id": "b"}],
                "total": 2
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(SEARCH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false,
                "message": "not logged in"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let criteria = SearchCriteria {
            keywords: "rust".into(),
            location: "Berlin".into(),
            salary_min: None,
            limit: Some(2),
        };
        let jobs = client.search(&criteria).await.unwrap();
        let ids: Vec<_> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let err = client.search(&criteria).await.unwrap_err();
        assert!(matches!(err, BridgeError::Upstream { ref body, .. } if body == "not logged in"));
    }

    #[tokio::test]
    async fn analysis_and_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ANALYZE_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"analysis": {"skills": ["rust"]}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(RECORDS_PATH))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let analysis = client.analyze_resume("cv").await.unwrap();
        assert_eq!(analysis["skills"][0], "rust");

        let record = ApplicationRecord {
            session_id: uuid::Uuid::new_v4(),
            requester: "alice".into(),
            job_id: "a".into(),
            title: "Rust".into(),
            company: String::new(),
            greeting: "hi".into(),
            success: true,
            message: "sent".into(),
            applied_at: chrono::Utc::now(),
        };
        client.record(&record).await.unwrap();
    }

    #[test]
    fn websocket_url_follows_scheme() {
        assert_eq!(
            ws_url("http://127.0.0.1:8765", "/api/apply/ws"),
            "ws://127.0.0.1:8765/api/apply/ws"
        );
        assert_eq!(ws_url("https://w.example", "/x"), "wss://w.example/x");
    }

    /// Accepts one WebSocket client, checks its first frame and replies with
    /// `frames`. Keeps the socket open afterwards when `linger` is set.
    async fn stream_server(frames: Vec<&'static str>, linger: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            assert!(first.into_text().unwrap().contains("job_ids"));
            for frame in frames {
                ws.send(Message::Text(frame.to_string())).await.unwrap();
            }
            if linger {
                tokio::time::sleep(Duration::from_secs(30)).await;
            } else {
                let _ = ws.close(None).await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn stream_decodes_frames_until_close() {
        let base = stream_server(
            vec![
                r#"{"stage": "applying", "progress": 0.5}"#,
                r#"{"progress": 1.0, "current": 1, "total": 1, "job": "j1", "success": true, "message": "ok"}"#,
                r#"{"completed": true, "message": "done"}"#,
            ],
            false,
        )
        .await;

        let client = BridgeClient::attached(base, Duration::from_secs(5)).unwrap();
        let mut stream = client
            .open_stream(
                "/api/apply/ws/apply",
                &serde_json::json!({"job_ids": ["j1"]}),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], ProgressEvent::stage("applying", 0.5));
        assert!(matches!(events[1], ProgressEvent::JobResult { .. }));
        assert!(matches!(events[3], ProgressEvent::Completed { .. }));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn cancelling_ends_the_stream() {
        let base = stream_server(vec![r#"{"stage": "searching", "progress": 0.1}"#], true).await;

        let cancel = CancellationToken::new();
        let client = BridgeClient::attached(base, Duration::from_secs(5)).unwrap();
        let mut stream = client
            .open_stream("/api/apply/ws", &serde_json::json!({"job_ids": []}), cancel.clone())
            .await
            .unwrap();

        assert!(stream.next().await.unwrap().is_ok());

        let waiter = tokio::spawn(async move {
            let next = stream.next().await;
            (next.is_none(), stream.next().await.is_none())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let (first, second) = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("stream should end promptly")
            .unwrap();
        assert!(first && second);
    }
}
