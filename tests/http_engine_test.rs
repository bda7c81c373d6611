//! HTTP 引擎客户端测试
//!
//! 在本地端口起一个返回固定 JSON 的 HTTP 桩, 校验请求形态与错误映射。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use scan_pool::config::EngineTimeouts;
use scan_pool::engine::{EngineClient, EngineConnector, EngineError, Endpoint, ScanHandle, ScanStatus};
use scan_pool::engine::HttpConnector;
use scan_pool::ScanOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use test_utils::init_logger;

type Responder = Arc<dyn Fn(&str) -> (u16, String) + Send + Sync>;

/// 按请求目标(路径+查询串)应答的引擎桩
struct StubEngine {
    port: u16,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl StubEngine {
    async fn serve<F>(respond: F) -> Self
    where
        F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
    {
        init_logger();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let respond: Responder = Arc::new(respond);

        let seen = requests.clone();
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(answer(socket, respond.clone(), seen.clone()));
            }
        });

        Self { port, requests, task }
    }

    fn client(&self, timeouts: EngineTimeouts) -> Arc<dyn EngineClient> {
        HttpConnector::new(timeouts)
            .unwrap()
            .connect(&Endpoint::new("127.0.0.1", self.port, "secret"))
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl Drop for StubEngine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn answer(mut socket: TcpStream, respond: Responder, seen: Arc<Mutex<Vec<String>>>) {
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&chunk[..n]),
        }
    }

    let text = String::from_utf8_lossy(&head);
    let target = text.split_whitespace().nth(1).unwrap_or_default().to_string();
    seen.lock().push(target.clone());

    let (status, body) = respond(&target);
    let reason = if status == 200 { "OK" } else { "Error" };
    let reply = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = socket.write_all(reply.as_bytes()).await;
    let _ = socket.shutdown().await;
}

fn timeouts() -> EngineTimeouts {
    EngineTimeouts {
        request: Duration::from_secs(2),
        health: Duration::from_secs(1),
        discovery_timeout: Duration::from_secs(2),
        discovery_poll: Duration::from_millis(10),
    }
}

fn ok(body: &str) -> (u16, String) {
    (200, body.to_string())
}

mod requests {
    use super::*;

    #[tokio::test]
    async fn test_health_check_sends_api_key() {
        let stub = StubEngine::serve(|_| ok(r#"{"version":"2.14.0"}"#)).await;
        assert!(stub.client(timeouts()).health_check().await);
        assert_eq!(
            stub.requests(),
            vec!["/JSON/core/view/version/?apikey=secret".to_string()]
        );

        let down = StubEngine::serve(|_| (503, String::new())).await;
        assert!(!down.client(timeouts()).health_check().await);
    }

    #[tokio::test]
    async fn test_start_runs_discovery_then_attack() {
        let stub = StubEngine::serve(|target| {
            if target.contains("/spider/action/scan/") {
                ok(r#"{"scan":"3"}"#)
            } else if target.contains("/spider/view/status/") {
                ok(r#"{"status":"100"}"#)
            } else if target.contains("/ascan/action/scan/") {
                ok(r#"{"scan":"4"}"#)
            } else {
                (404, String::new())
            }
        })
        .await;

        let handle = stub
            .client(timeouts())
            .start("https://example.com/app", &ScanOptions::default())
            .await
            .unwrap();
        assert_eq!(
            handle,
            ScanHandle {
                discovery_job_id: "3".into(),
                attack_job_id: "4".into(),
            }
        );

        let requests = stub.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].starts_with("/JSON/spider/action/scan/?apikey=secret&"));
        assert!(requests[0].contains("url=https%3A%2F%2Fexample.com%2Fapp"));
        assert!(requests[1].starts_with("/JSON/spider/view/status/?apikey=secret&"));
        assert!(requests[1].contains("scanId=3"));
        assert!(requests[2].starts_with("/JSON/ascan/action/scan/?apikey=secret&"));
        assert!(requests[2].contains("url=https%3A%2F%2Fexample.com%2Fapp"));
    }

    #[tokio::test]
    async fn test_results_decode_alerts() {
        let stub = StubEngine::serve(|_| {
            ok(r#"{"alerts":[{"name":"XSS","risk":"High","confidence":"Medium"}]}"#)
        })
        .await;

        let result = stub.client(timeouts()).results("https://example.com").await.unwrap();
        assert_eq!(result.total_findings(), 1);
        let requests = stub.requests();
        assert!(requests[0].starts_with("/JSON/core/view/alerts/?apikey=secret&"));
        assert!(requests[0].contains("baseurl=https%3A%2F%2Fexample.com"));
    }
}

mod errors {
    use super::*;

    #[tokio::test]
    async fn test_non_200_is_status_error() {
        let stub = StubEngine::serve(|_| (503, String::new())).await;
        let err = stub.client(timeouts()).results("https://example.com").await.unwrap_err();
        assert!(matches!(err, EngineError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_non_200_phase_status_reports_failed_scan() {
        let stub = StubEngine::serve(|target| {
            if target.contains("/spider/view/status/") {
                ok(r#"{"status":"100"}"#)
            } else {
                (500, String::new())
            }
        })
        .await;

        let handle = ScanHandle {
            discovery_job_id: "1".into(),
            attack_job_id: "2".into(),
        };
        let report = stub.client(timeouts()).progress(&handle).await.unwrap();
        assert_eq!(report.status, ScanStatus::Failed);

        let requests = stub.requests();
        assert!(requests[0].contains("scanId=1"));
        assert!(requests[1].starts_with("/JSON/ascan/view/status/"));
        assert!(requests[1].contains("scanId=2"));
    }

    #[tokio::test]
    async fn test_undecodable_body_is_malformed() {
        let stub = StubEngine::serve(|_| ok("<html>maintenance</html>")).await;
        let err = stub
            .client(timeouts())
            .start("https://example.com", &ScanOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_non_integer_status_is_malformed() {
        let stub = StubEngine::serve(|_| ok(r#"{"status":"running"}"#)).await;
        let handle = ScanHandle {
            discovery_job_id: "1".into(),
            attack_job_id: "2".into(),
        };
        let err = stub.client(timeouts()).progress(&handle).await.unwrap_err();
        assert!(matches!(err, EngineError::Malformed { .. }));
    }
}

mod discovery {
    use super::*;

    #[tokio::test]
    async fn test_stalled_discovery_times_out() {
        let stub = StubEngine::serve(|target| {
            if target.contains("/spider/action/scan/") {
                ok(r#"{"scan":"9"}"#)
            } else {
                ok(r#"{"status":"10"}"#)
            }
        })
        .await;
        let limit = Duration::from_millis(150);
        let client = stub.client(EngineTimeouts {
            discovery_timeout: limit,
            ..timeouts()
        });

        let err = client
            .start("https://example.com", &ScanOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DiscoveryTimeout(d) if d == limit));
        assert!(stub
            .requests()
            .iter()
            .all(|r| !r.contains("/ascan/action/scan/")));
    }

    #[tokio::test]
    async fn test_failed_discovery_aborts_start() {
        let stub = StubEngine::serve(|target| {
            if target.contains("/spider/action/scan/") {
                ok(r#"{"scan":"9"}"#)
            } else {
                (500, String::new())
            }
        })
        .await;

        let err = stub
            .client(timeouts())
            .start("https://example.com", &ScanOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DiscoveryFailed));
    }
}
