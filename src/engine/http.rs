//! 引擎 HTTP+JSON 控制协议
//!
//! 调用形态由外部扫描器决定: 每个操作一个 GET 请求, 参数全部放在查询串中
//! (apikey、目标URL、阶段任务ID), 响应为 JSON。

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{
    Alert, EngineClient, EngineConnector, EngineError, Endpoint, ProgressReport, ScanHandle,
    ScanResult, PROGRESS_FAILED,
};
use crate::config::EngineTimeouts;
use crate::job::ScanOptions;

const HEALTH_PATH: &str = "core/view/version";
const ALERTS_PATH: &str = "core/view/alerts";
const DISCOVERY_START_PATH: &str = "spider/action/scan";
const DISCOVERY_STATUS_PATH: &str = "spider/view/status";
const DISCOVERY_STOP_PATH: &str = "spider/action/stop";
const ATTACK_START_PATH: &str = "ascan/action/scan";
const ATTACK_STATUS_PATH: &str = "ascan/view/status";
const ATTACK_STOP_PATH: &str = "ascan/action/stop";

/// 单次告警拉取上限
const ALERT_PAGE_SIZE: &str = "1000";

#[derive(Debug, Deserialize)]
struct ScanStarted {
    scan: String,
}

#[derive(Debug, Deserialize)]
struct PhaseStatus {
    status: String,
}

#[derive(Debug, Deserialize)]
struct AlertPage {
    alerts: Vec<Alert>,
}

/// 基于 reqwest 的引擎客户端
#[derive(Debug, Clone)]
pub struct HttpEngineClient {
    client: Client,
    endpoint: Endpoint,
    timeouts: EngineTimeouts,
}

impl HttpEngineClient {
    pub fn new(client: Client, endpoint: Endpoint, timeouts: EngineTimeouts) -> Self {
        Self {
            client,
            endpoint,
            timeouts,
        }
    }

    fn api_url(&self, path: &str) -> String {
        api_url(&self.endpoint, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, EngineError> {
        let mut query = Vec::with_capacity(params.len() + 1);
        query.push(("apikey", self.endpoint.api_key.as_str()));
        query.extend_from_slice(params);

        let response = self
            .client
            .get(self.api_url(path))
            .query(&query)
            .timeout(self.timeouts.request)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(EngineError::Status {
                operation,
                status: response.status().as_u16(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| EngineError::Malformed {
                operation,
                reason: e.to_string(),
            })
    }

    async fn start_discovery(&self, target: &str) -> Result<String, EngineError> {
        let started: ScanStarted = self
            .get_json(
                "discovery start",
                DISCOVERY_START_PATH,
                &[
                    ("url", target),
                    ("maxChildren", "10"),
                    ("recurse", "true"),
                    ("contextName", ""),
                    ("subtreeOnly", "false"),
                ],
            )
            .await?;
        Ok(started.scan)
    }

    async fn start_attack(&self, target: &str, options: &ScanOptions) -> Result<String, EngineError> {
        let policy = options.scan_policy.as_deref().unwrap_or("");
        let started: ScanStarted = self
            .get_json(
                "attack start",
                ATTACK_START_PATH,
                &[
                    ("url", target),
                    ("recurse", "true"),
                    ("inScopeOnly", "false"),
                    ("scanPolicyName", policy),
                    ("method", "GET"),
                    ("postData", ""),
                ],
            )
            .await?;
        Ok(started.scan)
    }

    /// 查询单个阶段进度; 引擎返回非200时记为错误哨兵
    async fn phase_progress(
        &self,
        operation: &'static str,
        path: &str,
        scan_id: &str,
    ) -> Result<i32, EngineError> {
        match self
            .get_json::<PhaseStatus>(operation, path, &[("scanId", scan_id)])
            .await
        {
            Ok(body) => parse_status(operation, &body.status),
            Err(EngineError::Status { status, .. }) => {
                warn!("{} on {} returned HTTP {}", operation, self.endpoint, status);
                Ok(PROGRESS_FAILED)
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_for_discovery(&self, scan_id: &str) -> Result<(), EngineError> {
        let limit = self.timeouts.discovery_timeout;
        let poll = async {
            loop {
                let progress = self
                    .phase_progress("discovery status", DISCOVERY_STATUS_PATH, scan_id)
                    .await?;
                debug!("discovery {} on {} at {}%", scan_id, self.endpoint, progress);
                if progress >= 100 {
                    return Ok::<(), EngineError>(());
                }
                if progress == PROGRESS_FAILED {
                    return Err(EngineError::DiscoveryFailed);
                }
                tokio::time::sleep(self.timeouts.discovery_poll).await;
            }
        };

        match tokio::time::timeout(limit, poll).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::DiscoveryTimeout(limit)),
        }
    }

    async fn stop_phase(&self, operation: &'static str, path: &str, scan_id: &str) -> Result<(), EngineError> {
        self.get_json::<serde_json::Value>(operation, path, &[("scanId", scan_id)])
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl EngineClient for HttpEngineClient {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn health_check(&self) -> bool {
        let result = self
            .client
            .get(self.api_url(HEALTH_PATH))
            .query(&[("apikey", self.endpoint.api_key.as_str())])
            .timeout(self.timeouts.health)
            .send()
            .await;

        match result {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                debug!("health probe to {} failed: {}", self.endpoint, e);
                false
            }
        }
    }

    async fn start(&self, target: &str, options: &ScanOptions) -> Result<ScanHandle, EngineError> {
        validate_target(target)?;

        let discovery_job_id = self.start_discovery(target).await?;
        self.wait_for_discovery(&discovery_job_id).await?;
        let attack_job_id = self.start_attack(target, options).await?;

        Ok(ScanHandle {
            discovery_job_id,
            attack_job_id,
        })
    }

    async fn progress(&self, handle: &ScanHandle) -> Result<ProgressReport, EngineError> {
        let discovery = self
            .phase_progress("discovery status", DISCOVERY_STATUS_PATH, &handle.discovery_job_id)
            .await?;
        let attack = self
            .phase_progress("attack status", ATTACK_STATUS_PATH, &handle.attack_job_id)
            .await?;
        Ok(ProgressReport::blend(discovery, attack))
    }

    async fn results(&self, target: &str) -> Result<ScanResult, EngineError> {
        let page: AlertPage = self
            .get_json(
                "alerts",
                ALERTS_PATH,
                &[("baseurl", target), ("start", "0"), ("count", ALERT_PAGE_SIZE)],
            )
            .await?;
        Ok(ScanResult::from_alerts(target, page.alerts))
    }

    async fn stop(&self, handle: &ScanHandle) -> Result<(), EngineError> {
        // 两个阶段都尝试停止, 返回第一个错误
        let discovery = self
            .stop_phase("discovery stop", DISCOVERY_STOP_PATH, &handle.discovery_job_id)
            .await;
        let attack = self
            .stop_phase("attack stop", ATTACK_STOP_PATH, &handle.attack_job_id)
            .await;
        discovery.and(attack)
    }
}

/// 共享连接池的客户端工厂
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: Client,
    timeouts: EngineTimeouts,
}

impl HttpConnector {
    pub fn new(timeouts: EngineTimeouts) -> Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(timeouts.health)
            .build()?;
        Ok(Self { client, timeouts })
    }
}

impl EngineConnector for HttpConnector {
    fn connect(&self, endpoint: &Endpoint) -> Arc<dyn EngineClient> {
        Arc::new(HttpEngineClient::new(
            self.client.clone(),
            endpoint.clone(),
            self.timeouts.clone(),
        ))
    }
}

fn api_url(endpoint: &Endpoint, path: &str) -> String {
    format!("{}/JSON/{}/", endpoint.url(), path)
}

/// 目标必须带协议与主机名
fn validate_target(target: &str) -> Result<(), EngineError> {
    let url = Url::parse(target).map_err(|_| EngineError::InvalidTarget(target.to_string()))?;
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(EngineError::InvalidTarget(target.to_string())),
    }
}

fn parse_status(operation: &'static str, raw: &str) -> Result<i32, EngineError> {
    raw.trim().parse().map_err(|_| EngineError::Malformed {
        operation,
        reason: format!("non-integer status {raw:?}"),
    })
}
