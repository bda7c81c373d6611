//! 节点发现
//!
//! 发现逻辑与负载均衡核心解耦: 启动时调用一次, 之后可手动重扫。

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, error, info};

use super::Node;
use crate::engine::{EngineConnector, Endpoint};
use crate::health;

/// 节点发现接口
#[async_trait]
pub trait NodeDiscovery: Send + Sync {
    async fn discover(&self) -> Vec<Node>;
}

/// 固定节点列表
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    endpoints: Vec<(Endpoint, u32)>,
}

impl StaticDiscovery {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints: endpoints.into_iter().map(|e| (e, 1)).collect(),
        }
    }

    pub fn with_weight(mut self, endpoint: Endpoint, weight: u32) -> Self {
        self.endpoints.push((endpoint, weight));
        self
    }
}

#[async_trait]
impl NodeDiscovery for StaticDiscovery {
    async fn discover(&self) -> Vec<Node> {
        self.endpoints
            .iter()
            .map(|(endpoint, weight)| Node::from_endpoint(endpoint.clone(), *weight))
            .collect()
    }
}

/// 解析服务名的全部地址, 每个地址一个节点
#[derive(Debug, Clone)]
pub struct DnsDiscovery {
    pub service: String,
    pub port: u16,
    pub api_key: String,
}

impl DnsDiscovery {
    pub fn new(service: impl Into<String>, port: u16, api_key: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            port,
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl NodeDiscovery for DnsDiscovery {
    async fn discover(&self) -> Vec<Node> {
        let addrs = match tokio::net::lookup_host((self.service.as_str(), self.port)).await {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!("Service {} did not resolve: {}", self.service, e);
                return Vec::new();
            }
        };

        let mut nodes: Vec<Node> = Vec::new();
        for addr in addrs {
            let node = Node::from_endpoint(
                Endpoint::new(addr.ip().to_string(), self.port, self.api_key.clone()),
                1,
            );
            if !nodes.iter().any(|n| n.id == node.id) {
                nodes.push(node);
            }
        }
        info!("Resolved {} engine nodes from {}", nodes.len(), self.service);
        nodes
    }
}

/// 本机端口扫描: 区间首端口总是加入, 其余端口探测通过才加入
pub struct LocalDiscovery {
    host: String,
    ports: Range<u16>,
    api_key: String,
    connector: Arc<dyn EngineConnector>,
    probe_timeout: Duration,
}

impl LocalDiscovery {
    pub fn new(
        host: impl Into<String>,
        ports: Range<u16>,
        api_key: impl Into<String>,
        connector: Arc<dyn EngineConnector>,
    ) -> Self {
        Self {
            host: host.into(),
            ports,
            api_key: api_key.into(),
            connector,
            probe_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    fn endpoint(&self, port: u16) -> Endpoint {
        Endpoint::new(self.host.clone(), port, self.api_key.clone())
    }
}

#[async_trait]
impl NodeDiscovery for LocalDiscovery {
    async fn discover(&self) -> Vec<Node> {
        let mut ports = self.ports.clone();
        let Some(first) = ports.next() else {
            return Vec::new();
        };

        let probes = ports.map(|port| {
            let endpoint = self.endpoint(port);
            let client = self.connector.connect(&endpoint);
            let limit = self.probe_timeout;
            async move {
                let outcome = health::probe(client.as_ref(), limit).await;
                outcome.is_healthy().then_some(endpoint)
            }
        });

        let mut nodes = vec![Node::from_endpoint(self.endpoint(first), 1)];
        nodes.extend(
            join_all(probes)
                .await
                .into_iter()
                .flatten()
                .map(|endpoint| Node::from_endpoint(endpoint, 1)),
        );
        nodes
    }
}

/// 依次尝试多个发现源, 返回第一个非空结果
#[derive(Default)]
pub struct FallbackDiscovery {
    sources: Vec<Box<dyn NodeDiscovery>>,
}

impl FallbackDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, source: impl NodeDiscovery + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }
}

#[async_trait]
impl NodeDiscovery for FallbackDiscovery {
    async fn discover(&self) -> Vec<Node> {
        for source in &self.sources {
            let nodes = source.discover().await;
            if !nodes.is_empty() {
                return nodes;
            }
        }
        error!("No engine nodes discovered from any source");
        Vec::new()
    }
}
