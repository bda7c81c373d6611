//! 引擎节点负载均衡
//!
//! 维护已知引擎节点及其健康/负载指标, 为新任务挑选节点并记账。
//! 健康检查失败的节点只会被排除在选择之外, 是否移除由实例池决定。

pub mod discovery;
mod strategy;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{BalancerConfig, ConfigError};
use crate::engine::{EngineConnector, Endpoint};
use crate::health::{self, ProbeOutcome};
use crate::{JobId, NodeId};

pub use discovery::{DnsDiscovery, FallbackDiscovery, LocalDiscovery, NodeDiscovery, StaticDiscovery};

/// 不健康节点的负载分惩罚
const UNHEALTHY_PENALTY: f64 = 1000.0;
/// 慢节点每秒延迟的负载分惩罚
const LATENCY_PENALTY_PER_SEC: f64 = 0.1;

/// 负载均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    #[default]
    LeastLoaded,
    WeightedRoundRobin,
    RandomWeighted,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastLoaded => "least_loaded",
            Strategy::WeightedRoundRobin => "weighted_round_robin",
            Strategy::RandomWeighted => "random_weighted",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_loaded" | "least_connections" => Ok(Strategy::LeastLoaded),
            "weighted_round_robin" => Ok(Strategy::WeightedRoundRobin),
            "random_weighted" | "random" => Ok(Strategy::RandomWeighted),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// 健康状态变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Recovered,
    Failed,
    Unchanged,
}

/// 负载均衡器视角的引擎节点
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub endpoint: Endpoint,
    pub weight: u32,
    pub active_jobs: u32,
    pub total_jobs: u64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub latency: Duration,
    pub healthy: bool,
}

impl Node {
    /// 新节点默认视为健康, 由后续巡检修正
    pub fn new(id: impl Into<NodeId>, endpoint: Endpoint, weight: u32) -> Self {
        Self {
            id: id.into(),
            endpoint,
            weight,
            active_jobs: 0,
            total_jobs: 0,
            last_health_check: None,
            latency: Duration::ZERO,
            healthy: true,
        }
    }

    /// 以 `engine-{host}-{port}` 作为节点ID
    pub fn from_endpoint(endpoint: Endpoint, weight: u32) -> Self {
        let id = format!("engine-{}-{}", endpoint.host, endpoint.port);
        Self::new(id, endpoint, weight)
    }

    /// 负载分, 越低越空闲
    pub fn load_score(&self, slow_latency: Duration) -> f64 {
        let mut score = self.active_jobs as f64 / self.weight.max(1) as f64;
        if !self.healthy {
            score += UNHEALTHY_PENALTY;
        }
        if self.latency > slow_latency {
            score += self.latency.as_secs_f64() * LATENCY_PENALTY_PER_SEC;
        }
        score
    }

    /// 应用一次探测结果
    pub fn record_probe(&mut self, outcome: ProbeOutcome, failure_latency: Duration) -> HealthTransition {
        self.last_health_check = Some(Utc::now());
        match outcome {
            ProbeOutcome::Healthy { latency } => {
                self.latency = latency;
                if self.healthy {
                    HealthTransition::Unchanged
                } else {
                    self.healthy = true;
                    HealthTransition::Recovered
                }
            }
            ProbeOutcome::Unhealthy { .. } | ProbeOutcome::TimedOut => {
                self.latency = failure_latency;
                if self.healthy {
                    self.healthy = false;
                    HealthTransition::Failed
                } else {
                    HealthTransition::Unchanged
                }
            }
        }
    }

    fn info(&self, slow_latency: Duration) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            url: self.endpoint.url(),
            healthy: self.healthy,
            active_jobs: self.active_jobs,
            total_jobs: self.total_jobs,
            latency_secs: self.latency.as_secs_f64(),
            weight: self.weight,
            load_score: self.load_score(slow_latency),
            last_health_check: self.last_health_check,
        }
    }
}

/// 节点状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub url: String,
    pub healthy: bool,
    pub active_jobs: u32,
    pub total_jobs: u64,
    pub latency_secs: f64,
    pub weight: u32,
    pub load_score: f64,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// 集群状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterStatus {
    pub strategy: Strategy,
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub unhealthy_nodes: usize,
    pub total_active_jobs: u64,
    pub total_jobs_processed: u64,
    pub nodes: Vec<NodeInfo>,
}

/// 节点占用租约
#[derive(Debug)]
pub struct NodeLease {
    balancer: Arc<LoadBalancer>,
    node: Node,
    job_id: JobId,
}

impl NodeLease {
    pub fn node(&self) -> &Node {
        &self.node
    }
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        self.balancer.release(&self.node.id, &self.job_id);
    }
}

#[derive(Debug, Default)]
struct Registry {
    nodes: Vec<Node>,
    cursor: usize,
}

impl Registry {
    fn get_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    fn pick(&mut self, strategy: Strategy, slow_latency: Duration) -> Option<usize> {
        let healthy: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].healthy)
            .collect();
        let candidates: Vec<&Node> = healthy.iter().map(|&i| &self.nodes[i]).collect();
        let picked = strategy::select(strategy, &candidates, &mut self.cursor, slow_latency)?;
        Some(healthy[picked])
    }
}

/// 引擎负载均衡器
pub struct LoadBalancer {
    config: BalancerConfig,
    connector: Arc<dyn EngineConnector>,
    registry: Mutex<Registry>,
    shutdown: watch::Sender<bool>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("config", &self.config)
            .field("nodes", &self.registry.lock().nodes.len())
            .finish()
    }
}

impl LoadBalancer {
    pub fn new(config: BalancerConfig, connector: Arc<dyn EngineConnector>) -> Result<Self, ConfigError> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            connector,
            registry: Mutex::new(Registry::default()),
            shutdown,
            health_task: Mutex::new(None),
        })
    }

    pub fn strategy(&self) -> Strategy {
        self.config.strategy
    }

    /// 注册节点; 同ID节点会被替换
    pub fn add_node(&self, node: Node) {
        let mut registry = self.registry.lock();
        info!("Added engine node {} at {}", node.id, node.endpoint.url());
        match registry.get_mut(&node.id) {
            Some(existing) => *existing = node,
            None => registry.nodes.push(node),
        }
    }

    /// 按地址注册节点, 返回生成的节点ID
    pub fn add_endpoint(&self, host: &str, port: u16, api_key: &str, weight: u32) -> NodeId {
        let node = Node::from_endpoint(Endpoint::new(host, port, api_key), weight);
        let id = node.id.clone();
        self.add_node(node);
        id
    }

    /// 移除节点, 未知ID忽略
    pub fn remove_node(&self, id: &str) {
        let mut registry = self.registry.lock();
        let before = registry.nodes.len();
        registry.nodes.retain(|n| n.id != id);
        if registry.nodes.len() != before {
            info!("Removed engine node {}", id);
        }
    }

    pub fn node(&self, id: &str) -> Option<Node> {
        self.registry.lock().nodes.iter().find(|n| n.id == id).cloned()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.registry.lock().nodes.clone()
    }

    /// 按当前策略选出一个健康节点, 不记账
    pub fn select_node(&self) -> Option<Node> {
        let mut registry = self.registry.lock();
        match registry.pick(self.config.strategy, self.config.slow_latency) {
            Some(idx) => Some(registry.nodes[idx].clone()),
            None => {
                warn!("No healthy engine nodes available");
                None
            }
        }
    }

    /// 选点并在同一临界区内增加计数
    pub fn assign(&self, job_id: &JobId) -> Option<Node> {
        let mut registry = self.registry.lock();
        let Some(idx) = registry.pick(self.config.strategy, self.config.slow_latency) else {
            warn!("No healthy engine nodes available for job {}", job_id);
            return None;
        };

        let node = &mut registry.nodes[idx];
        node.active_jobs += 1;
        node.total_jobs += 1;
        metrics::counter!("scan_pool_jobs_assigned_total").increment(1);
        info!("Assigned job {} to engine node {}", job_id, node.id);
        Some(node.clone())
    }

    /// 选点并返回租约, 租约析构时自动归还
    pub fn lease(self: &Arc<Self>, job_id: &JobId) -> Option<NodeLease> {
        let node = self.assign(job_id)?;
        Some(NodeLease {
            balancer: Arc::clone(self),
            node,
            job_id: job_id.clone(),
        })
    }

    /// 归还任务占用, 计数不低于零
    pub fn release(&self, node_id: &str, job_id: &JobId) {
        let mut registry = self.registry.lock();
        if let Some(node) = registry.get_mut(node_id) {
            node.active_jobs = node.active_jobs.saturating_sub(1);
            metrics::counter!("scan_pool_jobs_released_total").increment(1);
            info!("Released job {} from engine node {}", job_id, node_id);
        }
    }

    /// 并发探测所有节点并更新健康状态
    pub async fn health_check_all(&self) {
        let targets: Vec<(NodeId, Endpoint)> = self
            .registry
            .lock()
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.endpoint.clone()))
            .collect();

        let limit = self.config.health_timeout;
        let probes = targets.into_iter().map(|(id, endpoint)| {
            let client = self.connector.connect(&endpoint);
            async move { (id, health::probe(client.as_ref(), limit).await) }
        });
        let outcomes = join_all(probes).await;

        let mut registry = self.registry.lock();
        for (id, outcome) in outcomes {
            // 探测期间被移除的节点直接跳过
            let Some(node) = registry.get_mut(&id) else {
                continue;
            };
            match node.record_probe(outcome, self.config.failure_latency) {
                HealthTransition::Recovered => info!("Engine node {} recovered", id),
                HealthTransition::Failed => warn!("Engine node {} failed health check: {:?}", id, outcome),
                HealthTransition::Unchanged => debug!("Engine node {} probe: {:?}", id, outcome),
            }
        }
        let healthy = registry.nodes.iter().filter(|n| n.healthy).count();
        metrics::gauge!("scan_pool_healthy_nodes").set(healthy as f64);
    }

    /// 执行一次节点发现, 返回新注册的节点数
    pub async fn rediscover(&self, discovery: &dyn NodeDiscovery) -> usize {
        let found = discovery.discover().await;
        let mut added = 0;
        for node in found {
            if self.node(&node.id).is_none() {
                added += 1;
                self.add_node(node);
            }
        }
        added
    }

    /// 发现节点并启动健康巡检循环
    pub async fn start(self: &Arc<Self>, discovery: &dyn NodeDiscovery) {
        info!("Starting engine load balancer...");
        self.rediscover(discovery).await;

        let mut task = self.health_task.lock();
        if task.is_none() {
            self.shutdown.send_replace(false);
            *task = Some(self.spawn_health_loop());
        }
        info!(
            "Engine load balancer started with {} nodes",
            self.registry.lock().nodes.len()
        );
    }

    /// 停止健康巡检循环
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let task = self.health_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Health check loop ended abnormally: {}", e);
            }
        }
        info!("Engine load balancer stopped");
    }

    fn spawn_health_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.health_check_interval;
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = health::shutdown_signal(&mut shutdown) => break,
                    _ = tokio::time::sleep(health::next_interval(interval)) => {
                        let Some(balancer) = weak.upgrade() else { break };
                        balancer.health_check_all().await;
                    }
                }
            }
            debug!("Balancer health check loop exited");
        })
    }

    /// 只读状态快照
    pub fn status(&self) -> ClusterStatus {
        let registry = self.registry.lock();
        let healthy_nodes = registry.nodes.iter().filter(|n| n.healthy).count();
        ClusterStatus {
            strategy: self.config.strategy,
            total_nodes: registry.nodes.len(),
            healthy_nodes,
            unhealthy_nodes: registry.nodes.len() - healthy_nodes,
            total_active_jobs: registry.nodes.iter().map(|n| n.active_jobs as u64).sum(),
            total_jobs_processed: registry.nodes.iter().map(|n| n.total_jobs).sum(),
            nodes: registry
                .nodes
                .iter()
                .map(|n| n.info(self.config.slow_latency))
                .collect(),
        }
    }
}
