//! 扫描编排
//!
//! 把一次扫描任务落到具体引擎上执行: 健康检查 → 启动 → 轮询进度 → 取结果。
//! 进度以事件形式广播, 订阅方自行决定如何展示或持久化。

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time;

use crate::balancer::{ClusterStatus, LoadBalancer};
use crate::config::OrchestratorConfig;
use crate::engine::{EngineClient, EngineConnector, ProgressReport, ScanHandle, ScanResult, ScanStatus};
use crate::job::ScanJob;
use crate::pool::{JobExecutor, PoolManager, PoolStatus};
use crate::{JobId, PoolError, Result};

/// 事件通道容量; 慢订阅者会丢失最旧的事件
const EVENT_CAPACITY: usize = 256;

/// 扫描生命周期事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Queued { job_id: JobId },
    Started { job_id: JobId, engine: String },
    Progress { job_id: JobId, report: ProgressReport },
    Completed { job_id: JobId, result: ScanResult },
    Failed { job_id: JobId, reason: String },
}

impl ProgressEvent {
    pub fn job_id(&self) -> &str {
        match self {
            ProgressEvent::Queued { job_id }
            | ProgressEvent::Started { job_id, .. }
            | ProgressEvent::Progress { job_id, .. }
            | ProgressEvent::Completed { job_id, .. }
            | ProgressEvent::Failed { job_id, .. } => job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Completed { .. } | ProgressEvent::Failed { .. }
        )
    }
}

/// 任务执行方式
#[derive(Clone)]
pub enum ExecutionMode {
    /// 提交到实例池排队
    Pooled(Arc<PoolManager>),
    /// 由负载均衡器选点后直接执行
    Balanced(Arc<LoadBalancer>),
    /// 固定单实例
    Single(Arc<dyn EngineClient>),
}

impl ExecutionMode {
    /// 启用池时优先用池, 其次负载均衡, 最后单实例
    pub fn choose(
        pool_enabled: bool,
        pool: Option<Arc<PoolManager>>,
        balancer: Option<Arc<LoadBalancer>>,
        single: Arc<dyn EngineClient>,
    ) -> Self {
        match (pool_enabled, pool, balancer) {
            (true, Some(pool), _) => ExecutionMode::Pooled(pool),
            (_, _, Some(balancer)) => ExecutionMode::Balanced(balancer),
            _ => ExecutionMode::Single(single),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionMode::Pooled(_) => "pooled",
            ExecutionMode::Balanced(_) => "balanced",
            ExecutionMode::Single(_) => "single",
        }
    }

    /// 汇总当前执行方式下的集群概况
    pub async fn overview(&self) -> ClusterOverview {
        let mut overview = ClusterOverview {
            mode: self.name(),
            pool_enabled: matches!(self, ExecutionMode::Pooled(_)),
            balancer: None,
            pool: None,
            single_engine: None,
        };
        match self {
            ExecutionMode::Pooled(pool) => overview.pool = Some(pool.status()),
            ExecutionMode::Balanced(balancer) => overview.balancer = Some(balancer.status()),
            ExecutionMode::Single(engine) => {
                overview.single_engine = Some(SingleEngineInfo {
                    url: engine.endpoint().url(),
                    healthy: engine.health_check().await,
                });
            }
        }
        overview
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SingleEngineInfo {
    pub url: String,
    pub healthy: bool,
}

/// 管理接口用的集群概况
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterOverview {
    pub mode: &'static str,
    pub pool_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balancer: Option<ClusterStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_engine: Option<SingleEngineInfo>,
}

/// 扫描编排器
pub struct ScanOrchestrator {
    config: OrchestratorConfig,
    connector: Arc<dyn EngineConnector>,
    events: broadcast::Sender<ProgressEvent>,
    tasks: Mutex<JoinSet<()>>,
}

impl ScanOrchestrator {
    pub fn new(config: OrchestratorConfig, connector: Arc<dyn EngineConnector>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            config,
            connector,
            events,
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ProgressEvent) {
        // 没有订阅者时丢弃
        let _ = self.events.send(event);
    }

    /// 按执行方式提交任务, 立即返回任务ID
    pub fn submit(self: &Arc<Self>, mode: &ExecutionMode, job: ScanJob) -> JobId {
        let job_id = job.id.clone();
        self.emit(ProgressEvent::Queued {
            job_id: job_id.clone(),
        });

        match mode {
            ExecutionMode::Pooled(pool) => {
                pool.submit(job);
            }
            ExecutionMode::Balanced(balancer) => {
                let this = Arc::clone(self);
                let balancer = Arc::clone(balancer);
                self.spawn(async move {
                    let _ = this.run_balanced(&balancer, job).await;
                });
            }
            ExecutionMode::Single(engine) => {
                let this = Arc::clone(self);
                let engine = Arc::clone(engine);
                self.spawn(async move {
                    let _ = this.drive(&job, engine.as_ref()).await;
                });
            }
        }
        job_id
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                error!("Scan task ended abnormally: {}", e);
            }
        }
        tasks.spawn(task);
    }

    /// 取消所有直接执行中的扫描
    pub async fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        tasks.abort_all();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    error!("Scan task ended abnormally: {}", e);
                }
            }
        }
    }

    /// 由负载均衡器选点执行; 任何退出路径都会归还节点
    pub async fn run_balanced(&self, balancer: &Arc<LoadBalancer>, job: ScanJob) -> Result<ScanResult> {
        let Some(lease) = balancer.lease(&job.id) else {
            self.emit(ProgressEvent::Failed {
                job_id: job.id.clone(),
                reason: PoolError::NoHealthyNode.to_string(),
            });
            return Err(PoolError::NoHealthyNode);
        };
        let engine = self.connector.connect(&lease.node().endpoint);
        let outcome = self.drive(&job, engine.as_ref()).await;
        drop(lease);
        outcome
    }

    /// 在指定引擎上完整执行一次扫描
    pub async fn drive(&self, job: &ScanJob, engine: &dyn EngineClient) -> Result<ScanResult> {
        let outcome = self.drive_inner(job, engine).await;
        match &outcome {
            Ok(result) => {
                info!(
                    "Scan {} completed with {} findings (grade {})",
                    job.id,
                    result.total_findings(),
                    result.risk_grade
                );
                self.emit(ProgressEvent::Completed {
                    job_id: job.id.clone(),
                    result: result.clone(),
                });
            }
            Err(e) => {
                error!("Scan {} failed: {}", job.id, e);
                self.emit(ProgressEvent::Failed {
                    job_id: job.id.clone(),
                    reason: e.to_string(),
                });
            }
        }
        outcome
    }

    async fn drive_inner(&self, job: &ScanJob, engine: &dyn EngineClient) -> Result<ScanResult> {
        let url = engine.endpoint().url();
        if !engine.health_check().await {
            return Err(PoolError::EngineUnavailable(url));
        }

        info!("Starting scan {} of {} on {}", job.id, job.target, url);
        self.emit(ProgressEvent::Started {
            job_id: job.id.clone(),
            engine: url,
        });
        let handle = engine.start(&job.target, &job.options).await?;

        let polled = time::timeout(
            self.config.scan_timeout,
            self.poll_until_done(job, engine, &handle),
        )
        .await;
        match polled {
            Ok(done) => done?,
            Err(_) => {
                warn!(
                    "Scan {} exceeded {:?}, stopping it on the engine",
                    job.id, self.config.scan_timeout
                );
                if let Err(e) = engine.stop(&handle).await {
                    warn!("Failed to stop scan {}: {}", job.id, e);
                }
                return Err(PoolError::ScanTimeout(job.id.clone()));
            }
        }

        Ok(engine.results(&job.target).await?)
    }

    async fn poll_until_done(
        &self,
        job: &ScanJob,
        engine: &dyn EngineClient,
        handle: &ScanHandle,
    ) -> Result<()> {
        loop {
            let report = engine.progress(handle).await?;
            debug!(
                "Scan {} at {}% ({:?})",
                job.id, report.percent, report.phase
            );
            self.emit(ProgressEvent::Progress {
                job_id: job.id.clone(),
                report,
            });

            match report.status {
                ScanStatus::Completed => return Ok(()),
                ScanStatus::Failed => return Err(PoolError::ScanFailed(job.id.clone())),
                ScanStatus::Running => time::sleep(self.config.progress_poll).await,
            }
        }
    }
}

#[async_trait]
impl JobExecutor for ScanOrchestrator {
    async fn execute(&self, job: ScanJob, engine: Arc<dyn EngineClient>) -> Result<()> {
        self.drive(&job, engine.as_ref()).await.map(|_| ())
    }
}
