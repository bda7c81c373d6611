//! 引擎实例池
//!
//! 维护容量有界、可自愈的实例集合; 没有空闲实例时任务在队列中等待。
//! 后台两个循环: 健康巡检循环与队列调度循环, 由 `stop()` 统一取消。

pub mod instance;
pub mod queue;
pub mod runtime;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;

use crate::config::{ConfigError, PoolConfig};
use crate::engine::{EngineClient, EngineConnector};
use crate::health;
use crate::job::{ScanJob, ScanOptions};
use crate::{InstanceId, JobId, PoolError, Result};

pub use instance::{Instance, InstanceInfo, InstanceStatus};
pub use queue::JobQueue;
pub use runtime::{DockerRuntime, InstanceRuntime, InstanceSpec, PortAllocator, RuntimeError};

/// 在已绑定实例上执行一次扫描任务
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: ScanJob, engine: Arc<dyn EngineClient>) -> Result<()>;
}

/// 实例池状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatus {
    pub total_instances: usize,
    pub status_breakdown: BTreeMap<String, usize>,
    pub queue_size: usize,
    pub running_jobs: usize,
    pub instances: Vec<InstanceInfo>,
}

/// 任务结束(含被取消)时归还实例; 只解除本任务的绑定
struct InstanceLease {
    pool: Arc<PoolManager>,
    instance_id: InstanceId,
    job_id: JobId,
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.pool.release_job(&self.instance_id, &self.job_id);
    }
}

/// 实例池管理器
pub struct PoolManager {
    config: PoolConfig,
    runtime: Arc<dyn InstanceRuntime>,
    connector: Arc<dyn EngineConnector>,
    executor: Arc<dyn JobExecutor>,
    ports: PortAllocator,
    instances: Mutex<BTreeMap<InstanceId, Instance>>,
    /// 每次置备递增, 保证实例ID不复用
    generation: AtomicU64,
    queue: Arc<JobQueue>,
    jobs: Mutex<JoinSet<()>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("config", &self.config)
            .field("instances", &self.instances.lock().len())
            .field("queue", &self.queue.len())
            .finish()
    }
}

impl PoolManager {
    /// 创建实例池; 配置非法时返回错误
    pub fn new(
        config: PoolConfig,
        runtime: Arc<dyn InstanceRuntime>,
        connector: Arc<dyn EngineConnector>,
        executor: Arc<dyn JobExecutor>,
    ) -> std::result::Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let ports = PortAllocator::new(config.base_port, config.port_end(), config.verify_ports_free);
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            runtime,
            connector,
            executor,
            ports,
            instances: Mutex::new(BTreeMap::new()),
            generation: AtomicU64::new(0),
            queue: Arc::new(JobQueue::new()),
            jobs: Mutex::new(JoinSet::new()),
            loops: Mutex::new(Vec::new()),
            shutdown,
        }))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// 置备到最小实例数并启动后台循环
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.loops.lock().is_empty() {
            return Err(PoolError::AlreadyStarted);
        }
        info!("Starting engine pool manager...");
        self.shutdown.send_replace(false);

        self.ensure_min_instances().await;

        let mut loops = self.loops.lock();
        if !loops.is_empty() {
            return Err(PoolError::AlreadyStarted);
        }
        loops.push(self.spawn_health_loop());
        loops.push(self.spawn_queue_loop());
        info!(
            "Engine pool manager started with {} instances",
            self.instances.lock().len()
        );
        Ok(())
    }

    /// 取消后台循环与在途任务, 拆除全部实例
    pub async fn stop(&self) {
        info!("Stopping engine pool manager...");
        self.shutdown.send_replace(true);

        let loops: Vec<JoinHandle<()>> = self.loops.lock().drain(..).collect();
        for handle in loops {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Pool background loop ended abnormally: {}", e);
                }
            }
        }

        let mut jobs = std::mem::take(&mut *self.jobs.lock());
        jobs.abort_all();
        while let Some(joined) = jobs.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    error!("Dispatched job ended abnormally: {}", e);
                }
            }
        }

        let dropped = self.queue.drain();
        if !dropped.is_empty() {
            warn!("Dropped {} queued jobs on shutdown", dropped.len());
        }

        let retired: Vec<Instance> = std::mem::take(&mut *self.instances.lock())
            .into_values()
            .collect();
        let teardowns = retired.iter().map(|instance| async move {
            let spec = InstanceSpec {
                id: instance.id.clone(),
                endpoint: instance.endpoint.clone(),
            };
            if let Err(e) = self.runtime.teardown(&spec).await {
                error!("Error stopping engine instance {}: {}", instance.id, e);
            }
        });
        join_all(teardowns).await;
        info!("Engine pool manager stopped");
    }

    /// 提交任务到队列, 立即返回任务ID
    pub fn submit(&self, job: ScanJob) -> JobId {
        let job_id = job.id.clone();
        self.queue.push(job);
        info!("Job {} submitted to queue", job_id);
        job_id
    }

    pub fn submit_target(&self, target: impl Into<String>, options: ScanOptions) -> JobId {
        self.submit(ScanJob::new(target, options))
    }

    /// 为任务取得一个实例: 优先认领空闲健康实例, 否则在容量内置备新实例
    ///
    /// 返回的实例已处于 Busy 并绑定 `job_id`。
    pub async fn acquire_instance(&self, job_id: &JobId) -> Option<Instance> {
        if let Some(instance) = self.claim_idle(job_id) {
            return Some(instance);
        }

        match self.provision(Some(job_id)).await {
            Ok(instance) => Some(instance),
            Err(PoolError::InsufficientCapacity) => {
                debug!("No capacity for job {}", job_id);
                None
            }
            Err(e) => {
                warn!("Provisioning for job {} failed: {}", job_id, e);
                None
            }
        }
    }

    /// 归还实例; 实例已被回收时忽略
    pub fn release_instance(&self, instance_id: &str) {
        let mut instances = self.instances.lock();
        match instances.get_mut(instance_id) {
            Some(instance) => {
                if instance.unbind() {
                    info!("Released engine instance {}", instance_id);
                }
            }
            None => debug!("Release of unknown instance {} ignored", instance_id),
        }
    }

    /// 仅当实例仍绑定 `job_id` 时归还; 返回是否解除了绑定
    ///
    /// 实例已被回收或已换绑其他任务时忽略。
    pub fn release_job(&self, instance_id: &str, job_id: &str) -> bool {
        let mut instances = self.instances.lock();
        let Some(instance) = instances.get_mut(instance_id) else {
            debug!("Release of unknown instance {} ignored", instance_id);
            return false;
        };
        if instance.unbind_job(job_id) {
            info!("Released engine instance {} from job {}", instance_id, job_id);
            true
        } else {
            debug!(
                "Instance {} no longer bound to job {}, release ignored",
                instance_id, job_id
            );
            false
        }
    }

    pub fn instance(&self, instance_id: &str) -> Option<Instance> {
        self.instances.lock().get(instance_id).cloned()
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.instances.lock().values().cloned().collect()
    }

    /// 当前承载该任务的实例
    pub fn instance_for_job(&self, job_id: &str) -> Option<Instance> {
        self.instances
            .lock()
            .values()
            .find(|i| i.current_job.as_deref() == Some(job_id))
            .cloned()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn claim_idle(&self, job_id: &JobId) -> Option<Instance> {
        let freshness = self.config.unhealthy_grace;
        let mut instances = self.instances.lock();
        let instance = instances
            .values_mut()
            .find(|i| i.is_available(freshness))?;
        instance.bind(job_id);
        Some(instance.clone())
    }

    /// 置备一个新实例; 成功时可直接绑定任务
    async fn provision(&self, job_id: Option<&JobId>) -> Result<Instance> {
        let spec = self.reserve_slot()?;

        if let Err(e) = self.runtime.launch(&spec).await {
            self.discard(&spec.id);
            error!("Failed to start engine instance {}: {}", spec.id, e);
            return Err(e.into());
        }

        let client = self.connector.connect(&spec.endpoint);
        if !self.wait_until_healthy(client.as_ref()).await {
            if let Err(e) = self.runtime.teardown(&spec).await {
                error!("Error removing failed instance {}: {}", spec.id, e);
            }
            self.discard(&spec.id);
            warn!("Engine instance {} never became healthy", spec.id);
            return Err(PoolError::ProvisionTimeout(
                spec.id,
                self.config.provision_timeout,
            ));
        }

        let provisioned = {
            let mut instances = self.instances.lock();
            instances.get_mut(&spec.id).map(|instance| {
                instance.mark_provisioned(job_id);
                instance.clone()
            })
        };

        match provisioned {
            Some(instance) => {
                metrics::counter!("scan_pool_instances_provisioned_total").increment(1);
                info!(
                    "Created engine instance {} on port {}",
                    instance.id,
                    instance.port()
                );
                Ok(instance)
            }
            None => {
                // 置备期间池已停止
                if let Err(e) = self.runtime.teardown(&spec).await {
                    error!("Error removing orphaned instance {}: {}", spec.id, e);
                }
                Err(PoolError::ShuttingDown)
            }
        }
    }

    /// 在同一临界区内检查容量、分配端口并登记 Starting 实例
    fn reserve_slot(&self) -> Result<InstanceSpec> {
        let mut instances = self.instances.lock();
        if instances.len() >= self.config.max_instances {
            return Err(PoolError::InsufficientCapacity);
        }

        let used: HashSet<u16> = instances.values().map(Instance::port).collect();
        let (start, end) = self.ports.range();
        let port = self
            .ports
            .allocate(&used)
            .ok_or(PoolError::PortsExhausted { start, end })?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let spec = InstanceSpec::for_port(
            &self.config.host,
            port,
            generation,
            &self.config.api_key_prefix,
        );
        instances.insert(
            spec.id.clone(),
            Instance::starting(spec.id.clone(), spec.endpoint.clone()),
        );
        Ok(spec)
    }

    fn discard(&self, instance_id: &str) {
        self.instances.lock().remove(instance_id);
    }

    async fn wait_until_healthy(&self, client: &dyn EngineClient) -> bool {
        let probe_limit = self.config.health_timeout;
        let poll = self.config.provision_poll;
        let ready = async {
            loop {
                if health::probe(client, probe_limit).await.is_healthy() {
                    return;
                }
                time::sleep(poll).await;
            }
        };
        time::timeout(self.config.provision_timeout, ready).await.is_ok()
    }

    /// 补足到最小实例数
    pub async fn ensure_min_instances(&self) {
        let current = self
            .instances
            .lock()
            .values()
            .filter(|i| i.status != InstanceStatus::Unhealthy)
            .count();
        let needed = self.config.min_instances.saturating_sub(current);

        for _ in 0..needed {
            match self.provision(None).await {
                Ok(_) => {}
                Err(e @ (PoolError::InsufficientCapacity | PoolError::PortsExhausted { .. })) => {
                    warn!("Cannot top up engine pool: {}", e);
                    break;
                }
                Err(e) => warn!("Engine instance provisioning failed: {}", e),
            }
        }
    }

    /// 探测所有非 Starting 实例
    pub async fn health_check_all(&self) {
        let targets: Vec<(InstanceId, Arc<dyn EngineClient>)> = self
            .instances
            .lock()
            .values()
            .filter(|i| i.status != InstanceStatus::Starting)
            .map(|i| (i.id.clone(), self.connector.connect(&i.endpoint)))
            .collect();

        let limit = self.config.health_timeout;
        let probes = targets.into_iter().map(|(id, client)| async move {
            let outcome = health::probe(client.as_ref(), limit).await;
            (id, outcome)
        });
        let outcomes = join_all(probes).await;

        let mut instances = self.instances.lock();
        for (id, outcome) in outcomes {
            let Some(instance) = instances.get_mut(&id) else {
                continue;
            };
            if outcome.is_healthy() {
                if instance.mark_healthy() {
                    info!("Engine instance {} recovered", id);
                }
            } else if instance.mark_unhealthy() {
                warn!("Engine instance {} is unhealthy: {:?}", id, outcome);
            } else {
                debug!("Engine instance {} still unhealthy", id);
            }
        }
    }

    /// 回收超过宽限期仍不健康的实例, 返回被回收的ID
    pub async fn retire_unrecoverable(&self) -> Vec<InstanceId> {
        let grace = self.config.unhealthy_grace;
        let retired: Vec<Instance> = {
            let mut instances = self.instances.lock();
            let ids: Vec<InstanceId> = instances
                .values()
                .filter(|i| i.is_unrecoverable(grace))
                .map(|i| i.id.clone())
                .collect();
            ids.iter().filter_map(|id| instances.remove(id)).collect()
        };

        for instance in &retired {
            if let Some(job_id) = &instance.current_job {
                warn!(
                    "Job {} abandoned with unrecoverable instance {}",
                    job_id, instance.id
                );
            }
            let spec = InstanceSpec {
                id: instance.id.clone(),
                endpoint: instance.endpoint.clone(),
            };
            if let Err(e) = self.runtime.teardown(&spec).await {
                error!("Error stopping engine instance {}: {}", instance.id, e);
            }
            metrics::counter!("scan_pool_instances_retired_total").increment(1);
            info!("Removed unhealthy engine instance {}", instance.id);
        }
        retired.into_iter().map(|i| i.id).collect()
    }

    /// 一轮完整巡检: 探测、回收、补足
    pub async fn run_health_cycle(&self) {
        self.health_check_all().await;
        self.retire_unrecoverable().await;
        self.ensure_min_instances().await;
    }

    fn dispatch(self: &Arc<Self>, instance: Instance, job: ScanJob) {
        let lease = InstanceLease {
            pool: Arc::clone(self),
            instance_id: instance.id.clone(),
            job_id: job.id.clone(),
        };
        let client = self.connector.connect(&instance.endpoint);
        let executor = Arc::clone(&self.executor);

        let mut jobs = self.jobs.lock();
        reap_finished(&mut jobs);

        info!("Dispatching job {} to engine instance {}", job.id, instance.id);
        metrics::counter!("scan_pool_jobs_dispatched_total").increment(1);
        jobs.spawn(async move {
            let job_id = job.id.clone();
            if let Err(e) = executor.execute(job, client).await {
                error!(
                    "Job {} on engine instance {} failed: {}",
                    job_id, lease.instance_id, e
                );
            }
            drop(lease);
        });
    }

    /// 循环只持有队列与池的弱引用, 池被丢弃后自行退出
    fn spawn_queue_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let queue = Arc::clone(&self.queue);
        let mut shutdown = self.shutdown.subscribe();
        let backoff = self.config.queue_backoff;

        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = health::shutdown_signal(&mut shutdown) => break,
                    job = queue.pop() => job,
                };
                let Some(pool) = weak.upgrade() else { break };

                let acquired = pool.acquire_instance(&job.id).await;
                match acquired {
                    Some(instance) => pool.dispatch(instance, job),
                    None => {
                        debug!("No engine instance for job {}, requeueing", job.id);
                        metrics::counter!("scan_pool_jobs_requeued_total").increment(1);
                        queue.push(job);
                        drop(pool);
                        tokio::select! {
                            _ = health::shutdown_signal(&mut shutdown) => break,
                            _ = time::sleep(backoff) => {}
                        }
                    }
                }
            }
            debug!("Pool queue loop exited");
        })
    }

    fn spawn_health_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.health_check_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = health::shutdown_signal(&mut shutdown) => break,
                    _ = time::sleep(health::next_interval(interval)) => {
                        let Some(pool) = weak.upgrade() else { break };
                        pool.run_health_cycle().await;
                    }
                }
            }
            debug!("Pool health check loop exited");
        })
    }

    /// 只读状态快照
    pub fn status(&self) -> PoolStatus {
        let running_jobs = {
            let mut jobs = self.jobs.lock();
            reap_finished(&mut jobs);
            jobs.len()
        };
        let instances = self.instances.lock();
        let mut status_breakdown: BTreeMap<String, usize> = InstanceStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for instance in instances.values() {
            *status_breakdown
                .entry(instance.status.as_str().to_string())
                .or_default() += 1;
        }

        PoolStatus {
            total_instances: instances.len(),
            status_breakdown,
            queue_size: self.queue.len(),
            running_jobs,
            instances: instances.values().map(Instance::info).collect(),
        }
    }
}

/// 回收已结束的派发任务, 剩下的才算在途
fn reap_finished(jobs: &mut JoinSet<()>) {
    while let Some(finished) = jobs.try_join_next() {
        if let Err(e) = finished {
            error!("Dispatched job ended abnormally: {}", e);
        }
    }
}
