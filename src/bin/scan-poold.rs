//! scan-poold: 引擎实例池守护进程
//!
//! 用法: `scan-poold [TARGET_URL...]`, 配置全部来自 `SCAN_POOL_*` 环境变量。

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use scan_pool::balancer::{DnsDiscovery, FallbackDiscovery, LocalDiscovery};
use scan_pool::engine::http::HttpConnector;
use scan_pool::engine::EngineConnector;
use scan_pool::orchestrator::ExecutionMode;
use scan_pool::pool::DockerRuntime;
use scan_pool::{LoadBalancer, PoolManager, ScanJob, ScanOptions, ScanOrchestrator, Settings};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> scan_pool::Result<()> {
    env_logger::init();

    let settings = Settings::from_env()?;
    let connector: Arc<dyn EngineConnector> = Arc::new(HttpConnector::new(settings.engine.clone())?);
    let orchestrator = ScanOrchestrator::new(settings.orchestrator.clone(), connector.clone());

    let balancer = Arc::new(LoadBalancer::new(settings.balancer.clone(), connector.clone())?);
    let single = &settings.single_engine;
    let discovery = FallbackDiscovery::new()
        .then(DnsDiscovery::new(
            settings.balancer.discovery_service.clone(),
            single.port,
            single.api_key.clone(),
        ))
        .then(LocalDiscovery::new(
            single.host.clone(),
            single.port..single.port.saturating_add(10),
            single.api_key.clone(),
            connector.clone(),
        ));
    balancer.start(&discovery).await;

    let pool = if settings.pool.pool_enabled {
        let pool = PoolManager::new(
            settings.pool.clone(),
            Arc::new(DockerRuntime::default()),
            connector.clone(),
            orchestrator.clone(),
        )?;
        pool.start().await?;
        Some(pool)
    } else {
        info!("Engine pool disabled, scans run through the load balancer");
        None
    };

    let mode = ExecutionMode::choose(
        settings.pool.pool_enabled,
        pool.clone(),
        Some(balancer.clone()),
        connector.connect(single),
    );
    info!("Execution mode: {}", mode.name());

    for target in std::env::args().skip(1) {
        let job_id = orchestrator.submit(&mode, ScanJob::new(target.clone(), ScanOptions::default()));
        info!("Submitted scan {} for {}", job_id, target);
    }

    let mut events = orchestrator.subscribe();
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                break;
            }
            _ = ticker.tick() => {
                match serde_json::to_string(&mode.overview().await) {
                    Ok(json) => info!("Cluster overview: {}", json),
                    Err(e) => warn!("Failed to serialize overview: {}", e),
                }
            }
            event = events.recv() => match event {
                Ok(event) if event.is_terminal() => info!("Scan {} finished: {:?}", event.job_id(), event),
                Ok(_) => {}
                Err(e) => warn!("Event stream lagged: {}", e),
            },
        }
    }

    orchestrator.shutdown().await;
    if let Some(pool) = pool {
        pool.stop().await;
    }
    balancer.stop().await;
    Ok(())
}
