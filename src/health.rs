//! 引擎存活探测
//!
//! 负载均衡器与实例池共用同一套探测: 有界超时、记录延迟。

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant};

use crate::engine::EngineClient;

/// 单次探测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy { latency: Duration },
    Unhealthy { latency: Duration },
    TimedOut,
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy { .. })
    }

    /// 探测延迟; 超时按给定惩罚值记录
    pub fn latency_or(&self, penalty: Duration) -> Duration {
        match self {
            ProbeOutcome::Healthy { latency } | ProbeOutcome::Unhealthy { latency } => *latency,
            ProbeOutcome::TimedOut => penalty,
        }
    }
}

/// 在 `limit` 内探测一次引擎
pub async fn probe(client: &dyn EngineClient, limit: Duration) -> ProbeOutcome {
    let started = Instant::now();
    match time::timeout(limit, client.health_check()).await {
        Ok(true) => ProbeOutcome::Healthy {
            latency: started.elapsed(),
        },
        Ok(false) => ProbeOutcome::Unhealthy {
            latency: started.elapsed(),
        },
        Err(_) => ProbeOutcome::TimedOut,
    }
}

/// 计算下一次巡检间隔(基准±5%随机抖动), 避免多个循环同时打到引擎
pub fn next_interval(base: Duration) -> Duration {
    let jitter = rand::random_range(0..=10u32);
    base + (base * jitter) / 100 - base / 20
}

/// 等待停机信号; 发送端被丢弃同样视为停机
///
/// 只返回 `()`, 不把 `watch::Ref` 带出 await 点, 可直接放进 `select!` 分支。
pub(crate) async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}
