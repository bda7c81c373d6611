//! 池内实例及其状态机
//!
//! `Starting → Idle ⇄ Busy`, 任意状态巡检失败 `→ Unhealthy`,
//! `Unhealthy` 恢复后回到 `Idle`(仍持有任务时回到 `Busy`)。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::engine::Endpoint;
use crate::{InstanceId, JobId};

/// 实例生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Idle,
    Busy,
    Unhealthy,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 4] = [
        InstanceStatus::Starting,
        InstanceStatus::Idle,
        InstanceStatus::Busy,
        InstanceStatus::Unhealthy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Idle => "idle",
            InstanceStatus::Busy => "busy",
            InstanceStatus::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 池管理的引擎实例
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    pub endpoint: Endpoint,
    pub status: InstanceStatus,
    pub current_job: Option<JobId>,
    pub last_health_check: Option<Instant>,
    /// 最近一次进入 Unhealthy 的时刻
    pub unhealthy_since: Option<Instant>,
    pub created_at: Instant,
}

impl Instance {
    pub(crate) fn starting(id: InstanceId, endpoint: Endpoint) -> Self {
        Self {
            id,
            endpoint,
            status: InstanceStatus::Starting,
            current_job: None,
            last_health_check: None,
            unhealthy_since: None,
            created_at: Instant::now(),
        }
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    /// 最近一次成功巡检在 `freshness` 之内
    pub fn is_healthy(&self, freshness: Duration) -> bool {
        self.last_health_check
            .is_some_and(|at| at.elapsed() < freshness)
    }

    /// 可以接收新任务
    pub fn is_available(&self, freshness: Duration) -> bool {
        self.status == InstanceStatus::Idle && self.is_healthy(freshness)
    }

    /// 绑定任务; 仅 Idle 实例可绑定
    pub(crate) fn bind(&mut self, job_id: &JobId) -> bool {
        if self.status != InstanceStatus::Idle || self.current_job.is_some() {
            return false;
        }
        self.status = InstanceStatus::Busy;
        self.current_job = Some(job_id.clone());
        true
    }

    /// 置备完成; 可直接绑定首个任务
    pub(crate) fn mark_provisioned(&mut self, job_id: Option<&JobId>) {
        self.last_health_check = Some(Instant::now());
        self.status = InstanceStatus::Idle;
        if let Some(job_id) = job_id {
            self.bind(job_id);
        }
    }

    /// 解除任务绑定; 返回是否有任务被解除
    pub(crate) fn unbind(&mut self) -> bool {
        let had_job = self.current_job.take().is_some();
        if self.status == InstanceStatus::Busy {
            self.status = InstanceStatus::Idle;
        }
        had_job
    }

    /// 仅当仍绑定着 `job_id` 时解除绑定
    pub(crate) fn unbind_job(&mut self, job_id: &str) -> bool {
        if self.current_job.as_deref() != Some(job_id) {
            return false;
        }
        self.unbind()
    }

    /// 巡检成功; 返回是否从 Unhealthy 恢复
    pub(crate) fn mark_healthy(&mut self) -> bool {
        self.last_health_check = Some(Instant::now());
        if self.status != InstanceStatus::Unhealthy {
            return false;
        }
        self.unhealthy_since = None;
        self.status = if self.current_job.is_some() {
            InstanceStatus::Busy
        } else {
            InstanceStatus::Idle
        };
        true
    }

    /// 巡检失败; 返回是否为新进入 Unhealthy
    pub(crate) fn mark_unhealthy(&mut self) -> bool {
        if self.status == InstanceStatus::Unhealthy {
            return false;
        }
        self.status = InstanceStatus::Unhealthy;
        self.unhealthy_since = Some(Instant::now());
        true
    }

    /// Unhealthy 且超过宽限期未恢复
    pub fn is_unrecoverable(&self, grace: Duration) -> bool {
        if self.status != InstanceStatus::Unhealthy {
            return false;
        }
        let reference = self
            .last_health_check
            .or(self.unhealthy_since)
            .unwrap_or(self.created_at);
        reference.elapsed() > grace
    }

    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id.clone(),
            port: self.endpoint.port,
            status: self.status,
            current_job: self.current_job.clone(),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

/// 实例状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub port: u16,
    pub status: InstanceStatus,
    pub current_job: Option<JobId>,
    pub uptime_secs: u64,
}
