//! ScanPool 核心库入口
//!
//! 管理扫描引擎实例池: 负载均衡选点、实例生命周期、健康检查与任务排队。

pub mod balancer;
pub mod config;
pub mod engine;
pub mod health;
pub mod job;
pub mod orchestrator;
pub mod pool;

use std::time::Duration;

/// 引擎节点标识类型
pub type NodeId = String;

/// 扫描任务标识类型
pub type JobId = String;

/// 池内实例标识类型
pub type InstanceId = String;

use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::pool::runtime::RuntimeError;

/// 通用错误类型
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("引擎调用错误: {0}")]
    Engine(#[from] EngineError),

    #[error("实例运行时错误: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("配置无效: {0}")]
    Config(#[from] ConfigError),

    #[error("引擎 {0} 不可达")]
    EngineUnavailable(String),

    #[error("没有可用的健康引擎节点")]
    NoHealthyNode,

    #[error("实例池已满")]
    InsufficientCapacity,

    #[error("端口范围 {start}..{end} 内无空闲端口")]
    PortsExhausted { start: u16, end: u16 },

    #[error("实例 {0} 未能在 {1:?} 内就绪")]
    ProvisionTimeout(InstanceId, Duration),

    #[error("无效的实例ID: {0}")]
    InvalidInstanceId(InstanceId),

    #[error("实例池已启动")]
    AlreadyStarted,

    #[error("实例池正在关闭")]
    ShuttingDown,

    #[error("扫描任务 {0} 超时")]
    ScanTimeout(JobId),

    #[error("扫描任务 {0} 在引擎侧失败")]
    ScanFailed(JobId),
}

pub type Result<T> = std::result::Result<T, PoolError>;

// 公开导出模块的公共接口
pub use balancer::{LoadBalancer, Node, Strategy};
pub use config::Settings;
pub use engine::{EngineClient, EngineConnector, Endpoint};
pub use job::{ScanJob, ScanOptions};
pub use orchestrator::{ExecutionMode, ProgressEvent, ScanOrchestrator};
pub use pool::{InstanceStatus, JobExecutor, PoolManager};
