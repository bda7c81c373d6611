//! 配置模块
//!
//! 所有可调参数集中在显式配置对象中, 构造时一次性传入,
//! 运行过程中不再读取环境变量。

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::balancer::Strategy;
use crate::engine::Endpoint;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "SCAN_POOL_";

/// 配置错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("无法解析配置项 {key}={value}")]
    Parse { key: String, value: String },

    #[error("最小实例数({min})超过最大实例数({max})")]
    MinAboveMax { min: usize, max: usize },

    #[error("最大实例数至少为1")]
    ZeroCapacity,

    #[error("端口范围 {base}+{span} 越界")]
    PortRangeOverflow { base: u16, span: u16 },

    #[error("端口跨度 {span} 容纳不下 {max} 个实例")]
    PortSpanTooSmall { span: u16, max: usize },

    #[error("{0} 必须大于零")]
    ZeroDuration(&'static str),
}

/// 实例池配置
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_instances: usize,
    pub max_instances: usize,
    /// 新实例对外暴露的主机名
    pub host: String,
    pub base_port: u16,
    pub port_span: u16,
    pub api_key_prefix: String,
    pub health_check_interval: Duration,
    pub health_timeout: Duration,
    /// 新实例首次健康检查的等待上限
    pub provision_timeout: Duration,
    pub provision_poll: Duration,
    /// 不健康状态持续超过该时长的实例会被回收
    pub unhealthy_grace: Duration,
    pub queue_backoff: Duration,
    pub verify_ports_free: bool,
    pub pool_enabled: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_instances: 2,
            max_instances: 10,
            host: "localhost".to_string(),
            base_port: 8080,
            port_span: 100,
            api_key_prefix: "scanpool".to_string(),
            health_check_interval: Duration::from_secs(60),
            health_timeout: Duration::from_secs(10),
            provision_timeout: Duration::from_secs(60),
            provision_poll: Duration::from_secs(1),
            unhealthy_grace: Duration::from_secs(300),
            queue_backoff: Duration::from_secs(5),
            verify_ports_free: true,
            pool_enabled: true,
        }
    }
}

impl PoolConfig {
    /// 校验配置不变量
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_instances == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.min_instances > self.max_instances {
            return Err(ConfigError::MinAboveMax {
                min: self.min_instances,
                max: self.max_instances,
            });
        }
        if self.base_port.checked_add(self.port_span).is_none() {
            return Err(ConfigError::PortRangeOverflow {
                base: self.base_port,
                span: self.port_span,
            });
        }
        if (self.port_span as usize) < self.max_instances {
            return Err(ConfigError::PortSpanTooSmall {
                span: self.port_span,
                max: self.max_instances,
            });
        }
        non_zero("health_check_interval", self.health_check_interval)?;
        non_zero("health_timeout", self.health_timeout)?;
        non_zero("provision_timeout", self.provision_timeout)?;
        non_zero("provision_poll", self.provision_poll)?;
        non_zero("queue_backoff", self.queue_backoff)?;
        Ok(())
    }

    /// 可分配端口区间的上界(不含)
    pub fn port_end(&self) -> u16 {
        self.base_port.saturating_add(self.port_span)
    }
}

/// 负载均衡器配置
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    pub strategy: Strategy,
    pub health_check_interval: Duration,
    pub health_timeout: Duration,
    /// 健康检查失败时记录的惩罚延迟
    pub failure_latency: Duration,
    /// 超过该延迟的节点在最少负载策略中被额外加权
    pub slow_latency: Duration,
    /// DNS 发现使用的引擎服务名
    pub discovery_service: String,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::LeastLoaded,
            health_check_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(10),
            failure_latency: Duration::from_secs(10),
            slow_latency: Duration::from_secs(5),
            discovery_service: "scan-engine".to_string(),
        }
    }
}

impl BalancerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("balancer.health_check_interval", self.health_check_interval)?;
        non_zero("balancer.health_timeout", self.health_timeout)?;
        Ok(())
    }
}

/// 引擎调用超时
#[derive(Debug, Clone)]
pub struct EngineTimeouts {
    pub request: Duration,
    pub health: Duration,
    /// 发现阶段(爬取)完成的等待上限
    pub discovery_timeout: Duration,
    pub discovery_poll: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(30),
            health: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(300),
            discovery_poll: Duration::from_secs(5),
        }
    }
}

/// 扫描编排配置
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub progress_poll: Duration,
    pub scan_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            progress_poll: Duration::from_secs(10),
            scan_timeout: Duration::from_secs(3600),
        }
    }
}

/// 完整配置集合
#[derive(Debug, Clone)]
pub struct Settings {
    pub pool: PoolConfig,
    pub balancer: BalancerConfig,
    pub engine: EngineTimeouts,
    pub orchestrator: OrchestratorConfig,
    /// 未启用实例池时使用的单实例引擎
    pub single_engine: Endpoint,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            balancer: BalancerConfig::default(),
            engine: EngineTimeouts::default(),
            orchestrator: OrchestratorConfig::default(),
            single_engine: Endpoint::new("localhost", 8080, "scanpool-engine-key"),
        }
    }
}

impl Settings {
    /// 从进程环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 从任意键值来源加载配置, 缺省键使用默认值
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut s = Settings::default();

        env.parse("MIN_INSTANCES", &mut s.pool.min_instances)?;
        env.parse("MAX_INSTANCES", &mut s.pool.max_instances)?;
        env.parse("HOST", &mut s.pool.host)?;
        env.parse("BASE_PORT", &mut s.pool.base_port)?;
        env.parse("PORT_SPAN", &mut s.pool.port_span)?;
        env.parse("API_KEY_PREFIX", &mut s.pool.api_key_prefix)?;
        env.secs("HEALTH_INTERVAL_SECS", &mut s.pool.health_check_interval)?;
        env.secs("HEALTH_TIMEOUT_SECS", &mut s.pool.health_timeout)?;
        env.secs("PROVISION_TIMEOUT_SECS", &mut s.pool.provision_timeout)?;
        env.secs("UNHEALTHY_GRACE_SECS", &mut s.pool.unhealthy_grace)?;
        env.secs("QUEUE_BACKOFF_SECS", &mut s.pool.queue_backoff)?;
        env.parse("VERIFY_PORTS_FREE", &mut s.pool.verify_ports_free)?;
        env.parse("ENABLED", &mut s.pool.pool_enabled)?;

        env.parse("STRATEGY", &mut s.balancer.strategy)?;
        env.secs("BALANCER_HEALTH_INTERVAL_SECS", &mut s.balancer.health_check_interval)?;
        env.secs("BALANCER_HEALTH_TIMEOUT_SECS", &mut s.balancer.health_timeout)?;
        env.parse("ENGINE_SERVICE", &mut s.balancer.discovery_service)?;

        env.secs("REQUEST_TIMEOUT_SECS", &mut s.engine.request)?;
        env.secs("DISCOVERY_TIMEOUT_SECS", &mut s.engine.discovery_timeout)?;
        env.secs("PROGRESS_POLL_SECS", &mut s.orchestrator.progress_poll)?;
        env.secs("SCAN_TIMEOUT_SECS", &mut s.orchestrator.scan_timeout)?;

        // 单实例模式沿用引擎自身的变量名
        if let Some(host) = (env.lookup)("ENGINE_HOST") {
            s.single_engine.host = host;
        }
        if let Some(port) = (env.lookup)("ENGINE_PORT") {
            s.single_engine.port = parse_value("ENGINE_PORT", &port)?;
        }
        if let Some(key) = (env.lookup)("ENGINE_API_KEY") {
            s.single_engine.api_key = key;
        }

        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.balancer.validate()?;
        non_zero("engine.discovery_poll", self.engine.discovery_poll)?;
        non_zero("orchestrator.progress_poll", self.orchestrator.progress_poll)?;
        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: FromStr>(&self, name: &str, slot: &mut T) -> Result<(), ConfigError> {
        let key = format!("{ENV_PREFIX}{name}");
        if let Some(raw) = (self.lookup)(&key) {
            *slot = parse_value(&key, &raw)?;
        }
        Ok(())
    }

    fn secs(&self, name: &str, slot: &mut Duration) -> Result<(), ConfigError> {
        let mut secs = slot.as_secs();
        self.parse(name, &mut secs)?;
        *slot = Duration::from_secs(secs);
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Parse {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

fn non_zero(name: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        Err(ConfigError::ZeroDuration(name))
    } else {
        Ok(())
    }
}
