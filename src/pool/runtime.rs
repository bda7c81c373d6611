//! 实例运行时
//!
//! 创建实例 = 分配端口 + 向底层运行时下发启动命令; 健康等待由池负责。

use std::collections::HashSet;
use std::process::Output;

use async_trait::async_trait;
use log::{debug, info};
use thiserror::Error;
use tokio::process::Command;

use crate::engine::Endpoint;
use crate::InstanceId;

/// 引擎容器内部监听端口
const ENGINE_CONTAINER_PORT: u16 = 8080;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("执行 {command} 失败: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} 异常退出 ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// 启动一个实例所需的全部参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub id: InstanceId,
    pub endpoint: Endpoint,
}

impl InstanceSpec {
    /// 以端口与代次派生实例ID与API密钥
    ///
    /// 同一端口回收后再置备会得到新代次, 旧ID不会指向新实例。
    pub fn for_port(host: &str, port: u16, generation: u64, api_key_prefix: &str) -> Self {
        let id = format!("engine-{port}-{generation}");
        let api_key = format!("{api_key_prefix}-{id}");
        Self {
            endpoint: Endpoint::new(host, port, api_key),
            id,
        }
    }

    pub fn container_name(&self) -> String {
        format!("scanpool_{}", self.id)
    }
}

/// 底层实例运行时
#[async_trait]
pub trait InstanceRuntime: Send + Sync {
    async fn launch(&self, spec: &InstanceSpec) -> Result<(), RuntimeError>;

    async fn teardown(&self, spec: &InstanceSpec) -> Result<(), RuntimeError>;
}

/// 通过 docker CLI 管理引擎容器
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    pub docker_bin: String,
    pub image: String,
    pub memory_limit: String,
    pub java_opts: String,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            image: "owasp/zap2docker-stable".to_string(),
            memory_limit: "2g".to_string(),
            java_opts: "-Xmx1g".to_string(),
        }
    }
}

impl DockerRuntime {
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    fn run_args(&self, spec: &InstanceSpec) -> Vec<String> {
        let port = ENGINE_CONTAINER_PORT.to_string();
        vec![
            "run".into(),
            "--detach".into(),
            "--rm".into(),
            "--name".into(),
            spec.container_name(),
            "--publish".into(),
            format!("{}:{}", spec.endpoint.port, ENGINE_CONTAINER_PORT),
            "--memory".into(),
            self.memory_limit.clone(),
            "--env".into(),
            format!("JAVA_OPTS={}", self.java_opts),
            self.image.clone(),
            "zap.sh".into(),
            "-daemon".into(),
            "-host".into(),
            "0.0.0.0".into(),
            "-port".into(),
            port,
            "-config".into(),
            "api.addrs.addr.name=.*".into(),
            "-config".into(),
            "api.addrs.addr.regex=true".into(),
            "-config".into(),
            format!("api.key={}", spec.endpoint.api_key),
        ]
    }

    async fn docker(&self, args: &[String]) -> Result<Output, RuntimeError> {
        let command = format!("{} {}", self.docker_bin, args.first().map(String::as_str).unwrap_or(""));
        Command::new(&self.docker_bin)
            .args(args)
            .output()
            .await
            .map_err(|source| RuntimeError::Io { command, source })
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        let out = self
            .docker(&["rm".into(), "--force".into(), name.to_string()])
            .await?;
        if out.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        if stderr.contains("No such container") {
            debug!("Container {} already gone", name);
            return Ok(());
        }
        Err(RuntimeError::CommandFailed {
            command: format!("{} rm", self.docker_bin),
            status: out.status.to_string(),
            stderr: stderr.trim().to_string(),
        })
    }
}

#[async_trait]
impl InstanceRuntime for DockerRuntime {
    async fn launch(&self, spec: &InstanceSpec) -> Result<(), RuntimeError> {
        let name = spec.container_name();
        // 同名残留容器先清掉
        if let Err(e) = self.remove_container(&name).await {
            debug!("Stale container cleanup for {} failed: {}", name, e);
        }

        let out = self.docker(&self.run_args(spec)).await?;
        if !out.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: format!("{} run", self.docker_bin),
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        info!("Launched container {} on port {}", name, spec.endpoint.port);
        Ok(())
    }

    async fn teardown(&self, spec: &InstanceSpec) -> Result<(), RuntimeError> {
        self.remove_container(&spec.container_name()).await
    }
}

/// 端口分配器
#[derive(Debug, Clone)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    verify_free: bool,
}

impl PortAllocator {
    /// 管理 `[start, end)` 区间
    pub fn new(start: u16, end: u16, verify_free: bool) -> Self {
        Self {
            start,
            end,
            verify_free,
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    /// 第一个未被占用的端口
    pub fn allocate(&self, used: &HashSet<u16>) -> Option<u16> {
        (self.start..self.end)
            .find(|port| !used.contains(port) && (!self.verify_free || portpicker::is_free(*port)))
    }
}
