//! 扫描引擎客户端抽象
//!
//! 引擎对池来说只是一个可寻址的能力: 健康检查、启动、进度、结果、停止。
//! 具体扫描逻辑(爬取、主动攻击、告警)由外部引擎实现。

pub mod http;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::ScanOptions;

pub use http::{HttpConnector, HttpEngineClient};

/// 阶段进度的错误哨兵值
pub const PROGRESS_FAILED: i32 = -1;

/// 发现阶段占总进度的权重(百分比)
const DISCOVERY_WEIGHT: i32 = 30;
/// 攻击阶段占总进度的权重(百分比)
const ATTACK_WEIGHT: i32 = 70;

/// 引擎调用错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("HTTP 通信错误: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{operation} 返回 HTTP {status}")]
    Status { operation: &'static str, status: u16 },

    #[error("{operation} 响应格式错误: {reason}")]
    Malformed { operation: &'static str, reason: String },

    #[error("无效的目标地址: {0}")]
    InvalidTarget(String),

    #[error("发现阶段未能在 {0:?} 内完成")]
    DiscoveryTimeout(std::time::Duration),

    #[error("发现阶段执行失败")]
    DiscoveryFailed,
}

/// 引擎网络地址与凭据
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing)]
    pub api_key: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, api_key: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            api_key: api_key.into(),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 一次扫描在引擎侧的两个阶段任务ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanHandle {
    pub discovery_job_id: String,
    pub attack_job_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanPhase {
    Discovery,
    Attack,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Completed,
    Failed,
}

/// 加权后的扫描进度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReport {
    /// 总进度 0..=100
    pub percent: u8,
    pub discovery_percent: i32,
    pub attack_percent: i32,
    pub phase: ScanPhase,
    pub status: ScanStatus,
}

impl ProgressReport {
    /// 按 发现30% / 攻击70% 合成总进度
    ///
    /// 任一阶段为错误哨兵时整体失败; 两阶段都到100时完成。
    pub fn blend(discovery: i32, attack: i32) -> Self {
        let d = discovery.clamp(0, 100);
        let a = attack.clamp(0, 100);
        let percent = ((d * DISCOVERY_WEIGHT + a * ATTACK_WEIGHT) / 100) as u8;

        let status = if discovery < 0 || attack < 0 {
            ScanStatus::Failed
        } else if discovery >= 100 && attack >= 100 {
            ScanStatus::Completed
        } else {
            ScanStatus::Running
        };

        let phase = if discovery < 100 {
            ScanPhase::Discovery
        } else if attack < 100 {
            ScanPhase::Attack
        } else {
            ScanPhase::Done
        };

        Self {
            percent,
            discovery_percent: discovery,
            attack_percent: attack,
            phase,
            status,
        }
    }
}

/// 发现严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    /// 引擎风险级别映射, 未知值按 low 处理
    pub fn from_engine_risk(risk: &str) -> Self {
        match risk {
            "High" => Severity::High,
            "Medium" => Severity::Medium,
            "Low" => Severity::Low,
            "Informational" => Severity::Info,
            _ => Severity::Low,
        }
    }

    fn base_cvss(self) -> f32 {
        match self {
            Severity::Critical => 9.0,
            Severity::High => 7.0,
            Severity::Medium => 5.0,
            Severity::Low => 3.0,
            Severity::Info => 1.0,
        }
    }
}

/// 估算 CVSS 分数: 级别基础分 × 置信度系数, 保留一位小数
pub fn cvss_score(severity: Severity, confidence: &str) -> f32 {
    let multiplier = match confidence {
        "High" => 1.0,
        "Medium" => 0.9,
        "Low" => 0.8,
        _ => 0.9,
    };
    (severity.base_cvss() * multiplier * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    #[serde(default)]
    pub critical: u32,
    #[serde(default)]
    pub high: u32,
    #[serde(default)]
    pub medium: u32,
    #[serde(default)]
    pub low: u32,
    #[serde(default)]
    pub info: u32,
}

impl SeverityCounts {
    pub fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
            Severity::Info => self.info += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.critical + self.high + self.medium + self.low + self.info
    }
}

/// 单字母风险评级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskGrade {
    A,
    B,
    C,
    D,
    F,
}

impl RiskGrade {
    pub fn from_counts(counts: &SeverityCounts) -> Self {
        if counts.critical > 0 {
            RiskGrade::F
        } else if counts.high >= 3 {
            RiskGrade::D
        } else if counts.high >= 1 || counts.medium >= 5 {
            RiskGrade::C
        } else if counts.medium >= 1 || counts.low >= 10 {
            RiskGrade::B
        } else {
            RiskGrade::A
        }
    }
}

impl fmt::Display for RiskGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            RiskGrade::A => "A",
            RiskGrade::B => "B",
            RiskGrade::C => "C",
            RiskGrade::D => "D",
            RiskGrade::F => "F",
        };
        f.write_str(letter)
    }
}

/// 引擎返回的原始告警记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Alert {
    pub name: Option<String>,
    pub description: Option<String>,
    pub risk: Option<String>,
    pub confidence: Option<String>,
    #[serde(rename = "cweid")]
    pub cwe_id: Option<String>,
    #[serde(rename = "wascid")]
    pub wasc_id: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub param: Option<String>,
    pub attack: Option<String>,
    pub evidence: Option<String>,
    #[serde(rename = "otherinfo")]
    pub other_info: Option<String>,
    pub solution: Option<String>,
    pub reference: Option<String>,
    #[serde(rename = "pluginId")]
    pub plugin_id: Option<String>,
    #[serde(rename = "alertRef")]
    pub alert_ref: Option<String>,
}

/// 归一化后的漏洞发现
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub confidence: String,
    pub cvss_score: f32,
    pub cwe_id: Option<String>,
    pub wasc_id: Option<String>,
    pub affected_url: String,
    pub method: String,
    pub parameter: String,
    pub attack: String,
    pub evidence: String,
    pub other_info: String,
    pub solution: String,
    pub reference: String,
    pub plugin_id: Option<String>,
    pub alert_ref: Option<String>,
}

impl Finding {
    pub fn from_alert(alert: Alert, target: &str) -> Self {
        let severity = Severity::from_engine_risk(alert.risk.as_deref().unwrap_or("Low"));
        let confidence = alert.confidence.unwrap_or_else(|| "Medium".to_string());
        Self {
            title: alert
                .name
                .unwrap_or_else(|| "Unknown Vulnerability".to_string()),
            description: alert.description.unwrap_or_default(),
            severity,
            cvss_score: cvss_score(severity, &confidence),
            confidence,
            cwe_id: alert.cwe_id,
            wasc_id: alert.wasc_id,
            affected_url: alert.url.unwrap_or_else(|| target.to_string()),
            method: alert.method.unwrap_or_else(|| "GET".to_string()),
            parameter: alert.param.unwrap_or_default(),
            attack: alert.attack.unwrap_or_default(),
            evidence: alert.evidence.unwrap_or_default(),
            other_info: alert.other_info.unwrap_or_default(),
            solution: alert.solution.unwrap_or_default(),
            reference: alert.reference.unwrap_or_default(),
            plugin_id: alert.plugin_id,
            alert_ref: alert.alert_ref,
        }
    }
}

/// 扫描结果汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub target: String,
    pub findings: Vec<Finding>,
    pub severity_counts: SeverityCounts,
    pub risk_grade: RiskGrade,
    pub completed_at: DateTime<Utc>,
}

impl ScanResult {
    pub fn from_alerts(target: &str, alerts: Vec<Alert>) -> Self {
        let findings: Vec<Finding> = alerts
            .into_iter()
            .map(|alert| Finding::from_alert(alert, target))
            .collect();

        let mut severity_counts = SeverityCounts::default();
        for finding in &findings {
            severity_counts.record(finding.severity);
        }

        Self {
            target: target.to_string(),
            risk_grade: RiskGrade::from_counts(&severity_counts),
            findings,
            severity_counts,
            completed_at: Utc::now(),
        }
    }

    pub fn total_findings(&self) -> usize {
        self.findings.len()
    }
}

/// 单个引擎实例的调用接口
#[async_trait]
pub trait EngineClient: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    /// 有界超时的存活探测
    async fn health_check(&self) -> bool;

    /// 启动发现阶段, 等待其完成后启动攻击阶段
    async fn start(&self, target: &str, options: &ScanOptions) -> Result<ScanHandle, EngineError>;

    async fn progress(&self, handle: &ScanHandle) -> Result<ProgressReport, EngineError>;

    async fn results(&self, target: &str) -> Result<ScanResult, EngineError>;

    async fn stop(&self, handle: &ScanHandle) -> Result<(), EngineError>;
}

/// 根据地址构造引擎客户端
pub trait EngineConnector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> Arc<dyn EngineClient>;
}
