//! 扫描任务定义

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::JobId;

/// 扫描深度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    Quick,
    #[default]
    Standard,
    Thorough,
    Full,
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanType::Quick => "quick",
            ScanType::Standard => "standard",
            ScanType::Thorough => "thorough",
            ScanType::Full => "full",
        };
        f.write_str(name)
    }
}

/// 扫描选项
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanOptions {
    #[serde(default)]
    pub scan_type: ScanType,
    /// 攻击阶段使用的扫描策略名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_policy: Option<String>,
    /// 透传给调用方的附加字段
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ScanOptions {
    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.scan_policy = Some(policy.into());
        self
    }
}

/// 一次扫描请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: JobId,
    pub target: String,
    pub options: ScanOptions,
    pub submitted_at: DateTime<Utc>,
}

impl ScanJob {
    pub fn new(target: impl Into<String>, options: ScanOptions) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target: target.into(),
            options,
            submitted_at: Utc::now(),
        }
    }

    /// 使用调用方已分配的任务ID
    pub fn with_id(id: impl Into<JobId>, target: impl Into<String>, options: ScanOptions) -> Self {
        Self {
            id: id.into(),
            ..Self::new(target, options)
        }
    }
}
