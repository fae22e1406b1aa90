//! 错误报告与聚合记录

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{ErrorKind, RuntimeError, Severity};

/// 组件上报的一次错误
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub code: String,
    pub category: String,
    pub message: String,
    pub agent_id: Option<String>,
    pub module_id: Option<String>,
    pub severity: Severity,
    pub context: Map<String, Value>,
}

impl ErrorReport {
    pub fn from_error(err: &RuntimeError) -> Self {
        Self {
            kind: err.kind(),
            code: err.code().to_string(),
            category: err.category(),
            message: err.message(),
            agent_id: None,
            module_id: None,
            severity: Severity::default(),
            context: err.context(),
        }
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn module(mut self, module_id: Option<impl Into<String>>) -> Self {
        self.module_id = module_id.map(Into::into);
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn key(&self) -> AggregateKey {
        AggregateKey {
            kind: self.kind,
            category: self.category.clone(),
            agent: self.agent_id.clone(),
            module: self.module_id.clone(),
        }
    }

    /// 模式检测中的组件名：模块 > Agent > system
    pub fn component(&self) -> String {
        self.module_id
            .clone()
            .or_else(|| self.agent_id.clone())
            .unwrap_or_else(|| "system".to_string())
    }
}

/// 聚合键 (kind, category, agent, module)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateKey {
    pub kind: ErrorKind,
    pub category: String,
    pub agent: Option<String>,
    pub module: Option<String>,
}

/// 持久化的聚合错误记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub id: String,
    pub kind: ErrorKind,
    pub category: String,
    pub code: String,
    /// 首次出现时的消息
    pub sample_message: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub module_id: Option<String>,
    pub severity: Severity,
    pub first_seen: DateTime<Utc>,
    pub last_occurred: DateTime<Utc>,
    pub count: u64,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ErrorRecord {
    pub fn new(report: &ErrorReport, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: report.kind,
            category: report.category.clone(),
            code: report.code.clone(),
            sample_message: report.message.clone(),
            agent_id: report.agent_id.clone(),
            module_id: report.module_id.clone(),
            severity: report.severity,
            first_seen: now,
            last_occurred: now,
            count: 1,
            context: report.context.clone(),
            resolved: false,
            resolution: None,
            resolved_by: None,
            resolved_at: None,
        }
    }

    pub fn key(&self) -> AggregateKey {
        AggregateKey {
            kind: self.kind,
            category: self.category.clone(),
            agent: self.agent_id.clone(),
            module: self.module_id.clone(),
        }
    }

    /// 同键再次出现：计数 + 1，更新最近时间；严重程度取较高者；已解决的记录重新打开
    pub fn touch(&mut self, report: &ErrorReport, now: DateTime<Utc>) {
        self.count += 1;
        self.last_occurred = now;
        if report.severity > self.severity {
            self.severity = report.severity;
        }
        if self.resolved {
            self.resolved = false;
            self.resolution = None;
            self.resolved_by = None;
            self.resolved_at = None;
        }
    }

    pub fn component(&self) -> String {
        self.module_id
            .clone()
            .or_else(|| self.agent_id.clone())
            .unwrap_or_else(|| "system".to_string())
    }
}

/// 错误统计
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorStatistics {
    /// 所有记录的出现次数之和
    pub total_errors: u64,
    pub by_kind: HashMap<String, u64>,
    pub by_component: HashMap<String, u64>,
    pub by_severity: HashMap<String, u64>,
    pub unresolved: u64,
}

impl ErrorStatistics {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ErrorRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total_errors += record.count;
            *stats.by_kind.entry(record.kind.to_string()).or_default() += record.count;
            *stats.by_component.entry(record.component()).or_default() += record.count;
            *stats
                .by_severity
                .entry(record.severity.to_string())
                .or_default() += record.count;
            if !record.resolved {
                stats.unresolved += 1;
            }
        }
        stats
    }
}
