//! 错误模式检测：滑动窗口内同一 (code, component) 出现次数达到阈值即判定为模式
//!
//! 每个模式在 cooldown 内最多上报一次。

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use super::record::ErrorReport;

/// 单个键保留的最多出现时间点
const MAX_OCCURRENCES: usize = 4096;

#[derive(Debug, Clone)]
pub struct PatternConfig {
    pub threshold: usize,
    pub window: Duration,
    pub cooldown: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PatternKey {
    code: String,
    component: String,
}

#[derive(Debug)]
struct Series {
    times: VecDeque<(Instant, DateTime<Utc>)>,
    sample: String,
    context: Map<String, Value>,
}

/// 检测到的模式
#[derive(Debug, Clone)]
pub struct DetectedPattern {
    /// 错误码（VALIDATION_ERROR 等）
    pub category: String,
    pub component: String,
    pub occurrences: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub sample: String,
    pub context: Map<String, Value>,
}

impl DetectedPattern {
    /// error.pattern 事件 payload；样本的上下文字段平铺在顶层
    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "category": self.category,
            "component": self.component,
            "occurrences": self.occurrences,
            "firstSeen": self.first_seen.to_rfc3339(),
            "lastSeen": self.last_seen.to_rfc3339(),
            "sample": self.sample,
        });
        if let Value::Object(map) = &mut payload {
            for (k, v) in &self.context {
                map.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        payload
    }
}

#[derive(Debug)]
pub struct PatternDetector {
    config: PatternConfig,
    series: HashMap<PatternKey, Series>,
    last_emitted: HashMap<PatternKey, Instant>,
}

impl PatternDetector {
    pub fn new(config: PatternConfig) -> Self {
        Self {
            config,
            series: HashMap::new(),
            last_emitted: HashMap::new(),
        }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    pub fn record(&mut self, report: &ErrorReport) {
        let key = PatternKey {
            code: report.code.clone(),
            component: report.component(),
        };
        let series = self.series.entry(key).or_insert_with(|| Series {
            times: VecDeque::new(),
            sample: report.message.clone(),
            context: report.context.clone(),
        });
        if series.times.len() >= MAX_OCCURRENCES {
            series.times.pop_front();
        }
        series.times.push_back((Instant::now(), Utc::now()));
    }

    /// 扫描所有键：丢弃窗口外的时间点，返回新触发的模式
    pub fn scan(&mut self) -> Vec<DetectedPattern> {
        let now = Instant::now();
        let window = self.config.window;
        let threshold = self.config.threshold.max(1);
        let cooldown = self.config.cooldown;
        let mut detected = Vec::new();

        self.series.retain(|key, series| {
            while let Some((t, _)) = series.times.front() {
                if now.duration_since(*t) > window {
                    series.times.pop_front();
                } else {
                    break;
                }
            }
            if series.times.len() >= threshold {
                let cooled = self
                    .last_emitted
                    .get(key)
                    .map(|last| now.duration_since(*last) >= cooldown)
                    .unwrap_or(true);
                if cooled {
                    self.last_emitted.insert(key.clone(), now);
                    let first_seen = series.times.front().map(|(_, at)| *at).unwrap_or_else(Utc::now);
                    let last_seen = series.times.back().map(|(_, at)| *at).unwrap_or_else(Utc::now);
                    detected.push(DetectedPattern {
                        category: key.code.clone(),
                        component: key.component.clone(),
                        occurrences: series.times.len(),
                        first_seen,
                        last_seen,
                        sample: series.sample.clone(),
                        context: series.context.clone(),
                    });
                }
            }
            !series.times.is_empty()
        });

        let horizon = cooldown.max(window);
        self.last_emitted
            .retain(|_, last| now.duration_since(*last) < horizon);
        detected
    }
}
