//! Topic 模式匹配
//!
//! 与 AMQP topic exchange 相同的语法：`*` 匹配恰好一个点分词，`#` 匹配零个或多个词。
//! 模式编译为正则，订阅时编译一次。

use regex::Regex;

use crate::core::RuntimeError;

/// 已编译的事件类型模式
#[derive(Debug, Clone)]
pub struct TopicPattern {
    raw: String,
    regex: Regex,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, RuntimeError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(RuntimeError::validation_field("pattern", "empty topic pattern"));
        }

        let words: Vec<&str> = pattern.split('.').collect();
        let mut re = String::from("^");
        for (i, word) in words.iter().enumerate() {
            let first = i == 0;
            match *word {
                "#" => {
                    // 零个或多个词；与前一个点一起可选
                    if first {
                        re.push_str(r"(?:[^.]+(?:\.[^.]+)*)?");
                    } else {
                        re.push_str(r"(?:\.[^.]+)*");
                    }
                }
                "*" => {
                    if !first {
                        re.push_str(r"\.");
                    }
                    re.push_str(r"[^.]+");
                }
                w if w.is_empty() => {
                    return Err(RuntimeError::validation_field(
                        "pattern",
                        format!("empty word in topic pattern '{pattern}'"),
                    ));
                }
                w => {
                    if !first {
                        re.push_str(r"\.");
                    }
                    re.push_str(&regex::escape(w));
                }
            }
        }
        re.push('$');

        // 以 # 开头且后面还有词时，首段可以为空，去掉紧随的点
        let re = if words.len() > 1 && words[0] == "#" {
            re.replacen(r"(?:[^.]+(?:\.[^.]+)*)?\.", r"(?:[^.]+(?:\.[^.]+)*\.)?", 1)
        } else {
            re
        };

        let regex = Regex::new(&re)
            .map_err(|e| RuntimeError::Config(format!("invalid topic pattern '{pattern}': {e}")))?;
        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}
