//! 文本返回值的正则提取

use regex::{Regex, RegexBuilder};

use crate::descriptor::MatchSpec;
use crate::exception::Exception;
use crate::util::parse_scalar;
use crate::value::{ReturnType, TypeTag, Value};

/// 按声明的模式从响应文本中提取返回值。
///
/// 标量返回取第一次匹配的捕获组；数组返回收集所有匹配（最多 `max_repeats` 个）。
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    regex: Regex,
    group: usize,
    max_repeats: Option<usize>,
    return_type: ReturnType,
}

impl PatternMatcher {
    pub fn new(spec: &MatchSpec, return_type: ReturnType) -> Result<Self, Exception> {
        if return_type.tag == TypeTag::Xml {
            return Err(Exception::Config(
                "pattern matched returns must be scalar".to_string(),
            ));
        }
        let regex = RegexBuilder::new(&spec.pattern)
            .case_insensitive(spec.ignore_case)
            .build()
            .map_err(|e| Exception::Config(format!("invalid pattern '{}': {}", spec.pattern, e)))?;
        if spec.group >= regex.captures_len() {
            return Err(Exception::Config(format!(
                "pattern '{}' has no group {}",
                spec.pattern, spec.group
            )));
        }
        Ok(Self {
            regex,
            group: spec.group,
            max_repeats: spec.max_repeats,
            return_type,
        })
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    fn captured<'t>(&self, captures: regex::Captures<'t>) -> Option<&'t str> {
        captures.get(self.group).map(|m| m.as_str())
    }

    pub fn matches(&self, text: &str) -> Result<Value, Exception> {
        let tag = self.return_type.tag;
        if self.return_type.is_array {
            let limit = self.max_repeats.unwrap_or(usize::MAX);
            let values = self
                .regex
                .captures_iter(text)
                .filter_map(|c| self.captured(c))
                .take(limit)
                .map(|s| parse_scalar("return", s, tag))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Value::Array(values));
        }
        match self.regex.captures(text).and_then(|c| self.captured(c)) {
            Some(s) => parse_scalar("return", s, tag),
            None if self.return_type.nullable => Ok(Value::Null),
            None => Err(Exception::PatternMismatch {
                pattern: self.pattern().to_string(),
            }),
        }
    }
}
