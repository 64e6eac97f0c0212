// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 该模块定义了绑定引擎在一次调用的生命周期中可能产生的各类异常情况。
//!
//! ## 设计意图
//! - **错误分类**：涵盖用法错误（阶段违规、不支持的流操作）、线路格式错误、
//!   扩展失败以及应用方法本身的失败。
//! - **协商未命中不是错误**：编解码器对请求或方法形状不适用时以 `None` 表达，不会出现在这里。
//! - **语义映射**：`status_code` 将每个变体映射为对应的 HTTP 响应状态码。

use std::{error::Error, fmt, io};

use crate::message::{SoapFault, Stage, StageMask};

/// 绑定引擎处理调用过程中发生的异常类型。
#[derive(Debug)]
pub enum Exception {
    /// 请求报文无法解析（请求行、头部或编码不合法）。
    BadRequest(String),
    /// 在当前阶段不允许访问的消息属性。
    InvalidStage {
        property: &'static str,
        current: Option<Stage>,
        allowed: StageMask,
    },
    /// 消息阶段的非法跃迁（倒退或跳过）。
    IllegalTransition { from: Option<Stage>, to: Stage },
    /// 对只写、只进流调用了不支持的操作（读取、定位、求长度）。
    UnsupportedOperation(&'static str),
    /// 结构化解码时遇到了不期望的元素。
    UnexpectedElement {
        name: String,
        namespace: Option<String>,
        expected: Vec<String>,
    },
    /// 结构化解码时遇到了不期望的属性。
    UnexpectedAttribute {
        element: String,
        name: String,
        namespace: Option<String>,
        expected: Vec<String>,
    },
    /// 正文带有扩展链未能解开的 `Content-Encoding`。
    UnsupportedEncoding(String),
    /// 请求中缺少某个标量参数。
    MissingParameter { name: String, expected: Vec<String> },
    /// 参数或返回值无法按声明类型解析。
    InvalidValue { name: String, value: String, type_name: &'static str },
    /// XML 正文格式错误。
    MalformedXml(String),
    /// 文本返回值不匹配声明的模式。
    PatternMismatch { pattern: String },
    /// 客户端或服务端无法理解标记为 mustUnderstand 的 SOAP 头。
    MustUnderstand { header: String },
    /// SOAP 请求无法映射到任何已知方法。
    UnknownMethod(String),
    /// 某个扩展在阶段回调中失败，剩余扩展链被中止。
    Extension {
        extension: String,
        stage: Stage,
        source: Box<Exception>,
    },
    /// 扩展自身报告的失败原因。
    ExtensionFailed(String),
    /// 服务方法执行失败。
    Application(String),
    /// 客户端收到了服务端返回的 SOAP 故障。
    SoapFault(SoapFault),
    /// 客户端收到了非预期的 HTTP 状态码。
    HttpStatus(u16),
    /// 配置文件读取或解析失败。
    Config(String),
    /// 底层流 I/O 失败，包括传输层断开。
    Io(io::Error),
}

use Exception::*;

impl Exception {
    /// 将异常映射为服务端响应的 HTTP 状态码。
    pub fn status_code(&self) -> u16 {
        match self {
            UnexpectedElement { .. }
            | UnexpectedAttribute { .. }
            | MissingParameter { .. }
            | InvalidValue { .. }
            | MalformedXml(_)
            | BadRequest(_) => 400,
            UnsupportedEncoding(_) => 415,
            UnknownMethod(_) => 404,
            HttpStatus(code) => *code,
            _ => 500,
        }
    }

    /// 是否属于线路格式错误（调用方的问题）。
    pub fn is_wire_error(&self) -> bool {
        matches!(
            self,
            UnexpectedElement { .. }
                | UnexpectedAttribute { .. }
                | MissingParameter { .. }
                | InvalidValue { .. }
                | MalformedXml(_)
                | UnsupportedEncoding(_)
                | PatternMismatch { .. }
        )
    }
}

/// 为 `Exception` 实现 `Display` 特性，使其支持字符串格式化输出。
///
/// 这些描述信息会写入日志，同时也作为 SOAP 故障的 faultstring 返回给客户端。
impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BadRequest(reason) => write!(f, "Bad request: {}", reason),
            InvalidStage {
                property,
                current,
                allowed,
            } => match current {
                Some(stage) => write!(
                    f,
                    "Property '{}' is not accessible in stage {}, allowed: {}",
                    property, stage, allowed
                ),
                None => write!(
                    f,
                    "Property '{}' is not accessible before the first stage, allowed: {}",
                    property, allowed
                ),
            },
            IllegalTransition { from, to } => match from {
                Some(from) => write!(f, "Illegal stage transition {} -> {}", from, to),
                None => write!(f, "Illegal initial stage {}", to),
            },
            UnsupportedOperation(op) => write!(f, "Operation not supported: {}", op),
            UnexpectedElement {
                name,
                namespace,
                expected,
            } => write!(
                f,
                "Unexpected element <{}> (namespace '{}'), expected one of: {}",
                name,
                namespace.as_deref().unwrap_or(""),
                expected.join(", ")
            ),
            UnexpectedAttribute {
                element,
                name,
                namespace,
                expected,
            } => write!(
                f,
                "Unexpected attribute '{}' (namespace '{}') on element <{}>, expected one of: {}",
                name,
                namespace.as_deref().unwrap_or(""),
                element,
                expected.join(", ")
            ),
            UnsupportedEncoding(encoding) => {
                write!(f, "Content encoding '{}' is not supported", encoding)
            }
            MissingParameter { name, expected } => write!(
                f,
                "Missing parameter '{}', parameters: {}",
                name,
                expected.join(", ")
            ),
            InvalidValue {
                name,
                value,
                type_name,
            } => write!(f, "Value '{}' of '{}' is not a valid {}", value, name, type_name),
            MalformedXml(e) => write!(f, "Malformed XML: {}", e),
            PatternMismatch { pattern } => {
                write!(f, "Response text does not match pattern '{}'", pattern)
            }
            MustUnderstand { header } => write!(f, "Header '{}' was not understood", header),
            UnknownMethod(name) => write!(f, "Unable to resolve method '{}'", name),
            Extension {
                extension,
                stage,
                source,
            } => write!(
                f,
                "Extension '{}' failed in stage {}: {}",
                extension, stage, source
            ),
            ExtensionFailed(reason) => write!(f, "{}", reason),
            Application(reason) => write!(f, "{}", reason),
            Exception::SoapFault(fault) => {
                write!(f, "SOAP fault {}: {}", fault.code, fault.reason)
            }
            HttpStatus(code) => write!(f, "Unexpected HTTP status {}", code),
            Config(reason) => write!(f, "Configuration error: {}", reason),
            Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl Error for Exception {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Io(e) => Some(e),
            Extension { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Exception {
    fn from(e: io::Error) -> Self {
        Io(e)
    }
}

impl From<quick_xml::Error> for Exception {
    fn from(e: quick_xml::Error) -> Self {
        MalformedXml(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_errors_map_to_400() {
        let e = MissingParameter {
            name: "a".to_string(),
            expected: vec!["a".to_string(), "b".to_string()],
        };
        assert!(e.is_wire_error());
        assert_eq!(e.status_code(), 400);
        assert!(e.to_string().contains("a, b"));
    }

    #[test]
    fn test_unexpected_element_message_lists_expected() {
        let e = UnexpectedElement {
            name: "Foo".to_string(),
            namespace: Some("urn:x".to_string()),
            expected: vec!["a".to_string(), "b".to_string()],
        };
        let text = e.to_string();
        assert!(text.contains("<Foo>"));
        assert!(text.contains("urn:x"));
        assert!(text.contains("a, b"));
    }

    #[test]
    fn test_unexpected_attribute_message_lists_expected() {
        let e = UnexpectedAttribute {
            element: "Add".to_string(),
            name: "bogus".to_string(),
            namespace: None,
            expected: vec!["id".to_string(), "href".to_string()],
        };
        assert!(e.is_wire_error());
        let text = e.to_string();
        assert!(text.contains("'bogus'"));
        assert!(text.contains("<Add>"));
        assert!(text.contains("id, href"));
    }

    #[test]
    fn test_extension_error_source_chain() {
        let e = Extension {
            extension: "trace".to_string(),
            stage: Stage::BeforeSerialize,
            source: Box::new(ExtensionFailed("boom".to_string())),
        };
        assert_eq!(e.status_code(), 500);
        assert!(e.source().is_some());
        assert!(e.to_string().contains("BeforeSerialize"));
    }
}
