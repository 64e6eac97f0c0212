// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 协议参数与常量模块
//!
//! 该模块定义了绑定引擎遵循的协议常量和基础枚举，包括：
//! - 常见的 HTTP 状态码及其原因短语（Reason Phrase）。
//! - 各绑定所使用的媒体类型与 SOAP / XSI 命名空间。
//! - HTTP 方法、SOAP 协议版本及内容编码的强类型枚举。

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt;

/// 服务器名称标识，用于 HTTP 响应头的 `Server` 字段
pub const SERVER_NAME: &str = "soapbind";

/// HTTP 协议规定的换行符（Carriage Return Line Feed）
pub const CRLF: &str = "\r\n";

/// SOAP 1.1 请求所使用的媒体类型
pub const TEXT_XML: &str = "text/xml";
/// SOAP 1.2 请求所使用的媒体类型
pub const APPLICATION_SOAP_XML: &str = "application/soap+xml";
/// HTML 表单提交的媒体类型
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
/// 纯文本返回值的媒体类型
pub const TEXT_PLAIN: &str = "text/plain";

/// SOAP 1.1 信封命名空间
pub const SOAP11_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
/// SOAP 1.2 信封命名空间
pub const SOAP12_ENVELOPE_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
/// XML Schema 实例命名空间（`xsi:nil`、`xsi:type` 等）
pub const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";
/// XML Schema 命名空间
pub const XSD_NS: &str = "http://www.w3.org/2001/XMLSchema";
/// `xmlns` 保留命名空间
pub const XMLNS_NS: &str = "http://www.w3.org/2000/xmlns/";
/// `xml:` 前缀保留命名空间
pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// 服务未显式声明命名空间时使用的默认值
pub const DEFAULT_NAMESPACE: &str = "http://tempuri.org/";

/// SOAP 1.1 的动作头
pub const SOAP_ACTION_HEADER: &str = "SOAPAction";

lazy_static! {
    /// HTTP 状态码与其对应的标准原因短语映射表。
    ///
    /// 参考标准：[RFC 9110: HTTP Semantics](https://www.rfc-editor.org/rfc/rfc9110.html)。
    pub static ref STATUS_CODES: HashMap<u16, &'static str> = {
        let mut map = HashMap::new();
        // 1xx: 信息响应 (Informational)
        map.insert(100, "Continue");

        // 2xx: 成功响应 (Successful)
        map.insert(200, "OK");
        map.insert(202, "Accepted");
        map.insert(204, "No Content");

        // 4xx: 客户端错误 (Client Error)
        map.insert(400, "Bad Request");
        map.insert(401, "Unauthorized");
        map.insert(403, "Forbidden");
        map.insert(404, "Not Found");
        map.insert(405, "Method Not Allowed");
        map.insert(406, "Not Acceptable");
        map.insert(411, "Length Required");
        map.insert(413, "Content Too Large");
        map.insert(415, "Unsupported Media Type");

        // 5xx: 服务端错误 (Server Error)
        map.insert(500, "Internal Server Error");
        map.insert(501, "Not Implemented");
        map.insert(503, "Service Unavailable");
        map.insert(505, "HTTP Version Not Supported");
        map
    };
}

lazy_static! {
    /// 在协议层“认识”的 HTTP 方法。
    ///
    /// 绑定到特定方法的协议工厂在遇到这些方法中的其他成员时返回 405，
    /// 遇到列表之外的方法（如 PUT）时则视为不适用。
    pub static ref BINDING_METHODS: Vec<HttpRequestMethod> = {
        vec![HttpRequestMethod::Get, HttpRequestMethod::Head, HttpRequestMethod::Post]
    };
}

/// 支持的 HTTP 协议版本
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HttpVersion {
    /// HTTP/1.0 版本
    V1_0,
    /// HTTP/1.1 版本
    V1_1,
}

/// 标准 HTTP 请求方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpRequestMethod {
    /// 获取资源
    Get,
    /// 获取资源的元数据（不包含响应体）
    Head,
    /// 查询服务器支持的选项
    Options,
    /// 提交数据或执行操作
    Post,
    /// 替换资源
    Put,
    /// 删除资源
    Delete,
}

impl HttpRequestMethod {
    /// 从请求行中的方法名解析，大小写不敏感
    pub fn parse(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "HEAD" => Some(Self::Head),
            "OPTIONS" => Some(Self::Options),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    /// 该方法是否属于某个协议绑定
    pub fn is_binding_method(&self) -> bool {
        BINDING_METHODS.contains(self)
    }
}

/// SOAP 协议版本
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoapProtocolVersion {
    /// SOAP 1.1（`text/xml`）
    Soap11,
    /// SOAP 1.2（`application/soap+xml`）
    Soap12,
}

impl SoapProtocolVersion {
    /// 信封命名空间
    pub fn envelope_ns(&self) -> &'static str {
        match self {
            SoapProtocolVersion::Soap11 => SOAP11_ENVELOPE_NS,
            SoapProtocolVersion::Soap12 => SOAP12_ENVELOPE_NS,
        }
    }

    /// 请求与响应所使用的媒体类型
    pub fn media_type(&self) -> &'static str {
        match self {
            SoapProtocolVersion::Soap11 => TEXT_XML,
            SoapProtocolVersion::Soap12 => APPLICATION_SOAP_XML,
        }
    }

    /// 根据基础媒体类型判断 SOAP 版本
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        if media_type.eq_ignore_ascii_case(TEXT_XML) {
            Some(SoapProtocolVersion::Soap11)
        } else if media_type.eq_ignore_ascii_case(APPLICATION_SOAP_XML) {
            Some(SoapProtocolVersion::Soap12)
        } else {
            None
        }
    }
}

/// 支持的内容编码（压缩）格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpEncoding {
    /// GNU zip 压缩
    Gzip,
    /// zlib 压缩
    Deflate,
    /// Brotli 压缩
    Br,
}

impl HttpEncoding {
    /// 从 `Content-Encoding` 标识符解析
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "gzip" => Some(HttpEncoding::Gzip),
            "deflate" => Some(HttpEncoding::Deflate),
            "br" => Some(HttpEncoding::Br),
            _ => None,
        }
    }
}

impl fmt::Display for HttpVersion {
    /// 将枚举格式化为 HTTP 报文中的版本字符串
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HttpVersion::V1_0 => write!(f, "1.0"),
            HttpVersion::V1_1 => write!(f, "1.1"),
        }
    }
}

impl fmt::Display for HttpRequestMethod {
    /// 将枚举格式化为 HTTP 标准大写方法名
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HttpRequestMethod::Get => write!(f, "GET"),
            HttpRequestMethod::Head => write!(f, "HEAD"),
            HttpRequestMethod::Options => write!(f, "OPTIONS"),
            HttpRequestMethod::Post => write!(f, "POST"),
            HttpRequestMethod::Put => write!(f, "PUT"),
            HttpRequestMethod::Delete => write!(f, "DELETE"),
        }
    }
}

impl fmt::Display for HttpEncoding {
    /// 将枚举格式化为 `Content-Encoding` 头所使用的标识符
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HttpEncoding::Gzip => write!(f, "gzip"),
            HttpEncoding::Deflate => write!(f, "deflate"),
            HttpEncoding::Br => write!(f, "br"),
        }
    }
}

impl fmt::Display for SoapProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SoapProtocolVersion::Soap11 => write!(f, "Soap11"),
            SoapProtocolVersion::Soap12 => write!(f, "Soap12"),
        }
    }
}
