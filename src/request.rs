// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 请求模块
//!
//! 协议层只通过 `Request` 特性观察传入请求：方法、路径、查询串、内容类型、
//! 是否来自本机，以及一次性可取走的正文流。
//!
//! `HttpRequest` 是该特性的默认实现，负责把 TCP 流中读到的原始字节解析为：
//! 1. 请求行（方法、路径、查询串、版本）。
//! 2. 头部集合（名称大小写不敏感）。
//! 3. 按 `Content-Length` 截取的正文。

use bytes::Bytes;
use log::error;

use crate::exception::Exception;
use crate::param::*;
use crate::stream::{input_from_bytes, InputStream};

/// 协议层看到的传入请求
pub trait Request: Send {
    /// 请求 ID，仅用于日志追踪
    fn id(&self) -> u128;

    fn method(&self) -> HttpRequestMethod;

    /// 不含查询串的路径
    fn path(&self) -> &str;

    /// 路径中的非空段
    fn path_segments(&self) -> Vec<&str> {
        self.path().split('/').filter(|s| !s.is_empty()).collect()
    }

    /// 不含 `?` 的原始查询串
    fn query(&self) -> &str;

    /// 客户端是否来自本机回环地址
    fn is_local(&self) -> bool;

    /// 名称大小写不敏感的头部查找
    fn header(&self, name: &str) -> Option<&str>;

    fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    /// 取走正文流；第二次调用得到空流。
    fn take_body(&mut self) -> InputStream;
}

/// 一个完整解析过的 HTTP 请求
#[derive(Debug, Clone)]
pub struct HttpRequest {
    id: u128,
    method: HttpRequestMethod,
    path: String,
    query: String,
    version: HttpVersion,
    headers: Vec<(String, String)>,
    body: Bytes,
    is_local: bool,
}

/// 在缓冲区中定位头部结束位置，返回头部长度（含结尾空行）
pub fn head_length(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
}

/// 从头部区域读取 `Content-Length`
pub fn content_length(head: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(head).ok()?;
    text.split(CRLF)
        .filter_map(|line| line.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse().ok())
}

/// 整个请求报文的长度（头部加 `Content-Length` 正文），超过 `max` 或溢出时返回 413
pub fn request_length(head: &[u8], max: usize) -> Result<usize, Exception> {
    let body = content_length(head).unwrap_or(0);
    match head.len().checked_add(body) {
        Some(total) if total <= max => Ok(total),
        _ => Err(Exception::HttpStatus(413)),
    }
}

impl HttpRequest {
    /// 从原始字节缓冲区尝试构建 `HttpRequest`。
    ///
    /// # 逻辑步骤
    /// 1. 定位头部结尾，头部必须是合法的 UTF-8。
    /// 2. 解析请求行：方法、请求目标与协议版本。
    /// 3. 逐行解析头部。
    /// 4. 按 `Content-Length` 截取正文，缺省时取剩余全部字节。
    pub fn try_from(buffer: &[u8], id: u128, is_local: bool) -> Result<Self, Exception> {
        let head_end = head_length(buffer).unwrap_or(buffer.len());
        let head = match std::str::from_utf8(&buffer[..head_end]) {
            Ok(s) => s,
            Err(_) => {
                error!("[ID{}]无法解析HTTP请求头", id);
                return Err(Exception::BadRequest("request head is not UTF-8".to_string()));
            }
        };

        let mut lines = head.split(CRLF);
        let request_line = lines.next().unwrap_or("");
        let parts: Vec<&str> = request_line.split(' ').filter(|s| !s.is_empty()).collect();
        if parts.len() != 3 {
            error!("[ID{}]HTTP请求行格式不正确：{}", id, request_line);
            return Err(Exception::BadRequest(format!(
                "malformed request line '{}'",
                request_line
            )));
        }

        let method = match HttpRequestMethod::parse(parts[0]) {
            Some(m) => m,
            None => {
                error!("[ID{}]不支持的HTTP请求方法：{}", id, parts[0]);
                return Err(Exception::BadRequest(format!("unsupported method '{}'", parts[0])));
            }
        };

        let version = match parts[2].to_ascii_uppercase().as_str() {
            "HTTP/1.1" => HttpVersion::V1_1,
            "HTTP/1.0" => HttpVersion::V1_0,
            other => {
                error!("[ID{}]不支持的HTTP协议版本：{}", id, other);
                return Err(Exception::BadRequest(format!("unsupported version '{}'", other)));
            }
        };

        let (path, query) = match parts[1].split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (parts[1].to_string(), String::new()),
        };

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((name, value)) => {
                    headers.push((name.trim().to_string(), value.trim().to_string()))
                }
                None => {
                    error!("[ID{}]无法解析的头部行：{}", id, line);
                    return Err(Exception::BadRequest(format!("malformed header '{}'", line)));
                }
            }
        }

        let rest = &buffer[head_end..];
        let length = content_length(&buffer[..head_end]).unwrap_or(rest.len());
        let body = Bytes::copy_from_slice(&rest[..length.min(rest.len())]);

        Ok(Self {
            id,
            method,
            path,
            query,
            version,
            headers,
            body,
            is_local,
        })
    }

    /// 直接构造请求，`target` 可以带查询串
    pub fn new(method: HttpRequestMethod, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (target.to_string(), String::new()),
        };
        Self {
            id: 0,
            method,
            path,
            query,
            version: HttpVersion::V1_1,
            headers: Vec::new(),
            body: Bytes::new(),
            is_local: false,
        }
    }

    pub fn with_id(mut self, id: u128) -> Self {
        self.id = id;
        self
    }

    pub fn header_line(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn local(mut self, is_local: bool) -> Self {
        self.is_local = is_local;
        self
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

impl Request for HttpRequest {
    fn id(&self) -> u128 {
        self.id
    }

    fn method(&self) -> HttpRequestMethod {
        self.method
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn query(&self) -> &str {
        &self.query
    }

    fn is_local(&self) -> bool {
        self.is_local
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn take_body(&mut self) -> InputStream {
        input_from_bytes(std::mem::take(&mut self.body))
    }
}
