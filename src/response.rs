// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 响应模块
//!
//! - `HttpResponse`：服务端构建的响应。正文写入 `ResponseBody`，管线在提交前
//!   可以丢弃已写内容（例如改写为故障响应）；`as_bytes` 负责拼装报文。
//! - `Response`：客户端看到的响应，返回值读取器通过它拿到状态、头部与正文流。
//!   `HttpClientResponse` 是它的默认实现。

use std::io::Write;

use bytes::Bytes;
use chrono::prelude::*;
use log::{error, warn};

use crate::exception::Exception;
use crate::param::*;
use crate::request::head_length;
use crate::stream::{input_from_bytes, InputStream, ResponseBody};
use crate::util::HtmlBuilder;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    version: HttpVersion,
    status_code: u16,
    information: String,
    content_type: Option<String>,
    content_encoding: Option<HttpEncoding>,
    date: DateTime<Utc>,
    server_name: String,
    allow: Option<Vec<HttpRequestMethod>>,
    headers: Vec<(String, String)>,
    body: ResponseBody,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpResponse {
    pub fn new() -> Self {
        Self {
            version: HttpVersion::V1_1,
            status_code: 200,
            information: "OK".to_string(),
            content_type: None,
            content_encoding: None,
            date: Utc::now(),
            server_name: SERVER_NAME.to_string(),
            allow: None,
            headers: Vec::new(),
            body: ResponseBody::new(),
        }
    }

    /// 设置状态码与对应的状态描述
    pub fn set_code(&mut self, code: u16) -> &mut Self {
        self.status_code = code;
        self.information = match STATUS_CODES.get(&code) {
            Some(&text) => text.to_string(),
            None => {
                error!("非法的状态码：{}", code);
                "Unknown".to_string()
            }
        };
        self
    }

    pub fn set_content_type(&mut self, content_type: &str) -> &mut Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn set_content_encoding(&mut self, encoding: Option<HttpEncoding>) -> &mut Self {
        self.content_encoding = encoding;
        self
    }

    pub fn set_allow(&mut self, allow: Vec<HttpRequestMethod>) -> &mut Self {
        self.allow = Some(allow);
        self
    }

    /// 追加或替换一个附加头部
    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
        self
    }

    fn set_date(&mut self) -> &mut Self {
        self.date = Utc::now();
        self
    }

    /// 响应正文句柄，写入端交给管线
    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn set_body(&mut self, body: ResponseBody) -> &mut Self {
        self.body = body;
        self
    }

    /// 生成状态页响应；405 附带 `Allow`
    pub fn from_status_code(code: u16, allow: Option<Vec<HttpRequestMethod>>, note: Option<&str>) -> Self {
        let mut response = Self::new();
        response.set_code(code).set_date();
        if code == 405 && allow.is_none() {
            warn!("405响应缺少Allow头部");
        }
        response.allow = allow;
        if code == 202 || code == 204 {
            return response;
        }
        let page = HtmlBuilder::from_status_code(code, note).build();
        let mut writer = response.body.writer();
        if let Err(e) = writer.write_all(page.as_bytes()) {
            error!("写入状态页失败：{}", e);
        }
        response.content_type = Some("text/html;charset=utf-8".to_string());
        response
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn information(&self) -> &str {
        &self.information
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_encoding(&self) -> Option<HttpEncoding> {
        self.content_encoding
    }

    pub fn allow(&self) -> Option<&[HttpRequestMethod]> {
        self.allow.as_deref()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 当前正文内容
    pub fn content(&self) -> Bytes {
        self.body.bytes()
    }

    /// 拼装完整的 HTTP 报文
    pub fn as_bytes(&self) -> Vec<u8> {
        let version = match self.version {
            HttpVersion::V1_1 => "HTTP/1.1",
            HttpVersion::V1_0 => "HTTP/1.0",
        };
        let content = self.body.bytes();

        let mut head = format!("{} {} {}{}", version, self.status_code, self.information, CRLF);
        if let Some(t) = &self.content_type {
            head.push_str(&["Content-Type: ", t, CRLF].concat());
        }
        if let Some(e) = self.content_encoding {
            head.push_str(&format!("Content-Encoding: {}{}", e, CRLF));
        }
        head.push_str(&format!("Content-Length: {}{}", content.len(), CRLF));
        head.push_str(&["Date: ", &format_date(&self.date), CRLF].concat());
        head.push_str(&["Server: ", &self.server_name, CRLF].concat());
        if let Some(allow) = &self.allow {
            let methods: Vec<String> = allow.iter().map(|m| m.to_string()).collect();
            head.push_str(&["Allow: ", &methods.join(", "), CRLF].concat());
        }
        for (name, value) in &self.headers {
            head.push_str(&[name.as_str(), ": ", value, CRLF].concat());
        }
        head.push_str(CRLF);

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&content);
        bytes
    }
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// 客户端看到的 HTTP 响应
pub trait Response: Send {
    fn status(&self) -> u16;

    fn header(&self, name: &str) -> Option<&str>;

    fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    /// 取走正文；响应对象随之关闭。
    fn into_body(self: Box<Self>) -> InputStream;
}

/// 内存中的客户端响应
#[derive(Debug, Clone)]
pub struct HttpClientResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl HttpClientResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// 解析原始响应报文
    pub fn try_from(buffer: &[u8]) -> Result<Self, Exception> {
        let head_end = head_length(buffer)
            .ok_or_else(|| Exception::BadRequest("response head is incomplete".to_string()))?;
        let head = std::str::from_utf8(&buffer[..head_end])
            .map_err(|_| Exception::BadRequest("response head is not UTF-8".to_string()))?;
        let mut lines = head.split(CRLF);
        let status_line = lines.next().unwrap_or("");
        let status = status_line
            .split(' ')
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| Exception::BadRequest(format!("malformed status line '{}'", status_line)))?;
        let headers = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        Ok(Self {
            status,
            headers,
            body: Bytes::copy_from_slice(&buffer[head_end..]),
        })
    }

    /// 把服务端响应直接转成客户端视图（进程内传输）
    pub fn from_server(response: &HttpResponse) -> Self {
        let mut headers = Vec::new();
        if let Some(t) = response.content_type() {
            headers.push(("Content-Type".to_string(), t.to_string()));
        }
        if let Some(e) = response.content_encoding() {
            headers.push(("Content-Encoding".to_string(), e.to_string()));
        }
        headers.extend(response.headers.iter().cloned());
        Self {
            status: response.status_code(),
            headers,
            body: response.content(),
        }
    }
}

impl Response for HttpClientResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn into_body(self: Box<Self>) -> InputStream {
        input_from_bytes(self.body)
    }
}
