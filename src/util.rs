//! 通用工具函数：标量编解码、URL 转义、媒体类型解析与状态页生成。
//!
//! 这里的函数都是无状态的纯函数，所有输入通过参数传入。

use log::warn;
use url::form_urlencoded;

use crate::{exception::Exception, param::STATUS_CODES, value::TypeTag, value::Value};

/// 状态页 HTML 生成器，用于协议选择失败时的拒绝响应。
pub struct HtmlBuilder {
    title: String,
    css: String,
    body: String,
}

impl HtmlBuilder {
    pub fn from_status_code(code: u16, note: Option<&str>) -> Self {
        let title = format!("{}", code);
        let css = r"
            body {
                width: 35em;
                margin: 0 auto;
                font-family: Tahoma, Verdana, Arial, sans-serif;
            }
            "
        .to_string();
        let description = match note {
            Some(n) => n,
            None => match STATUS_CODES.get(&code) {
                Some(d) => *d,
                None => {
                    warn!("未登记的状态码：{}", code);
                    "Unknown Status"
                }
            },
        };
        let body = format!(
            r"
            <h1>{}</h1>
            <p>{}</p>
            ",
            code, description
        );
        Self { title, css, body }
    }

    pub fn build(&self) -> String {
        format!(
            r##"<!DOCTYPE html>
            <html>
                <head>
                    <meta charset="utf-8">
                    <title>{}</title>
                    <style>{}</style>
                </head>
                <body>
                {}
                </body>
            </html>"##,
            self.title, self.css, self.body
        )
    }
}

/// URL 与表单编码所使用的字节编码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteEncoding {
    Utf8,
    /// ISO-8859-1，超出范围的字符替换为 `?`
    Latin1,
}

impl ByteEncoding {
    /// 从 `charset` 参数解析，未知字符集返回 `None`
    pub fn from_charset(charset: &str) -> Option<Self> {
        match charset.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(ByteEncoding::Utf8),
            "iso-8859-1" | "latin1" | "latin-1" => Some(ByteEncoding::Latin1),
            _ => None,
        }
    }

    pub fn charset(&self) -> &'static str {
        match self {
            ByteEncoding::Utf8 => "utf-8",
            ByteEncoding::Latin1 => "iso-8859-1",
        }
    }

    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            ByteEncoding::Utf8 => text.as_bytes().to_vec(),
            ByteEncoding::Latin1 => text
                .chars()
                .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
                .collect(),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            ByteEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            ByteEncoding::Latin1 => bytes.iter().map(|b| *b as char).collect(),
        }
    }
}

/// 对单个名称或值做 URL 转义。
///
/// 指定了字节编码时按该编码逐字节 `%XX` 转义；否则 ASCII 之外的字符以 `%uXXXX` 形式输出。
pub fn url_encode(text: &str, encoding: Option<ByteEncoding>) -> String {
    match encoding {
        Some(encoding) => form_urlencoded::byte_serialize(&encoding.encode(text)).collect(),
        None => url_encode_unicode(text),
    }
}

fn url_encode_unicode(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut units = [0u16; 2];
    for c in text.chars() {
        if c.is_ascii() {
            let mut buf = [0u8; 1];
            let ascii: &str = c.encode_utf8(&mut buf);
            out.extend(form_urlencoded::byte_serialize(ascii.as_bytes()));
        } else {
            for unit in c.encode_utf16(&mut units).iter() {
                out.push_str(&format!("%u{:04x}", unit));
            }
        }
    }
    out
}

/// URL 解码，支持 `+`、`%XX` 以及 `%uXXXX`；非法转义按字面保留。
pub fn url_decode(text: &str, encoding: ByteEncoding) -> String {
    url_decode_bytes(text.as_bytes(), encoding)
}

/// 对原始字节做 URL 解码：未转义的字节与 `%XX` 字节一起按 `encoding` 只解码一次
pub fn url_decode_bytes(bytes: &[u8], encoding: ByteEncoding) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut pending: Vec<u8> = Vec::new();
    let mut units: Vec<u16> = Vec::new();
    let mut i = 0;

    fn flush_bytes(pending: &mut Vec<u8>, out: &mut String, encoding: ByteEncoding) {
        if !pending.is_empty() {
            out.push_str(&encoding.decode(pending));
            pending.clear();
        }
    }
    fn flush_units(units: &mut Vec<u16>, out: &mut String) {
        if !units.is_empty() {
            out.push_str(&String::from_utf16_lossy(units));
            units.clear();
        }
    }

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                flush_units(&mut units, &mut out);
                pending.push(b' ');
                i += 1;
            }
            b'%' if i + 6 <= bytes.len() && (bytes[i + 1] == b'u' || bytes[i + 1] == b'U') => {
                match std::str::from_utf8(&bytes[i + 2..i + 6])
                    .ok()
                    .and_then(|h| u16::from_str_radix(h, 16).ok())
                {
                    Some(unit) => {
                        flush_bytes(&mut pending, &mut out, encoding);
                        units.push(unit);
                        i += 6;
                    }
                    _ => {
                        flush_units(&mut units, &mut out);
                        pending.push(b'%');
                        i += 1;
                    }
                }
            }
            b'%' if i + 3 <= bytes.len() => {
                let hex = &bytes[i + 1..i + 3];
                match std::str::from_utf8(hex)
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                {
                    Some(b) => {
                        flush_units(&mut units, &mut out);
                        pending.push(b);
                        i += 3;
                    }
                    None => {
                        flush_units(&mut units, &mut out);
                        pending.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                flush_units(&mut units, &mut out);
                pending.push(b);
                i += 1;
            }
        }
    }
    flush_units(&mut units, &mut out);
    flush_bytes(&mut pending, &mut out, encoding);
    out
}

/// 解析 `a=1&b=2&b=3` 形式的查询串或表单正文，保留出现顺序与重复键。
pub fn parse_query(text: &str, encoding: ByteEncoding) -> Vec<(String, String)> {
    parse_query_bytes(text.as_bytes(), encoding)
}

/// 同 [`parse_query`]，直接处理未解码的正文字节
pub fn parse_query_bytes(body: &[u8], encoding: ByteEncoding) -> Vec<(String, String)> {
    body.split(|b| *b == b'&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.iter().position(|b| *b == b'=') {
            Some(eq) => (
                url_decode_bytes(&pair[..eq], encoding),
                url_decode_bytes(&pair[eq + 1..], encoding),
            ),
            None => (url_decode_bytes(pair, encoding), String::new()),
        })
        .collect()
}

/// 解析媒体类型：返回小写的基础类型与参数列表。
///
/// 协商时只比较基础类型，`charset` 等参数留给解码阶段使用。
pub fn split_content_type(content_type: &str) -> (String, Vec<(String, String)>) {
    let mut parts = content_type.split(';');
    let base = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let params = parts
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| {
            (
                k.trim().to_ascii_lowercase(),
                v.trim().trim_matches('"').to_string(),
            )
        })
        .collect();
    (base, params)
}

/// 读取媒体类型中的某个参数
pub fn content_type_param(content_type: &str, name: &str) -> Option<String> {
    let (_, params) = split_content_type(content_type);
    params
        .into_iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

/// 基础媒体类型是否与期望值一致（忽略参数与大小写）
pub fn media_type_matches(content_type: &str, expected: &str) -> bool {
    split_content_type(content_type).0 == expected.to_ascii_lowercase()
}

/// 根据 `charset` 参数决定解码字节编码，缺省或未知时使用 UTF-8
pub fn charset_of(content_type: &str) -> ByteEncoding {
    content_type_param(content_type, "charset")
        .and_then(|c| ByteEncoding::from_charset(&c))
        .unwrap_or(ByteEncoding::Utf8)
}

/// 将标量值格式化为与区域设置无关的字符串；数组与空值返回 `None`。
pub fn format_scalar(value: &Value) -> Option<String> {
    match value {
        Value::Str(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Double(d) => Some(format_double(*d)),
        Value::Bool(b) => Some(b.to_string()),
        Value::Xml(x) => Some(x.clone()),
        Value::Null | Value::Array(_) => None,
    }
}

fn format_double(d: f64) -> String {
    if d.is_nan() {
        "NaN".to_string()
    } else if d.is_infinite() {
        if d > 0.0 { "INF" } else { "-INF" }.to_string()
    } else {
        d.to_string()
    }
}

/// 按类型标签解析标量字符串，失败时报告参数名与原始文本。
pub fn parse_scalar(name: &str, text: &str, tag: TypeTag) -> Result<Value, Exception> {
    let invalid = || Exception::InvalidValue {
        name: name.to_string(),
        value: text.to_string(),
        type_name: tag.xml_name(),
    };
    match tag {
        TypeTag::String => Ok(Value::Str(text.to_string())),
        TypeTag::Xml => Ok(Value::Xml(text.to_string())),
        TypeTag::Int => text.trim().parse::<i64>().map(Value::Int).map_err(|_| invalid()),
        TypeTag::Double => match text.trim() {
            "INF" => Ok(Value::Double(f64::INFINITY)),
            "-INF" => Ok(Value::Double(f64::NEG_INFINITY)),
            "NaN" => Ok(Value::Double(f64::NAN)),
            t => t.parse::<f64>().map(Value::Double).map_err(|_| invalid()),
        },
        TypeTag::Bool => match text.trim() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(invalid()),
        },
    }
}
