//! # 返回值读写器
//!
//! 读取器拿到响应的所有权：消费完正文后响应随之关闭。透传读取器例外，
//! 它把正文流原样交给调用方，由调用方继续读取并负责关闭。

use std::io::{Read, Write};
use std::sync::Arc;

use crate::descriptor::{MethodDescriptor, ReturnFormat, ServiceDescriptor};
use crate::exception::Exception;
use crate::formatter::pattern::PatternMatcher;
use crate::formatter::MimeFormatter;
use crate::param::TEXT_XML;
use crate::response::{HttpResponse, Response};
use crate::serializer::{Serializer, XmlSerializer};
use crate::util::charset_of;
use crate::value::{ReturnType, ReturnValue, Value};

use log::error;

pub trait ReturnReader {
    fn read(&self, response: Box<dyn Response>) -> Result<ReturnValue, Exception>;
}

/// HTTP-GET/POST 返回值的根元素名：标量用类型名，数组用 `ArrayOf` 前缀
pub fn return_element(return_type: ReturnType) -> String {
    let name = return_type.tag.xml_name();
    if return_type.is_array {
        let mut chars = name.chars();
        let capitalized: String = match chars.next() {
            Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
            None => String::new(),
        };
        format!("ArrayOf{}", capitalized)
    } else {
        name.to_string()
    }
}

fn return_serializer(service: &ServiceDescriptor, method: &MethodDescriptor) -> Option<XmlSerializer> {
    method.return_type.map(|rt| {
        XmlSerializer::new(&return_element(rt), Some(&service.namespace), rt.tag, rt.is_array)
    })
}

fn read_all(response: Box<dyn Response>) -> Result<(Option<String>, Vec<u8>), Exception> {
    let content_type = response.content_type().map(|s| s.to_string());
    let mut body = Vec::new();
    response.into_body().read_to_end(&mut body)?;
    Ok((content_type, body))
}

/// XML 序列化的返回值
pub struct XmlReturnReader {
    serializer: Arc<XmlSerializer>,
}

impl MimeFormatter for XmlReturnReader {
    type Initializer = XmlSerializer;
    const NAME: &'static str = "XmlReturnReader";

    fn get_initializer(service: &ServiceDescriptor, method: &MethodDescriptor) -> Option<XmlSerializer> {
        if method.return_format != ReturnFormat::Xml || method.one_way {
            return None;
        }
        return_serializer(service, method)
    }

    fn initialize(serializer: Arc<XmlSerializer>) -> Self {
        Self { serializer }
    }
}

impl ReturnReader for XmlReturnReader {
    fn read(&self, response: Box<dyn Response>) -> Result<ReturnValue, Exception> {
        let (_, body) = read_all(response)?;
        let value = self.serializer.deserialize(&mut &body[..])?;
        Ok(ReturnValue::Value(value))
    }
}

/// 从纯文本中按模式提取的返回值
pub struct TextReturnReader {
    matcher: Arc<PatternMatcher>,
}

impl MimeFormatter for TextReturnReader {
    type Initializer = PatternMatcher;
    const NAME: &'static str = "TextReturnReader";

    fn get_initializer(_: &ServiceDescriptor, method: &MethodDescriptor) -> Option<PatternMatcher> {
        let spec = match &method.return_format {
            ReturnFormat::Text(spec) if !method.one_way => spec,
            _ => return None,
        };
        let return_type = method.return_type?;
        match PatternMatcher::new(spec, return_type) {
            Ok(matcher) => Some(matcher),
            Err(e) => {
                error!("方法 {} 的文本返回模式不可用：{}", method.name, e);
                None
            }
        }
    }

    fn initialize(matcher: Arc<PatternMatcher>) -> Self {
        Self { matcher }
    }
}

impl ReturnReader for TextReturnReader {
    fn read(&self, response: Box<dyn Response>) -> Result<ReturnValue, Exception> {
        let (content_type, body) = read_all(response)?;
        let encoding = charset_of(content_type.as_deref().unwrap_or(""));
        let text = encoding.decode(&body);
        self.matcher.matches(&text).map(ReturnValue::Value)
    }
}

/// 透传：正文流交给调用方
pub struct AnyReturnReader;

impl MimeFormatter for AnyReturnReader {
    type Initializer = ();
    const NAME: &'static str = "AnyReturnReader";

    fn get_initializer(_: &ServiceDescriptor, method: &MethodDescriptor) -> Option<()> {
        match method.return_format {
            ReturnFormat::Passthrough if !method.one_way => Some(()),
            _ => None,
        }
    }

    fn initialize(_: Arc<()>) -> Self {
        AnyReturnReader
    }
}

impl ReturnReader for AnyReturnReader {
    fn read(&self, response: Box<dyn Response>) -> Result<ReturnValue, Exception> {
        Ok(ReturnValue::Stream(response.into_body()))
    }
}

/// 无返回值：只负责关闭响应
pub struct NopReturnReader;

impl MimeFormatter for NopReturnReader {
    type Initializer = ();
    const NAME: &'static str = "NopReturnReader";

    fn get_initializer(_: &ServiceDescriptor, method: &MethodDescriptor) -> Option<()> {
        if method.one_way || method.return_type.is_none() {
            Some(())
        } else {
            None
        }
    }

    fn initialize(_: Arc<()>) -> Self {
        NopReturnReader
    }
}

impl ReturnReader for NopReturnReader {
    fn read(&self, response: Box<dyn Response>) -> Result<ReturnValue, Exception> {
        drop(response);
        Ok(ReturnValue::None)
    }
}

/// 服务端把返回值写为 XML
pub struct XmlReturnWriter {
    serializer: Arc<XmlSerializer>,
}

impl MimeFormatter for XmlReturnWriter {
    type Initializer = XmlSerializer;
    const NAME: &'static str = "XmlReturnWriter";

    fn get_initializer(service: &ServiceDescriptor, method: &MethodDescriptor) -> Option<XmlSerializer> {
        if method.one_way {
            return None;
        }
        return_serializer(service, method)
    }

    fn initialize(serializer: Arc<XmlSerializer>) -> Self {
        Self { serializer }
    }
}

impl XmlReturnWriter {
    pub fn write(
        &self,
        value: &Value,
        response: &mut HttpResponse,
        out: &mut dyn Write,
    ) -> Result<(), Exception> {
        response.set_content_type(&format!("{}; charset=utf-8", TEXT_XML));
        self.serializer.serialize(out, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{MatchSpec, MethodBuilder};
    use crate::response::HttpClientResponse;
    use crate::value::TypeTag;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn service() -> ServiceDescriptor {
        ServiceDescriptor::new("S")
            .namespace("urn:s")
            .method(MethodBuilder::new("Add").returns(ReturnType::scalar(TypeTag::Int)))
            .method(
                MethodBuilder::new("Title")
                    .returns(ReturnType::scalar(TypeTag::String))
                    .return_format(ReturnFormat::Text(MatchSpec::new("<title>(.*?)</title>"))),
            )
            .method(
                MethodBuilder::new("Raw")
                    .returns(ReturnType::scalar(TypeTag::String))
                    .return_format(ReturnFormat::Passthrough),
            )
            .method(MethodBuilder::new("Ping").one_way())
            .method(
                MethodBuilder::new("Names").returns(ReturnType::array(TypeTag::String)),
            )
    }

    /// 记录是否被关闭的响应
    struct Tracked {
        inner: HttpClientResponse,
        closed: Arc<AtomicBool>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    impl Response for Tracked {
        fn status(&self) -> u16 {
            self.inner.status()
        }
        fn header(&self, name: &str) -> Option<&str> {
            self.inner.header(name)
        }
        fn into_body(self: Box<Self>) -> crate::stream::InputStream {
            Box::new(self.inner.clone()).into_body()
        }
    }

    fn tracked(body: &'static str) -> (Box<dyn Response>, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        let response = Tracked {
            inner: HttpClientResponse::new(200)
                .with_header("Content-Type", "text/xml")
                .with_body(body),
            closed: closed.clone(),
        };
        (Box::new(response), closed)
    }

    #[test]
    fn test_negotiation_by_shape() {
        let s = service();
        let m = s.methods();
        assert!(XmlReturnReader::get_initializer(&s, &m[0]).is_some());
        assert!(XmlReturnReader::get_initializer(&s, &m[1]).is_none());
        assert!(TextReturnReader::get_initializer(&s, &m[1]).is_some());
        assert!(AnyReturnReader::get_initializer(&s, &m[2]).is_some());
        assert!(NopReturnReader::get_initializer(&s, &m[3]).is_some());
        assert!(NopReturnReader::get_initializer(&s, &m[0]).is_none());
        assert!(XmlReturnWriter::get_initializer(&s, &m[3]).is_none());
    }

    #[test]
    fn test_xml_reader_closes_response() {
        let s = service();
        let reader = XmlReturnReader::initialize(Arc::new(
            XmlReturnReader::get_initializer(&s, &s.methods()[0]).unwrap(),
        ));
        let (response, closed) = tracked(r#"<?xml version="1.0"?><int xmlns="urn:s">42</int>"#);
        let value = reader.read(response).unwrap().into_value();
        assert_eq!(value, Some(Value::Int(42)));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_text_reader_matches() {
        let s = service();
        let reader = TextReturnReader::initialize(Arc::new(
            TextReturnReader::get_initializer(&s, &s.methods()[1]).unwrap(),
        ));
        let (response, closed) = tracked("<html><title>Hello</title></html>");
        let value = reader.read(response).unwrap().into_value();
        assert_eq!(value, Some(Value::Str("Hello".into())));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_passthrough_hands_stream_to_caller() {
        let (response, _) = tracked("raw bytes");
        match AnyReturnReader.read(response).unwrap() {
            ReturnValue::Stream(mut stream) => {
                let mut text = String::new();
                stream.read_to_string(&mut text).unwrap();
                assert_eq!(text, "raw bytes");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_nop_reader_closes_and_returns_nothing() {
        let (response, closed) = tracked("ignored");
        assert!(matches!(NopReturnReader.read(response).unwrap(), ReturnValue::None));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_writer_uses_type_named_root() {
        let s = service();
        let writer = XmlReturnWriter::initialize(Arc::new(
            XmlReturnWriter::get_initializer(&s, &s.methods()[4]).unwrap(),
        ));
        let mut response = HttpResponse::new();
        let mut out = Vec::new();
        writer
            .write(
                &Value::Array(vec![Value::Str("a".into())]),
                &mut response,
                &mut out,
            )
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(r#"<ArrayOfString xmlns="urn:s"><string>a</string></ArrayOfString>"#));
        assert_eq!(response.content_type(), Some("text/xml; charset=utf-8"));
    }
}
