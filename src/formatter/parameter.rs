//! # 参数读写器
//!
//! 读取器把请求转换为按声明顺序排列的实参向量；请求的内容类型与读取器不匹配时
//! 返回 `Ok(None)`，调用方继续尝试下一个读取器。
//!
//! 写入器是客户端一侧的对应物：`UrlParameterWriter` 把实参编码进 URL，
//! `HtmlFormParameterWriter` 把实参编码为表单正文。

use std::io::{Read, Write};
use std::sync::Arc;

use log::debug;

use crate::descriptor::{MethodDescriptor, ParameterInfo, ServiceDescriptor};
use crate::exception::Exception;
use crate::formatter::MimeFormatter;
use crate::param::{FORM_URLENCODED, TEXT_XML};
use crate::request::Request;
use crate::serializer::XmlSerializer;
use crate::util::{
    charset_of, media_type_matches, parse_query, parse_query_bytes, parse_scalar, url_encode, ByteEncoding,
};
use crate::value::Value;
use crate::xml::{is_protocol_namespace, parse_document};

const APPLICATION_XML: &str = "application/xml";

pub trait ParameterReader {
    fn read(&self, request: &mut dyn Request) -> Result<Option<Vec<Value>>, Exception>;
}

/// 只含标量（或标量数组）形参的方法共享的参数表
#[derive(Debug, Clone)]
pub struct ValueCollectionInit {
    parameters: Vec<ParameterInfo>,
}

impl ValueCollectionInit {
    /// 任一形参不是标量类型时不适用
    pub fn build(method: &MethodDescriptor) -> Option<Self> {
        if method.parameters.iter().any(|p| !p.type_tag.is_scalar()) {
            return None;
        }
        Some(Self {
            parameters: method.parameters.clone(),
        })
    }

    pub fn parameters(&self) -> &[ParameterInfo] {
        &self.parameters
    }

    fn names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    /// 把名称到值的多重映射按形参顺序解码为实参向量
    pub fn decode(&self, pairs: &[(String, String)]) -> Result<Vec<Value>, Exception> {
        let mut args = Vec::with_capacity(self.parameters.len());
        for parameter in &self.parameters {
            let mut values = pairs
                .iter()
                .filter(|(name, _)| *name == parameter.name)
                .map(|(_, value)| value.as_str());
            if parameter.is_array {
                let items = values
                    .map(|v| parse_scalar(&parameter.name, v, parameter.type_tag))
                    .collect::<Result<Vec<_>, _>>()?;
                args.push(Value::Array(items));
            } else {
                match values.next() {
                    Some(v) => args.push(parse_scalar(&parameter.name, v, parameter.type_tag)?),
                    None => {
                        return Err(Exception::MissingParameter {
                            name: parameter.name.clone(),
                            expected: self.names(),
                        })
                    }
                }
            }
        }
        Ok(args)
    }

    /// 按形参顺序编码实参；数组形参每个元素各输出一对 `name=value`，空值被省略。
    pub fn encode(&self, args: &[Value], encoding: Option<ByteEncoding>) -> Result<String, Exception> {
        if args.len() != self.parameters.len() {
            return Err(Exception::InvalidValue {
                name: "arguments".to_string(),
                value: args.len().to_string(),
                type_name: "argument count",
            });
        }
        let mut pairs = Vec::new();
        for (parameter, arg) in self.parameters.iter().zip(args) {
            let name = url_encode(&parameter.name, encoding);
            match (parameter.is_array, arg) {
                (_, Value::Null) => {}
                (true, Value::Array(items)) => {
                    for item in items {
                        if let Some(text) = item.to_wire_string() {
                            pairs.push(format!("{}={}", name, url_encode(&text, encoding)));
                        }
                    }
                }
                (false, Value::Array(_)) | (true, _) => {
                    return Err(Exception::InvalidValue {
                        name: parameter.name.clone(),
                        value: format!("{:?}", arg),
                        type_name: parameter.type_tag.xml_name(),
                    })
                }
                (false, scalar) => {
                    if let Some(text) = scalar.to_wire_string() {
                        pairs.push(format!("{}={}", name, url_encode(&text, encoding)));
                    }
                }
            }
        }
        Ok(pairs.join("&"))
    }
}

/// 从查询串读取参数（HTTP-GET）
pub struct UrlParameterReader {
    init: Arc<ValueCollectionInit>,
}

impl MimeFormatter for UrlParameterReader {
    type Initializer = ValueCollectionInit;
    const NAME: &'static str = "UrlParameterReader";

    fn get_initializer(_: &ServiceDescriptor, method: &MethodDescriptor) -> Option<ValueCollectionInit> {
        ValueCollectionInit::build(method)
    }

    fn initialize(init: Arc<ValueCollectionInit>) -> Self {
        Self { init }
    }
}

impl ParameterReader for UrlParameterReader {
    fn read(&self, request: &mut dyn Request) -> Result<Option<Vec<Value>>, Exception> {
        let pairs = parse_query(request.query(), ByteEncoding::Utf8);
        self.init.decode(&pairs).map(Some)
    }
}

/// 从 `application/x-www-form-urlencoded` 正文读取参数（HTTP-POST）
pub struct HtmlFormParameterReader {
    init: Arc<ValueCollectionInit>,
}

impl MimeFormatter for HtmlFormParameterReader {
    type Initializer = ValueCollectionInit;
    const NAME: &'static str = "HtmlFormParameterReader";

    fn get_initializer(_: &ServiceDescriptor, method: &MethodDescriptor) -> Option<ValueCollectionInit> {
        ValueCollectionInit::build(method)
    }

    fn initialize(init: Arc<ValueCollectionInit>) -> Self {
        Self { init }
    }
}

impl ParameterReader for HtmlFormParameterReader {
    fn read(&self, request: &mut dyn Request) -> Result<Option<Vec<Value>>, Exception> {
        let content_type = match request.content_type() {
            Some(t) if media_type_matches(t, FORM_URLENCODED) => t.to_string(),
            other => {
                debug!("[ID{}]表单读取器不适用，内容类型：{:?}", request.id(), other);
                return Ok(None);
            }
        };
        let mut body = Vec::new();
        request.take_body().read_to_end(&mut body)?;
        let pairs = parse_query_bytes(&body, charset_of(&content_type));
        self.init.decode(&pairs).map(Some)
    }
}

/// XML 参数读取器的预计算结果
#[derive(Debug, Clone)]
pub struct XmlParameterInit {
    element: String,
    namespace: String,
    parameters: Vec<(ParameterInfo, XmlSerializer)>,
}

/// 从 XML 正文读取参数：根元素为方法名，子元素为各个形参
pub struct XmlParameterReader {
    init: Arc<XmlParameterInit>,
}

impl MimeFormatter for XmlParameterReader {
    type Initializer = XmlParameterInit;
    const NAME: &'static str = "XmlParameterReader";

    fn get_initializer(service: &ServiceDescriptor, method: &MethodDescriptor) -> Option<XmlParameterInit> {
        Some(XmlParameterInit {
            element: method.name.clone(),
            namespace: service.namespace.clone(),
            parameters: method
                .parameters
                .iter()
                .map(|p| (p.clone(), XmlSerializer::for_parameter(p, &service.namespace)))
                .collect(),
        })
    }

    fn initialize(init: Arc<XmlParameterInit>) -> Self {
        Self { init }
    }
}

impl XmlParameterReader {
    /// 从已解析的方法元素读取实参；SOAP 正文也复用这一逻辑
    pub fn read_children(&self, element: &crate::xml::XmlElement) -> Result<Vec<Value>, Exception> {
        let init = &self.init;
        if !element.is(Some(&init.namespace), &init.element) {
            return Err(element.unexpected(&[init.element.clone()]));
        }
        element.check_attributes(&[])?;
        let expected: Vec<String> = init.parameters.iter().map(|(p, _)| p.name.clone()).collect();
        for child in &element.children {
            let known = init
                .parameters
                .iter()
                .any(|(p, s)| child.name == p.name && child.namespace.as_deref() == s.namespace());
            if !known && !is_protocol_namespace(child.namespace.as_deref()) {
                return Err(child.unexpected(&expected));
            }
        }
        let mut args = Vec::with_capacity(init.parameters.len());
        for (parameter, serializer) in &init.parameters {
            let found = element
                .children
                .iter()
                .find(|c| c.name == parameter.name && c.namespace.as_deref() == serializer.namespace());
            match found {
                Some(child) => args.push(serializer.read_element(child)?),
                None if parameter.is_array => args.push(Value::Array(Vec::new())),
                None => {
                    return Err(Exception::MissingParameter {
                        name: parameter.name.clone(),
                        expected: expected.clone(),
                    })
                }
            }
        }
        Ok(args)
    }

    /// 把实参写为方法元素（不含 XML 声明）
    pub fn write_element(&self, out: &mut String, args: &[Value], parent_ns: Option<&str>) -> Result<(), Exception> {
        let init = &self.init;
        out.push('<');
        out.push_str(&init.element);
        if parent_ns != Some(init.namespace.as_str()) {
            out.push_str(&format!(" xmlns=\"{}\"", crate::xml::escape(&init.namespace)));
        }
        out.push('>');
        for ((_, serializer), arg) in init.parameters.iter().zip(args) {
            serializer.write_element(out, arg, Some(&init.namespace))?;
        }
        out.push_str("</");
        out.push_str(&init.element);
        out.push('>');
        Ok(())
    }
}

impl ParameterReader for XmlParameterReader {
    fn read(&self, request: &mut dyn Request) -> Result<Option<Vec<Value>>, Exception> {
        match request.content_type() {
            Some(t) if media_type_matches(t, TEXT_XML) || media_type_matches(t, APPLICATION_XML) => {}
            _ => return Ok(None),
        }
        let mut body = Vec::new();
        request.take_body().read_to_end(&mut body)?;
        let root = parse_document(&body)?;
        self.read_children(&root).map(Some)
    }
}

pub trait ParameterWriter {
    /// 是否把实参写入请求正文
    fn uses_write_request(&self) -> bool {
        false
    }

    /// 生成请求 URL；零个实参时原样返回 `base`
    fn request_url(&self, base: &str, _args: &[Value]) -> Result<String, Exception> {
        Ok(base.to_string())
    }

    fn content_type(&self) -> Option<String> {
        None
    }

    fn write_request(&self, _out: &mut dyn Write, _args: &[Value]) -> Result<(), Exception> {
        Ok(())
    }
}

/// 把实参编码进查询串（HTTP-GET 客户端）
pub struct UrlParameterWriter {
    init: Arc<ValueCollectionInit>,
    encoding: Option<ByteEncoding>,
}

impl UrlParameterWriter {
    pub fn with_encoding(mut self, encoding: Option<ByteEncoding>) -> Self {
        self.encoding = encoding;
        self
    }
}

impl MimeFormatter for UrlParameterWriter {
    type Initializer = ValueCollectionInit;
    const NAME: &'static str = "UrlParameterWriter";

    fn get_initializer(_: &ServiceDescriptor, method: &MethodDescriptor) -> Option<ValueCollectionInit> {
        ValueCollectionInit::build(method)
    }

    fn initialize(init: Arc<ValueCollectionInit>) -> Self {
        Self { init, encoding: None }
    }
}

impl ParameterWriter for UrlParameterWriter {
    fn request_url(&self, base: &str, args: &[Value]) -> Result<String, Exception> {
        let query = self.init.encode(args, self.encoding)?;
        if query.is_empty() {
            return Ok(base.to_string());
        }
        let separator = if base.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}{}", base, separator, query))
    }
}

/// 把实参编码为表单正文（HTTP-POST 客户端）
pub struct HtmlFormParameterWriter {
    init: Arc<ValueCollectionInit>,
    encoding: Option<ByteEncoding>,
}

impl HtmlFormParameterWriter {
    pub fn with_encoding(mut self, encoding: Option<ByteEncoding>) -> Self {
        self.encoding = encoding;
        self
    }
}

impl MimeFormatter for HtmlFormParameterWriter {
    type Initializer = ValueCollectionInit;
    const NAME: &'static str = "HtmlFormParameterWriter";

    fn get_initializer(_: &ServiceDescriptor, method: &MethodDescriptor) -> Option<ValueCollectionInit> {
        ValueCollectionInit::build(method)
    }

    fn initialize(init: Arc<ValueCollectionInit>) -> Self {
        Self {
            init,
            encoding: Some(ByteEncoding::Utf8),
        }
    }
}

impl ParameterWriter for HtmlFormParameterWriter {
    fn uses_write_request(&self) -> bool {
        true
    }

    fn content_type(&self) -> Option<String> {
        Some(match self.encoding {
            Some(encoding) => format!("{}; charset={}", FORM_URLENCODED, encoding.charset()),
            None => FORM_URLENCODED.to_string(),
        })
    }

    fn write_request(&self, out: &mut dyn Write, args: &[Value]) -> Result<(), Exception> {
        let body = self.init.encode(args, self.encoding)?;
        out.write_all(body.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::MethodBuilder;
    use crate::param::HttpRequestMethod;
    use crate::request::HttpRequest;
    use crate::value::TypeTag;

    fn service() -> ServiceDescriptor {
        ServiceDescriptor::new("Calc")
            .namespace("urn:calc")
            .method(
                MethodBuilder::new("Sum")
                    .param(ParameterInfo::new("label", TypeTag::String))
                    .param(ParameterInfo::array("values", TypeTag::Int)),
            )
            .method(MethodBuilder::new("Doc").param(ParameterInfo::new("doc", TypeTag::Xml)))
    }

    fn init(service: &ServiceDescriptor) -> Arc<ValueCollectionInit> {
        Arc::new(ValueCollectionInit::build(&service.methods()[0]).unwrap())
    }

    #[test]
    fn test_xml_parameter_is_not_collection_shaped() {
        let service = service();
        assert!(UrlParameterReader::get_initializer(&service, &service.methods()[1]).is_none());
        assert!(XmlParameterReader::get_initializer(&service, &service.methods()[1]).is_some());
    }

    #[test]
    fn test_url_reader_expands_repeated_keys() {
        let service = service();
        let reader = UrlParameterReader::initialize(init(&service));
        let mut request = HttpRequest::new(
            HttpRequestMethod::Get,
            "/Calc/Sum?values=1&label=a%20b&values=2&values=3",
        );
        let args = reader.read(&mut request).unwrap().unwrap();
        assert_eq!(args[0], Value::Str("a b".into()));
        assert_eq!(
            args[1],
            Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn test_missing_scalar_and_missing_array() {
        let service = service();
        let reader = UrlParameterReader::initialize(init(&service));
        let mut request = HttpRequest::new(HttpRequestMethod::Get, "/Calc/Sum?label=x");
        let args = reader.read(&mut request).unwrap().unwrap();
        assert_eq!(args[1], Value::Array(vec![]));

        let mut request = HttpRequest::new(HttpRequestMethod::Get, "/Calc/Sum?values=1");
        match reader.read(&mut request) {
            Err(Exception::MissingParameter { name, expected }) => {
                assert_eq!(name, "label");
                assert_eq!(expected, vec!["label".to_string(), "values".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_form_reader_checks_media_type() {
        let service = service();
        let reader = HtmlFormParameterReader::initialize(init(&service));
        let mut request = HttpRequest::new(HttpRequestMethod::Post, "/Calc/Sum")
            .header_line("Content-Type", "text/plain")
            .body("label=x");
        assert!(reader.read(&mut request).unwrap().is_none());

        let mut request = HttpRequest::new(HttpRequestMethod::Post, "/Calc/Sum")
            .header_line("Content-Type", "Application/X-WWW-Form-UrlEncoded; charset=iso-8859-1")
            .body(&b"label=caf%E9&values=4"[..]);
        let args = reader.read(&mut request).unwrap().unwrap();
        assert_eq!(args[0], Value::Str("caf\u{e9}".into()));
        assert_eq!(args[1], Value::Array(vec![Value::Int(4)]));

        // 未转义的 0xE9 与 %E9 得到同一个字符
        let mut request = HttpRequest::new(HttpRequestMethod::Post, "/Calc/Sum")
            .header_line("Content-Type", "application/x-www-form-urlencoded; charset=iso-8859-1")
            .body(&b"label=caf\xe9&values=5"[..]);
        let args = reader.read(&mut request).unwrap().unwrap();
        assert_eq!(args[0], Value::Str("caf\u{e9}".into()));
    }

    #[test]
    fn test_xml_reader_strictness() {
        let service = service();
        let method = &service.methods()[0];
        let reader = XmlParameterReader::initialize(Arc::new(
            XmlParameterReader::get_initializer(&service, method).unwrap(),
        ));
        let body = r#"<Sum xmlns="urn:calc"><label>t</label><values><int>1</int><int>2</int></values></Sum>"#;
        let mut request = HttpRequest::new(HttpRequestMethod::Post, "/Calc/Sum")
            .header_line("Content-Type", "text/xml; charset=utf-8")
            .body(body);
        let args = reader.read(&mut request).unwrap().unwrap();
        assert_eq!(args[1], Value::Array(vec![Value::Int(1), Value::Int(2)]));

        let body = r#"<Sum xmlns="urn:calc"><label>t</label><extra>1</extra></Sum>"#;
        let mut request = HttpRequest::new(HttpRequestMethod::Post, "/Calc/Sum")
            .header_line("Content-Type", "application/xml")
            .body(body);
        match reader.read(&mut request) {
            Err(Exception::UnexpectedElement { name, expected, .. }) => {
                assert_eq!(name, "extra");
                assert_eq!(expected, vec!["label".to_string(), "values".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_url_writer_repeats_array_names() {
        let service = service();
        let writer = UrlParameterWriter::initialize(init(&service));
        let args = vec![
            Value::Str("a&b".into()),
            Value::Array(vec![Value::Int(1), Value::Int(2)]),
        ];
        let url = writer.request_url("http://h/Calc/Sum", &args).unwrap();
        assert_eq!(url, "http://h/Calc/Sum?label=a%26b&values=1&values=2");
    }

    #[test]
    fn test_zero_args_produce_no_query_or_body() {
        let service = ServiceDescriptor::new("S").method(MethodBuilder::new("Ping"));
        let init = Arc::new(ValueCollectionInit::build(&service.methods()[0]).unwrap());
        let writer = UrlParameterWriter::initialize(init.clone());
        assert_eq!(writer.request_url("http://h/S/Ping", &[]).unwrap(), "http://h/S/Ping");

        let form = HtmlFormParameterWriter::initialize(init);
        let mut out = Vec::new();
        form.write_request(&mut out, &[]).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_unicode_escape_without_encoding() {
        let service = service();
        let writer = UrlParameterWriter::initialize(init(&service));
        let url = writer
            .request_url("/Calc/Sum", &[Value::Str("\u{4e2d}".into()), Value::Array(vec![])])
            .unwrap();
        assert_eq!(url, "/Calc/Sum?label=%u4e2d");

        let writer = UrlParameterWriter::initialize(init(&service)).with_encoding(Some(ByteEncoding::Utf8));
        let url = writer
            .request_url("/Calc/Sum", &[Value::Str("\u{4e2d}".into()), Value::Array(vec![])])
            .unwrap();
        assert_eq!(url, "/Calc/Sum?label=%E4%B8%AD");
    }

    #[test]
    fn test_form_writer_content_type() {
        let service = service();
        let writer = HtmlFormParameterWriter::initialize(init(&service))
            .with_encoding(Some(ByteEncoding::Latin1));
        assert_eq!(
            writer.content_type().unwrap(),
            "application/x-www-form-urlencoded; charset=iso-8859-1"
        );
        assert!(writer.uses_write_request());
    }
}
