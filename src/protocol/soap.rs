//! # SOAP 绑定
//!
//! 服务端处理顺序：
//! 1. 按 SOAPAction（1.1）或内容类型的 `action` 参数（1.2）确定方法，失败时退回到
//!    正文第一个元素的名称；
//! 2. 建立扩展链并包装输入流，依次经过 `BeforeDeserialize`、解析信封、
//!    `AfterDeserialize`，然后检查 mustUnderstand 头；
//! 3. 单向方法此时即以 202 应答，不进入序列化阶段；
//! 4. 其余方法调用服务，经 `BeforeSerialize`、写出信封、`AfterSerialize` 后提交。
//!
//! 反序列化中的任何失败都记为故障，消息直接跳到 `BeforeSerialize`，故障信封照常
//! 经过扩展链写出。序列化阶段本身失败时，已写入的正文被丢弃，改写为不经扩展的故障。

use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error, info, warn};

use crate::descriptor::{MethodDescriptor, ServiceDescriptor};
use crate::exception::Exception;
use crate::extension::ExtensionChain;
use crate::formatter::parameter::XmlParameterReader;
use crate::formatter::MimeFormatter;
use crate::message::{FaultCode, HeaderDirection, SoapFault, SoapHeader, SoapMessage, Stage};
use crate::param::{HttpEncoding, HttpRequestMethod, SoapProtocolVersion, SOAP_ACTION_HEADER, XSD_NS, XSI_NS};
use crate::protocol::{ProtocolContext, Selection, ServerProtocol, ServerProtocolFactory};
use crate::request::Request;
use crate::response::HttpResponse;
use crate::serializer::XmlSerializer;
use crate::stream::{input_from_bytes, BufferedOutputStream, InputStream, OutputLayer, ResponseBody};
use crate::util::{content_type_param, split_content_type};
use crate::value::Value;
use crate::xml::{escape, parse_document, XmlElement};

/// SOAP 响应中 `{方法}Result` 元素的序列化器
pub struct SoapResultFormatter {
    serializer: Arc<XmlSerializer>,
}

impl MimeFormatter for SoapResultFormatter {
    type Initializer = XmlSerializer;
    const NAME: &'static str = "SoapResultFormatter";

    fn get_initializer(service: &ServiceDescriptor, method: &MethodDescriptor) -> Option<XmlSerializer> {
        XmlSerializer::for_return(method, &service.namespace)
    }

    fn initialize(serializer: Arc<XmlSerializer>) -> Self {
        Self { serializer }
    }
}

impl SoapResultFormatter {
    pub fn serializer(&self) -> &XmlSerializer {
        &self.serializer
    }
}

/// 完整媒体类型，附带字符集
pub fn content_type(version: SoapProtocolVersion) -> String {
    format!("{}; charset=utf-8", version.media_type())
}

/// 已解析的信封
#[derive(Debug)]
pub struct Envelope {
    pub headers: Vec<SoapHeader>,
    /// `Body` 的第一个子元素
    pub body: Option<XmlElement>,
}

fn is_true(text: &str) -> bool {
    matches!(text.trim(), "1" | "true")
}

/// 解析信封；信封命名空间与协议版本不一致时报 VersionMismatch 故障
pub fn read_envelope(
    bytes: &[u8],
    version: SoapProtocolVersion,
    direction: HeaderDirection,
) -> Result<Envelope, Exception> {
    let root = parse_document(bytes)?;
    let ns = version.envelope_ns();
    if root.name != "Envelope" {
        return Err(root.unexpected(&["Envelope".to_string()]));
    }
    if root.namespace.as_deref() != Some(ns) {
        return Err(Exception::SoapFault(SoapFault::new(
            FaultCode::VersionMismatch,
            &format!(
                "Envelope namespace '{}' does not match {:?}",
                root.namespace.as_deref().unwrap_or(""),
                version
            ),
        )));
    }

    let mut headers = Vec::new();
    let mut body = None;
    let mut seen_body = false;
    for child in &root.children {
        if child.is(Some(ns), "Header") {
            for h in &child.children {
                let value = if h.children.is_empty() {
                    h.text.clone()
                } else {
                    h.inner_xml()
                };
                headers.push(SoapHeader {
                    namespace: h.namespace.clone().unwrap_or_default(),
                    name: h.name.clone(),
                    value,
                    must_understand: h.attribute(Some(ns), "mustUnderstand").map(is_true).unwrap_or(false),
                    understood: false,
                    direction,
                });
            }
        } else if child.is(Some(ns), "Body") {
            seen_body = true;
            body = child.first_child().cloned();
        } else if child.namespace.as_deref() != Some(ns) {
            return Err(child.unexpected(&["Header".to_string(), "Body".to_string()]));
        }
    }
    if !seen_body {
        return Err(Exception::MalformedXml("envelope has no Body".to_string()));
    }
    Ok(Envelope { headers, body })
}

/// 组装信封
pub fn write_envelope<'h>(
    version: SoapProtocolVersion,
    headers: impl Iterator<Item = &'h SoapHeader>,
    body: &str,
) -> String {
    let mut out = format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?><soap:Envelope xmlns:soap=\"{}\" xmlns:xsi=\"{}\" xmlns:xsd=\"{}\">",
        version.envelope_ns(),
        XSI_NS,
        XSD_NS
    );
    let mut header_xml = String::new();
    for h in headers {
        header_xml.push_str(&format!("<{} xmlns=\"{}\"", h.name, escape(&h.namespace)));
        if h.must_understand {
            header_xml.push_str(" soap:mustUnderstand=\"1\"");
        }
        header_xml.push_str(&format!(">{}</{}>", escape(&h.value), h.name));
    }
    if !header_xml.is_empty() {
        out.push_str("<soap:Header>");
        out.push_str(&header_xml);
        out.push_str("</soap:Header>");
    }
    out.push_str("<soap:Body>");
    out.push_str(body);
    out.push_str("</soap:Body></soap:Envelope>");
    out
}

/// 故障元素
pub fn write_fault(out: &mut String, version: SoapProtocolVersion, fault: &SoapFault) {
    let code = fault.code.local_name(version);
    let code = match fault.code {
        FaultCode::Other(_) => code.to_string(),
        _ => format!("soap:{}", code),
    };
    match version {
        SoapProtocolVersion::Soap11 => {
            out.push_str(&format!(
                "<soap:Fault><faultcode>{}</faultcode><faultstring>{}</faultstring>",
                escape(&code),
                escape(&fault.reason)
            ));
            if let Some(detail) = &fault.detail {
                out.push_str(&format!("<detail>{}</detail>", escape(detail)));
            }
        }
        SoapProtocolVersion::Soap12 => {
            out.push_str(&format!(
                "<soap:Fault><soap:Code><soap:Value>{}</soap:Value></soap:Code><soap:Reason><soap:Text xml:lang=\"en\">{}</soap:Text></soap:Reason>",
                escape(&code),
                escape(&fault.reason)
            ));
            if let Some(detail) = &fault.detail {
                out.push_str(&format!("<soap:Detail>{}</soap:Detail>", escape(detail)));
            }
        }
    }
    out.push_str("</soap:Fault>");
}

fn child_text(element: &XmlElement, namespace: Option<&str>, name: &str) -> Option<String> {
    element
        .children
        .iter()
        .find(|c| c.is(namespace, name))
        .map(|c| if c.children.is_empty() { c.text.clone() } else { c.inner_xml() })
}

/// 若元素是故障则解析之
pub fn read_fault(element: &XmlElement, version: SoapProtocolVersion) -> Option<SoapFault> {
    let ns = version.envelope_ns();
    if !element.is(Some(ns), "Fault") {
        return None;
    }
    let fault = match version {
        SoapProtocolVersion::Soap11 => SoapFault {
            code: FaultCode::parse(&child_text(element, None, "faultcode").unwrap_or_default()),
            reason: child_text(element, None, "faultstring").unwrap_or_default(),
            detail: child_text(element, None, "detail"),
        },
        SoapProtocolVersion::Soap12 => {
            let code = element
                .children
                .iter()
                .find(|c| c.is(Some(ns), "Code"))
                .and_then(|c| child_text(c, Some(ns), "Value"))
                .unwrap_or_default();
            let reason = element
                .children
                .iter()
                .find(|c| c.is(Some(ns), "Reason"))
                .and_then(|r| child_text(r, Some(ns), "Text"))
                .unwrap_or_default();
            SoapFault {
                code: FaultCode::parse(&code),
                reason,
                detail: child_text(element, Some(ns), "Detail"),
            }
        }
    };
    Some(fault)
}

/// 检查某个方向上是否有未被理解的 mustUnderstand 头
pub fn check_must_understand(headers: &[SoapHeader], direction: HeaderDirection) -> Result<(), Exception> {
    match headers
        .iter()
        .find(|h| h.direction == direction && h.must_understand && !h.understood)
    {
        Some(h) => Err(Exception::MustUnderstand {
            header: h.qualified_name(),
        }),
        None => Ok(()),
    }
}

/// 读取 `{方法}Response` 元素中的返回值
pub fn read_result(
    element: &XmlElement,
    method: &MethodDescriptor,
    namespace: &str,
    serializer: Option<&XmlSerializer>,
) -> Result<Option<Value>, Exception> {
    let wrapper = method.response_element();
    if !element.is(Some(namespace), &wrapper) {
        return Err(element.unexpected(&[wrapper]));
    }
    let serializer = match serializer {
        Some(s) => s,
        None => return Ok(None),
    };
    let result = element
        .children
        .iter()
        .find(|c| c.name == serializer.element() && c.namespace.as_deref() == serializer.namespace())
        .ok_or_else(|| Exception::MissingParameter {
            name: serializer.element().to_string(),
            expected: vec![serializer.element().to_string()],
        })?;
    serializer.read_element(result).map(Some)
}

fn requested_action(request: &dyn Request, version: SoapProtocolVersion) -> String {
    let action = match version {
        SoapProtocolVersion::Soap11 => request.header(SOAP_ACTION_HEADER).map(|s| s.to_string()),
        SoapProtocolVersion::Soap12 => request
            .content_type()
            .and_then(|ct| content_type_param(ct, "action")),
    };
    action
        .map(|a| a.trim().trim_matches('"').to_string())
        .unwrap_or_default()
}

/// 按正文第一个元素的名称查找方法
fn method_from_body<'s>(
    service: &'s ServiceDescriptor,
    version: SoapProtocolVersion,
    raw: &[u8],
) -> Option<&'s MethodDescriptor> {
    let envelope = read_envelope(raw, version, HeaderDirection::Request).ok()?;
    let element = envelope.body?;
    if element.namespace.as_deref() != Some(service.namespace.as_str()) {
        return None;
    }
    service.by_name(&element.name)
}

pub struct SoapServerProtocolFactory;

impl ServerProtocolFactory for SoapServerProtocolFactory {
    fn name(&self) -> &'static str {
        "HttpSoap"
    }

    fn create(&self, request: &dyn Request) -> Selection {
        if request.path_segments().len() >= 2 {
            return Selection::NotApplicable;
        }
        match request.method() {
            HttpRequestMethod::Post => Selection::Protocol(Box::new(SoapServerProtocol)),
            m if m.is_binding_method() => Selection::MethodNotAllowed(vec![HttpRequestMethod::Post]),
            _ => Selection::NotApplicable,
        }
    }
}

pub struct SoapServerProtocol;

/// 直接写入传输流、不经扩展的故障响应
fn plain_fault(version: SoapProtocolVersion, fault: &SoapFault, body: &ResponseBody) -> HttpResponse {
    body.reset();
    let mut xml = String::new();
    write_fault(&mut xml, version, fault);
    let envelope = write_envelope(version, std::iter::empty(), &xml);

    let mut response = HttpResponse::new();
    response
        .set_code(500)
        .set_content_type(&content_type(version))
        .set_content_encoding(None);
    let mut out = body.writer();
    let written = out.write_all(envelope.as_bytes()).and_then(|_| out.close());
    if let Err(e) = written {
        error!("写出故障信封失败：{}", e);
    }
    response.set_body(body.clone());
    response
}

impl SoapServerProtocol {
    fn deserialize(
        &self,
        context: &ProtocolContext<'_>,
        chain: &mut ExtensionChain,
        message: &mut SoapMessage<'_>,
        mut input: InputStream,
    ) -> Result<(), Exception> {
        chain.process(Stage::BeforeDeserialize, message)?;
        message.ensure_decoded()?;
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;
        drop(input);

        let envelope = read_envelope(&bytes, message.version(), HeaderDirection::Request)?;
        message.headers_mut().extend(envelope.headers);
        let service = context.metadata.descriptor();
        let method = message.method();
        let reader = context
            .metadata
            .formatters()
            .instance::<XmlParameterReader>(service, method)
            .ok_or_else(|| Exception::UnknownMethod(method.name.clone()))?;
        let element = envelope
            .body
            .ok_or_else(|| Exception::MalformedXml("SOAP body is empty".to_string()))?;
        let args = reader.read_children(&element)?;
        message.set_parameters(args);

        chain.process(Stage::AfterDeserialize, message)?;
        check_must_understand(message.headers(), HeaderDirection::Request)
    }

    fn invoke(&self, message: &mut SoapMessage<'_>) {
        let result = message.target().and_then(|target| {
            let args = message.parameters()?.to_vec();
            target.invoke(message.method(), args)
        });
        match result {
            Ok(value) => message.set_return_value(value),
            Err(e) => {
                warn!("方法 {} 执行失败：{}", message.method().name, e);
                message.set_fault(SoapFault::from(&e));
            }
        }
    }

    fn response_body(
        &self,
        context: &ProtocolContext<'_>,
        message: &SoapMessage<'_>,
    ) -> Result<String, Exception> {
        let version = message.version();
        let mut body = String::new();
        match message.exception() {
            Some(fault) => write_fault(&mut body, version, fault),
            None => {
                let service = context.metadata.descriptor();
                let method = message.method();
                let ns = service.namespace.as_str();
                let wrapper = method.response_element();
                body.push_str(&format!("<{} xmlns=\"{}\">", wrapper, escape(ns)));
                let formatter = context
                    .metadata
                    .formatters()
                    .instance::<SoapResultFormatter>(service, method);
                if let (Some(value), Some(formatter)) = (message.return_value()?, formatter) {
                    formatter.serializer().write_element(&mut body, value, Some(ns))?;
                }
                body.push_str(&format!("</{}>", wrapper));
            }
        }
        Ok(write_envelope(version, message.outgoing_headers(), &body))
    }

    fn write_through(
        &self,
        context: &ProtocolContext<'_>,
        chain: &mut ExtensionChain,
        message: &mut SoapMessage<'_>,
        out: &mut BufferedOutputStream,
    ) -> Result<(), Exception> {
        chain.process(Stage::BeforeSerialize, message)?;
        let envelope = self.response_body(context, message)?;
        out.write_all(envelope.as_bytes())?;
        // 禁用期间不会提交任何字节
        out.flush()?;
        chain.process(Stage::AfterSerialize, message)
    }

    fn serialize(
        &self,
        context: &ProtocolContext<'_>,
        chain: &mut ExtensionChain,
        message: &mut SoapMessage<'_>,
    ) -> HttpResponse {
        let body = ResponseBody::new();
        let mut out = Box::new(BufferedOutputStream::new(
            chain.chain_output(body.writer()),
            context.buffer_size,
        ));
        out.set_flush_enabled(false);
        let written = self.write_through(context, chain, message, &mut out);
        let closed = out.close().map_err(Exception::from);

        let version = message.version();
        match written.and(closed) {
            Ok(()) => {
                let mut response = HttpResponse::new();
                let status = if message.exception().is_some() { 500 } else { 200 };
                response
                    .set_code(status)
                    .set_content_type(&content_type(version))
                    .set_content_encoding(message.outgoing_encoding());
                response.set_body(body);
                response
            }
            Err(e) => {
                error!("写出 {} 的响应失败，改写为故障：{}", message.method().name, e);
                plain_fault(version, &SoapFault::from(&e), &body)
            }
        }
    }
}

impl ServerProtocol for SoapServerProtocol {
    fn name(&self) -> &'static str {
        "HttpSoap"
    }

    fn handle(&self, context: &ProtocolContext<'_>, request: &mut dyn Request) -> HttpResponse {
        let id = request.id();
        let version = match request
            .content_type()
            .and_then(|ct| SoapProtocolVersion::from_media_type(&split_content_type(ct).0))
        {
            Some(version) => version,
            None => {
                warn!("[ID{}]不支持的 SOAP 内容类型：{:?}", id, request.content_type());
                return HttpResponse::from_status_code(415, None, None);
            }
        };

        let mut raw = Vec::new();
        if let Err(e) = request.take_body().read_to_end(&mut raw) {
            return plain_fault(version, &SoapFault::from(&Exception::from(e)), &ResponseBody::new());
        }

        let service = context.metadata.descriptor();
        let action = requested_action(&*request, version);
        let method = match service
            .by_action(&action)
            .or_else(|| method_from_body(service, version, &raw))
        {
            Some(method) => method,
            None => {
                warn!("[ID{}]无法确定 SOAP 方法，动作：{:?}", id, action);
                let e = Exception::UnknownMethod(action);
                return plain_fault(version, &SoapFault::from(&e), &ResponseBody::new());
            }
        };
        debug!("[ID{}]SOAP 方法 {}，版本 {:?}", id, method.name, version);

        let mut chain = match ExtensionChain::new(context.metadata.extensions(method.id)) {
            Ok(chain) => chain,
            Err(e) => return plain_fault(version, &SoapFault::from(&e), &ResponseBody::new()),
        };
        let mut message = SoapMessage::server(method, context.service, request.path(), &action, version);
        message.set_incoming_encoding(request.header("Content-Encoding").and_then(HttpEncoding::parse));

        let input = chain.chain_input(input_from_bytes(Bytes::from(raw)));
        if let Err(e) = self.deserialize(context, &mut chain, &mut message, input) {
            warn!("[ID{}]请求反序列化失败：{}", id, e);
            message.set_fault(SoapFault::from(&e));
        }

        if message.exception().is_none() && method.one_way {
            let args = message.take_parameters();
            match message.target() {
                Ok(target) => {
                    if let Err(e) = target.invoke(method, args) {
                        error!("[ID{}]单向方法 {} 执行失败：{}", id, method.name, e);
                    }
                }
                Err(e) => error!("[ID{}]{}", id, e),
            }
            info!("[ID{}]单向方法 {} 已接受", id, method.name);
            return HttpResponse::from_status_code(202, None, None);
        }

        if message.exception().is_none() {
            self.invoke(&mut message);
        }
        self.serialize(context, &mut chain, &mut message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::SOAP11_ENVELOPE_NS;

    #[test]
    fn test_envelope_headers_and_body() {
        let doc = format!(
            r#"<s:Envelope xmlns:s="{}"><s:Header><Token xmlns="urn:auth" s:mustUnderstand="1">abc</Token></s:Header><s:Body><Add xmlns="urn:calc"/></s:Body></s:Envelope>"#,
            SOAP11_ENVELOPE_NS
        );
        let envelope = read_envelope(doc.as_bytes(), SoapProtocolVersion::Soap11, HeaderDirection::Request).unwrap();
        assert_eq!(envelope.headers.len(), 1);
        assert!(envelope.headers[0].must_understand);
        assert_eq!(envelope.headers[0].value, "abc");
        assert!(envelope.body.unwrap().is(Some("urn:calc"), "Add"));
        assert!(check_must_understand(&envelope.headers, HeaderDirection::Request).is_err());
    }

    #[test]
    fn test_version_mismatch() {
        let doc = format!(r#"<s:Envelope xmlns:s="{}"><s:Body/></s:Envelope>"#, SOAP11_ENVELOPE_NS);
        match read_envelope(doc.as_bytes(), SoapProtocolVersion::Soap12, HeaderDirection::Request) {
            Err(Exception::SoapFault(fault)) => assert_eq!(fault.code, FaultCode::VersionMismatch),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_body() {
        let doc = format!(r#"<s:Envelope xmlns:s="{}"/>"#, SOAP11_ENVELOPE_NS);
        assert!(matches!(
            read_envelope(doc.as_bytes(), SoapProtocolVersion::Soap11, HeaderDirection::Request),
            Err(Exception::MalformedXml(_))
        ));
    }

    #[test]
    fn test_fault_roundtrip_both_versions() {
        for version in [SoapProtocolVersion::Soap11, SoapProtocolVersion::Soap12] {
            let mut fault = SoapFault::new(FaultCode::Client, "bad <input>");
            fault.detail = Some("line 1".to_string());
            let mut xml = String::new();
            write_fault(&mut xml, version, &fault);
            let envelope = write_envelope(version, std::iter::empty(), &xml);
            let parsed = read_envelope(envelope.as_bytes(), version, HeaderDirection::Response).unwrap();
            let read = read_fault(&parsed.body.unwrap(), version).unwrap();
            assert_eq!(read, fault);
        }
    }

    #[test]
    fn test_soap12_fault_uses_sender() {
        let mut xml = String::new();
        write_fault(&mut xml, SoapProtocolVersion::Soap12, &SoapFault::new(FaultCode::Client, "x"));
        assert!(xml.contains("<soap:Value>soap:Sender</soap:Value>"));
        assert!(xml.contains("<soap:Reason><soap:Text xml:lang=\"en\">x</soap:Text></soap:Reason>"));
    }

    #[test]
    fn test_outgoing_headers_are_written() {
        let header = SoapHeader::new("urn:h", "Session", "42", HeaderDirection::Response).must_understand();
        let envelope = write_envelope(SoapProtocolVersion::Soap11, [header].iter(), "<x/>");
        assert!(envelope.contains(
            r#"<soap:Header><Session xmlns="urn:h" soap:mustUnderstand="1">42</Session></soap:Header>"#
        ));
    }
}
