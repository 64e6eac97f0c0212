//! # 客户端协议
//!
//! - `SoapClientProtocol`：按 `BeforeSerialize → AfterSerialize → BeforeDeserialize →
//!   AfterDeserialize` 的顺序驱动扩展链，服务端故障转换为 `Exception::SoapFault`。
//! - `HttpSimpleClientProtocol`：HTTP-GET/POST 调用，实参由参数写入器编码，
//!   返回值读取器按 Nop、Xml、Text、Any 的顺序协商，初始化器在第一次调用时构建。
//!
//! 传输层抽象为 `ClientTransport`。`LoopbackTransport` 在进程内直接调用
//! `ServiceHost`，`TcpTransport` 通过阻塞的 TCP 连接发送 HTTP/1.1 报文。

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use url::Url;

use crate::descriptor::{ExtensionConfig, MethodDescriptor, MethodId, ServiceDescriptor};
use crate::exception::Exception;
use crate::extension::{ExtensionChain, ExtensionEntry, ExtensionRegistry};
use crate::formatter::parameter::{
    HtmlFormParameterWriter, ParameterWriter, UrlParameterWriter, XmlParameterReader,
};
use crate::formatter::returns::{
    AnyReturnReader, NopReturnReader, ReturnReader, TextReturnReader, XmlReturnReader,
};
use crate::formatter::FormatterCache;
use crate::host::ServiceHost;
use crate::message::{HeaderDirection, SoapHeader, SoapMessage, Stage};
use crate::param::{HttpEncoding, HttpRequestMethod, SoapProtocolVersion, CRLF, SOAP_ACTION_HEADER};
use crate::protocol::soap::{
    check_must_understand, content_type, read_envelope, read_fault, read_result, write_envelope,
    SoapResultFormatter,
};
use crate::request::HttpRequest;
use crate::response::{HttpClientResponse, Response};
use crate::stream::{BufferedOutputStream, OutputLayer, ResponseBody};
use crate::util::split_content_type;
use crate::value::{ReturnValue, Value};

const REQUEST_BUFFER: usize = 4096;

/// 客户端发出的请求
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: HttpRequestMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ClientRequest {
    pub fn new(method: HttpRequestMethod, url: &str) -> Self {
        Self {
            method,
            url: url.to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// URL 中的路径与查询串部分
    pub fn target(&self) -> String {
        match Url::parse(&self.url) {
            Ok(url) => match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            },
            Err(_) => self.url.clone(),
        }
    }
}

pub trait ClientTransport: Send + Sync {
    fn send(&self, request: ClientRequest) -> Result<Box<dyn Response>, Exception>;
}

/// 进程内传输，请求视为来自本机
pub struct LoopbackTransport {
    host: Arc<ServiceHost>,
    next_id: AtomicU64,
}

impl LoopbackTransport {
    pub fn new(host: Arc<ServiceHost>) -> Self {
        Self {
            host,
            next_id: AtomicU64::new(1),
        }
    }
}

impl ClientTransport for LoopbackTransport {
    fn send(&self, request: ClientRequest) -> Result<Box<dyn Response>, Exception> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut server_request = HttpRequest::new(request.method, &request.target())
            .with_id(id as u128)
            .local(true);
        for (name, value) in &request.headers {
            server_request = server_request.header_line(name, value);
        }
        server_request = server_request.body(request.body);
        let response = self.host.handle(&mut server_request);
        Ok(Box::new(HttpClientResponse::from_server(&response)))
    }
}

/// 阻塞式 TCP 传输，每个请求一个连接
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ClientTransport for TcpTransport {
    fn send(&self, request: ClientRequest) -> Result<Box<dyn Response>, Exception> {
        let url = Url::parse(&request.url)
            .map_err(|e| Exception::Config(format!("invalid URL '{}': {}", request.url, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| Exception::Config(format!("URL '{}' has no host", request.url)))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let mut stream = TcpStream::connect((host, port))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut head = format!(
            "{} {} HTTP/1.1{}Host: {}:{}{}Connection: close{}Content-Length: {}{}",
            request.method,
            request.target(),
            CRLF,
            host,
            port,
            CRLF,
            CRLF,
            request.body.len(),
            CRLF
        );
        for (name, value) in &request.headers {
            head.push_str(&format!("{}: {}{}", name, value, CRLF));
        }
        head.push_str(CRLF);
        stream.write_all(head.as_bytes())?;
        stream.write_all(&request.body)?;
        stream.flush()?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw)?;
        debug!("收到 {} 字节的响应", raw.len());
        Ok(Box::new(HttpClientResponse::try_from(&raw)?))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct SoapClientProtocol {
    descriptor: Arc<ServiceDescriptor>,
    transport: Arc<dyn ClientTransport>,
    url: String,
    version: SoapProtocolVersion,
    registry: ExtensionRegistry,
    extensions: Vec<ExtensionConfig>,
    headers: Vec<SoapHeader>,
    formatters: FormatterCache,
    resolved: Mutex<HashMap<MethodId, Vec<ExtensionEntry>>>,
}

impl SoapClientProtocol {
    pub fn new(descriptor: Arc<ServiceDescriptor>, transport: Arc<dyn ClientTransport>, url: &str) -> Self {
        Self {
            descriptor,
            transport,
            url: url.to_string(),
            version: SoapProtocolVersion::Soap11,
            registry: ExtensionRegistry::new(),
            extensions: Vec::new(),
            headers: Vec::new(),
            formatters: FormatterCache::new(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn version(mut self, version: SoapProtocolVersion) -> Self {
        self.version = version;
        self
    }

    pub fn registry(mut self, registry: ExtensionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// 客户端一侧的服务级扩展
    pub fn extension(mut self, config: ExtensionConfig) -> Self {
        self.extensions.push(config);
        self
    }

    /// 每次请求都携带的 SOAP 头
    pub fn header(mut self, header: SoapHeader) -> Self {
        self.headers.push(SoapHeader {
            direction: HeaderDirection::Request,
            ..header
        });
        self
    }

    fn extensions_for(&self, method: &MethodDescriptor) -> Result<Vec<ExtensionEntry>, Exception> {
        let mut resolved = lock(&self.resolved);
        if let Some(entries) = resolved.get(&method.id) {
            return Ok(entries.clone());
        }
        let entries = self.registry.resolve(&self.descriptor, method, &self.extensions)?;
        resolved.insert(method.id, entries.clone());
        Ok(entries)
    }

    fn write_request(
        &self,
        chain: &mut ExtensionChain,
        message: &mut SoapMessage<'_>,
        out: &mut BufferedOutputStream,
    ) -> Result<(), Exception> {
        chain.process(Stage::BeforeSerialize, message)?;
        let method = message.method();
        let writer = self
            .formatters
            .instance::<XmlParameterReader>(&self.descriptor, method)
            .ok_or_else(|| Exception::UnknownMethod(method.name.clone()))?;
        let mut body = String::new();
        writer.write_element(&mut body, message.parameters()?, None)?;
        let envelope = write_envelope(self.version, message.outgoing_headers(), &body);
        out.write_all(envelope.as_bytes())?;
        chain.process(Stage::AfterSerialize, message)
    }

    fn read_response(
        &self,
        chain: &mut ExtensionChain,
        message: &mut SoapMessage<'_>,
        response: Box<dyn Response>,
    ) -> Result<Option<Value>, Exception> {
        message.set_incoming_encoding(response.header("Content-Encoding").and_then(HttpEncoding::parse));
        let mut input = chain.chain_input(response.into_body());
        chain.process(Stage::BeforeDeserialize, message)?;
        message.ensure_decoded()?;
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;
        drop(input);

        let envelope = read_envelope(&bytes, self.version, HeaderDirection::Response)?;
        message.headers_mut().extend(envelope.headers);
        let element = envelope
            .body
            .ok_or_else(|| Exception::MalformedXml("SOAP body is empty".to_string()))?;

        if let Some(fault) = read_fault(&element, self.version) {
            message.set_fault(fault.clone());
            chain.process(Stage::AfterDeserialize, message)?;
            return Err(Exception::SoapFault(fault));
        }

        let method = message.method();
        let formatter = self
            .formatters
            .instance::<SoapResultFormatter>(&self.descriptor, method);
        let value = read_result(
            &element,
            method,
            &self.descriptor.namespace,
            formatter.as_ref().map(|f| f.serializer()),
        )?;
        message.set_return_value(value);
        chain.process(Stage::AfterDeserialize, message)?;
        check_must_understand(message.headers(), HeaderDirection::Response)?;
        Ok(message.take_return_value())
    }

    /// 调用远程方法；单向方法在请求被接受后立即返回 `None`
    pub fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Option<Value>, Exception> {
        let method = self
            .descriptor
            .by_name(name)
            .ok_or_else(|| Exception::UnknownMethod(name.to_string()))?;
        let entries = self.extensions_for(method)?;
        let mut chain = ExtensionChain::new(&entries)?;
        let mut message = SoapMessage::client(method, &self.url, self.version, args);
        message.headers_mut().extend(self.headers.iter().cloned());

        let body = ResponseBody::new();
        let mut out = Box::new(BufferedOutputStream::new(
            chain.chain_output(body.writer()),
            REQUEST_BUFFER,
        ));
        let written = self.write_request(&mut chain, &mut message, &mut out);
        let closed = out.close().map_err(Exception::from);
        written.and(closed)?;

        let mut request = ClientRequest::new(HttpRequestMethod::Post, &self.url);
        match self.version {
            SoapProtocolVersion::Soap11 => {
                request.set_header("Content-Type", &content_type(self.version));
                request.set_header(SOAP_ACTION_HEADER, &format!("\"{}\"", message.action()));
            }
            SoapProtocolVersion::Soap12 => request.set_header(
                "Content-Type",
                &format!("{}; action=\"{}\"", content_type(self.version), message.action()),
            ),
        }
        if let Some(encoding) = message.outgoing_encoding() {
            request.set_header("Content-Encoding", &encoding.to_string());
        }
        request.body = body.bytes();

        let response = self.transport.send(request)?;
        let status = response.status();
        if method.one_way {
            drop(response);
            return if (200..300).contains(&status) {
                Ok(None)
            } else {
                Err(Exception::HttpStatus(status))
            };
        }

        let is_soap = response
            .content_type()
            .map(|ct| SoapProtocolVersion::from_media_type(&split_content_type(ct).0).is_some())
            .unwrap_or(false);
        if !(status == 200 || status == 500) || !is_soap {
            warn!(
                "调用 {} 收到非 SOAP 响应：{} {:?}",
                method.name,
                status,
                response.content_type()
            );
            return Err(Exception::HttpStatus(status));
        }
        self.read_response(&mut chain, &mut message, response)
    }
}

/// HTTP-GET/POST 客户端
pub struct HttpSimpleClientProtocol {
    descriptor: Arc<ServiceDescriptor>,
    transport: Arc<dyn ClientTransport>,
    url: String,
    verb: HttpRequestMethod,
    formatters: FormatterCache,
}

impl HttpSimpleClientProtocol {
    fn with_verb(
        descriptor: Arc<ServiceDescriptor>,
        transport: Arc<dyn ClientTransport>,
        url: &str,
        verb: HttpRequestMethod,
    ) -> Self {
        Self {
            descriptor,
            transport,
            url: url.trim_end_matches('/').to_string(),
            verb,
            formatters: FormatterCache::new(),
        }
    }

    pub fn get(descriptor: Arc<ServiceDescriptor>, transport: Arc<dyn ClientTransport>, url: &str) -> Self {
        Self::with_verb(descriptor, transport, url, HttpRequestMethod::Get)
    }

    pub fn post(descriptor: Arc<ServiceDescriptor>, transport: Arc<dyn ClientTransport>, url: &str) -> Self {
        Self::with_verb(descriptor, transport, url, HttpRequestMethod::Post)
    }

    pub fn formatters(&self) -> &FormatterCache {
        &self.formatters
    }

    fn parameter_writer(&self, method: &MethodDescriptor) -> Option<Box<dyn ParameterWriter>> {
        let service = &*self.descriptor;
        match self.verb {
            HttpRequestMethod::Get => self
                .formatters
                .instance::<UrlParameterWriter>(service, method)
                .map(|w| Box::new(w) as Box<dyn ParameterWriter>),
            _ => self
                .formatters
                .instance::<HtmlFormParameterWriter>(service, method)
                .map(|w| Box::new(w) as Box<dyn ParameterWriter>),
        }
    }

    fn return_reader(&self, method: &MethodDescriptor) -> Option<Box<dyn ReturnReader>> {
        let service = &*self.descriptor;
        let f = &self.formatters;
        if let Some(r) = f.instance::<NopReturnReader>(service, method) {
            return Some(Box::new(r));
        }
        if let Some(r) = f.instance::<XmlReturnReader>(service, method) {
            return Some(Box::new(r));
        }
        if let Some(r) = f.instance::<TextReturnReader>(service, method) {
            return Some(Box::new(r));
        }
        f.instance::<AnyReturnReader>(service, method)
            .map(|r| Box::new(r) as Box<dyn ReturnReader>)
    }

    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<ReturnValue, Exception> {
        let method = self
            .descriptor
            .by_name(name)
            .ok_or_else(|| Exception::UnknownMethod(name.to_string()))?;
        let writer = self.parameter_writer(method).ok_or(Exception::UnsupportedOperation(
            "method parameters cannot be encoded as name/value pairs",
        ))?;

        let target = format!("{}/{}", self.url, method.name);
        let mut request = ClientRequest::new(self.verb, &writer.request_url(&target, args)?);
        if writer.uses_write_request() {
            if let Some(content_type) = writer.content_type() {
                request.set_header("Content-Type", &content_type);
            }
            let mut body = Vec::new();
            writer.write_request(&mut body, args)?;
            request.body = Bytes::from(body);
        }

        let response = self.transport.send(request)?;
        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(Exception::HttpStatus(status));
        }
        let reader = self
            .return_reader(method)
            .ok_or(Exception::UnsupportedOperation("no return reader applies to this method"))?;
        reader.read(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_strips_authority() {
        let request = ClientRequest::new(HttpRequestMethod::Get, "http://localhost:7878/Calc/Add?a=1");
        assert_eq!(request.target(), "/Calc/Add?a=1");
        let request = ClientRequest::new(HttpRequestMethod::Post, "/Calc");
        assert_eq!(request.target(), "/Calc");
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut request = ClientRequest::new(HttpRequestMethod::Post, "/Calc");
        request.set_header("Content-Type", "text/xml");
        assert_eq!(request.header("content-type"), Some("text/xml"));
    }

    #[test]
    fn test_tcp_transport_round_trip() {
        use crate::config::Config;
        use crate::descriptor::{MethodBuilder, ParameterInfo};
        use crate::host::WebService;
        use crate::request::{content_length, head_length};
        use crate::value::{ReturnType, TypeTag};
        use std::net::TcpListener;

        struct Upper;

        impl WebService for Upper {
            fn invoke(&self, _: &MethodDescriptor, args: Vec<Value>) -> Result<Option<Value>, Exception> {
                Ok(args.first().and_then(Value::as_str).map(|s| Value::Str(s.to_uppercase())))
            }
        }

        let descriptor = ServiceDescriptor::new("Text").namespace("urn:text").method(
            MethodBuilder::new("Upper")
                .param(ParameterInfo::new("s", TypeTag::String))
                .returns(ReturnType::scalar(TypeTag::String)),
        );
        let host = ServiceHost::new(descriptor.clone(), Arc::new(Upper), &Config::new()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut stream, addr) = listener.accept().unwrap();
            let mut raw = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&chunk[..n]);
                if let Some(head) = head_length(&raw) {
                    if raw.len() >= head + content_length(&raw[..head]).unwrap_or(0) {
                        break;
                    }
                }
            }
            let mut request = HttpRequest::try_from(&raw, 1, addr.ip().is_loopback()).unwrap();
            let response = host.handle(&mut request);
            stream.write_all(&response.as_bytes()).unwrap();
        });

        let url = format!("http://127.0.0.1:{}/Text", port);
        let client = HttpSimpleClientProtocol::post(
            Arc::new(descriptor),
            Arc::new(TcpTransport::default()),
            &url,
        );
        let value = client
            .invoke("Upper", &[Value::Str("soap".to_string())])
            .unwrap()
            .into_value();
        assert_eq!(value, Some(Value::Str("SOAP".to_string())));
        server.join().unwrap();
    }
}
