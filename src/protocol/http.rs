//! HTTP-GET / HTTP-POST 绑定：`/{服务}/{方法}` 形式的地址，参数来自查询串、
//! 表单或 XML 正文，返回值以类型名为根元素的 XML 写回。

use std::io::Write;

use log::{debug, error, warn};

use crate::descriptor::MethodDescriptor;
use crate::exception::Exception;
use crate::formatter::parameter::{
    HtmlFormParameterReader, ParameterReader, UrlParameterReader, XmlParameterReader,
};
use crate::formatter::returns::XmlReturnWriter;
use crate::param::{HttpRequestMethod, TEXT_PLAIN};
use crate::protocol::{ProtocolContext, Selection, ServerProtocol, ServerProtocolFactory};
use crate::request::Request;
use crate::response::HttpResponse;
use crate::stream::{BufferedOutputStream, OutputLayer};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Get,
    Post,
    PostLocalhost,
}

impl Binding {
    fn verb(&self) -> HttpRequestMethod {
        match self {
            Binding::Get => HttpRequestMethod::Get,
            Binding::Post | Binding::PostLocalhost => HttpRequestMethod::Post,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Binding::Get => "HttpGet",
            Binding::Post => "HttpPost",
            Binding::PostLocalhost => "HttpPostLocalhost",
        }
    }
}

pub struct HttpServerProtocolFactory {
    binding: Binding,
}

impl HttpServerProtocolFactory {
    pub fn get() -> Self {
        Self { binding: Binding::Get }
    }

    pub fn post() -> Self {
        Self { binding: Binding::Post }
    }

    /// 只接受本机客户端的 POST 绑定
    pub fn post_localhost() -> Self {
        Self {
            binding: Binding::PostLocalhost,
        }
    }
}

impl ServerProtocolFactory for HttpServerProtocolFactory {
    fn name(&self) -> &'static str {
        self.binding.name()
    }

    fn create(&self, request: &dyn Request) -> Selection {
        if request.path_segments().len() < 2 {
            return Selection::NotApplicable;
        }
        let method = request.method();
        let verb = self.binding.verb();
        if method != verb {
            return if method.is_binding_method() {
                Selection::MethodNotAllowed(vec![verb])
            } else {
                Selection::NotApplicable
            };
        }
        if self.binding == Binding::PostLocalhost && !request.is_local() {
            warn!("[ID{}]拒绝来自远程客户端的 HTTP-POST 调用", request.id());
            return Selection::Reject {
                status: 405,
                allow: Vec::new(),
            };
        }
        Selection::Protocol(Box::new(HttpServerProtocol {
            binding: self.binding,
        }))
    }
}

pub struct HttpServerProtocol {
    binding: Binding,
}

/// 以纯文本写出错误
fn error_response(e: &Exception) -> HttpResponse {
    let mut response = HttpResponse::new();
    response
        .set_code(e.status_code())
        .set_content_type(&format!("{}; charset=utf-8", TEXT_PLAIN));
    let mut out = response.body().writer();
    let written = out.write_all(e.to_string().as_bytes()).and_then(|_| out.close());
    if let Err(io) = written {
        error!("写出错误响应失败：{}", io);
    }
    response
}

impl HttpServerProtocol {
    fn read_parameters(
        &self,
        context: &ProtocolContext<'_>,
        method: &MethodDescriptor,
        request: &mut dyn Request,
    ) -> Result<Vec<Value>, Exception> {
        let service = context.metadata.descriptor();
        let formatters = context.metadata.formatters();
        let mut readers: Vec<Box<dyn ParameterReader>> = Vec::new();
        match self.binding {
            Binding::Get => {
                if let Some(r) = formatters.instance::<UrlParameterReader>(service, method) {
                    readers.push(Box::new(r));
                }
            }
            Binding::Post | Binding::PostLocalhost => {
                if let Some(r) = formatters.instance::<HtmlFormParameterReader>(service, method) {
                    readers.push(Box::new(r));
                }
                if let Some(r) = formatters.instance::<XmlParameterReader>(service, method) {
                    readers.push(Box::new(r));
                }
            }
        }
        if readers.is_empty() {
            return Err(Exception::UnknownMethod(format!(
                "{} (not available over {})",
                method.name,
                self.binding.name()
            )));
        }
        for reader in &readers {
            if let Some(args) = reader.read(request)? {
                return Ok(args);
            }
        }
        debug!(
            "[ID{}]没有参数读取器接受内容类型 {:?}",
            request.id(),
            request.content_type()
        );
        Err(Exception::HttpStatus(415))
    }

    fn dispatch(
        &self,
        context: &ProtocolContext<'_>,
        request: &mut dyn Request,
    ) -> Result<HttpResponse, Exception> {
        let segments = request.path_segments();
        let name = segments.last().copied().unwrap_or("").to_string();
        let service = context.metadata.descriptor();
        let method = service
            .by_name(&name)
            .ok_or_else(|| Exception::UnknownMethod(name.clone()))?;

        let args = self.read_parameters(context, method, request)?;

        if method.one_way {
            if let Err(e) = context.service.invoke(method, args) {
                error!("[ID{}]单向方法 {} 执行失败：{}", request.id(), method.name, e);
            }
            return Ok(HttpResponse::from_status_code(202, None, None));
        }

        let result = context.service.invoke(method, args)?;
        let mut response = HttpResponse::new();
        let writer = context
            .metadata
            .formatters()
            .instance::<XmlReturnWriter>(service, method);
        match (writer, result) {
            (Some(writer), Some(value)) => {
                let mut out = Box::new(BufferedOutputStream::new(
                    response.body().writer(),
                    context.buffer_size,
                ));
                let written = writer.write(&value, &mut response, &mut out);
                let closed = out.close();
                written?;
                closed?;
            }
            (_, _) => {
                Box::new(response.body().clone()).close()?;
            }
        }
        Ok(response)
    }
}

impl ServerProtocol for HttpServerProtocol {
    fn name(&self) -> &'static str {
        self.binding.name()
    }

    fn handle(&self, context: &ProtocolContext<'_>, request: &mut dyn Request) -> HttpResponse {
        match self.dispatch(context, request) {
            Ok(response) => response,
            Err(Exception::HttpStatus(code)) => HttpResponse::from_status_code(code, None, None),
            Err(e) => {
                warn!("[ID{}]{} 调用失败：{}", request.id(), self.binding.name(), e);
                error_response(&e)
            }
        }
    }
}
