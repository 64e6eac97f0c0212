//! # 服务宿主
//!
//! 启动时构建一次 `ServiceMetadata`：为每个方法预热全部服务端编解码器的初始化器，
//! 并解析、排序好扩展条目。之后每个请求只做协议选择与分发。

use std::sync::Arc;

use log::{error, info, warn};

use crate::config::Config;
use crate::descriptor::{ExtensionConfig, MethodDescriptor, MethodId, ServiceDescriptor};
use crate::exception::Exception;
use crate::extension::{ExtensionEntry, ExtensionRegistry};
use crate::formatter::parameter::{HtmlFormParameterReader, UrlParameterReader, XmlParameterReader};
use crate::formatter::returns::XmlReturnWriter;
use crate::formatter::FormatterCache;
use crate::protocol::{self, ProtocolContext, ServerProtocolFactory};
use crate::request::Request;
use crate::response::HttpResponse;
use crate::value::Value;

/// 服务实现：按方法描述分发调用
pub trait WebService: Send + Sync {
    /// 执行方法；无返回值的方法返回 `Ok(None)`
    fn invoke(&self, method: &MethodDescriptor, args: Vec<Value>) -> Result<Option<Value>, Exception>;
}

/// 启动时构建、之后只读共享的服务元数据
pub struct ServiceMetadata {
    descriptor: ServiceDescriptor,
    formatters: FormatterCache,
    extensions: Vec<Vec<ExtensionEntry>>,
}

impl ServiceMetadata {
    pub fn build(
        descriptor: ServiceDescriptor,
        registry: &ExtensionRegistry,
        extra: &[ExtensionConfig],
    ) -> Result<Self, Exception> {
        let formatters = FormatterCache::new();
        formatters.prime::<UrlParameterReader>(&descriptor);
        formatters.prime::<HtmlFormParameterReader>(&descriptor);
        formatters.prime::<XmlParameterReader>(&descriptor);
        formatters.prime::<XmlReturnWriter>(&descriptor);

        let extensions = descriptor
            .methods()
            .iter()
            .map(|method| registry.resolve(&descriptor, method, extra))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            "服务 {} 元数据就绪：{} 个方法，{} 个编解码器初始化器",
            descriptor.name,
            descriptor.methods().len(),
            formatters.len()
        );
        Ok(Self {
            descriptor,
            formatters,
            extensions,
        })
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn formatters(&self) -> &FormatterCache {
        &self.formatters
    }

    /// 方法的有序扩展条目
    pub fn extensions(&self, id: MethodId) -> &[ExtensionEntry] {
        self.extensions.get(id.0).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

pub struct ServiceHost {
    metadata: Arc<ServiceMetadata>,
    service: Arc<dyn WebService>,
    factories: Vec<Box<dyn ServerProtocolFactory>>,
    buffer_size: usize,
}

impl ServiceHost {
    pub fn new(
        descriptor: ServiceDescriptor,
        service: Arc<dyn WebService>,
        config: &Config,
    ) -> Result<Self, Exception> {
        Self::with_registry(descriptor, service, config, &ExtensionRegistry::new())
    }

    pub fn with_registry(
        descriptor: ServiceDescriptor,
        service: Arc<dyn WebService>,
        config: &Config,
        registry: &ExtensionRegistry,
    ) -> Result<Self, Exception> {
        let metadata = ServiceMetadata::build(descriptor, registry, config.extensions())?;
        if config.protocols().is_empty() {
            warn!("没有启用任何协议绑定，所有请求都将返回 404");
        }
        Ok(Self {
            metadata: Arc::new(metadata),
            service,
            factories: protocol::factories(config.protocols()),
            buffer_size: config.buffer_size(),
        })
    }

    pub fn metadata(&self) -> &ServiceMetadata {
        &self.metadata
    }

    /// 处理一个请求，总是得到一个响应
    pub fn handle(&self, request: &mut dyn Request) -> HttpResponse {
        let id = request.id();
        let service_name = &self.metadata.descriptor().name;
        let matches_service = request
            .path_segments()
            .first()
            .map(|s| s == service_name)
            .unwrap_or(false);
        if !matches_service {
            warn!("[ID{}]路径 {} 不属于服务 {}", id, request.path(), service_name);
            return HttpResponse::from_status_code(404, None, None);
        }

        let protocol = match protocol::select(&self.factories, &*request) {
            Ok(protocol) => protocol,
            Err(rejection) => {
                warn!(
                    "[ID{}]{} {} 被拒绝，状态码 {}",
                    id,
                    request.method(),
                    request.path(),
                    rejection.status
                );
                return rejection.into_response();
            }
        };

        let context = ProtocolContext {
            metadata: &self.metadata,
            service: self.service.as_ref(),
            buffer_size: self.buffer_size,
        };
        let response = protocol.handle(&context, request);
        if response.status_code() >= 500 {
            error!("[ID{}]{} 处理失败，状态码 {}", id, protocol.name(), response.status_code());
        } else {
            info!("[ID{}]{} 处理完成，状态码 {}", id, protocol.name(), response.status_code());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{MethodBuilder, ParameterInfo};
    use crate::param::HttpRequestMethod;
    use crate::request::HttpRequest;
    use crate::value::{ReturnType, TypeTag};

    struct Echo;

    impl WebService for Echo {
        fn invoke(&self, _: &MethodDescriptor, mut args: Vec<Value>) -> Result<Option<Value>, Exception> {
            Ok(args.pop())
        }
    }

    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new("Echo").namespace("urn:echo").method(
            MethodBuilder::new("Say")
                .param(ParameterInfo::new("text", TypeTag::String))
                .returns(ReturnType::scalar(TypeTag::String)),
        )
    }

    #[test]
    fn test_metadata_primes_formatters_once() {
        let metadata = ServiceMetadata::build(descriptor(), &ExtensionRegistry::new(), &[]).unwrap();
        assert_eq!(metadata.formatters().len(), 4);
        let builds = metadata.formatters().builds();
        let method = &metadata.descriptor().methods()[0];
        metadata
            .formatters()
            .instance::<XmlReturnWriter>(metadata.descriptor(), method);
        assert_eq!(metadata.formatters().builds(), builds);
    }

    #[test]
    fn test_unknown_extension_kind_fails_startup() {
        let extra = [ExtensionConfig::new("missing", 0)];
        assert!(matches!(
            ServiceMetadata::build(descriptor(), &ExtensionRegistry::new(), &extra),
            Err(Exception::Config(_))
        ));
    }

    #[test]
    fn test_foreign_path_is_not_found() {
        let host = ServiceHost::new(descriptor(), Arc::new(Echo), &Config::new()).unwrap();
        let mut request = HttpRequest::new(HttpRequestMethod::Get, "/Other/Say?text=x");
        assert_eq!(host.handle(&mut request).status_code(), 404);
    }

    #[test]
    fn test_get_dispatch() {
        let host = ServiceHost::new(descriptor(), Arc::new(Echo), &Config::new()).unwrap();
        let mut request = HttpRequest::new(HttpRequestMethod::Get, "/Echo/Say?text=hi");
        let response = host.handle(&mut request);
        assert_eq!(response.status_code(), 200);
        let body = String::from_utf8(response.content().to_vec()).unwrap();
        assert!(body.ends_with(r#"<string xmlns="urn:echo">hi</string>"#));
    }
}
