//! # 协议选择
//!
//! 请求到达后，按固定顺序询问每个已启用的协议工厂。工厂只看请求方法与路径形状，
//! 从不读取正文，并给出四种答复之一：
//! - `NotApplicable`：与本绑定无关，继续询问下一个；
//! - `Protocol`：胜任，选择结束；
//! - `MethodNotAllowed`：路径形状匹配但动词不对，记下后继续询问；
//!   若最终没有任何工厂胜任，以 405 拒绝；
//! - `Reject`：明确拒绝（例如仅限本机的绑定收到了远程请求），选择立即结束，
//!   避免优先级更低、限制更宽松的绑定接手本应被拦截的请求。
//!
//! 所有工厂都不适用时以 404 拒绝。

pub mod http;
pub mod soap;

use serde_derive::{Deserialize, Serialize};

use log::debug;

use crate::host::{ServiceMetadata, WebService};
use crate::param::HttpRequestMethod;
use crate::request::Request;
use crate::response::HttpResponse;

/// 协议处理时可用的服务上下文
pub struct ProtocolContext<'a> {
    pub metadata: &'a ServiceMetadata,
    pub service: &'a dyn WebService,
    /// 响应缓冲区容量
    pub buffer_size: usize,
}

/// 一个已被选中的协议实例，处理单个请求
pub trait ServerProtocol {
    fn name(&self) -> &'static str;

    fn handle(&self, context: &ProtocolContext<'_>, request: &mut dyn Request) -> HttpResponse;
}

pub enum Selection {
    NotApplicable,
    Protocol(Box<dyn ServerProtocol>),
    MethodNotAllowed(Vec<HttpRequestMethod>),
    Reject {
        status: u16,
        allow: Vec<HttpRequestMethod>,
    },
}

pub trait ServerProtocolFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, request: &dyn Request) -> Selection;
}

/// 协议选择失败时的拒绝信息
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub status: u16,
    pub allow: Vec<HttpRequestMethod>,
}

impl Rejection {
    pub fn into_response(self) -> HttpResponse {
        // 空的 Allow 表示该资源对此客户端不开放任何方法
        let allow = if self.status == 405 || !self.allow.is_empty() {
            Some(self.allow)
        } else {
            None
        };
        HttpResponse::from_status_code(self.status, allow, None)
    }
}

/// 依次询问各工厂，返回胜任的协议或拒绝信息
pub fn select(
    factories: &[Box<dyn ServerProtocolFactory>],
    request: &dyn Request,
) -> Result<Box<dyn ServerProtocol>, Rejection> {
    let mut not_allowed: Option<Vec<HttpRequestMethod>> = None;
    for factory in factories {
        match factory.create(request) {
            Selection::NotApplicable => {}
            Selection::Protocol(protocol) => {
                debug!("[ID{}]由 {} 处理", request.id(), factory.name());
                return Ok(protocol);
            }
            Selection::MethodNotAllowed(allow) => {
                debug!(
                    "[ID{}]{} 不接受 {} 方法",
                    request.id(),
                    factory.name(),
                    request.method()
                );
                let merged = not_allowed.get_or_insert_with(Vec::new);
                for method in allow {
                    if !merged.contains(&method) {
                        merged.push(method);
                    }
                }
            }
            Selection::Reject { status, allow } => {
                debug!("[ID{}]{} 明确拒绝，状态码 {}", request.id(), factory.name(), status);
                return Err(Rejection { status, allow });
            }
        }
    }
    Err(match not_allowed {
        Some(allow) => Rejection { status: 405, allow },
        None => Rejection {
            status: 404,
            allow: Vec::new(),
        },
    })
}

/// 可启用的协议绑定
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    HttpSoap,
    HttpGet,
    HttpPost,
    HttpPostLocalhost,
}

impl ProtocolKind {
    /// 默认启用的绑定，按选择顺序排列
    pub fn defaults() -> Vec<ProtocolKind> {
        vec![
            ProtocolKind::HttpSoap,
            ProtocolKind::HttpGet,
            ProtocolKind::HttpPostLocalhost,
        ]
    }

    pub fn factory(&self) -> Box<dyn ServerProtocolFactory> {
        match self {
            ProtocolKind::HttpSoap => Box::new(soap::SoapServerProtocolFactory),
            ProtocolKind::HttpGet => Box::new(http::HttpServerProtocolFactory::get()),
            ProtocolKind::HttpPost => Box::new(http::HttpServerProtocolFactory::post()),
            ProtocolKind::HttpPostLocalhost => {
                Box::new(http::HttpServerProtocolFactory::post_localhost())
            }
        }
    }
}

/// 按 `kinds` 的顺序构建工厂链
pub fn factories(kinds: &[ProtocolKind]) -> Vec<Box<dyn ServerProtocolFactory>> {
    kinds.iter().map(|k| k.factory()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::HttpRequest;

    fn selected(kinds: &[ProtocolKind], request: &HttpRequest) -> Result<&'static str, Rejection> {
        select(&factories(kinds), request).map(|p| p.name())
    }

    const ALL: [ProtocolKind; 4] = [
        ProtocolKind::HttpSoap,
        ProtocolKind::HttpGet,
        ProtocolKind::HttpPostLocalhost,
        ProtocolKind::HttpPost,
    ];

    #[test]
    fn test_get_with_two_segments_goes_to_get() {
        let request = HttpRequest::new(HttpRequestMethod::Get, "/Calc/Add?a=1");
        assert_eq!(selected(&ALL, &request).unwrap(), "HttpGet");
    }

    #[test]
    fn test_get_rejected_by_post_only_bindings() {
        let request = HttpRequest::new(HttpRequestMethod::Get, "/Calc/Add");
        let rejection = selected(&[ProtocolKind::HttpPost], &request).unwrap_err();
        assert_eq!(rejection.status, 405);
        assert_eq!(rejection.allow, vec![HttpRequestMethod::Post]);
    }

    #[test]
    fn test_put_is_not_found() {
        let request = HttpRequest::new(HttpRequestMethod::Put, "/Calc/Add");
        assert_eq!(selected(&ALL, &request).unwrap_err().status, 404);
        let request = HttpRequest::new(HttpRequestMethod::Put, "/Calc");
        assert_eq!(selected(&ALL, &request).unwrap_err().status, 404);
    }

    #[test]
    fn test_localhost_gate_blocks_lower_priority_post() {
        let remote = HttpRequest::new(HttpRequestMethod::Post, "/Calc/Add");
        let rejection = selected(&ALL, &remote).unwrap_err();
        assert_eq!(rejection.status, 405);

        let local = HttpRequest::new(HttpRequestMethod::Post, "/Calc/Add").local(true);
        assert_eq!(selected(&ALL, &local).unwrap(), "HttpPostLocalhost");

        let remote = HttpRequest::new(HttpRequestMethod::Post, "/Calc/Add");
        assert_eq!(
            selected(&[ProtocolKind::HttpGet, ProtocolKind::HttpPost], &remote).unwrap(),
            "HttpPost"
        );
    }

    #[test]
    fn test_soap_binding_uses_single_segment() {
        let request = HttpRequest::new(HttpRequestMethod::Post, "/Calc");
        assert_eq!(selected(&ALL, &request).unwrap(), "HttpSoap");

        let request = HttpRequest::new(HttpRequestMethod::Get, "/Calc");
        let rejection = selected(&ALL, &request).unwrap_err();
        assert_eq!(rejection.status, 405);
        assert_eq!(rejection.allow, vec![HttpRequestMethod::Post]);
    }

    #[test]
    fn test_short_path_never_method_bound() {
        let request = HttpRequest::new(HttpRequestMethod::Get, "/Calc");
        assert_eq!(
            selected(&[ProtocolKind::HttpGet], &request).unwrap_err().status,
            404
        );
    }

    #[test]
    fn test_rejection_response_carries_allow() {
        let response = Rejection {
            status: 405,
            allow: vec![HttpRequestMethod::Get, HttpRequestMethod::Post],
        }
        .into_response();
        assert_eq!(response.status_code(), 405);
        assert_eq!(
            response.allow(),
            Some(&[HttpRequestMethod::Get, HttpRequestMethod::Post][..])
        );
    }
}
