pub mod client;
pub mod config;
pub mod descriptor;
pub mod exception;
pub mod extension;
pub mod formatter;
pub mod host;
pub mod message;
pub mod param;
pub mod protocol;
pub mod request;
pub mod response;
pub mod serializer;
pub mod stream;
pub mod util;
pub mod value;
pub mod xml;

pub use client::{ClientTransport, HttpSimpleClientProtocol, LoopbackTransport, SoapClientProtocol};
pub use config::Config;
pub use descriptor::{ExtensionConfig, MethodBuilder, MethodDescriptor, ParameterInfo, ServiceDescriptor};
pub use exception::Exception;
pub use extension::{ExtensionRegistry, SoapExtension, SoapExtensionKind};
pub use host::{ServiceHost, WebService};
pub use message::{SoapMessage, Stage};
pub use param::{HttpEncoding, HttpRequestMethod, HttpVersion, SoapProtocolVersion};
pub use protocol::ProtocolKind;
pub use request::{HttpRequest, Request};
pub use response::{HttpResponse, Response};
pub use util::HtmlBuilder;
pub use value::{ReturnType, ReturnValue, TypeTag, Value};
