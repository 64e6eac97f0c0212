//! # 消息与阶段状态机
//!
//! `SoapMessage` 描述一次在途调用的元数据：方向、URL、动作、单向标记、协议版本
//! 以及 SOAP 头集合。扩展在各个阶段拿到它，可以检查或改写头部。
//!
//! 阶段严格线性推进：
//! - 服务端：`BeforeDeserialize → AfterDeserialize → BeforeSerialize → AfterSerialize`
//! - 客户端：`BeforeSerialize → AfterSerialize → BeforeDeserialize → AfterDeserialize`
//!
//! 与阶段相关的属性在访问前先通过 `ensure_stage` 校验，越界访问返回
//! `Exception::InvalidStage`，绝不返回过期数据。

use std::fmt;
use std::ops::BitOr;

use crate::descriptor::MethodDescriptor;
use crate::exception::Exception;
use crate::host::WebService;
use crate::param::{HttpEncoding, SoapProtocolVersion};
use crate::value::Value;

/// 调用生命周期中的一个阶段，数值为稳定的位掩码标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Stage {
    BeforeSerialize = 1,
    AfterSerialize = 2,
    BeforeDeserialize = 4,
    AfterDeserialize = 8,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::BeforeSerialize,
        Stage::AfterSerialize,
        Stage::BeforeDeserialize,
        Stage::AfterDeserialize,
    ];

    pub fn bits(self) -> u8 {
        self as u8
    }

    /// 序列化方向的阶段（字节从本端流出）
    pub fn is_outbound(self) -> bool {
        matches!(self, Stage::BeforeSerialize | Stage::AfterSerialize)
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::BeforeSerialize => "BeforeSerialize",
            Stage::AfterSerialize => "AfterSerialize",
            Stage::BeforeDeserialize => "BeforeDeserialize",
            Stage::AfterDeserialize => "AfterDeserialize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 阶段集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageMask(u8);

impl StageMask {
    pub const NONE: StageMask = StageMask(0);
    pub const ALL: StageMask = StageMask(0x0F);

    pub fn from_bits(bits: u8) -> Self {
        StageMask(bits & 0x0F)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.0 & stage.bits() != 0
    }
}

impl From<Stage> for StageMask {
    fn from(stage: Stage) -> Self {
        StageMask(stage.bits())
    }
}

impl BitOr for Stage {
    type Output = StageMask;
    fn bitor(self, rhs: Stage) -> StageMask {
        StageMask(self.bits() | rhs.bits())
    }
}

impl BitOr<Stage> for StageMask {
    type Output = StageMask;
    fn bitor(self, rhs: Stage) -> StageMask {
        StageMask(self.0 | rhs.bits())
    }
}

impl BitOr for StageMask {
    type Output = StageMask;
    fn bitor(self, rhs: StageMask) -> StageMask {
        StageMask(self.0 | rhs.0)
    }
}

impl fmt::Display for StageMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Stage::ALL
            .iter()
            .filter(|s| self.contains(**s))
            .map(|s| s.name())
            .collect();
        if names.is_empty() {
            write!(f, "(none)")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// 头部所属的方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderDirection {
    Request,
    Response,
}

/// 一个 SOAP 头
#[derive(Debug, Clone, PartialEq)]
pub struct SoapHeader {
    pub namespace: String,
    pub name: String,
    pub value: String,
    pub must_understand: bool,
    /// 扩展或服务处理过该头后置为真
    pub understood: bool,
    pub direction: HeaderDirection,
}

impl SoapHeader {
    pub fn new(namespace: &str, name: &str, value: &str, direction: HeaderDirection) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            value: value.to_string(),
            must_understand: false,
            understood: false,
            direction,
        }
    }

    pub fn must_understand(mut self) -> Self {
        self.must_understand = true;
        self
    }

    pub fn qualified_name(&self) -> String {
        format!("{{{}}}{}", self.namespace, self.name)
    }
}

/// 故障代码
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultCode {
    /// 调用方的问题（1.2 中为 Sender）
    Client,
    /// 服务端的问题（1.2 中为 Receiver）
    Server,
    MustUnderstand,
    VersionMismatch,
    Other(String),
}

impl FaultCode {
    pub fn local_name(&self, version: SoapProtocolVersion) -> &str {
        match (self, version) {
            (FaultCode::Client, SoapProtocolVersion::Soap11) => "Client",
            (FaultCode::Client, SoapProtocolVersion::Soap12) => "Sender",
            (FaultCode::Server, SoapProtocolVersion::Soap11) => "Server",
            (FaultCode::Server, SoapProtocolVersion::Soap12) => "Receiver",
            (FaultCode::MustUnderstand, _) => "MustUnderstand",
            (FaultCode::VersionMismatch, _) => "VersionMismatch",
            (FaultCode::Other(name), _) => name,
        }
    }

    /// 从带或不带前缀的代码解析
    pub fn parse(code: &str) -> Self {
        let local = code.rsplit(':').next().unwrap_or(code).trim();
        match local {
            "Client" | "Sender" => FaultCode::Client,
            "Server" | "Receiver" => FaultCode::Server,
            "MustUnderstand" => FaultCode::MustUnderstand,
            "VersionMismatch" => FaultCode::VersionMismatch,
            other => FaultCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.local_name(SoapProtocolVersion::Soap11))
    }
}

/// 终结性的故障表示
#[derive(Debug, Clone, PartialEq)]
pub struct SoapFault {
    pub code: FaultCode,
    pub reason: String,
    pub detail: Option<String>,
}

impl SoapFault {
    pub fn new(code: FaultCode, reason: &str) -> Self {
        Self {
            code,
            reason: reason.to_string(),
            detail: None,
        }
    }
}

impl From<&Exception> for SoapFault {
    fn from(e: &Exception) -> Self {
        let code = match e {
            Exception::MustUnderstand { .. } => FaultCode::MustUnderstand,
            Exception::SoapFault(fault) => return fault.clone(),
            e if e.is_wire_error() => FaultCode::Client,
            Exception::UnknownMethod(_) => FaultCode::Client,
            _ => FaultCode::Server,
        };
        SoapFault::new(code, &e.to_string())
    }
}

/// 消息方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Client,
    Server,
}

impl Direction {
    fn order(&self) -> [Stage; 4] {
        match self {
            Direction::Server => [
                Stage::BeforeDeserialize,
                Stage::AfterDeserialize,
                Stage::BeforeSerialize,
                Stage::AfterSerialize,
            ],
            Direction::Client => [
                Stage::BeforeSerialize,
                Stage::AfterSerialize,
                Stage::BeforeDeserialize,
                Stage::AfterDeserialize,
            ],
        }
    }
}

/// 一次在途调用的消息
pub struct SoapMessage<'a> {
    direction: Direction,
    method: &'a MethodDescriptor,
    server: Option<&'a dyn WebService>,
    stage: Option<Stage>,
    url: String,
    action: String,
    version: SoapProtocolVersion,
    incoming_encoding: Option<HttpEncoding>,
    outgoing_encoding: Option<HttpEncoding>,
    headers: Vec<SoapHeader>,
    parameters: Vec<Value>,
    return_value: Option<Value>,
    exception: Option<SoapFault>,
}

impl<'a> SoapMessage<'a> {
    pub fn client(
        method: &'a MethodDescriptor,
        url: &str,
        version: SoapProtocolVersion,
        parameters: Vec<Value>,
    ) -> Self {
        Self {
            direction: Direction::Client,
            method,
            server: None,
            stage: None,
            url: url.to_string(),
            action: method.action.clone(),
            version,
            incoming_encoding: None,
            outgoing_encoding: None,
            headers: Vec::new(),
            parameters,
            return_value: None,
            exception: None,
        }
    }

    pub fn server(
        method: &'a MethodDescriptor,
        server: &'a dyn WebService,
        url: &str,
        action: &str,
        version: SoapProtocolVersion,
    ) -> Self {
        Self {
            direction: Direction::Server,
            method,
            server: Some(server),
            stage: None,
            url: url.to_string(),
            action: action.to_string(),
            version,
            incoming_encoding: None,
            outgoing_encoding: None,
            headers: Vec::new(),
            parameters: Vec::new(),
            return_value: None,
            exception: None,
        }
    }

    /// 校验当前阶段在允许集合内
    pub fn ensure_stage(&self, property: &'static str, allowed: StageMask) -> Result<(), Exception> {
        match self.stage {
            Some(stage) if allowed.contains(stage) => Ok(()),
            current => Err(Exception::InvalidStage {
                property,
                current,
                allowed,
            }),
        }
    }

    /// 推进到下一个阶段；只接受当前方向上的紧邻阶段。
    ///
    /// 服务端消息一旦记录了故障，可以从反序列化阶段直接跳到 `BeforeSerialize` 以写出故障。
    pub(crate) fn advance(&mut self, next: Stage) -> Result<(), Exception> {
        let order = self.direction.order();
        let expected = match self.stage {
            None => Some(order[0]),
            Some(current) => order
                .iter()
                .position(|s| *s == current)
                .and_then(|i| order.get(i + 1).copied()),
        };
        let fault_jump = self.direction == Direction::Server
            && self.exception.is_some()
            && next == Stage::BeforeSerialize
            && !matches!(self.stage, Some(Stage::BeforeSerialize) | Some(Stage::AfterSerialize));
        if expected == Some(next) || fault_jump {
            self.stage = Some(next);
            Ok(())
        } else {
            Err(Exception::IllegalTransition {
                from: self.stage,
                to: next,
            })
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_client(&self) -> bool {
        self.direction == Direction::Client
    }

    pub fn stage(&self) -> Option<Stage> {
        self.stage
    }

    pub fn method(&self) -> &'a MethodDescriptor {
        self.method
    }

    pub fn one_way(&self) -> bool {
        self.method.one_way
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn version(&self) -> SoapProtocolVersion {
        self.version
    }

    /// 服务对象，仅在 `AfterDeserialize | BeforeSerialize` 可用
    pub fn target(&self) -> Result<&'a dyn WebService, Exception> {
        self.ensure_stage("Server", Stage::AfterDeserialize | Stage::BeforeSerialize)?;
        self.server
            .ok_or(Exception::UnsupportedOperation("client message has no server object"))
    }

    fn parameters_mask(&self) -> StageMask {
        match self.direction {
            Direction::Server => {
                Stage::AfterDeserialize | Stage::BeforeSerialize | Stage::AfterSerialize
            }
            Direction::Client => Stage::BeforeSerialize | Stage::AfterSerialize,
        }
    }

    /// 输入参数
    pub fn parameters(&self) -> Result<&[Value], Exception> {
        self.ensure_stage("Parameters", self.parameters_mask())?;
        Ok(&self.parameters)
    }

    /// 可改写的输入参数：服务端在 `AfterDeserialize`，客户端在 `BeforeSerialize`
    pub fn parameters_mut(&mut self) -> Result<&mut Vec<Value>, Exception> {
        let mask = match self.direction {
            Direction::Server => StageMask::from(Stage::AfterDeserialize),
            Direction::Client => StageMask::from(Stage::BeforeSerialize),
        };
        self.ensure_stage("Parameters", mask)?;
        Ok(&mut self.parameters)
    }

    /// 返回值：服务端在序列化阶段，客户端在 `AfterDeserialize`
    pub fn return_value(&self) -> Result<Option<&Value>, Exception> {
        let mask = match self.direction {
            Direction::Server => Stage::BeforeSerialize | Stage::AfterSerialize,
            Direction::Client => StageMask::from(Stage::AfterDeserialize),
        };
        self.ensure_stage("ReturnValue", mask)?;
        Ok(self.return_value.as_ref())
    }

    /// 当前阶段所处理正文的编码：反序列化阶段是读入的正文，其余阶段是写出的正文
    pub fn content_encoding(&self) -> Option<HttpEncoding> {
        match self.stage {
            Some(Stage::BeforeDeserialize) | Some(Stage::AfterDeserialize) => self.incoming_encoding,
            _ => self.outgoing_encoding,
        }
    }

    /// 只能在写出或读入正文之前修改。
    ///
    /// `BeforeSerialize` 设置写出正文的编码；`BeforeDeserialize` 置为 `None` 表示扩展已负责解码读入的正文。
    pub fn set_content_encoding(&mut self, encoding: Option<HttpEncoding>) -> Result<(), Exception> {
        self.ensure_stage(
            "ContentEncoding",
            Stage::BeforeSerialize | Stage::BeforeDeserialize,
        )?;
        match self.stage {
            Some(Stage::BeforeDeserialize) => self.incoming_encoding = encoding,
            _ => self.outgoing_encoding = encoding,
        }
        Ok(())
    }

    /// 写出正文实际使用的编码，只由扩展在 `BeforeSerialize` 设置
    pub fn outgoing_encoding(&self) -> Option<HttpEncoding> {
        self.outgoing_encoding
    }

    /// 读入正文经过扩展链后仍未解开的编码
    pub fn incoming_encoding(&self) -> Option<HttpEncoding> {
        self.incoming_encoding
    }

    /// 扩展链处理完 `BeforeDeserialize` 后，正文必须已是明文
    pub(crate) fn ensure_decoded(&self) -> Result<(), Exception> {
        match self.incoming_encoding {
            Some(encoding) => Err(Exception::UnsupportedEncoding(encoding.to_string())),
            None => Ok(()),
        }
    }

    pub fn headers(&self) -> &[SoapHeader] {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Vec<SoapHeader> {
        &mut self.headers
    }

    /// 查找某个方向上的头
    pub fn header(&self, namespace: &str, name: &str, direction: HeaderDirection) -> Option<&SoapHeader> {
        self.headers
            .iter()
            .find(|h| h.direction == direction && h.namespace == namespace && h.name == name)
    }

    /// 本端要写出的头：客户端写请求头，服务端写响应头
    pub fn outgoing_headers(&self) -> impl Iterator<Item = &SoapHeader> {
        let direction = match self.direction {
            Direction::Client => HeaderDirection::Request,
            Direction::Server => HeaderDirection::Response,
        };
        self.headers.iter().filter(move |h| h.direction == direction)
    }

    pub fn exception(&self) -> Option<&SoapFault> {
        self.exception.as_ref()
    }

    pub(crate) fn set_fault(&mut self, fault: SoapFault) {
        self.exception = Some(fault);
    }

    pub(crate) fn set_parameters(&mut self, parameters: Vec<Value>) {
        self.parameters = parameters;
    }

    pub(crate) fn take_parameters(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.parameters)
    }

    pub(crate) fn set_return_value(&mut self, value: Option<Value>) {
        self.return_value = value;
    }

    pub(crate) fn take_return_value(&mut self) -> Option<Value> {
        self.return_value.take()
    }

    pub(crate) fn set_incoming_encoding(&mut self, encoding: Option<HttpEncoding>) {
        self.incoming_encoding = encoding;
    }
}
