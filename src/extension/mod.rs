//! # SOAP 扩展链
//!
//! 扩展通过两条相互独立的通道参与一次调用：
//! - **字节流通道**：`chain_input` / `chain_output` 可以返回包装了原始流的新流
//!   （压缩、记录、变换）；
//! - **元数据通道**：`process_message` 在每个阶段被调用，可以检查或改写消息头。
//!
//! ## 排序约定
//! 1. 方法级扩展排在服务级扩展之前；
//! 2. 同一层内按优先级从高到低；
//! 3. 优先级相同时保持声明顺序。
//!
//! 链中下标 0 的扩展最先包装传输流，因此位于最内层、最靠近传输。
//! 出站阶段（`BeforeSerialize`、`AfterSerialize`）按下标正序回调，
//! 入站阶段（`BeforeDeserialize`、`AfterDeserialize`）按下标逆序回调，
//! 于是回调顺序总是与字节流经各层的顺序相反。

pub mod compression;
pub mod trace;

use std::any::Any;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use log::{debug, error, warn};

use crate::descriptor::{ExtensionConfig, MethodDescriptor, ServiceDescriptor};
use crate::exception::Exception;
use crate::message::{SoapMessage, Stage};
use crate::stream::{InputStream, OutputStream};

pub trait SoapExtension: Send {
    /// 包装输入流；默认原样返回
    fn chain_input(&mut self, stream: InputStream) -> InputStream {
        stream
    }

    /// 包装输出流；默认原样返回
    fn chain_output(&mut self, stream: OutputStream) -> OutputStream {
        stream
    }

    fn process_message(&mut self, message: &mut SoapMessage<'_>) -> Result<(), Exception>;
}

/// 带两阶段初始化的扩展类型
pub trait SoapExtensionKind: SoapExtension + Sized + 'static {
    type Initializer: Send + Sync + 'static;

    /// 配置中引用该扩展时使用的名称
    const KIND: &'static str;

    /// 每个（扩展配置, 方法）只调用一次；不适用时返回 `None`
    fn get_initializer(method: &MethodDescriptor, config: &ExtensionConfig) -> Option<Self::Initializer>;

    fn initialize(initializer: Arc<Self::Initializer>) -> Self;
}

pub type SharedInitializer = Arc<dyn Any + Send + Sync>;

/// 类型擦除后的扩展工厂
pub trait ExtensionFactory: Send + Sync {
    fn kind(&self) -> &str;

    fn get_initializer(&self, method: &MethodDescriptor, config: &ExtensionConfig) -> Option<SharedInitializer>;

    fn initialize(&self, initializer: &SharedInitializer) -> Result<Box<dyn SoapExtension>, Exception>;
}

/// 把 `SoapExtensionKind` 适配为 `ExtensionFactory`
pub struct KindFactory<E>(PhantomData<fn() -> E>);

impl<E> Default for KindFactory<E> {
    fn default() -> Self {
        KindFactory(PhantomData)
    }
}

impl<E: SoapExtensionKind> ExtensionFactory for KindFactory<E> {
    fn kind(&self) -> &str {
        E::KIND
    }

    fn get_initializer(&self, method: &MethodDescriptor, config: &ExtensionConfig) -> Option<SharedInitializer> {
        E::get_initializer(method, config).map(|init| Arc::new(init) as SharedInitializer)
    }

    fn initialize(&self, initializer: &SharedInitializer) -> Result<Box<dyn SoapExtension>, Exception> {
        match initializer.clone().downcast::<E::Initializer>() {
            Ok(init) => Ok(Box::new(E::initialize(init))),
            Err(_) => Err(Exception::ExtensionFailed(format!(
                "initializer of extension '{}' has an unexpected type",
                E::KIND
            ))),
        }
    }
}

/// 扩展配置所在的层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExtensionTier {
    Method,
    Service,
}

/// 已解析的扩展：工厂、初始化器与排序键
#[derive(Clone)]
pub struct ExtensionEntry {
    pub kind: String,
    pub priority: i32,
    pub tier: ExtensionTier,
    factory: Arc<dyn ExtensionFactory>,
    initializer: SharedInitializer,
}

impl std::fmt::Debug for ExtensionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionEntry")
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("tier", &self.tier)
            .finish()
    }
}

/// 扩展类型注册表
#[derive(Clone)]
pub struct ExtensionRegistry {
    factories: HashMap<String, Arc<dyn ExtensionFactory>>,
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionRegistry {
    /// 空注册表
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// 含内置扩展（`compression`、`trace`）的注册表
    pub fn new() -> Self {
        Self::empty()
            .register::<compression::CompressionExtension>()
            .register::<trace::TraceExtension>()
    }

    pub fn register<E: SoapExtensionKind>(self) -> Self {
        self.register_factory(Arc::new(KindFactory::<E>::default()))
    }

    pub fn register_factory(mut self, factory: Arc<dyn ExtensionFactory>) -> Self {
        let kind = factory.kind().to_string();
        if self.factories.insert(kind.clone(), factory).is_some() {
            warn!("扩展类型 {} 被重复注册，后注册者生效", kind);
        }
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// 为方法解析并排序扩展；配置引用了未注册的类型时报错
    pub fn resolve(
        &self,
        service: &ServiceDescriptor,
        method: &MethodDescriptor,
        extra: &[ExtensionConfig],
    ) -> Result<Vec<ExtensionEntry>, Exception> {
        let configs = method
            .extensions
            .iter()
            .map(|c| (ExtensionTier::Method, c))
            .chain(
                service
                    .extensions
                    .iter()
                    .chain(extra)
                    .map(|c| (ExtensionTier::Service, c)),
            );

        let mut entries = Vec::new();
        for (tier, config) in configs {
            let factory = self.factories.get(&config.kind).ok_or_else(|| {
                Exception::Config(format!("unknown extension kind '{}'", config.kind))
            })?;
            match factory.get_initializer(method, config) {
                Some(initializer) => entries.push(ExtensionEntry {
                    kind: config.kind.clone(),
                    priority: config.priority,
                    tier,
                    factory: factory.clone(),
                    initializer,
                }),
                None => debug!("扩展 {} 不适用于方法 {}", config.kind, method.name),
            }
        }
        entries.sort_by_key(|e| (e.tier, Reverse(e.priority)));
        Ok(entries)
    }
}

/// 一次调用的扩展实例链
pub struct ExtensionChain {
    extensions: Vec<(String, Box<dyn SoapExtension>)>,
}

impl ExtensionChain {
    pub fn new(entries: &[ExtensionEntry]) -> Result<Self, Exception> {
        let mut extensions = Vec::with_capacity(entries.len());
        for entry in entries {
            extensions.push((entry.kind.clone(), entry.factory.initialize(&entry.initializer)?));
        }
        Ok(Self { extensions })
    }

    pub fn empty() -> Self {
        Self {
            extensions: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn chain_input(&mut self, mut stream: InputStream) -> InputStream {
        for (_, extension) in self.extensions.iter_mut() {
            stream = extension.chain_input(stream);
        }
        stream
    }

    pub fn chain_output(&mut self, mut stream: OutputStream) -> OutputStream {
        for (_, extension) in self.extensions.iter_mut() {
            stream = extension.chain_output(stream);
        }
        stream
    }

    /// 推进消息阶段并依次回调各扩展；任一扩展失败即中止剩余回调
    pub fn process(&mut self, stage: Stage, message: &mut SoapMessage<'_>) -> Result<(), Exception> {
        message.advance(stage)?;
        let outbound = stage.is_outbound();
        let count = self.extensions.len();
        for i in 0..count {
            let index = if outbound { i } else { count - 1 - i };
            let (kind, extension) = &mut self.extensions[index];
            if let Err(e) = extension.process_message(message) {
                error!("扩展 {} 在阶段 {} 失败：{}", kind, stage, e);
                return Err(Exception::Extension {
                    extension: kind.clone(),
                    stage,
                    source: Box::new(e),
                });
            }
        }
        Ok(())
    }
}
