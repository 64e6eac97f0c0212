//! # 编解码器注册表
//!
//! 所有参数读写器与返回值读写器都遵循同一个两阶段约定：
//! - `get_initializer`：每个 `(编解码器类型, 方法)` 只调用一次，可以做任意昂贵的准备
//!   工作（编译正则、构建序列化器、整理参数表）。对方法形状不适用时返回 `None`，
//!   协议层据此跳过该编解码器，不视为错误。
//! - `initialize`：每次调用执行一次，只捕获初始化器的共享引用。
//!
//! `FormatterCache` 以写锁保护的首次构建保证每个键的初始化器只计算一次，
//! 之后的调用只取读锁，返回同一个 `Arc`。

pub mod parameter;
pub mod pattern;
pub mod returns;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, warn};

use crate::descriptor::{MethodDescriptor, MethodId, ServiceDescriptor};

pub trait MimeFormatter: Sized + 'static {
    /// 只读、可跨调用共享的预计算结果
    type Initializer: Send + Sync + 'static;

    /// 用于日志的编解码器名
    const NAME: &'static str;

    fn get_initializer(
        service: &ServiceDescriptor,
        method: &MethodDescriptor,
    ) -> Option<Self::Initializer>;

    fn initialize(initializer: Arc<Self::Initializer>) -> Self;
}

type CachedInitializer = Option<Arc<dyn Any + Send + Sync>>;

/// 初始化器缓存
#[derive(Default)]
pub struct FormatterCache {
    entries: RwLock<HashMap<(TypeId, MethodId), CachedInitializer>>,
    builds: AtomicUsize,
}

impl FormatterCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<(TypeId, MethodId), CachedInitializer>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("编解码器缓存锁被污染，恢复并继续");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<(TypeId, MethodId), CachedInitializer>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("编解码器缓存锁被污染，恢复并继续");
                poisoned.into_inner()
            }
        }
    }

    /// 取出（必要时构建）某个编解码器针对某个方法的初始化器
    pub fn initializer<F: MimeFormatter>(
        &self,
        service: &ServiceDescriptor,
        method: &MethodDescriptor,
    ) -> Option<Arc<F::Initializer>> {
        let key = (TypeId::of::<F>(), method.id);
        let cached = self.read().get(&key).cloned();
        let entry = match cached {
            Some(entry) => entry,
            None => {
                let mut entries = self.write();
                // 等待写锁期间可能已被其他调用构建
                let built = entries
                    .entry(key)
                    .or_insert_with(|| {
                        self.builds.fetch_add(1, Ordering::Relaxed);
                        let built = F::get_initializer(service, method);
                        debug!(
                            "构建初始化器 {} / {}：{}",
                            F::NAME,
                            method.name,
                            if built.is_some() { "适用" } else { "不适用" }
                        );
                        built.map(|init| Arc::new(init) as Arc<dyn Any + Send + Sync>)
                    })
                    .clone();
                built
            }
        };
        entry.and_then(|init| init.downcast::<F::Initializer>().ok())
    }

    /// 为本次调用创建编解码器实例；不适用时返回 `None`
    pub fn instance<F: MimeFormatter>(
        &self,
        service: &ServiceDescriptor,
        method: &MethodDescriptor,
    ) -> Option<F> {
        self.initializer::<F>(service, method).map(F::initialize)
    }

    /// 为服务的全部方法预先构建某个编解码器的初始化器
    pub fn prime<F: MimeFormatter>(&self, service: &ServiceDescriptor) {
        for method in service.methods() {
            self.initializer::<F>(service, method);
        }
    }

    /// 已缓存的键数量（含“不适用”）
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `get_initializer` 的累计调用次数
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }
}
