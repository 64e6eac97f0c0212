//! # 流适配层
//!
//! 扩展链与序列化器之间传递的都是分层的字节流：
//! - 输出方向使用 `OutputStream`（`Box<dyn OutputLayer>`），关闭时由外向内逐层收尾；
//! - 输入方向使用 `InputStream`（`Box<dyn Read + Send>`），丢弃即关闭。
//!
//! `BufferedOutputStream` 位于序列化器与传输流之间，合并小块写入，并且可以暂时
//! 禁用 `flush`，让扩展在响应真正提交之前改写正文。

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Buf, Bytes};
use log::{debug, warn};

/// 输出流中的一层
pub trait OutputLayer: Write + Send {
    /// 刷出本层剩余数据，并关闭其下的所有层。
    fn close(self: Box<Self>) -> io::Result<()>;
}

pub type OutputStream = Box<dyn OutputLayer>;
pub type InputStream = Box<dyn Read + Send>;

/// 把一段内存数据包装为输入流
pub fn input_from_bytes(bytes: Bytes) -> InputStream {
    Box::new(bytes.reader())
}

fn unsupported(op: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{} is not supported on a write-only forward stream", op),
    )
}

/// 固定容量的写缓冲流。
///
/// 该流由构造它的一层独占，只会被关闭一次；关闭时连同它持有的下层流一起关闭。
pub struct BufferedOutputStream {
    inner: Option<OutputStream>,
    buffer: Vec<u8>,
    capacity: usize,
    flush_enabled: bool,
}

impl BufferedOutputStream {
    pub fn new(inner: OutputStream, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Some(inner),
            buffer: Vec::with_capacity(capacity),
            capacity,
            flush_enabled: true,
        }
    }

    /// 禁用或恢复 `flush`；禁用期间 `flush` 不做任何事
    pub fn set_flush_enabled(&mut self, enabled: bool) {
        self.flush_enabled = enabled;
    }

    pub fn flush_enabled(&self) -> bool {
        self.flush_enabled
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前缓冲中尚未写出的字节数
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn inner_mut(&mut self) -> io::Result<&mut OutputStream> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stream already closed"))
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.buffer);
        let result = self.inner_mut().and_then(|inner| inner.write_all(&pending));
        self.buffer = pending;
        self.buffer.clear();
        result
    }
}

impl Write for BufferedOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() <= self.capacity - self.buffer.len() {
            self.buffer.extend_from_slice(buf);
            return Ok(buf.len());
        }
        self.flush_buffer()?;
        if buf.len() >= self.capacity {
            self.inner_mut()?.write_all(buf)?;
        } else {
            self.buffer.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.flush_enabled {
            return Ok(());
        }
        self.flush_buffer()?;
        self.inner_mut()?.flush()
    }
}

impl Read for BufferedOutputStream {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(unsupported("read"))
    }
}

impl Seek for BufferedOutputStream {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(unsupported("seek"))
    }
}

impl OutputLayer for BufferedOutputStream {
    fn close(mut self: Box<Self>) -> io::Result<()> {
        let flushed = self.flush_buffer();
        let inner = self.inner.take();
        match inner {
            Some(mut inner) => {
                let result = flushed.and_then(|_| inner.flush());
                let closed = inner.close();
                result.and(closed)
            }
            None => flushed,
        }
    }
}

impl Drop for BufferedOutputStream {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            debug!("缓冲输出流未显式关闭，在析构时收尾");
            let mut inner = inner;
            if !self.buffer.is_empty() {
                if let Err(e) = inner.write_all(&self.buffer) {
                    warn!("析构时写出缓冲数据失败：{}", e);
                }
                self.buffer.clear();
            }
            if let Err(e) = inner.close() {
                warn!("析构时关闭下层流失败：{}", e);
            }
        }
    }
}

#[derive(Default)]
struct BodyState {
    bytes: Vec<u8>,
    writes: usize,
    closed: bool,
}

/// 内存中的响应正文，充当服务端管线最内层的“传输流”。
///
/// 句柄可克隆：管线持有一份写入，响应对象持有一份读取。
#[derive(Clone, Default)]
pub struct ResponseBody {
    state: Arc<Mutex<BodyState>>,
}

impl ResponseBody {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BodyState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("响应正文锁被污染，恢复并继续");
                poisoned.into_inner()
            }
        }
    }

    pub fn bytes(&self) -> Bytes {
        Bytes::from(self.lock().bytes.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// 已到达传输流的写入次数
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// 丢弃已写入的内容并重新打开，用于在提交前改写为故障响应
    pub fn reset(&self) {
        let mut state = self.lock();
        state.bytes.clear();
        state.writes = 0;
        state.closed = false;
    }

    /// 以输出流的形式取出一个写入句柄
    pub fn writer(&self) -> OutputStream {
        Box::new(self.clone())
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Write for ResponseBody {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "response body closed"));
        }
        state.bytes.extend_from_slice(buf);
        state.writes += 1;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl OutputLayer for ResponseBody {
    fn close(self: Box<Self>) -> io::Result<()> {
        self.lock().closed = true;
        Ok(())
    }
}
