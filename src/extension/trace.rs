//! 跟踪扩展：记录每个阶段，并截取进出的正文片段写入日志。

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, warn};

use crate::descriptor::{ExtensionConfig, MethodDescriptor};
use crate::exception::Exception;
use crate::extension::{SoapExtension, SoapExtensionKind};
use crate::message::{SoapMessage, Stage};
use crate::stream::{InputStream, OutputLayer, OutputStream};

const DEFAULT_LIMIT: usize = 1024;

/// 截取到的正文片段，最多保留 `limit` 字节
#[derive(Clone, Default)]
pub struct Capture {
    bytes: Arc<Mutex<Vec<u8>>>,
    limit: usize,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Arc::default(),
            limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        match self.bytes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, data: &[u8]) {
        let mut bytes = self.lock();
        let room = self.limit.saturating_sub(bytes.len());
        bytes.extend_from_slice(&data[..room.min(data.len())]);
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }
}

struct TeeInput {
    inner: InputStream,
    capture: Capture,
}

impl Read for TeeInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.capture.record(&buf[..n]);
        Ok(n)
    }
}

struct TeeOutput {
    inner: OutputStream,
    capture: Capture,
}

impl Write for TeeOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.capture.record(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl OutputLayer for TeeOutput {
    fn close(self: Box<Self>) -> io::Result<()> {
        self.inner.close()
    }
}

pub struct TraceExtension {
    limit: Arc<usize>,
    inbound: Capture,
    outbound: Capture,
}

impl TraceExtension {
    pub fn inbound(&self) -> String {
        self.inbound.text()
    }

    pub fn outbound(&self) -> String {
        self.outbound.text()
    }
}

impl SoapExtensionKind for TraceExtension {
    type Initializer = usize;
    const KIND: &'static str = "trace";

    fn get_initializer(method: &MethodDescriptor, config: &ExtensionConfig) -> Option<usize> {
        match config.settings.get("limit") {
            None => Some(DEFAULT_LIMIT),
            Some(text) => match text.parse() {
                Ok(limit) => Some(limit),
                Err(_) => {
                    warn!("方法 {} 的跟踪上限 {} 无法解析，使用默认值", method.name, text);
                    Some(DEFAULT_LIMIT)
                }
            },
        }
    }

    fn initialize(limit: Arc<usize>) -> Self {
        Self {
            inbound: Capture::new(*limit),
            outbound: Capture::new(*limit),
            limit,
        }
    }
}

impl SoapExtension for TraceExtension {
    fn chain_input(&mut self, stream: InputStream) -> InputStream {
        Box::new(TeeInput {
            inner: stream,
            capture: self.inbound.clone(),
        })
    }

    fn chain_output(&mut self, stream: OutputStream) -> OutputStream {
        Box::new(TeeOutput {
            inner: stream,
            capture: self.outbound.clone(),
        })
    }

    fn process_message(&mut self, message: &mut SoapMessage<'_>) -> Result<(), Exception> {
        let stage = match message.stage() {
            Some(stage) => stage,
            None => return Ok(()),
        };
        info!(
            "[trace] {:?} {} {} action={} headers={}",
            message.direction(),
            message.method().name,
            stage,
            message.action(),
            message.headers().len()
        );
        match stage {
            Stage::AfterDeserialize => info!(
                "[trace] 入站正文（前 {} 字节）：{}",
                self.limit,
                self.inbound.text()
            ),
            Stage::AfterSerialize => info!(
                "[trace] 出站正文（前 {} 字节）：{}",
                self.limit,
                self.outbound.text()
            ),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{input_from_bytes, ResponseBody};
    use bytes::Bytes;

    #[test]
    fn test_capture_is_limited() {
        let mut ext = TraceExtension::initialize(Arc::new(4));
        let body = ResponseBody::new();
        let mut out = ext.chain_output(body.writer());
        out.write_all(b"abcdefgh").unwrap();
        out.close().unwrap();
        assert_eq!(&body.bytes()[..], b"abcdefgh");
        assert_eq!(ext.outbound(), "abcd");

        let mut input = ext.chain_input(input_from_bytes(Bytes::from_static(b"xyz")));
        let mut text = String::new();
        input.read_to_string(&mut text).unwrap();
        assert_eq!(text, "xyz");
        assert_eq!(ext.inbound(), "xyz");
    }

    #[test]
    fn test_limit_setting() {
        use crate::descriptor::{MethodBuilder, ServiceDescriptor};
        let service = ServiceDescriptor::new("S").method(MethodBuilder::new("M"));
        let config = ExtensionConfig::new("trace", 0).with_setting("limit", "16");
        assert_eq!(TraceExtension::get_initializer(&service.methods()[0], &config), Some(16));
        let config = ExtensionConfig::new("trace", 0);
        assert_eq!(
            TraceExtension::get_initializer(&service.methods()[0], &config),
            Some(DEFAULT_LIMIT)
        );
    }
}
