//! 压缩扩展
//!
//! 出站正文按配置的编码（`gzip`、`deflate`、`br`）压缩，并在 `BeforeSerialize`
//! 把编码记录到消息上，由协议层写入 `Content-Encoding`。入站正文在第一次读取时
//! 按 `BeforeDeserialize` 时消息上记录的编码解压；未记录编码时原样透传。

use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex};

use brotli::enc::{self, backward_references::BrotliEncoderParams};
use flate2::{
    read::{DeflateDecoder, GzDecoder},
    write::{DeflateEncoder, GzEncoder},
    Compression,
};
use log::{debug, warn};

use crate::descriptor::{ExtensionConfig, MethodDescriptor};
use crate::exception::Exception;
use crate::extension::{SoapExtension, SoapExtensionKind};
use crate::message::{SoapMessage, Stage};
use crate::param::HttpEncoding;
use crate::stream::{InputStream, OutputLayer, OutputStream};

/// 按编码一次性压缩数据
pub fn compress(data: Vec<u8>, mode: Option<HttpEncoding>) -> io::Result<Vec<u8>> {
    let original_size = data.len();
    let result = match mode {
        Some(HttpEncoding::Gzip) => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&data)?;
            encoder.finish()
        }
        Some(HttpEncoding::Deflate) => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&data)?;
            encoder.finish()
        }
        Some(HttpEncoding::Br) => {
            let params = BrotliEncoderParams::default();
            let mut output = Vec::new();
            enc::BrotliCompress(&mut Cursor::new(data), &mut output, &params)?;
            Ok(output)
        }
        None => Ok(data),
    };

    if let Ok(ref compressed) = result {
        debug!(
            "压缩完成: {:?}, 原始大小: {} bytes, 压缩后: {} bytes",
            mode,
            original_size,
            compressed.len()
        );
    }
    result
}

/// 按编码包装一个解压读取器
pub fn decompress(stream: InputStream, mode: Option<HttpEncoding>) -> InputStream {
    match mode {
        Some(HttpEncoding::Gzip) => Box::new(GzDecoder::new(stream)),
        Some(HttpEncoding::Deflate) => Box::new(DeflateDecoder::new(stream)),
        Some(HttpEncoding::Br) => Box::new(brotli::Decompressor::new(stream, 4096)),
        None => stream,
    }
}

/// 收集出站字节，关闭时压缩后写入下层流
struct CompressingOutput {
    inner: Option<OutputStream>,
    pending: Vec<u8>,
    mode: HttpEncoding,
}

impl Write for CompressingOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.inner.is_none() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream already closed"));
        }
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CompressingOutput {
    fn finish(&mut self) -> io::Result<()> {
        let mut inner = match self.inner.take() {
            Some(inner) => inner,
            None => return Ok(()),
        };
        let data = std::mem::take(&mut self.pending);
        let written = compress(data, Some(self.mode)).and_then(|c| inner.write_all(&c));
        let closed = inner.close();
        written.and(closed)
    }
}

impl OutputLayer for CompressingOutput {
    fn close(mut self: Box<Self>) -> io::Result<()> {
        self.finish()
    }
}

impl Drop for CompressingOutput {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("析构时写出压缩数据失败：{}", e);
        }
    }
}

/// 第一次读取时才决定解压方式
struct DecompressingInput {
    raw: Option<InputStream>,
    decoded: Option<InputStream>,
    mode: Arc<Mutex<Option<HttpEncoding>>>,
}

impl Read for DecompressingInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.decoded.is_none() {
            let raw: InputStream = match self.raw.take() {
                Some(raw) => raw,
                None => Box::new(io::empty()),
            };
            let mode = match self.mode.lock() {
                Ok(guard) => *guard,
                Err(poisoned) => *poisoned.into_inner(),
            };
            self.decoded = Some(decompress(raw, mode));
        }
        match self.decoded.as_mut() {
            Some(decoded) => decoded.read(buf),
            None => Ok(0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompressionSettings {
    pub encoding: HttpEncoding,
}

pub struct CompressionExtension {
    settings: Arc<CompressionSettings>,
    incoming: Arc<Mutex<Option<HttpEncoding>>>,
}

impl SoapExtensionKind for CompressionExtension {
    type Initializer = CompressionSettings;
    const KIND: &'static str = "compression";

    fn get_initializer(method: &MethodDescriptor, config: &ExtensionConfig) -> Option<CompressionSettings> {
        let name = config.settings.get("encoding").map(|s| s.as_str()).unwrap_or("gzip");
        match HttpEncoding::parse(name) {
            Some(encoding) => Some(CompressionSettings { encoding }),
            None => {
                warn!("方法 {} 的压缩扩展配置了未知编码 {}，忽略该扩展", method.name, name);
                None
            }
        }
    }

    fn initialize(settings: Arc<CompressionSettings>) -> Self {
        Self {
            settings,
            incoming: Arc::new(Mutex::new(None)),
        }
    }
}

impl SoapExtension for CompressionExtension {
    fn chain_input(&mut self, stream: InputStream) -> InputStream {
        Box::new(DecompressingInput {
            raw: Some(stream),
            decoded: None,
            mode: self.incoming.clone(),
        })
    }

    fn chain_output(&mut self, stream: OutputStream) -> OutputStream {
        Box::new(CompressingOutput {
            inner: Some(stream),
            pending: Vec::new(),
            mode: self.settings.encoding,
        })
    }

    fn process_message(&mut self, message: &mut SoapMessage<'_>) -> Result<(), Exception> {
        match message.stage() {
            Some(Stage::BeforeSerialize) => {
                message.set_content_encoding(Some(self.settings.encoding))?;
            }
            Some(Stage::BeforeDeserialize) => {
                let encoding = message.content_encoding();
                match self.incoming.lock() {
                    Ok(mut guard) => *guard = encoding,
                    Err(poisoned) => *poisoned.into_inner() = encoding,
                }
                // 正文已由本扩展解压，后续层看到的是明文
                message.set_content_encoding(None)?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{MethodBuilder, ServiceDescriptor};
    use crate::param::SoapProtocolVersion;
    use crate::stream::{input_from_bytes, ResponseBody};
    use bytes::Bytes;

    fn extension(encoding: &str) -> CompressionExtension {
        let service = ServiceDescriptor::new("S").method(MethodBuilder::new("M"));
        let config = ExtensionConfig::new("compression", 0).with_setting("encoding", encoding);
        let init = CompressionExtension::get_initializer(&service.methods()[0], &config).unwrap();
        CompressionExtension::initialize(Arc::new(init))
    }

    #[test]
    fn test_unknown_encoding_not_applicable() {
        let service = ServiceDescriptor::new("S").method(MethodBuilder::new("M"));
        let config = ExtensionConfig::new("compression", 0).with_setting("encoding", "zstd");
        assert!(CompressionExtension::get_initializer(&service.methods()[0], &config).is_none());
    }

    #[test]
    fn test_output_is_compressed_on_close() {
        for name in ["gzip", "deflate", "br"] {
            let mut ext = extension(name);
            let body = ResponseBody::new();
            let mut out = ext.chain_output(body.writer());
            out.write_all(b"hello hello hello hello").unwrap();
            assert!(body.is_empty());
            out.close().unwrap();
            assert!(body.is_closed());

            let mode = HttpEncoding::parse(name);
            let mut plain = String::new();
            decompress(input_from_bytes(body.bytes()), mode)
                .read_to_string(&mut plain)
                .unwrap();
            assert_eq!(plain, "hello hello hello hello");
        }
    }

    #[test]
    fn test_input_decoded_with_recorded_encoding() {
        let service = ServiceDescriptor::new("S").method(MethodBuilder::new("M"));
        let mut msg = SoapMessage::client(&service.methods()[0], "/S", SoapProtocolVersion::Soap11, vec![]);
        let mut ext = extension("gzip");

        let compressed = compress(b"<x/>".to_vec(), Some(HttpEncoding::Gzip)).unwrap();
        let mut input = ext.chain_input(input_from_bytes(Bytes::from(compressed)));

        msg.advance(Stage::BeforeSerialize).unwrap();
        ext.process_message(&mut msg).unwrap();
        assert_eq!(msg.content_encoding(), Some(HttpEncoding::Gzip));
        msg.advance(Stage::AfterSerialize).unwrap();
        msg.set_incoming_encoding(Some(HttpEncoding::Gzip));
        msg.advance(Stage::BeforeDeserialize).unwrap();
        ext.process_message(&mut msg).unwrap();
        assert_eq!(msg.content_encoding(), None);

        let mut text = String::new();
        input.read_to_string(&mut text).unwrap();
        assert_eq!(text, "<x/>");
    }

    #[test]
    fn test_plain_input_passes_through() {
        let mut ext = extension("gzip");
        let mut input = ext.chain_input(input_from_bytes(Bytes::from_static(b"plain")));
        let mut text = String::new();
        input.read_to_string(&mut text).unwrap();
        assert_eq!(text, "plain");
    }
}
