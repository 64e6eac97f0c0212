use serde_derive::Deserialize;
use serde_derive::Serialize;

use log::{error, warn};
use std::fs::File;
use std::io::prelude::*;

use crate::descriptor::ExtensionConfig;
use crate::exception::Exception;
use crate::param::DEFAULT_NAMESPACE;
use crate::protocol::ProtocolKind;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    port: u16,
    local: bool,
    #[serde(default)]
    worker_threads: usize,
    #[serde(default = "default_buffer_size")]
    buffer_size: usize,
    #[serde(default = "default_max_request_size")]
    max_request_size: usize,
    #[serde(default = "ProtocolKind::defaults")]
    protocols: Vec<ProtocolKind>,
    #[serde(default = "default_service_namespace")]
    service_namespace: String,
    /// 对全部方法生效的服务级扩展
    #[serde(default)]
    extensions: Vec<ExtensionConfig>,
}

fn default_buffer_size() -> usize {
    4096
}

fn default_max_request_size() -> usize {
    1048576 // 1MB
}

fn default_service_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            port: 7878,
            local: true,
            worker_threads: 0,
            buffer_size: default_buffer_size(),
            max_request_size: default_max_request_size(),
            protocols: ProtocolKind::defaults(),
            service_namespace: default_service_namespace(),
            extensions: Vec::new(),
        }
    }

    /// 读取 TOML 配置；文件不可读时报错，内容无法解析时记录错误并使用默认配置
    pub fn from_toml(filename: &str) -> Result<Self, Exception> {
        let mut file = File::open(filename)
            .map_err(|e| Exception::Config(format!("cannot open {}: {}", filename, e)))?;
        let mut str_val = String::new();
        file.read_to_string(&mut str_val)
            .map_err(|e| Exception::Config(format!("cannot read {}: {}", filename, e)))?;

        let mut raw_config = match toml::from_str::<Config>(&str_val) {
            Ok(t) => t,
            Err(e) => {
                error!("无法成功从配置文件构建配置对象，使用默认配置：{}", e);
                Config::new()
            }
        };
        if raw_config.worker_threads == 0 {
            raw_config.worker_threads = num_cpus::get();
        }
        if raw_config.buffer_size == 0 {
            warn!("buffer_size被设置为0，将改为默认值{}。", default_buffer_size());
            raw_config.buffer_size = default_buffer_size();
        }
        Ok(raw_config)
    }

    pub fn with_protocols(mut self, protocols: Vec<ProtocolKind>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn with_extension(mut self, extension: ExtensionConfig) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn max_request_size(&self) -> usize {
        self.max_request_size
    }

    pub fn protocols(&self) -> &[ProtocolKind] {
        &self.protocols
    }

    pub fn service_namespace(&self) -> &str {
        &self.service_namespace
    }

    pub fn extensions(&self) -> &[ExtensionConfig] {
        &self.extensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_full_config() {
        let file = write_config(
            r#"
port = 9000
local = false
worker_threads = 3
buffer_size = 512
protocols = ["HttpSoap", "HttpPost"]
service_namespace = "urn:calc"

[[extensions]]
kind = "compression"
priority = 5
settings = { encoding = "br" }
"#,
        );
        let config = Config::from_toml(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.port(), 9000);
        assert!(!config.local());
        assert_eq!(config.worker_threads(), 3);
        assert_eq!(config.buffer_size(), 512);
        assert_eq!(config.protocols(), &[ProtocolKind::HttpSoap, ProtocolKind::HttpPost]);
        assert_eq!(config.service_namespace(), "urn:calc");
        assert_eq!(config.extensions()[0].kind, "compression");
        assert_eq!(config.extensions()[0].priority, 5);
        assert_eq!(config.extensions()[0].settings.get("encoding").map(|s| s.as_str()), Some("br"));
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let file = write_config("port = 8080\nlocal = true\n");
        let config = Config::from_toml(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.port(), 8080);
        assert!(config.worker_threads() > 0);
        assert_eq!(config.buffer_size(), 4096);
        assert_eq!(config.protocols(), ProtocolKind::defaults().as_slice());
        assert!(config.extensions().is_empty());
    }

    #[test]
    fn test_unparsable_file_falls_back() {
        let file = write_config("port = \"not a number\"");
        let config = Config::from_toml(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.port(), 7878);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(matches!(
            Config::from_toml("/nonexistent/soapbind.toml"),
            Err(Exception::Config(_))
        ));
    }
}
