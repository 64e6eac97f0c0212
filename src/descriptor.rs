//! # 服务元数据
//!
//! 方法描述表在启动时一次性构建，之后只读共享。协议实例通过 `MethodId`
//! 引用其中的 `MethodDescriptor`，从不复制。

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

use crate::param::DEFAULT_NAMESPACE;
use crate::value::{ReturnType, TypeTag};

/// 形参描述
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterInfo {
    pub name: String,
    pub type_tag: TypeTag,
    pub is_array: bool,
}

impl ParameterInfo {
    pub fn new(name: &str, type_tag: TypeTag) -> Self {
        Self {
            name: name.to_string(),
            type_tag,
            is_array: false,
        }
    }

    pub fn array(name: &str, type_tag: TypeTag) -> Self {
        Self {
            name: name.to_string(),
            type_tag,
            is_array: true,
        }
    }
}

/// 文本返回值的捕获规则
#[derive(Debug, Clone, PartialEq)]
pub struct MatchSpec {
    /// 正则表达式模式
    pub pattern: String,
    /// 取值的捕获组下标，0 表示整个匹配
    pub group: usize,
    /// 数组返回值最多收集的匹配数，`None` 表示不限
    pub max_repeats: Option<usize>,
    pub ignore_case: bool,
}

impl MatchSpec {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            group: 1,
            max_repeats: None,
            ignore_case: false,
        }
    }

    pub fn group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    pub fn max_repeats(mut self, max: usize) -> Self {
        self.max_repeats = Some(max);
        self
    }

    pub fn ignore_case(mut self) -> Self {
        self.ignore_case = true;
        self
    }
}

/// 客户端读取 HTTP-GET/POST 响应时采用的返回值格式
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnFormat {
    /// XML 序列化的返回值
    Xml,
    /// 用正则从纯文本中提取
    Text(MatchSpec),
    /// 直接把响应正文交给调用方
    Passthrough,
}

/// 以配置声明的扩展（取代特性标注）
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExtensionConfig {
    /// 在 `ExtensionRegistry` 中注册的扩展类型名
    pub kind: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl ExtensionConfig {
    pub fn new(kind: &str, priority: i32) -> Self {
        Self {
            kind: kind.to_string(),
            priority,
            settings: BTreeMap::new(),
        }
    }

    pub fn with_setting(mut self, key: &str, value: &str) -> Self {
        self.settings.insert(key.to_string(), value.to_string());
        self
    }
}

/// 方法在描述表中的下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub usize);

/// 一个可远程调用的方法
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    pub id: MethodId,
    pub name: String,
    pub parameters: Vec<ParameterInfo>,
    /// `None` 表示无返回值
    pub return_type: Option<ReturnType>,
    pub return_format: ReturnFormat,
    pub one_way: bool,
    /// SOAP 动作标识
    pub action: String,
    /// 方法级扩展，优先于服务级扩展
    pub extensions: Vec<ExtensionConfig>,
}

impl MethodDescriptor {
    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    /// SOAP 响应包装元素名
    pub fn response_element(&self) -> String {
        format!("{}Response", self.name)
    }

    /// 返回值元素名
    pub fn result_element(&self) -> String {
        format!("{}Result", self.name)
    }
}

/// 构建 `MethodDescriptor` 的构建器
pub struct MethodBuilder {
    name: String,
    parameters: Vec<ParameterInfo>,
    return_type: Option<ReturnType>,
    return_format: ReturnFormat,
    one_way: bool,
    action: Option<String>,
    extensions: Vec<ExtensionConfig>,
}

impl MethodBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parameters: Vec::new(),
            return_type: None,
            return_format: ReturnFormat::Xml,
            one_way: false,
            action: None,
            extensions: Vec::new(),
        }
    }

    pub fn param(mut self, parameter: ParameterInfo) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn returns(mut self, return_type: ReturnType) -> Self {
        self.return_type = Some(return_type);
        self
    }

    pub fn return_format(mut self, format: ReturnFormat) -> Self {
        self.return_format = format;
        self
    }

    pub fn one_way(mut self) -> Self {
        self.one_way = true;
        self
    }

    pub fn action(mut self, action: &str) -> Self {
        self.action = Some(action.to_string());
        self
    }

    pub fn extension(mut self, extension: ExtensionConfig) -> Self {
        self.extensions.push(extension);
        self
    }
}

/// 服务描述表：方法按声明顺序编号
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub namespace: String,
    methods: Vec<MethodDescriptor>,
    /// 服务级扩展
    pub extensions: Vec<ExtensionConfig>,
}

impl ServiceDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            methods: Vec::new(),
            extensions: Vec::new(),
        }
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn extension(mut self, extension: ExtensionConfig) -> Self {
        self.extensions.push(extension);
        self
    }

    /// 追加方法；未声明动作时按 `命名空间 + 方法名` 生成。
    pub fn method(mut self, builder: MethodBuilder) -> Self {
        let id = MethodId(self.methods.len());
        let action = builder.action.unwrap_or_else(|| {
            let mut ns = self.namespace.clone();
            if !ns.ends_with('/') {
                ns.push('/');
            }
            format!("{}{}", ns, builder.name)
        });
        self.methods.push(MethodDescriptor {
            id,
            name: builder.name,
            parameters: builder.parameters,
            return_type: builder.return_type,
            return_format: builder.return_format,
            one_way: builder.one_way,
            action,
            extensions: builder.extensions,
        });
        self
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    pub fn get(&self, id: MethodId) -> Option<&MethodDescriptor> {
        self.methods.get(id.0)
    }

    pub fn by_name(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// 按 SOAP 动作查找，两侧的引号会被忽略
    pub fn by_action(&self, action: &str) -> Option<&MethodDescriptor> {
        let action = action.trim().trim_matches('"');
        if action.is_empty() {
            return None;
        }
        self.methods.iter().find(|m| m.action == action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> ServiceDescriptor {
        ServiceDescriptor::new("Calculator")
            .namespace("urn:calc")
            .method(
                MethodBuilder::new("Add")
                    .param(ParameterInfo::new("a", TypeTag::Int))
                    .param(ParameterInfo::new("b", TypeTag::Int))
                    .returns(ReturnType::scalar(TypeTag::Int)),
            )
            .method(MethodBuilder::new("Ping").one_way().action("urn:ping"))
    }

    #[test]
    fn test_method_ids_follow_declaration_order() {
        let service = calculator();
        assert_eq!(service.by_name("Add").unwrap().id, MethodId(0));
        assert_eq!(service.by_name("Ping").unwrap().id, MethodId(1));
        assert_eq!(service.get(MethodId(1)).unwrap().name, "Ping");
    }

    #[test]
    fn test_default_action() {
        let service = calculator();
        assert_eq!(service.by_name("Add").unwrap().action, "urn:calc/Add");
        assert_eq!(service.by_action("\"urn:calc/Add\"").unwrap().name, "Add");
        assert_eq!(service.by_action("urn:ping").unwrap().name, "Ping");
        assert!(service.by_action("").is_none());
    }

    #[test]
    fn test_element_names() {
        let service = calculator();
        let add = service.by_name("Add").unwrap();
        assert_eq!(add.response_element(), "AddResponse");
        assert_eq!(add.result_element(), "AddResult");
        assert_eq!(add.parameter_names(), vec!["a", "b"]);
    }
}
