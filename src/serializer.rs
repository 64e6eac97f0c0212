//! # 参数编组接口
//!
//! `Serializer` 是结构化值与 XML 之间的转换接口。`XmlSerializer` 是针对
//! `Value` 的默认实现：在初始化阶段按元素名、命名空间与类型构建一次，
//! 之后在每次调用中只读复用。

use std::io::{Read, Write};

use crate::descriptor::{MethodDescriptor, ParameterInfo};
use crate::exception::Exception;
use crate::param::XSI_NS;
use crate::util::parse_scalar;
use crate::value::{TypeTag, Value};
use crate::xml::{escape, is_protocol_namespace, parse_document, XmlElement};

pub trait Serializer: Send + Sync {
    fn serialize(&self, writer: &mut dyn Write, value: &Value) -> Result<(), Exception>;
    fn deserialize(&self, reader: &mut dyn Read) -> Result<Value, Exception>;
}

/// 单个元素的结构化序列化器
#[derive(Debug, Clone, PartialEq)]
pub struct XmlSerializer {
    element: String,
    namespace: Option<String>,
    tag: TypeTag,
    is_array: bool,
}

impl XmlSerializer {
    pub fn new(element: &str, namespace: Option<&str>, tag: TypeTag, is_array: bool) -> Self {
        Self {
            element: element.to_string(),
            namespace: namespace.map(|s| s.to_string()),
            tag,
            is_array,
        }
    }

    pub fn for_parameter(parameter: &ParameterInfo, namespace: &str) -> Self {
        Self::new(
            &parameter.name,
            Some(namespace),
            parameter.type_tag,
            parameter.is_array,
        )
    }

    /// 返回值序列化器；无返回值的方法返回 `None`
    pub fn for_return(method: &MethodDescriptor, namespace: &str) -> Option<Self> {
        method.return_type.map(|rt| {
            Self::new(&method.result_element(), Some(namespace), rt.tag, rt.is_array)
        })
    }

    pub fn element(&self) -> &str {
        &self.element
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// 写出元素；与父元素命名空间相同则不重复声明
    pub fn write_element(
        &self,
        out: &mut String,
        value: &Value,
        parent_ns: Option<&str>,
    ) -> Result<(), Exception> {
        out.push('<');
        out.push_str(&self.element);
        if self.namespace.as_deref() != parent_ns {
            out.push_str(&format!(
                " xmlns=\"{}\"",
                escape(self.namespace.as_deref().unwrap_or(""))
            ));
        }
        match value {
            Value::Null => {
                out.push_str(&format!(" xmlns:xsi=\"{}\" xsi:nil=\"true\"/>", XSI_NS));
                return Ok(());
            }
            Value::Array(items) if self.is_array => {
                out.push('>');
                let item = self.tag.xml_name();
                for v in items {
                    out.push_str(&format!("<{}>", item));
                    self.write_scalar(out, v)?;
                    out.push_str(&format!("</{}>", item));
                }
            }
            v if !self.is_array => {
                out.push('>');
                self.write_scalar(out, v)?;
            }
            v => {
                return Err(Exception::InvalidValue {
                    name: self.element.clone(),
                    value: format!("{:?}", v),
                    type_name: "array",
                })
            }
        }
        out.push_str("</");
        out.push_str(&self.element);
        out.push('>');
        Ok(())
    }

    fn write_scalar(&self, out: &mut String, value: &Value) -> Result<(), Exception> {
        match (self.tag, value) {
            (TypeTag::Xml, Value::Xml(raw)) => out.push_str(raw),
            (_, v @ (Value::Array(_) | Value::Null)) => {
                return Err(Exception::InvalidValue {
                    name: self.element.clone(),
                    value: format!("{:?}", v),
                    type_name: self.tag.xml_name(),
                })
            }
            (_, v) => {
                let text = v.to_wire_string().unwrap_or_default();
                out.push_str(&escape(&text));
            }
        }
        Ok(())
    }

    /// 从已解析的元素中读取值
    pub fn read_element(&self, element: &XmlElement) -> Result<Value, Exception> {
        element.check_attributes(&[])?;
        if element.is_nil() {
            return Ok(Value::Null);
        }
        if self.is_array {
            let item = self.tag.xml_name();
            let mut values = Vec::new();
            for child in &element.children {
                if child.name != item {
                    if is_protocol_namespace(child.namespace.as_deref()) {
                        continue;
                    }
                    return Err(child.unexpected(&[item.to_string()]));
                }
                values.push(self.read_scalar(child)?);
            }
            return Ok(Value::Array(values));
        }
        self.read_scalar(element)
    }

    fn read_scalar(&self, element: &XmlElement) -> Result<Value, Exception> {
        if self.tag == TypeTag::Xml {
            return Ok(Value::Xml(element.inner_xml()));
        }
        if element.is_nil() {
            return Ok(Value::Null);
        }
        if let Some(child) = element
            .children
            .iter()
            .find(|c| !is_protocol_namespace(c.namespace.as_deref()))
        {
            return Err(child.unexpected(&[]));
        }
        parse_scalar(&element.name, &element.text, self.tag)
    }
}

impl Serializer for XmlSerializer {
    fn serialize(&self, writer: &mut dyn Write, value: &Value) -> Result<(), Exception> {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>");
        self.write_element(&mut out, value, None)?;
        writer.write_all(out.as_bytes())?;
        Ok(())
    }

    fn deserialize(&self, reader: &mut dyn Read) -> Result<Value, Exception> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let root = parse_document(&bytes)?;
        if root.name != self.element || root.namespace != self.namespace {
            return Err(root.unexpected(&[self.element.clone()]));
        }
        self.read_element(&root)
    }
}
