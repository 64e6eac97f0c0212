//! 调用参数与返回值的值模型。

use std::fmt;

use crate::exception::Exception;
use crate::util::{format_scalar, parse_scalar};

/// 形参与返回值的类型标签。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    String,
    Int,
    Double,
    Bool,
    /// 只能由 XML 序列化器处理的结构化值，URL 与表单编解码器不支持。
    Xml,
}

impl TypeTag {
    /// 该类型能否以单个字符串表示（URL 与表单编码的前提）。
    pub fn is_scalar(&self) -> bool {
        !matches!(self, TypeTag::Xml)
    }

    /// XML Schema 中的类型名，同时用作数组元素的元素名。
    pub fn xml_name(&self) -> &'static str {
        match self {
            TypeTag::String => "string",
            TypeTag::Int => "int",
            TypeTag::Double => "double",
            TypeTag::Bool => "boolean",
            TypeTag::Xml => "anyType",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.xml_name())
    }
}

/// 方法返回值的声明类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnType {
    pub tag: TypeTag,
    pub is_array: bool,
    /// 为真时允许返回空值，文本模式匹配失败时返回 `Value::Null` 而不是报错。
    pub nullable: bool,
}

impl ReturnType {
    pub fn scalar(tag: TypeTag) -> Self {
        Self {
            tag,
            is_array: false,
            nullable: false,
        }
    }

    pub fn array(tag: TypeTag) -> Self {
        Self {
            tag,
            is_array: true,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// 一次调用中流转的参数值或返回值。
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Str(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    Array(Vec<Value>),
    /// 原样保留的 XML 片段（对应 `TypeTag::Xml`）。
    Xml(String),
}

impl Value {
    /// 按标量类型解析字符串，使用与区域设置无关的格式。
    pub fn parse(name: &str, text: &str, tag: TypeTag) -> Result<Value, Exception> {
        parse_scalar(name, text, tag)
    }

    /// 将标量值转换为线路上的字符串表示。
    pub fn to_wire_string(&self) -> Option<String> {
        format_scalar(self)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// 客户端读取返回值得到的结果。
///
/// `Stream` 表示透传：响应正文交由调用方继续读取并负责关闭。
pub enum ReturnValue {
    None,
    Value(Value),
    Stream(Box<dyn std::io::Read + Send>),
}

impl ReturnValue {
    /// 取出已解码的值；透传流与无返回值都得到 `None`。
    pub fn into_value(self) -> Option<Value> {
        match self {
            ReturnValue::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Debug for ReturnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnValue::None => write!(f, "None"),
            ReturnValue::Value(v) => write!(f, "Value({:?})", v),
            ReturnValue::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}
