//! # 最小化的 XML 元素树
//!
//! 基于 `quick-xml` 的命名空间感知读取器，把正文一次性解析为元素树，
//! 供 SOAP 信封与 XML 序列化器做结构化解码。
//!
//! 严格度规则：来自已识别协议命名空间（SOAP 信封、XSI、xmlns、xml）的
//! 未知元素和属性被静默忽略，其余未知项一律报错。

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;

use crate::exception::Exception;
use crate::param::{SOAP11_ENVELOPE_NS, SOAP12_ENVELOPE_NS, XML_NS, XMLNS_NS, XSI_NS};

#[derive(Debug, Clone, PartialEq)]
pub struct XmlAttribute {
    pub namespace: Option<String>,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct XmlElement {
    pub namespace: Option<String>,
    pub name: String,
    pub attributes: Vec<XmlAttribute>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

/// 命名空间是否属于协议本身（其中的未知项可以忽略）
pub fn is_protocol_namespace(namespace: Option<&str>) -> bool {
    matches!(
        namespace,
        Some(SOAP11_ENVELOPE_NS) | Some(SOAP12_ENVELOPE_NS) | Some(XSI_NS) | Some(XMLNS_NS) | Some(XML_NS)
    )
}

impl XmlElement {
    pub fn is(&self, namespace: Option<&str>, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == namespace
    }

    pub fn attribute(&self, namespace: Option<&str>, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name && a.namespace.as_deref() == namespace)
            .map(|a| a.value.as_str())
    }

    /// `xsi:nil="true"`
    pub fn is_nil(&self) -> bool {
        matches!(self.attribute(Some(XSI_NS), "nil"), Some("true") | Some("1"))
    }

    /// 第一个子元素
    pub fn first_child(&self) -> Option<&XmlElement> {
        self.children.first()
    }

    /// 检查属性：无命名空间的属性必须出现在 `allowed` 中，协议命名空间中的属性被忽略。
    pub fn check_attributes(&self, allowed: &[&str]) -> Result<(), Exception> {
        for attr in &self.attributes {
            if is_protocol_namespace(attr.namespace.as_deref()) {
                continue;
            }
            if attr.namespace.is_none() && allowed.contains(&attr.name.as_str()) {
                continue;
            }
            return Err(Exception::UnexpectedAttribute {
                element: self.name.clone(),
                name: attr.name.clone(),
                namespace: attr.namespace.clone(),
                expected: allowed.iter().map(|a| a.to_string()).collect(),
            });
        }
        Ok(())
    }

    /// 把子节点重新序列化为 XML 文本；没有子元素时返回转义后的文本内容
    pub fn inner_xml(&self) -> String {
        let mut out = String::new();
        if self.children.is_empty() {
            out.push_str(&escape(&self.text));
        } else {
            for child in &self.children {
                child.write_to(&mut out, self.namespace.as_deref());
            }
        }
        out
    }

    fn write_to(&self, out: &mut String, parent_ns: Option<&str>) {
        out.push('<');
        out.push_str(&self.name);
        if self.namespace.as_deref() != parent_ns {
            out.push_str(&format!(
                " xmlns=\"{}\"",
                escape(self.namespace.as_deref().unwrap_or(""))
            ));
        }
        for attr in self.attributes.iter().filter(|a| a.namespace.is_none()) {
            out.push_str(&format!(" {}=\"{}\"", attr.name, escape(&attr.value)));
        }
        if self.is_nil() {
            out.push_str(&format!(" xmlns:xsi=\"{}\" xsi:nil=\"true\"", XSI_NS));
        }
        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
        } else {
            out.push('>');
            out.push_str(&self.inner_xml());
            out.push_str("</");
            out.push_str(&self.name);
            out.push('>');
        }
    }

    /// 构造“意外元素”错误，附带可接受的名称列表
    pub fn unexpected(&self, expected: &[String]) -> Exception {
        Exception::UnexpectedElement {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            expected: expected.to_vec(),
        }
    }
}

fn owned_namespace(resolved: &ResolveResult) -> Result<Option<String>, Exception> {
    match resolved {
        ResolveResult::Bound(ns) => Ok(Some(String::from_utf8_lossy(ns.as_ref()).into_owned())),
        ResolveResult::Unbound => Ok(None),
        ResolveResult::Unknown(prefix) => Err(Exception::MalformedXml(format!(
            "unknown namespace prefix '{}'",
            String::from_utf8_lossy(prefix)
        ))),
    }
}

fn start_element(
    reader: &NsReader<&[u8]>,
    namespace: Option<String>,
    start: &BytesStart,
) -> Result<XmlElement, Exception> {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| Exception::MalformedXml(e.to_string()))?;
        if attr.key.as_namespace_binding().is_some() {
            continue;
        }
        let (resolved, local) = reader.resolve_attribute(attr.key);
        let namespace = owned_namespace(&resolved)?;
        attributes.push(XmlAttribute {
            namespace,
            name: String::from_utf8_lossy(local.as_ref()).into_owned(),
            value: attr.unescape_value()?.into_owned(),
        });
    }
    Ok(XmlElement {
        namespace,
        name,
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

fn attach(
    stack: &mut Vec<XmlElement>,
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), Exception> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(element);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(element);
            Ok(())
        }
        None => Err(Exception::MalformedXml(
            "multiple root elements".to_string(),
        )),
    }
}

/// 将完整的 XML 文档解析为元素树
pub fn parse_document(bytes: &[u8]) -> Result<XmlElement, Exception> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Exception::MalformedXml(format!("body is not UTF-8: {}", e)))?;
    let mut reader = NsReader::from_str(text);
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        let (namespace, event) = {
            let (resolved, event) = reader.read_resolved_event()?;
            (owned_namespace(&resolved)?, event)
        };
        match event {
            Event::Start(e) => {
                let element = start_element(&reader, namespace, &e)?;
                stack.push(element);
            }
            Event::Empty(e) => {
                let element = start_element(&reader, namespace, &e)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| Exception::MalformedXml("unbalanced end tag".to_string()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(Exception::MalformedXml("unexpected end of document".to_string()));
    }
    root.ok_or_else(|| Exception::MalformedXml("document has no root element".to_string()))
}

/// 转义文本与属性值中的 XML 特殊字符
pub fn escape(text: &str) -> String {
    quick_xml::escape::escape(text).into_owned()
}
