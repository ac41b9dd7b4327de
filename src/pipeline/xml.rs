// 消息体里的 XML 片段只做定向取值：元素文本与属性，解析失败保留已读到的部分。
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader as XmlReader;
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct XmlFields {
    texts: HashMap<String, String>,
    attrs: HashMap<String, String>,
}

impl XmlFields {
    /// 元素文本，首个出现的同名元素生效。
    pub fn text(&self, tag: &str) -> Option<&str> {
        self.texts
            .get(tag)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// 属性值；`name` 可写成 `tag.attr` 限定元素，或只写 `attr`。
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn attr_u64(&self, name: &str) -> Option<u64> {
        self.attr(name)
            .and_then(|value| value.trim().parse::<u64>().ok())
    }

    /// 依次尝试属性与元素文本，返回第一个非空值。
    pub fn first(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .find_map(|name| self.attr(name).or_else(|| self.text(name)))
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty() && self.attrs.is_empty()
    }

    fn record_attrs(&mut self, event: &BytesStart<'_>) {
        let tag = String::from_utf8_lossy(event.local_name().as_ref()).to_string();
        for attr in event.attributes().flatten() {
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
            let value = match attr.unescape_value() {
                Ok(value) => value.trim().to_string(),
                Err(_) => String::from_utf8_lossy(attr.value.as_ref()).trim().to_string(),
            };
            self.attrs
                .entry(format!("{tag}.{key}"))
                .or_insert_with(|| value.clone());
            self.attrs.entry(key).or_insert(value);
        }
    }
}

pub fn parse_lenient(xml: &str) -> XmlFields {
    let mut fields = XmlFields::default();
    let trimmed = xml.trim();
    if !trimmed.starts_with('<') {
        return fields;
    }
    let mut reader = XmlReader::from_str(trimmed);
    reader.trim_text(true);
    reader.check_end_names(false);
    let mut buffer = Vec::new();
    let mut current_tag: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buffer) {
            Ok(Event::Start(event)) => {
                fields.record_attrs(&event);
                current_tag =
                    Some(String::from_utf8_lossy(event.local_name().as_ref()).to_string());
            }
            Ok(Event::Empty(event)) => {
                fields.record_attrs(&event);
                current_tag = None;
            }
            Ok(Event::Text(event)) => {
                if let Some(tag) = current_tag.take() {
                    let text = match event.unescape() {
                        Ok(text) => text.trim().to_string(),
                        Err(_) => String::from_utf8_lossy(&event).trim().to_string(),
                    };
                    if !text.is_empty() {
                        fields.texts.entry(tag).or_insert(text);
                    }
                }
            }
            Ok(Event::CData(event)) => {
                if let Some(tag) = current_tag.take() {
                    let text = String::from_utf8_lossy(event.as_ref()).trim().to_string();
                    if !text.is_empty() {
                        fields.texts.entry(tag).or_insert(text);
                    }
                }
            }
            Ok(Event::End(_)) => {
                current_tag = None;
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buffer.clear();
    }
    fields
}
