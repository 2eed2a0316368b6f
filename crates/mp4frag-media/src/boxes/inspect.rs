//! Box tree dumpers.

use super::BoxType;
use serde_json::{Map, Value};
use std::fmt::{self, Write as _};

/// Visitor receiving a box tree in document order.
pub trait Inspector {
    fn start_box(&mut self, box_type: BoxType, size: u64);
    fn field(&mut self, name: &str, value: &dyn fmt::Display);
    fn end_box(&mut self);
}

/// Indented human-readable dump.
#[derive(Debug, Default)]
pub struct TextInspector {
    out: String,
    depth: usize,
}

impl TextInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_string(self) -> String {
        self.out
    }
}

impl Inspector for TextInspector {
    fn start_box(&mut self, box_type: BoxType, size: u64) {
        let _ = writeln!(self.out, "{:indent$}[{}] size={}", "", box_type, size, indent = self.depth * 2);
        self.depth += 1;
    }

    fn field(&mut self, name: &str, value: &dyn fmt::Display) {
        let _ = writeln!(self.out, "{:indent$}{} = {}", "", name, value, indent = self.depth * 2);
    }

    fn end_box(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }
}

/// JSON dump: one object per box with its fields and a `children` array.
#[derive(Debug, Default)]
pub struct JsonInspector {
    stack: Vec<Map<String, Value>>,
    roots: Vec<Value>,
}

impl JsonInspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Top-level boxes seen so far.
    pub fn into_value(self) -> Value {
        Value::Array(self.roots)
    }
}

fn json_value(value: &dyn fmt::Display) -> Value {
    let text = value.to_string();
    if let Ok(n) = text.parse::<u64>() {
        Value::from(n)
    } else if let Ok(n) = text.parse::<i64>() {
        Value::from(n)
    } else {
        Value::String(text)
    }
}

impl Inspector for JsonInspector {
    fn start_box(&mut self, box_type: BoxType, size: u64) {
        let mut node = Map::new();
        node.insert("type".into(), Value::String(box_type.to_string()));
        node.insert("size".into(), Value::from(size));
        self.stack.push(node);
    }

    fn field(&mut self, name: &str, value: &dyn fmt::Display) {
        let Some(node) = self.stack.last_mut() else {
            return;
        };
        let value = json_value(value);
        match node.get_mut(name) {
            // Repeated fields (table entries) collect into an array.
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                node.insert(name.to_string(), value);
            }
        }
    }

    fn end_box(&mut self) {
        let Some(node) = self.stack.pop() else {
            return;
        };
        let node = Value::Object(node);
        match self.stack.last_mut() {
            Some(parent) => {
                let children = parent
                    .entry("children")
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(items) = children {
                    items.push(node);
                }
            }
            None => self.roots.push(node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::{ContainerBox, MfhdBox, Mp4Box};

    fn moof() -> Mp4Box {
        let mut moof = ContainerBox::new(BoxType::MOOF);
        moof.add_child(MfhdBox { sequence_number: 3 });
        moof.into()
    }

    #[test]
    fn test_text_dump_indents_children() {
        let mut inspector = TextInspector::new();
        moof().inspect(&mut inspector);
        let text = inspector.into_string();
        assert_eq!(
            text,
            "[moof] size=24\n  [mfhd] size=16\n    sequence_number = 3\n"
        );
    }

    #[test]
    fn test_json_dump_nests_children() {
        let mut inspector = JsonInspector::new();
        moof().inspect(&mut inspector);
        let value = inspector.into_value();
        assert_eq!(value[0]["type"], "moof");
        assert_eq!(value[0]["children"][0]["type"], "mfhd");
        assert_eq!(value[0]["children"][0]["sequence_number"], 3);
    }
}
