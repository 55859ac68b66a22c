//! Structured records built from XML elements.
//!
//! A [`Node`] maps keys to [`Field`]s. Attribute keys carry the configured
//! prefix (`$id`), child element keys are the case-normalized tag names
//! (`ROW`), and mixed text sits under the text key (`_`). Whether a child
//! key maps to one value or a sequence is decided per parent by the
//! always-array option and the number of occurrences.

use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use super::options::ParserOptions;

/// A normalized element: attributes, text and children by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Node {
    fields: BTreeMap<String, Field>,
}

/// The value(s) stored under one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Field {
    Single(Value),
    Many(Vec<Value>),
}

/// A text value or a nested element
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Text(String),
    Node(Node),
}

/// A streamed record: one closed element matching the target tag.
pub type Row = Node;

/// Rows delivered together; batch boundaries carry no meaning.
pub type RowBatch = Vec<Row>;

impl Node {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Field> {
        self.fields.get(key)
    }

    /// Text stored directly under `key`, such as an attribute value.
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.fields.get(key)? {
            Field::Single(value) => value.as_text(),
            Field::Many(_) => None,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, field: Field) -> Option<Field> {
        self.fields.insert(key.into(), field)
    }

    /// Add `value` under `key`, turning an existing field into a sequence.
    pub fn append(&mut self, key: impl Into<String>, value: Value) {
        match self.fields.entry(key.into()) {
            Entry::Vacant(slot) => {
                slot.insert(Field::Single(value));
            }
            Entry::Occupied(mut slot) => slot.get_mut().push(value),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Convert to a JSON object with the same shape.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl Field {
    /// The only value, or the first of a sequence.
    pub fn first(&self) -> Option<&Value> {
        match self {
            Field::Single(value) => Some(value),
            Field::Many(values) => values.first(),
        }
    }

    /// All values, a single one included.
    pub fn as_slice(&self) -> &[Value] {
        match self {
            Field::Single(value) => std::slice::from_ref(value),
            Field::Many(values) => values,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    pub fn is_many(&self) -> bool {
        matches!(self, Field::Many(_))
    }

    fn push(&mut self, value: Value) {
        let values = match std::mem::replace(self, Field::Many(Vec::new())) {
            Field::Single(first) => vec![first, value],
            Field::Many(mut values) => {
                values.push(value);
                values
            }
        };
        *self = Field::Many(values);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.as_slice().iter()
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Field::Single(value) => value.to_json(),
            Field::Many(values) => values.iter().map(Value::to_json).collect(),
        }
    }
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            Value::Node(_) => None,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Value::Node(node) => Some(node),
            Value::Text(_) => None,
        }
    }

    /// Look up `key` when this value is an element.
    pub fn get(&self, key: &str) -> Option<&Field> {
        self.as_node()?.get(key)
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Text(text) => serde_json::Value::String(text.clone()),
            Value::Node(node) => node.to_json(),
        }
    }
}

/// Accumulates one element's attributes, text and children until it closes.
#[derive(Debug)]
pub(crate) struct ElementBuilder {
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<(String, Value)>,
}

impl ElementBuilder {
    pub(crate) fn new(attributes: Vec<(String, String)>) -> Self {
        Self {
            attributes,
            text: String::new(),
            children: Vec::new(),
        }
    }

    /// Append character data; whitespace-only runs between elements are dropped.
    pub(crate) fn push_text(&mut self, text: &str) {
        if !text.trim().is_empty() {
            self.text.push_str(text);
        }
    }

    /// Append the contents of a CDATA section, whitespace included.
    pub(crate) fn push_cdata(&mut self, text: &str) {
        self.text.push_str(text);
    }

    pub(crate) fn push_child(&mut self, key: String, value: Value) {
        self.children.push((key, value));
    }

    /// The element as a value: bare text when it only holds text.
    pub(crate) fn into_value(self, options: &ParserOptions) -> Value {
        if self.attributes.is_empty() && self.children.is_empty() && !self.text.trim().is_empty() {
            return Value::Text(self.text.trim().to_string());
        }
        Value::Node(self.into_node(options))
    }

    /// The element as a record, applying the arity rule to its children.
    pub(crate) fn into_node(self, options: &ParserOptions) -> Node {
        let mut node = Node::new();

        let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for (key, value) in self.children {
            grouped.entry(key).or_default().push(value);
        }
        for (key, mut values) in grouped {
            let field = if options.always_array || values.len() > 1 {
                Field::Many(values)
            } else {
                match values.pop() {
                    Some(value) => Field::Single(value),
                    None => continue,
                }
            };
            node.insert(key, field);
        }

        // a child or attribute may share the text key; keep every value
        let text = self.text.trim();
        if !text.is_empty() {
            node.append(options.text_key.clone(), Value::Text(text.to_string()));
        }

        for (name, value) in self.attributes {
            node.append(options.attribute_key(&name), Value::Text(value));
        }

        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn single_child_is_bare_unless_always_array() {
        let build = |options: &ParserOptions| {
            let mut parent = ElementBuilder::new(Vec::new());
            parent.push_child(
                "ROW".to_string(),
                ElementBuilder::new(attrs(&[("id", "1")])).into_value(options),
            );
            parent.into_node(options).to_json()
        };

        assert_eq!(build(&ParserOptions::default()), json!({"ROW": {"$id": "1"}}));
        assert_eq!(
            build(&ParserOptions::default().with_always_array(true)),
            json!({"ROW": [{"$id": "1"}]})
        );
    }

    #[test]
    fn repeated_children_form_a_sequence_in_order() {
        let options = ParserOptions::default();
        let mut parent = ElementBuilder::new(Vec::new());
        for id in ["1", "2"] {
            parent.push_child(
                "ROW".to_string(),
                ElementBuilder::new(attrs(&[("id", id)])).into_value(&options),
            );
        }
        let node = parent.into_node(&options);
        let rows = node.get("ROW").unwrap();
        assert!(rows.is_many());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.as_slice()[1].get("$id").unwrap().first().unwrap().as_text(), Some("2"));
    }

    #[test]
    fn text_only_element_is_bare_text() {
        let options = ParserOptions::default();
        let mut name = ElementBuilder::new(Vec::new());
        name.push_text("  Bolt ");
        assert_eq!(name.into_value(&options), Value::Text("Bolt".to_string()));
    }

    #[test]
    fn mixed_text_goes_under_text_key() {
        let options = ParserOptions::default().with_text_key("#text");
        let mut el = ElementBuilder::new(attrs(&[("lang", "en")]));
        el.push_text("hello");
        el.push_text("\n  ");
        let node = el.into_node(&options);
        assert_eq!(node.to_json(), json!({"$lang": "en", "#text": "hello"}));
    }

    #[test]
    fn text_and_child_sharing_the_text_key_are_both_kept() {
        let options = ParserOptions::default();
        let mut item = ElementBuilder::new(Vec::new());
        item.push_text("note");
        item.push_child("_".to_string(), Value::Text("child".to_string()));
        let node = item.into_node(&options);
        assert_eq!(node.to_json(), json!({"_": ["child", "note"]}));
    }

    #[test]
    fn attribute_colliding_with_child_key_is_kept() {
        let options = ParserOptions::default().with_attribute_prefix("");
        let mut row = ElementBuilder::new(attrs(&[("ID", "7")]));
        row.push_child("ID".to_string(), Value::Text("8".to_string()));
        assert_eq!(row.into_node(&options).to_json(), json!({"ID": ["8", "7"]}));
    }

    #[test]
    fn cdata_whitespace_survives_between_text() {
        let options = ParserOptions::default();
        let mut el = ElementBuilder::new(Vec::new());
        el.push_text("foo");
        el.push_cdata(" ");
        el.push_text("bar");
        el.push_text("\n");
        assert_eq!(el.into_value(&options), Value::Text("foo bar".to_string()));
    }

    #[test]
    fn empty_element_is_empty_node() {
        let options = ParserOptions::default();
        assert_eq!(
            ElementBuilder::new(Vec::new()).into_value(&options),
            Value::Node(Node::new())
        );
    }

    #[test]
    fn serializes_like_to_json() {
        let options = ParserOptions::default();
        let mut el = ElementBuilder::new(attrs(&[("a", "1")]));
        el.push_child("B".to_string(), Value::Text("x".to_string()));
        let node = el.into_node(&options);
        assert_eq!(serde_json::to_value(&node).unwrap(), node.to_json());
    }
}
