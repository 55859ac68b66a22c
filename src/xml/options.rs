/// How element names become keys in the produced records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagCase {
    /// `<row>` becomes `ROW`
    #[default]
    Upper,
    /// Names are kept as written
    Preserve,
}

/// Shape of the records produced from XML.
///
/// Shared by the whole-document parser and the streaming row extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserOptions {
    /// Represent every child element as a sequence, even a single one (default: false).
    pub always_array: bool,
    /// Prefix that marks attribute keys (default: `$`).
    pub attribute_prefix: String,
    /// Case applied to element names (default: upper).
    pub tag_case: TagCase,
    /// Key for the text of an element that also has attributes or children (default: `_`).
    pub text_key: String,
    /// Maximum rows per streamed batch (default: 1000).
    pub batch_size: usize,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            always_array: false,
            attribute_prefix: "$".to_string(),
            tag_case: TagCase::Upper,
            text_key: "_".to_string(),
            batch_size: 1000,
        }
    }
}

impl ParserOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_always_array(mut self, always_array: bool) -> Self {
        self.always_array = always_array;
        self
    }

    pub fn with_attribute_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.attribute_prefix = prefix.into();
        self
    }

    pub fn with_tag_case(mut self, tag_case: TagCase) -> Self {
        self.tag_case = tag_case;
        self
    }

    pub fn with_text_key(mut self, text_key: impl Into<String>) -> Self {
        self.text_key = text_key.into();
        self
    }

    /// Set the batch size; zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub(crate) fn tag_key(&self, name: &str) -> String {
        match self.tag_case {
            TagCase::Upper => name.to_uppercase(),
            TagCase::Preserve => name.to_string(),
        }
    }

    pub(crate) fn attribute_key(&self, name: &str) -> String {
        format!("{}{}", self.attribute_prefix, name)
    }
}
