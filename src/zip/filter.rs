//! Entry selection by file extension.

use std::collections::HashSet;

/// Portion of an archive path after the last directory separator.
///
/// ZIP paths use `/`, but some writers emit `\`, so both are honoured.
pub fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Decides which archive members are exposed to callers.
///
/// Directories are never accepted. Files are accepted when their base
/// name's extension (case-insensitive) is in the configured set, or always
/// when the filter was built with [`EntryFilter::any`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFilter {
    extensions: Option<HashSet<String>>,
}

impl Default for EntryFilter {
    fn default() -> Self {
        Self::xml()
    }
}

impl EntryFilter {
    /// Accept `.xml` files only
    pub fn xml() -> Self {
        Self::with_extensions(["xml"])
    }

    /// Accept every file
    pub fn any() -> Self {
        Self { extensions: None }
    }

    /// Accept files with one of `extensions`, given with or without a leading dot.
    pub fn with_extensions<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Self {
            extensions: Some(extensions),
        }
    }

    /// The base name to expose for `path`, or `None` if it is filtered out.
    pub fn accept<'a>(&self, path: &'a str, is_directory: bool) -> Option<&'a str> {
        if is_directory || path.ends_with('/') {
            return None;
        }
        let name = base_name(path);
        if name.is_empty() {
            return None;
        }
        match &self.extensions {
            None => Some(name),
            Some(extensions) => {
                let (_, ext) = name.rsplit_once('.')?;
                extensions
                    .contains(&ext.to_ascii_lowercase())
                    .then_some(name)
            }
        }
    }
}
