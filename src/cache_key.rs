//! Result store keys derived from resize requests.

use crate::size::Size;
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::fmt;

/// Key under which a derivative is stored.
///
/// Built from the parsed request, never from the raw path string: the size
/// segment comes from [`Size`] and the source from its serialized [`Url`],
/// whose path is cleaned on its own. Query strings are kept verbatim, so
/// nothing after `?` can reach back into the size, host or scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    path: String,
    hash: String,
}

impl CacheKey {
    /// Key for a resize of `source` to `size`, e.g.
    /// `100x100/http://example.com/cat.png`.
    pub fn for_resize(size: Size, source: &Url) -> Self {
        let mut source = source.clone();
        source.set_fragment(None);
        // dot segments are already resolved by the URL parser
        let cleaned = format!("/{}", clean_path(source.path()));
        source.set_path(&cleaned);
        Self::new(&format!("{}/{}", size, source))
    }

    /// Key from an already normalized path, taken as is.
    pub fn new(path: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        let hash = hex::encode(hasher.finalize());
        Self { path: path.to_string(), hash }
    }

    /// The key path, used verbatim as the object key.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Hex SHA-256 of the path, for backends that need filesystem-safe names.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Lexical path cleaning: drops empty and `.` segments and resolves `..`
/// against the preceding segment. The result never starts with `/`.
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => { segments.pop(); }
            s => segments.push(s),
        }
    }
    segments.join("/")
}
