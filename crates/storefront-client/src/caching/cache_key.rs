use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use url::form_urlencoded;

/// The signature of a request, used as key for the response cache and the request coalescer.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(Arc<str>);

impl RequestKey {
    /// Builds the key for a request to `path` with the given query `params`.
    ///
    /// Leading and trailing slashes of the path are ignored. The parameters are appended
    /// url-encoded and sorted by name.
    pub fn new(path: &str, params: &BTreeMap<String, String>) -> Self {
        let mut key = path.trim_matches('/').to_owned();
        if !params.is_empty() {
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(params)
                .finish();
            key.push('?');
            key.push_str(&query);
        }
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl From<&str> for RequestKey {
    fn from(key: &str) -> Self {
        Self(key.into())
    }
}

impl From<String> for RequestKey {
    fn from(key: String) -> Self {
        Self(key.into())
    }
}

impl Borrow<str> for RequestKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RequestKey").field(&&*self.0).finish()
    }
}
