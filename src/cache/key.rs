use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};
use std::fmt;

/// Keys longer than this are collapsed to a digest
const MAX_READABLE_KEY_LEN: usize = 200;

/// Deterministic fingerprint of a request, used for caching and deduplication.
///
/// Renders as `namespace:name=value&name=value` with parameters sorted by name,
/// so the same logical request always maps to the same key regardless of the
/// order its parameters were supplied in.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq)]
pub struct RequestKey {
    namespace: String,
    params: Vec<(String, String)>,
}

impl RequestKey {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            params: Vec::new(),
        }
    }

    /// Add a parameter; names are case-insensitive
    pub fn param(mut self, name: impl AsRef<str>, value: impl fmt::Display) -> Self {
        self.params
            .push((name.as_ref().trim().to_ascii_lowercase(), value.to_string()));
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Render the cache key
    pub fn fingerprint(&self) -> String {
        let mut params = self.params.clone();
        params.sort();

        let query = params
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("&");

        let readable = if query.is_empty() {
            self.namespace.clone()
        } else {
            format!("{}:{}", self.namespace, query)
        };

        if readable.len() <= MAX_READABLE_KEY_LEN {
            return readable;
        }

        // Keep the namespace readable so pattern invalidation still works
        let digest = Sha256::digest(query.as_bytes());
        format!("{}:#{}", self.namespace, URL_SAFE_NO_PAD.encode(digest))
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

impl From<RequestKey> for String {
    fn from(key: RequestKey) -> Self {
        key.fingerprint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_order_does_not_matter() {
        let a = RequestKey::new("quote").param("symbol", "AAPL").param("range", "1d");
        let b = RequestKey::new("quote").param("range", "1d").param("symbol", "AAPL");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), "quote:range=1d&symbol=AAPL");
    }

    #[test]
    fn test_param_names_are_case_insensitive() {
        let a = RequestKey::new("quote").param("Symbol", "AAPL");
        let b = RequestKey::new("quote").param("symbol", "AAPL");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_values_distinguish_keys() {
        let a = RequestKey::new("quote").param("symbol", "AAPL");
        let b = RequestKey::new("quote").param("symbol", "MSFT");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_namespace_only() {
        assert_eq!(RequestKey::new("market-status").fingerprint(), "market-status");
    }

    #[test]
    fn test_long_keys_are_digested() {
        let symbols: Vec<String> = (0..80).map(|i| format!("SYM{}", i)).collect();
        let key = RequestKey::new("batch").param("symbols", symbols.join(","));

        let fingerprint = key.fingerprint();
        assert!(fingerprint.starts_with("batch:#"));
        assert!(fingerprint.len() < MAX_READABLE_KEY_LEN);
        assert_eq!(fingerprint, key.clone().fingerprint());
    }
}
