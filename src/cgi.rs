//! CGI (`k=v&k=v`) query-string codec. Last write wins on duplicate keys;
//! values are never escaped or unescaped.

use memchr::memchr;

/// An ordered key/value mapping parsed from (or to be emitted as) a CGI
/// query string. Iteration order is insertion order, matching a map built
/// by repeated assignment during `ImportCGI`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Cgi {
    pairs: Vec<(String, String)>,
}

impl Cgi {
    /// An empty mapping.
    pub fn new() -> Self {
        Cgi { pairs: Vec::new() }
    }

    /// Parse a `k=v&k=v` string. A token with no `=` is stored with an
    /// empty value. Duplicate keys: the last occurrence wins, but keeps
    /// its original position (matching assignment into an existing map
    /// slot).
    pub fn parse(raw: &str) -> Self {
        let mut cgi = Cgi::new();
        if raw.is_empty() {
            return cgi;
        }
        for token in raw.split('&') {
            if token.is_empty() {
                continue;
            }
            let (key, value) = match memchr(b'=', token.as_bytes()) {
                Some(pos) => (&token[..pos], &token[pos + 1..]),
                None => (token, ""),
            };
            cgi.set(key, value);
        }
        cgi
    }

    /// Set `key` to `value`, overwriting any prior value but preserving
    /// the key's original position if it already existed.
    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(existing) = self.pairs.iter_mut().find(|(k, _)| k == key) {
            existing.1 = value.to_string();
        } else {
            self.pairs.push((key.to_string(), value.to_string()));
        }
    }

    /// Look up a key's value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Remove a key, returning its value if present.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.pairs.iter().position(|(k, _)| k == key)?;
        Some(self.pairs.remove(idx).1)
    }

    /// Merge `other` into `self` with last-wins semantics: keys already in
    /// `self` are overwritten, keys only in `other` are appended.
    pub fn merge(&mut self, other: &Cgi) {
        for (k, v) in &other.pairs {
            self.set(k, v);
        }
    }

    /// Iterate over `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Re-emit as a `k=v&k=v` string.
    pub fn emit(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Keys that must never be forwarded from the master's opaque to the data
/// server (stripped after a lazy open's redirect is parsed).
pub const AUTH_KEYS: &[&str] = &[
    "xrd.wantprot",
    "xrd.gsiusrpxy",
    "xrd.k5ccname",
    "xrdcl.secuid",
    "xrdcl.secgid",
];

impl Cgi {
    /// Remove every recognized authentication key, returning the removed
    /// pairs so they can be reattached to a different URL (e.g. Restore's
    /// request).
    pub fn strip_auth_keys(&mut self) -> Vec<(String, String)> {
        let mut removed = Vec::new();
        for key in AUTH_KEYS {
            if let Some(value) = self.remove(key) {
                removed.push((key.to_string(), value));
            }
        }
        removed
    }

    /// True if any recognized authentication key is present.
    pub fn has_auth_keys(&self) -> bool {
        AUTH_KEYS.iter().any(|k| self.get(k).is_some())
    }

    /// Emit only the recognized authentication keys, in `AUTH_KEYS` order,
    /// as a `k=v&k=v` string. Empty if none are present.
    pub fn auth_query(&self) -> String {
        AUTH_KEYS
            .iter()
            .filter_map(|k| self.get(k).map(|v| format!("{k}={v}")))
            .collect::<Vec<_>>()
            .join("&")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_emit_roundtrip() {
        let raw = "mgm.app=fuse&mgm.id=abc&mgm.id=def";
        let cgi = Cgi::parse(raw);
        // last-wins: only one "mgm.id" entry, holding "def"
        assert_eq!(cgi.get("mgm.id"), Some("def"));
        assert_eq!(cgi.get("mgm.app"), Some("fuse"));
        assert_eq!(cgi.iter().count(), 2);
    }

    #[test]
    fn parse_tolerates_empty_leading_token() {
        let cgi = Cgi::parse("&a=1&&b=2");
        assert_eq!(cgi.get("a"), Some("1"));
        assert_eq!(cgi.get("b"), Some("2"));
    }

    #[test]
    fn key_without_equals_has_empty_value() {
        let cgi = Cgi::parse("justakey");
        assert_eq!(cgi.get("justakey"), Some(""));
    }

    #[test]
    fn merge_overwrites_and_appends() {
        let mut base = Cgi::parse("a=1&b=2");
        let extra = Cgi::parse("b=3&c=4");
        base.merge(&extra);
        assert_eq!(base.get("a"), Some("1"));
        assert_eq!(base.get("b"), Some("3"));
        assert_eq!(base.get("c"), Some("4"));
    }

    #[test]
    fn strip_auth_keys_removes_every_recognized_key() {
        let mut cgi = Cgi::parse("xrd.wantprot=p&xrdcl.secuid=1&mgm.id=42");
        assert!(cgi.has_auth_keys());
        let removed = cgi.strip_auth_keys();
        assert_eq!(removed.len(), 2);
        assert!(!cgi.has_auth_keys());
        assert_eq!(cgi.get("mgm.id"), Some("42"));
    }

    #[test]
    fn emit_preserves_insertion_order() {
        let cgi = Cgi::parse("z=1&a=2");
        assert_eq!(cgi.emit(), "z=1&a=2");
    }

    #[test]
    fn auth_query_carries_only_recognized_keys_in_auth_keys_order() {
        let cgi = Cgi::parse("mgm.id=42&xrdcl.secgid=9&xrd.wantprot=krb5&foo=bar");
        assert_eq!(cgi.auth_query(), "xrd.wantprot=krb5&xrdcl.secgid=9");
    }

    #[test]
    fn auth_query_is_empty_without_auth_keys() {
        let cgi = Cgi::parse("mgm.id=42");
        assert_eq!(cgi.auth_query(), "");
    }
}
