//! Ordered, case-insensitive header storage.
//!
//! Names compare ASCII case-insensitively and repeated fields are kept as
//! separate entries in arrival order (RFC 9110 §5.3), which matters when a
//! request is relayed to a backend.

use std::fmt;

/// Fields scoped to a single connection; a proxy must not forward them
/// (RFC 9110 §7.6.1).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Multi-value header list.
///
/// ```
/// use switchyard::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Via", "1.1 edge");
/// headers.insert("via", "1.1 switchyard");
///
/// assert_eq!(headers.get("VIA"), Some("1.1 edge"));
/// assert_eq!(headers.get_all("via").count(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Append an entry, keeping any existing values for `name`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every value for `name` with `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'s, 'n>(
        &'s self,
        name: &'n str,
    ) -> impl Iterator<Item = &'s str> + use<'s, 'n> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Elements of a comma-separated list field, across all of its entries,
    /// trimmed and with empty elements skipped.
    pub fn list<'s, 'n>(
        &'s self,
        name: &'n str,
    ) -> impl Iterator<Item = &'s str> + use<'s, 'n> {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|item| !item.is_empty())
    }

    /// Remove every entry for `name`; `true` if anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Entries, not distinct names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy of these headers without hop-by-hop fields, including any extra
    /// fields the `Connection` header nominates.
    pub fn end_to_end(&self) -> Headers {
        let nominated: Vec<String> = self
            .list("connection")
            .map(str::to_ascii_lowercase)
            .collect();
        let entries = self
            .entries
            .iter()
            .filter(|(name, _)| {
                let lower = name.to_ascii_lowercase();
                !HOP_BY_HOP.contains(&lower.as_str()) && !nominated.contains(&lower)
            })
            .cloned()
            .collect();
        Headers { entries }
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.iter()
            .try_for_each(|(name, value)| write!(f, "{name}: {value}\r\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        let mut h = Headers::new();
        for (name, value) in pairs {
            h.insert(*name, *value);
        }
        h
    }

    #[test]
    fn lookup_ignores_case_and_keeps_order() {
        let h = headers(&[("Set-Cookie", "a=1"), ("set-cookie", "b=2")]);
        assert_eq!(h.get("SET-COOKIE"), Some("a=1"));
        assert_eq!(h.get_all("Set-Cookie").collect::<Vec<_>>(), ["a=1", "b=2"]);
        assert!(h.contains("set-cookie"));
        assert!(!h.contains("cookie"));
    }

    #[test]
    fn values_outlive_the_lookup_name() {
        let h = headers(&[("Via", "1.1 a"), ("Via", "1.1 b, 1.1 c")]);
        let (first, hops) = {
            let name = String::from("via");
            let first = h.get(&name);
            let hops: Vec<&str> = h.list(&name).collect();
            (first, hops)
        };
        assert_eq!(first, Some("1.1 a"));
        assert_eq!(hops, ["1.1 a", "1.1 b", "1.1 c"]);
    }

    #[test]
    fn set_collapses_to_one_value() {
        let mut h = headers(&[("X-Foo", "a"), ("x-foo", "b")]);
        h.set("X-Foo", "c");
        assert_eq!(h.get_all("x-foo").collect::<Vec<_>>(), ["c"]);
        assert!(h.remove("X-FOO"));
        assert!(!h.remove("x-foo"));
        assert!(h.is_empty());
    }

    #[test]
    fn list_splits_across_entries() {
        let h = headers(&[("X-Forwarded-For", "1.1.1.1, 2.2.2.2"), ("x-forwarded-for", " ,3.3.3.3")]);
        assert_eq!(
            h.list("x-forwarded-for").collect::<Vec<_>>(),
            ["1.1.1.1", "2.2.2.2", "3.3.3.3"]
        );
    }

    #[test]
    fn end_to_end_drops_hop_by_hop_and_nominated() {
        let h = headers(&[
            ("Host", "example.com"),
            ("Connection", "keep-alive, X-Trace"),
            ("Keep-Alive", "timeout=5"),
            ("X-Trace", "abc"),
            ("Transfer-Encoding", "chunked"),
            ("Accept", "*/*"),
        ]);
        let relayed = h.end_to_end();
        assert_eq!(
            relayed.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            ["Host", "Accept"]
        );
    }

    #[test]
    fn display_is_wire_format() {
        let h = headers(&[("A", "1"), ("B", "2")]);
        assert_eq!(h.to_string(), "A: 1\r\nB: 2\r\n");
    }
}
