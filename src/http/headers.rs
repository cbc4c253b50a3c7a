//! Ordered, case-insensitive header map.

use std::fmt;

/// A case-insensitive, multi-value HTTP header map.
///
/// Entries keep their insertion order, which is also the order they are
/// written on the wire. [`insert`](Self::insert) appends, while
/// [`set`](Self::set) replaces every existing value for the name, which is
/// what response-decorating middleware such as CORS wants.
///
/// # Examples
///
/// ```
/// use kiri::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Vary", "Origin");
/// headers.insert("Vary", "Accept");
/// headers.set("Content-Type", "text/css");
/// headers.set("content-type", "image/svg+xml");
///
/// assert_eq!(headers.get_all("vary").count(), 2);
/// assert_eq!(headers.get("Content-Type"), Some("image/svg+xml"));
/// assert_eq!(headers.len(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
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

    /// Appends a value, keeping any existing values for the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces all values for `name` with a single `value`.
    ///
    /// The entry keeps the position of the first existing value, or is
    /// appended when the name is new.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(k, _)| {
                    let keep = index <= first || !k.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.entries[i].1.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Removes every value for `name`; returns `true` if anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.entries.len() < before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Number of entries, counting repeated names separately.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copies every entry of `other` into `self` using [`set`](Self::set)
    /// semantics, so `other` wins on conflicts.
    pub fn merge(&mut self, other: &Headers) {
        for (name, value) in other.iter() {
            self.set(name, value);
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        let mut h = Headers::new();
        h.insert("Authorization", "Bearer abc");
        assert_eq!(h.get("authorization"), Some("Bearer abc"));
        assert!(h.contains("AUTHORIZATION"));
        assert!(!h.contains("x-missing"));
    }

    #[test]
    fn set_collapses_duplicates_in_place() {
        let mut h = Headers::new();
        h.insert("A", "1");
        h.insert("X-Dup", "first");
        h.insert("B", "2");
        h.insert("x-dup", "second");
        h.set("X-Dup", "only");

        let names: Vec<_> = h.iter().map(|(k, v)| format!("{k}={v}")).collect();
        assert_eq!(names, vec!["A=1", "X-Dup=only", "B=2"]);
    }

    #[test]
    fn merge_overrides_existing_values() {
        let mut base = Headers::new();
        base.insert("Content-Type", "text/plain");
        let mut extra = Headers::new();
        extra.insert("content-type", "application/json");
        extra.insert("Cache-Control", "no-cache");

        base.merge(&extra);
        assert_eq!(base.get("Content-Type"), Some("application/json"));
        assert_eq!(base.get("cache-control"), Some("no-cache"));
        assert_eq!(base.len(), 2);
    }

    #[test]
    fn remove_reports_whether_anything_went() {
        let mut h = Headers::new();
        h.insert("Set-Cookie", "a=1");
        h.insert("set-cookie", "b=2");
        assert!(h.remove("SET-COOKIE"));
        assert!(h.is_empty());
        assert!(!h.remove("set-cookie"));
    }
}
