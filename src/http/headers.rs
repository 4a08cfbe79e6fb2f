//! Ordered header list with case-insensitive lookup.

/// HTTP header block.
///
/// Names keep the case they were received or inserted with; every lookup
/// ignores ASCII case. Duplicate names are kept in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Vec<u8>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_slice()))
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_slice())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|value| std::str::from_utf8(value).ok())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.entries
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    /// Add a header, keeping any existing values with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Set a header to a single value.
    ///
    /// The first existing entry is overwritten in place so the header keeps
    /// its position; any further duplicates are dropped.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(&name))
        {
            Some(pos) => {
                let mut index = 0;
                self.entries.retain(|(key, _)| {
                    let keep = index <= pos || !key.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });
                self.entries[pos] = (name, value);
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Remove every entry named `name`. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<Vec<u8>>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        headers.extend(iter);
        headers
    }
}

impl<K, V> Extend<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<Vec<u8>>,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (name, value) in iter {
            self.append(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_ignores_case() {
        let headers: Headers = [("Content-Type", "text/plain")].into_iter().collect();
        assert_eq!(headers.get("content-type"), Some(&b"text/plain"[..]));
        assert_eq!(headers.get_str("CONTENT-TYPE"), Some("text/plain"));
        assert!(headers.contains("Content-type"));
        assert!(!headers.contains("Content-Length"));
    }

    #[test]
    fn test_duplicates_are_kept() {
        let mut headers = Headers::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("set-cookie", "b=2");
        assert_eq!(headers.len(), 2);
        let all: Vec<&[u8]> = headers.get_all("SET-COOKIE").collect();
        assert_eq!(all, vec![&b"a=1"[..], &b"b=2"[..]]);
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut headers: Headers = [
            ("Host", "example.org"),
            ("Content-Length", "5"),
            ("Accept", "*/*"),
            ("content-length", "7"),
        ]
        .into_iter()
        .collect();

        headers.insert("Content-Length", "16");

        let names: Vec<&str> = headers.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["Host", "Content-Length", "Accept"]);
        assert_eq!(headers.get_str("content-length"), Some("16"));
    }

    #[test]
    fn test_insert_appends_when_missing() {
        let mut headers = Headers::new();
        headers.insert("Via", "1.1 proxy");
        assert_eq!(headers.get_str("via"), Some("1.1 proxy"));
    }

    #[test]
    fn test_remove_drops_all_duplicates() {
        let mut headers: Headers = [("X-A", "1"), ("x-a", "2"), ("X-B", "3")]
            .into_iter()
            .collect();
        assert!(headers.remove("X-A"));
        assert!(!headers.remove("X-A"));
        assert_eq!(headers.len(), 1);
    }
}
