/// Ordered, case-insensitive header collection.
///
/// Lookup and removal compare names ASCII case-insensitively. Insertion
/// order is preserved for emission; inserting a duplicate replaces the
/// earlier entry in place, keeping its position but adopting the later
/// spelling and value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<HeaderEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderEntry {
    name: String,
    value: String,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(index) => {
                self.entries[index] = HeaderEntry { name, value };
            }
            None => self.entries.push(HeaderEntry { name, value }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .map(|index| self.entries[index].value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.position(name)
            .map(|index| self.entries.remove(index).value)
    }

    /// Iterates `(name, value)` pairs in insertion order, names in their
    /// original spelling.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|entry| (entry.name.as_str(), entry.value.as_str()))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::HeaderMap;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("User-Agent", "curl/8.0");
        assert_eq!(headers.get("user-agent"), Some("curl/8.0"));
        assert_eq!(headers.get("USER-AGENT"), Some("curl/8.0"));
        assert!(headers.get("accept").is_none());
    }

    #[test]
    fn duplicate_insert_replaces_value_and_keeps_position() {
        let mut headers = HeaderMap::new();
        headers.insert("Accept", "text/plain");
        headers.insert("User-Agent", "curl/8.0");
        headers.insert("ACCEPT", "text/html");

        let collected: Vec<(String, String)> = headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        assert_eq!(
            collected,
            vec![
                ("ACCEPT".to_string(), "text/html".to_string()),
                ("User-Agent".to_string(), "curl/8.0".to_string()),
            ]
        );
    }

    #[test]
    fn remove_returns_the_stored_value() {
        let mut headers = HeaderMap::new();
        headers.insert("Connection", "close, X-Custom");
        assert_eq!(
            headers.remove("connection"),
            Some("close, X-Custom".to_string())
        );
        assert!(headers.remove("connection").is_none());
        assert!(headers.is_empty());
    }

    #[test]
    fn iteration_preserves_insertion_order() {
        let mut headers = HeaderMap::new();
        headers.insert("A", "1");
        headers.insert("B", "2");
        headers.insert("C", "3");
        let names: Vec<&str> = headers.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }
}
