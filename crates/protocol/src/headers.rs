//! Ordered, case-insensitive, multi-valued header map.
//!
//! On the wire a header with one value is a JSON string and a header with
//! several values is a JSON array, so `{"Accept": "a", "Set-Cookie": ["x", "y"]}`
//! survives a decode/encode cycle unchanged.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Header names in insertion order, each with one or more values.
///
/// Names compare case-insensitively; the spelling of the first insertion is
/// kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Vec<String>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    /// Adds a value, keeping any values already present for `name`.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.position(&name) {
            Some(idx) => self.entries[idx].1.push(value.into()),
            None => self.entries.push((name, vec![value.into()])),
        }
    }

    /// Replaces every value of `name` with a single value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.position(&name) {
            Some(idx) => self.entries[idx].1 = vec![value.into()],
            None => self.entries.push((name, vec![value.into()])),
        }
    }

    /// Removes `name`, returning its values.
    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.position(name).map(|idx| self.entries.remove(idx).1)
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.position(name).map(|idx| self.entries[idx].1.as_slice())
    }

    /// Returns the first value of `name`.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Iterates over `(name, values)` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds every header from `defaults` whose name is not already present.
    pub fn merge_defaults(&mut self, defaults: &Headers) {
        for (name, values) in defaults.iter() {
            if !self.contains(name) {
                self.entries.push((name.to_string(), values.to_vec()));
            }
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, values) in &self.entries {
            match values.as_slice() {
                [single] => map.serialize_entry(name, single)?,
                many => map.serialize_entry(name, many)?,
            }
        }
        map.end()
    }
}

/// A header value as it appears on the wire.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireValues {
    One(String),
    Many(Vec<String>),
}

struct HeadersVisitor;

impl<'de> Visitor<'de> for HeadersVisitor {
    type Value = Headers;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of header names to a string or an array of strings")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Headers, A::Error> {
        let mut headers = Headers::new();
        while let Some((name, values)) = access.next_entry::<String, Option<WireValues>>()? {
            match values {
                Some(WireValues::One(value)) => headers.append(name, value),
                Some(WireValues::Many(values)) => {
                    if values.is_empty() {
                        if headers.position(&name).is_none() {
                            headers.entries.push((name, Vec::new()));
                        }
                    } else {
                        for value in values {
                            headers.append(name.clone(), value);
                        }
                    }
                }
                None => {}
            }
        }
        Ok(headers)
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<Headers, E> {
        Ok(Headers::new())
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(HeadersVisitor)
    }
}
