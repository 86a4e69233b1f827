//! Header codec.
//!
//! A [`HeaderSet`] co-maintains two views of one header block:
//! - `raw`: the `(name, value)` sequence as received, original casing and order
//! - `canonical`: the case-insensitive mapping the proxy actually edits
//!
//! [`restore_headers`] is the only conversion between the two. Every edit goes
//! through [`HeaderSet::set`] or [`HeaderSet::remove`] so the views cannot drift.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::{ProxyError, ProxyResult};

/// Connection-scoped headers that never cross the proxy.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Wire-order header sequence plus its case-insensitive mapping.
#[derive(Debug, Clone, Default)]
pub struct HeaderSet {
    raw: Vec<(String, String)>,
    canonical: HeaderMap,
}

impl HeaderSet {
    /// Build from a raw wire sequence. Unparseable pairs stay in `raw` only
    /// and are therefore dropped by [`restore`](Self::restore).
    pub fn from_raw<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut set = Self::default();
        for (key, value) in pairs {
            let (key, value) = (key.into(), value.into());
            if let (Ok(name), Ok(val)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                set.canonical.append(name, val);
            }
            set.raw.push((key, value));
        }
        set
    }

    /// Build from a transport header map, taking its iteration order as wire order.
    pub fn from_header_map(map: &HeaderMap) -> Self {
        let raw = map
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Self {
            raw,
            canonical: map.clone(),
        }
    }

    /// Pair a transport header map with the raw sequence read off the wire.
    pub fn from_wire(canonical: &HeaderMap, raw: Vec<(String, String)>) -> Self {
        Self {
            raw,
            canonical: canonical.clone(),
        }
    }

    pub fn raw(&self) -> &[(String, String)] {
        &self.raw
    }

    pub fn canonical(&self) -> &HeaderMap {
        &self.canonical
    }

    /// First value for `name`, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.canonical.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.canonical.contains_key(name)
    }

    /// Replace every value of `name` with `value`.
    ///
    /// When no raw entry matches `name` case-insensitively, one is appended
    /// using `name`'s casing so the next [`restore`](Self::restore) exposes it.
    pub fn set(&mut self, name: &str, value: &str) -> ProxyResult<()> {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ProxyError::InvalidHeader(name.to_string()))?;
        let val = HeaderValue::from_str(value)
            .map_err(|_| ProxyError::InvalidHeader(format!("{name}: {value}")))?;

        self.canonical.insert(header, val);
        if !self.raw.iter().any(|(k, _)| k.eq_ignore_ascii_case(name)) {
            self.raw.push((name.to_string(), value.to_string()));
        }
        Ok(())
    }

    /// Remove `name` from the canonical view. The raw entry stays and is
    /// filtered out on restore.
    pub fn remove(&mut self, name: &str) -> bool {
        self.canonical.remove(name).is_some()
    }

    pub fn strip_hop_by_hop(&mut self) {
        for name in HOP_BY_HOP {
            self.remove(name);
        }
    }

    pub fn restore(&self) -> RestoredHeaders {
        restore_headers(&self.canonical, &self.raw)
    }
}

/// Rebuild headers keyed by original casing.
///
/// Keeps only raw keys whose lower-cased form is still in `canonical`, in raw
/// order, carrying the canonical values. Keys that differ only by case collapse
/// onto the first spelling seen.
pub fn restore_headers(canonical: &HeaderMap, raw: &[(String, String)]) -> RestoredHeaders {
    let mut restored = RestoredHeaders::default();

    for (key, _) in raw {
        if restored.get_all(key).is_some() {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
            continue;
        };
        let values: Vec<String> = canonical
            .get_all(&name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        if !values.is_empty() {
            restored.entries.push((key.clone(), values));
        }
    }

    restored
}

/// Ordered headers keyed by original casing.
///
/// Serializes as a JSON object in wire order; a key with several values
/// becomes an array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoredHeaders {
    entries: Vec<(String, Vec<String>)>,
}

impl RestoredHeaders {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Values for `name`, case-insensitively.
    pub fn get_all(&self, name: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Convert back into a transport header map.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for (key, values) in &self.entries {
            let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(val) = HeaderValue::from_str(value) {
                    map.append(name.clone(), val);
                }
            }
        }
        map
    }
}

impl Serialize for RestoredHeaders {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, values) in &self.entries {
            match values.as_slice() {
                [single] => map.serialize_entry(key, single)?,
                many => map.serialize_entry(key, many)?,
            }
        }
        map.end()
    }
}
