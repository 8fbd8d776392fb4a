//! Cache key derivation

use kiln_core::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single generation parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            // Debug keeps a trailing ".0" so 1 and 1.0 stay distinct
            ParamValue::Float(x) => write!(f, "{:?}", x),
            ParamValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float(v as f64)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

/// Generation parameters, always iterated in name order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationParams(BTreeMap<String, ParamValue>);

impl GenerationParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(name.into(), value.into());
    }

    /// Insert only when the name is not already present
    pub fn set_default(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.entry(name.into()).or_insert_with(|| value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.0.get(name)? {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.0.get(name)? {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.0.get(name)? {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    /// `name_value` pairs in name order, joined by `_`
    pub fn canonical(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}_{}", k, v))
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Identifies one cached artifact: source hash plus canonical parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(source: &ContentHash, params: &GenerationParams) -> Self {
        let canonical = params.canonical();
        if canonical.is_empty() {
            Self(source.to_hex())
        } else {
            Self(format!("{}_{}", source.to_hex(), canonical))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fixed-length file stem for the artifact backing this key
    pub fn file_stem(&self) -> String {
        ContentHash::from_str(&self.0).to_hex()
    }

    /// Leading characters for log lines
    pub fn short(&self) -> &str {
        self.0.get(..16).unwrap_or(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_order_independent() {
        let hash = ContentHash::from_str("image");
        let a = GenerationParams::new()
            .with("texture_resolution", 1024)
            .with("foreground_ratio", 0.85);
        let b = GenerationParams::new()
            .with("foreground_ratio", 0.85)
            .with("texture_resolution", 1024);
        assert_eq!(CacheKey::new(&hash, &a), CacheKey::new(&hash, &b));
    }

    #[test]
    fn test_key_format() {
        let hash = ContentHash::from_str("image");
        let params = GenerationParams::new()
            .with("texture_resolution", 1024)
            .with("foreground_ratio", 0.85)
            .with("remesh", "triangle");
        let key = CacheKey::new(&hash, &params);
        assert_eq!(
            key.as_str(),
            format!(
                "{}_foreground_ratio_0.85_remesh_triangle_texture_resolution_1024",
                hash.to_hex()
            )
        );
        assert_eq!(key.short(), &hash.to_hex()[..16]);
    }

    #[test]
    fn test_key_without_params_is_bare_hash() {
        let hash = ContentHash::from_str("image");
        let key = CacheKey::new(&hash, &GenerationParams::new());
        assert_eq!(key.as_str(), hash.to_hex());
    }

    #[test]
    fn test_param_change_changes_key() {
        let hash = ContentHash::from_str("image");
        let a = GenerationParams::new().with("foreground_ratio", 0.85);
        let b = GenerationParams::new().with("foreground_ratio", 0.9);
        assert_ne!(CacheKey::new(&hash, &a), CacheKey::new(&hash, &b));
    }

    #[test]
    fn test_float_rendering_distinct_from_int() {
        assert_eq!(ParamValue::Float(1.0).to_string(), "1.0");
        assert_eq!(ParamValue::Int(1).to_string(), "1");
    }

    #[test]
    fn test_file_stem_is_fixed_length() {
        let key = CacheKey::from("x".repeat(500).as_str());
        assert_eq!(key.file_stem().len(), 64);
    }

    #[test]
    fn test_params_json_untagged() {
        let params: GenerationParams =
            serde_json::from_str(r#"{"a": 1, "b": 0.5, "c": true, "d": "quad"}"#).unwrap();
        assert_eq!(params.get("a"), Some(&ParamValue::Int(1)));
        assert_eq!(params.get_f64("b"), Some(0.5));
        assert_eq!(params.get("c"), Some(&ParamValue::Bool(true)));
        assert_eq!(params.get_str("d"), Some("quad"));
    }

    #[test]
    fn test_set_default_keeps_existing() {
        let mut params = GenerationParams::new().with("vertex_count", 5000);
        params.set_default("vertex_count", -1);
        params.set_default("remesh", "triangle");
        assert_eq!(params.get_i64("vertex_count"), Some(5000));
        assert_eq!(params.get_str("remesh"), Some("triangle"));
    }
}
