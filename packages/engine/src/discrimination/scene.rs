// packages/engine/src/discrimination/scene.rs
//! Scenes: the ordered features extracted from one session

use std::collections::BTreeMap;

/// One extracted `(key, value)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Feature {
    pub key: String,
    pub value: Vec<u8>,
}

impl Feature {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Features in discovery order; equality is order-sensitive
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Scene {
    features: Vec<Feature>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, feature: Feature) {
        self.features.push(feature);
    }

    pub fn with_feature(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.push(Feature::new(key, value));
        self
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Binary form: `len(key):u16 | key | len(value):u16 | value` per feature.
    ///
    /// Keys and values longer than `u16::MAX` bytes are truncated.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for feature in &self.features {
            put_field(&mut out, feature.key.as_bytes());
            put_field(&mut out, &feature.value);
        }
        out
    }

    /// Key to value view; a repeated key keeps its last value
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.features
            .iter()
            .map(|f| (f.key.clone(), String::from_utf8_lossy(&f.value).into_owned()))
            .collect()
    }
}

impl FromIterator<Feature> for Scene {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        Self {
            features: iter.into_iter().collect(),
        }
    }
}

fn put_field(out: &mut Vec<u8>, field: &[u8]) {
    let field = &field[..field.len().min(u16::MAX as usize)];
    out.extend_from_slice(&(field.len() as u16).to_le_bytes());
    out.extend_from_slice(field);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let scene = Scene::new().with_feature("product_id", "3");

        let encoded = scene.encode();

        assert_eq!(&encoded[..2], &10u16.to_le_bytes());
        assert_eq!(&encoded[2..12], b"product_id");
        assert_eq!(&encoded[12..14], &1u16.to_le_bytes());
        assert_eq!(&encoded[14..], b"3");
    }

    #[test]
    fn test_encode_truncates_long_values() {
        let scene = Scene::new().with_feature("k", vec![b'v'; 70_000]);
        let encoded = scene.encode();
        assert_eq!(encoded.len(), 2 + 1 + 2 + u16::MAX as usize);
    }

    #[test]
    fn test_equality_is_order_sensitive() {
        let a = Scene::new().with_feature("a", "1").with_feature("b", "2");
        let b = Scene::new().with_feature("b", "2").with_feature("a", "1");
        assert_ne!(a, b);
    }

    #[test]
    fn test_to_map() {
        let map = Scene::new()
            .with_feature("user_role", "driver")
            .with_feature("user_type", "normal")
            .to_map();

        assert_eq!(map["user_role"], "driver");
        assert_eq!(map["user_type"], "normal");
    }
}
