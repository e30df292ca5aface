//! The canonical name-to-tensor mapping.

use std::collections::BTreeMap;
use std::collections::btree_map;

use candle_core::Tensor;

/// Parameter name to tensor, ordered by name.
#[derive(Debug, Clone, Default)]
pub struct ParameterMap(BTreeMap<String, Tensor>);

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.0.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.0.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.0.remove(name)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Tensor> {
        self.0.iter()
    }

    /// `(name, shape)` pairs, the only view architecture inference needs.
    pub fn shapes(&self) -> impl Iterator<Item = (&str, &[usize])> + Clone {
        self.0.iter().map(|(k, t)| (k.as_str(), t.dims()))
    }

    /// Total element count across all parameters.
    pub fn element_count(&self) -> usize {
        self.0.values().map(Tensor::elem_count).sum()
    }

    pub fn into_inner(self) -> BTreeMap<String, Tensor> {
        self.0
    }
}

impl FromIterator<(String, Tensor)> for ParameterMap {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for ParameterMap {
    type Item = (String, Tensor);
    type IntoIter = btree_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ParameterMap {
    type Item = (&'a String, &'a Tensor);
    type IntoIter = btree_map::Iter<'a, String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
