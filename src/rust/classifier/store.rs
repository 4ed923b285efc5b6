use std::cmp::Ordering;
use std::fmt;

use ndarray::Array1;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::embedding::FeatureVector;
use super::error::ClassifierError;
use super::utils::{cosine_similarity, normalize_vector};

/// Number of neighbours consulted by [`LabeledFeatureStore::query`] unless configured otherwise
pub const DEFAULT_K: usize = 3;

/// One label's share of the nearest-neighbour vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    /// Percentage of the k nearest neighbours carrying this label, `0..=100`
    pub confidence: u8,
}

/// Ranked outcome of a nearest-neighbour query, highest confidence first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub predictions: Vec<Prediction>,
}

impl PredictionResult {
    /// The winning label, if any
    pub fn top(&self) -> Option<&Prediction> {
        self.predictions.first()
    }

    /// Confidence for a label, or `None` when the label took no part in the vote
    pub fn confidence(&self, label: &str) -> Option<u8> {
        self.predictions.iter().find(|p| p.label == label).map(|p| p.confidence)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Prediction> {
        self.predictions.iter()
    }

    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }
}

/// Portable form of a feature store: each label maps to the concatenation of
/// its feature vectors.
///
/// Serialises as a JSON object (`{"cat": [0.1, 0.2, ...], ...}`). Label order
/// is preserved in both directions since it decides confidence ties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetDocument {
    entries: Vec<(String, Vec<f32>)>,
}

impl DatasetDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flat values for a label, replacing any previous values in place
    pub fn insert(&mut self, label: impl Into<String>, values: Vec<f32>) {
        let label = label.into();
        match self.entries.iter_mut().find(|(l, _)| *l == label) {
            Some((_, existing)) => *existing = values,
            None => self.entries.push((label, values)),
        }
    }

    pub fn get(&self, label: &str) -> Option<&[f32]> {
        self.entries.iter().find(|(l, _)| l == label).map(|(_, v)| v.as_slice())
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(l, _)| l.as_str())
    }

    pub fn entries(&self) -> &[(String, Vec<f32>)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> Result<String, ClassifierError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ClassifierError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Serialize for DatasetDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (label, values) in &self.entries {
            map.serialize_entry(label, values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DatasetDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DocumentVisitor;

        impl<'de> Visitor<'de> for DocumentVisitor {
            type Value = DatasetDocument;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map from label to a flat array of numbers")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut doc = DatasetDocument::new();
                while let Some((label, values)) = access.next_entry::<String, Vec<f32>>()? {
                    if doc.get(&label).is_some() {
                        return Err(serde::de::Error::custom(format!("duplicate label '{}'", label)));
                    }
                    doc.entries.push((label, values));
                }
                Ok(doc)
            }
        }

        deserializer.deserialize_map(DocumentVisitor)
    }
}

#[derive(Debug, Clone)]
struct LabelEntry {
    label: String,
    vectors: Vec<FeatureVector>,
    /// L2-normalised copies of `vectors`, kept in step with them
    unit: Vec<FeatureVector>,
}

impl LabelEntry {
    fn new(label: String) -> Self {
        Self { label, vectors: Vec::new(), unit: Vec::new() }
    }

    fn push(&mut self, vector: FeatureVector) {
        self.unit.push(normalize_vector(&vector));
        self.vectors.push(vector);
    }
}

/// Label-indexed collection of feature vectors answering k-nearest-neighbour
/// queries by cosine similarity.
///
/// Labels keep the order in which they were first seen. That order breaks
/// ties, both between equally similar neighbours and between labels with the
/// same confidence.
#[derive(Debug, Clone)]
pub struct LabeledFeatureStore {
    dim: usize,
    k: usize,
    entries: Vec<LabelEntry>,
}

impl LabeledFeatureStore {
    /// Creates an empty store for vectors of length `dim`
    pub fn new(dim: usize) -> Self {
        Self { dim, k: DEFAULT_K, entries: Vec::new() }
    }

    /// Sets the number of neighbours consulted per query (at least 1)
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k.max(1);
        self
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Labels in creation order, including those without examples
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    pub fn num_labels(&self) -> usize {
        self.entries.len()
    }

    /// Number of examples stored under `label`
    pub fn example_count(&self, label: &str) -> usize {
        self.entry(label).map_or(0, |e| e.vectors.len())
    }

    pub fn total_examples(&self) -> usize {
        self.entries.iter().map(|e| e.vectors.len()).sum()
    }

    /// A store can answer queries once at least one label holds an example
    pub fn is_queryable(&self) -> bool {
        self.entries.iter().any(|e| !e.vectors.is_empty())
    }

    pub fn examples(&self, label: &str) -> Option<&[FeatureVector]> {
        self.entry(label).map(|e| e.vectors.as_slice())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn entry(&self, label: &str) -> Option<&LabelEntry> {
        self.entries.iter().find(|e| e.label == label)
    }

    fn entry_mut(&mut self, label: &str) -> &mut LabelEntry {
        let pos = match self.entries.iter().position(|e| e.label == label) {
            Some(pos) => pos,
            None => {
                self.entries.push(LabelEntry::new(label.to_string()));
                self.entries.len() - 1
            }
        };
        &mut self.entries[pos]
    }

    fn check_dim(&self, vector: &FeatureVector) -> Result<(), ClassifierError> {
        if vector.len() != self.dim {
            return Err(ClassifierError::Validation(format!(
                "Feature vector has {} values, expected {}",
                vector.len(),
                self.dim
            )));
        }
        Ok(())
    }

    /// Registers a label without examples so it keeps its place in the label order
    pub fn ensure_label(&mut self, label: &str) {
        self.entry_mut(label);
    }

    /// Appends an example under `label`, creating the label if needed
    pub fn add_example(&mut self, label: &str, vector: FeatureVector) -> Result<(), ClassifierError> {
        self.check_dim(&vector)?;
        self.entry_mut(label).push(vector);
        Ok(())
    }

    /// Removes and returns the example at `index` under `label`
    pub fn remove_example(&mut self, label: &str, index: usize) -> Result<FeatureVector, ClassifierError> {
        let entry = self.entries.iter_mut()
            .find(|e| e.label == label)
            .ok_or_else(|| ClassifierError::UnknownClass(label.to_string()))?;

        if index >= entry.vectors.len() {
            log::warn!("Refusing to remove example {} of '{}': only {} stored", index, label, entry.vectors.len());
            return Err(ClassifierError::Index {
                label: label.to_string(),
                index,
                len: entry.vectors.len(),
            });
        }
        entry.unit.remove(index);
        Ok(entry.vectors.remove(index))
    }

    /// Votes among the `min(k, total)` stored vectors most similar to `vector`.
    ///
    /// Every label with at least one example appears in the result, with a
    /// confidence of `votes / k * 100` rounded to the nearest integer.
    pub fn query(&self, vector: &FeatureVector) -> Result<PredictionResult, ClassifierError> {
        if !self.is_queryable() {
            return Err(ClassifierError::EmptyStore);
        }
        self.check_dim(vector)?;

        let query = normalize_vector(vector);

        // (similarity, label position, example position)
        let mut neighbours: Vec<(f32, usize, usize)> = Vec::with_capacity(self.total_examples());
        for (label_pos, entry) in self.entries.iter().enumerate() {
            for (example_pos, unit) in entry.unit.iter().enumerate() {
                neighbours.push((cosine_similarity(&query, unit), label_pos, example_pos));
            }
        }

        let k = self.k.min(neighbours.len());
        let by_rank = |a: &(f32, usize, usize), b: &(f32, usize, usize)| {
            b.0.total_cmp(&a.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        };
        if k < neighbours.len() {
            neighbours.select_nth_unstable_by(k - 1, by_rank);
        }

        let mut votes = vec![0usize; self.entries.len()];
        for &(_, label_pos, _) in &neighbours[..k] {
            votes[label_pos] += 1;
        }

        let mut ranked: Vec<(usize, u8)> = self.entries.iter()
            .enumerate()
            .filter(|(_, e)| !e.vectors.is_empty())
            .map(|(pos, _)| {
                let confidence = (votes[pos] as f64 / k as f64 * 100.0).round() as u8;
                (pos, confidence)
            })
            .collect();
        ranked.sort_by(|a, b| match b.1.cmp(&a.1) {
            Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });

        Ok(PredictionResult {
            predictions: ranked.into_iter()
                .map(|(pos, confidence)| Prediction {
                    label: self.entries[pos].label.clone(),
                    confidence,
                })
                .collect(),
        })
    }

    /// Flattens the store into a [`DatasetDocument`]
    pub fn export_dataset(&self) -> DatasetDocument {
        let mut doc = DatasetDocument::new();
        for entry in &self.entries {
            let mut flat = Vec::with_capacity(entry.vectors.len() * self.dim);
            for vector in &entry.vectors {
                flat.extend(vector.iter().copied());
            }
            doc.insert(entry.label.clone(), flat);
        }
        doc
    }

    /// Replaces the store's contents with `doc`.
    ///
    /// Every label's flat array is split into rows of `dim` values. If any
    /// label's length is not a multiple of `dim` the import fails with
    /// [`ClassifierError::Shape`] and the store is left untouched.
    pub fn import_dataset(&mut self, doc: &DatasetDocument) -> Result<(), ClassifierError> {
        if self.dim == 0 {
            return Err(ClassifierError::Validation("Feature dimensionality must be positive".into()));
        }

        let mut entries = Vec::with_capacity(doc.len());
        for (label, flat) in doc.entries() {
            if flat.len() % self.dim != 0 {
                log::error!("Cannot reshape {} values for '{}' into rows of {}", flat.len(), label, self.dim);
                return Err(ClassifierError::Shape {
                    label: label.clone(),
                    len: flat.len(),
                    dim: self.dim,
                });
            }
            let mut entry = LabelEntry::new(label.clone());
            for row in flat.chunks_exact(self.dim) {
                entry.push(Array1::from(row.to_vec()));
            }
            entries.push(entry);
        }

        self.entries = entries;
        log::info!("Imported {} examples across {} labels", self.total_examples(), self.num_labels());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn pets() -> LabeledFeatureStore {
        let mut store = LabeledFeatureStore::new(2);
        store.add_example("cat", array![1.0, 0.0]).unwrap();
        store.add_example("cat", array![0.9, 0.1]).unwrap();
        store.add_example("dog", array![0.0, 1.0]).unwrap();
        store
    }

    #[test]
    fn test_query_votes_among_all_examples() {
        let store = pets();
        let result = store.query(&array![0.95, 0.05]).unwrap();
        assert_eq!(result.confidence("cat"), Some(67));
        assert_eq!(result.confidence("dog"), Some(33));
        assert_eq!(result.top().unwrap().label, "cat");
    }

    #[test]
    fn test_query_with_k_one() {
        let store = pets().with_k(1);
        let result = store.query(&array![0.1, 0.9]).unwrap();
        assert_eq!(
            result.predictions,
            vec![
                Prediction { label: "dog".into(), confidence: 100 },
                Prediction { label: "cat".into(), confidence: 0 },
            ]
        );
    }

    #[test]
    fn test_confidence_ties_follow_label_order() {
        let mut store = LabeledFeatureStore::new(2).with_k(2);
        store.add_example("b", array![1.0, 0.0]).unwrap();
        store.add_example("a", array![0.0, 1.0]).unwrap();
        let result = store.query(&array![1.0, 1.0]).unwrap();
        let labels: Vec<_> = result.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, vec!["b", "a"]);
        assert_eq!(result.confidence("a"), Some(50));
    }

    #[test]
    fn test_labels_without_examples_are_not_reported() {
        let mut store = pets();
        store.ensure_label("bird");
        let result = store.query(&array![0.5, 0.5]).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result.confidence("bird"), None);
    }

    #[test]
    fn test_empty_store_query() {
        let mut store = LabeledFeatureStore::new(2);
        assert!(matches!(store.query(&array![1.0, 0.0]), Err(ClassifierError::EmptyStore)));
        store.ensure_label("cat");
        assert!(!store.is_queryable());
        assert!(matches!(store.query(&array![1.0, 0.0]), Err(ClassifierError::EmptyStore)));
    }

    #[test]
    fn test_dimension_is_enforced() {
        let mut store = pets();
        assert!(matches!(store.add_example("cat", array![1.0]), Err(ClassifierError::Validation(_))));
        assert!(matches!(store.query(&array![1.0, 0.0, 0.0]), Err(ClassifierError::Validation(_))));
        assert_eq!(store.example_count("cat"), 2);
    }

    #[test]
    fn test_remove_example() {
        let mut store = pets();
        let removed = store.remove_example("cat", 0).unwrap();
        assert_eq!(removed, array![1.0, 0.0]);
        assert_eq!(store.example_count("cat"), 1);

        assert!(matches!(store.remove_example("cat", 5), Err(ClassifierError::Index { index: 5, len: 1, .. })));
        assert!(matches!(store.remove_example("fish", 0), Err(ClassifierError::UnknownClass(_))));

        store.remove_example("dog", 0).unwrap();
        let result = store.query(&array![0.0, 1.0]).unwrap();
        assert_eq!(result.predictions, vec![Prediction { label: "cat".into(), confidence: 100 }]);
    }

    #[test]
    fn test_export_import_round_trip() {
        let store = pets();
        let doc = store.export_dataset();
        assert_eq!(doc.get("cat"), Some(&[1.0, 0.0, 0.9, 0.1][..]));

        let mut restored = LabeledFeatureStore::new(2);
        restored.import_dataset(&doc).unwrap();
        assert_eq!(restored.labels().collect::<Vec<_>>(), vec!["cat", "dog"]);
        assert_eq!(restored.examples("cat"), store.examples("cat"));
        assert_eq!(restored.examples("dog"), store.examples("dog"));
    }

    #[test]
    fn test_import_bad_shape_is_atomic() {
        let mut store = pets();
        let mut doc = DatasetDocument::new();
        doc.insert("owl", vec![0.5, 0.5]);
        doc.insert("fox", vec![0.1, 0.2, 0.3]);

        let result = store.import_dataset(&doc);
        assert!(matches!(result, Err(ClassifierError::Shape { len: 3, dim: 2, .. })));
        assert_eq!(store.labels().collect::<Vec<_>>(), vec!["cat", "dog"]);
        assert_eq!(store.total_examples(), 3);
    }

    #[test]
    fn test_document_json_keeps_label_order() {
        let doc = DatasetDocument::from_json(r#"{"zebra": [1.0, 2.0], "ant": [3.0, 4.0]}"#).unwrap();
        assert_eq!(doc.labels().collect::<Vec<_>>(), vec!["zebra", "ant"]);

        let json = doc.to_json().unwrap();
        assert_eq!(json, r#"{"zebra":[1.0,2.0],"ant":[3.0,4.0]}"#);
        assert_eq!(DatasetDocument::from_json(&json).unwrap(), doc);
    }

    #[test]
    fn test_document_rejects_duplicate_labels() {
        let result = DatasetDocument::from_json(r#"{"a": [1.0], "a": [2.0]}"#);
        assert!(matches!(result, Err(ClassifierError::Serialization(_))));
    }
}
