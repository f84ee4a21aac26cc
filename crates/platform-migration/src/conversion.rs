//! Version conversion dispatch
//!
//! Converters are registered per (source, target) version pair in a
//! [`ConversionRegistry`]; the orchestrator never matches on version strings.
//!
//! [`FieldMappingConverter`] covers declarative rules (rename / remove /
//! default of JSON pointer paths) so simple migrations need no code.

use crate::error::ConversionError;
use crate::types::Document;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Converts a document to a target schema version
pub trait Converter: Send + Sync {
    /// Convert `document` to `target_version`
    ///
    /// Must not mutate the input.
    fn convert(&self, document: &Document, target_version: &str)
        -> Result<Document, ConversionError>;
}

impl<F> Converter for F
where
    F: Fn(&Document, &str) -> Result<Document, ConversionError> + Send + Sync,
{
    fn convert(
        &self,
        document: &Document,
        target_version: &str,
    ) -> Result<Document, ConversionError> {
        self(document, target_version)
    }
}

/// Registry of converters keyed by (source, target) version
#[derive(Clone, Default)]
pub struct ConversionRegistry {
    converters: HashMap<(String, String), Arc<dyn Converter>>,
}

impl fmt::Debug for ConversionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionRegistry")
            .field("paths", &self.paths())
            .finish()
    }
}

impl ConversionRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a converter for a version pair, replacing any previous one
    pub fn register(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        converter: impl Converter + 'static,
    ) {
        self.converters
            .insert((from.into(), to.into()), Arc::new(converter));
    }

    /// Builder form of [`register`](Self::register)
    #[must_use]
    pub fn with(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        converter: impl Converter + 'static,
    ) -> Self {
        self.register(from, to, converter);
        self
    }

    /// Register a declarative rule
    pub fn register_rule(&mut self, rule: ConversionRule) {
        let (from, to) = (rule.from.clone(), rule.to.clone());
        self.register(from, to, FieldMappingConverter::from(rule));
    }

    /// Check if a direct converter exists
    #[inline]
    #[must_use]
    pub fn supports(&self, from: &str, to: &str) -> bool {
        from == to || self.converters.contains_key(&(from.to_string(), to.to_string()))
    }

    /// Every version some converter produces
    #[must_use]
    pub fn target_versions(&self) -> BTreeSet<String> {
        self.converters.keys().map(|(_, to)| to.clone()).collect()
    }

    /// Registered (source, target) pairs, sorted
    #[must_use]
    pub fn paths(&self) -> Vec<(String, String)> {
        let mut paths: Vec<_> = self.converters.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Convert a document to `target_version`
    ///
    /// A document already at the target is returned unchanged. The result
    /// always keeps the input's reference and resource version and carries
    /// the target version.
    ///
    /// # Errors
    /// `ConversionError::UnsupportedVersion` for unknown pairs, otherwise the
    /// converter's error.
    pub fn convert(
        &self,
        document: &Document,
        target_version: &str,
    ) -> Result<Document, ConversionError> {
        if document.version() == target_version {
            return Ok(document.clone());
        }

        let key = (document.version().to_string(), target_version.to_string());
        let converter = self
            .converters
            .get(&key)
            .ok_or_else(|| ConversionError::UnsupportedVersion {
                from: key.0.clone(),
                to: key.1.clone(),
            })?;

        let mut converted = converter.convert(document, target_version)?;
        converted.reference = document.reference.clone();
        converted.resource_version = document.resource_version;
        converted.api_version = target_version.to_string();
        Ok(converted)
    }
}

/// Declarative conversion rule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionRule {
    /// Source version
    pub from: String,
    /// Target version
    pub to: String,
    /// JSON pointer renames, applied first
    pub rename: BTreeMap<String, String>,
    /// JSON pointers removed after renames
    pub remove: Vec<String>,
    /// Values inserted where the pointer is absent
    pub defaults: BTreeMap<String, Value>,
}

/// Converter driven by a [`ConversionRule`]
#[derive(Debug, Clone)]
pub struct FieldMappingConverter {
    rule: ConversionRule,
}

impl From<ConversionRule> for FieldMappingConverter {
    fn from(rule: ConversionRule) -> Self {
        Self { rule }
    }
}

impl Converter for FieldMappingConverter {
    fn convert(
        &self,
        document: &Document,
        target_version: &str,
    ) -> Result<Document, ConversionError> {
        let mut content = document.content.clone();

        for (from, to) in &self.rule.rename {
            if let Some(value) = remove_pointer(&mut content, from) {
                insert_pointer(&mut content, to, value)?;
            }
        }
        for pointer in &self.rule.remove {
            remove_pointer(&mut content, pointer);
        }
        for (pointer, value) in &self.rule.defaults {
            if content.pointer(pointer).is_none() {
                insert_pointer(&mut content, pointer, value.clone())?;
            }
        }

        Ok(Document {
            reference: document.reference.clone(),
            api_version: target_version.to_string(),
            resource_version: document.resource_version,
            content,
        })
    }
}

fn pointer_tokens(pointer: &str) -> Result<Vec<String>, ConversionError> {
    let rest = pointer
        .strip_prefix('/')
        .ok_or_else(|| ConversionError::Failed(format!("invalid JSON pointer: {pointer}")))?;
    Ok(rest
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Remove the value at `pointer`, returning it
pub(crate) fn remove_pointer(root: &mut Value, pointer: &str) -> Option<Value> {
    let tokens = pointer_tokens(pointer).ok()?;
    let (last, parents) = tokens.split_last()?;
    let mut current = root;
    for token in parents {
        current = current.get_mut(token.as_str())?;
    }
    current.as_object_mut()?.remove(last)
}

/// Insert `value` at `pointer`, creating intermediate objects
pub(crate) fn insert_pointer(
    root: &mut Value,
    pointer: &str,
    value: Value,
) -> Result<(), ConversionError> {
    let tokens = pointer_tokens(pointer)?;
    let Some((last, parents)) = tokens.split_last() else {
        return Err(ConversionError::Failed("empty JSON pointer".into()));
    };

    if root.is_null() {
        *root = Value::Object(Map::new());
    }
    let mut current = root;
    for token in parents {
        let object = current.as_object_mut().ok_or_else(|| {
            ConversionError::Failed(format!("{pointer}: parent of {token} is not an object"))
        })?;
        current = object
            .entry(token.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    current
        .as_object_mut()
        .ok_or_else(|| ConversionError::Failed(format!("{pointer}: parent is not an object")))?
        .insert(last.clone(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceRef;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn alpha_doc() -> Document {
        let mut doc = Document::new(
            ResourceRef::new("monitoring", "platform"),
            "v1alpha1",
            json!({
                "metadata": {"labels": {"team": "sre"}},
                "spec": {
                    "monitoring": {"retention": "15d"},
                    "legacyConfig": "x"
                }
            }),
        );
        doc.resource_version = 7;
        doc
    }

    fn beta_rule() -> ConversionRule {
        ConversionRule {
            from: "v1alpha1".into(),
            to: "v1beta1".into(),
            rename: BTreeMap::from([("/spec/monitoring".into(), "/spec/observability".into())]),
            remove: vec!["/spec/legacyConfig".into()],
            defaults: BTreeMap::from([("/spec/multiCluster/enabled".into(), json!(false))]),
        }
    }

    #[test]
    fn field_mapping_applies_rule() {
        let mut registry = ConversionRegistry::new();
        registry.register_rule(beta_rule());

        let converted = registry.convert(&alpha_doc(), "v1beta1").unwrap();

        assert_eq!(converted.version(), "v1beta1");
        assert_eq!(converted.resource_version, 7);
        assert_eq!(
            converted.content,
            json!({
                "metadata": {"labels": {"team": "sre"}},
                "spec": {
                    "observability": {"retention": "15d"},
                    "multiCluster": {"enabled": false}
                }
            })
        );
    }

    #[test]
    fn unknown_pair_is_unsupported() {
        let registry = ConversionRegistry::new();
        let err = registry.convert(&alpha_doc(), "v2").unwrap_err();
        assert!(matches!(err, ConversionError::UnsupportedVersion { .. }));
    }

    #[test]
    fn same_version_is_identity() {
        let registry = ConversionRegistry::new();
        let doc = alpha_doc();
        assert_eq!(registry.convert(&doc, "v1alpha1").unwrap(), doc);
        assert!(registry.supports("v1alpha1", "v1alpha1"));
    }

    #[test]
    fn closure_converters_are_normalized() {
        let registry = ConversionRegistry::new().with(
            "v1alpha1",
            "v1beta1",
            |doc: &Document, _: &str| {
                let mut out = doc.clone();
                out.resource_version = 0;
                out.reference = ResourceRef::new("elsewhere", "other");
                Ok(out)
            },
        );

        let converted = registry.convert(&alpha_doc(), "v1beta1").unwrap();
        assert_eq!(converted.reference, ResourceRef::new("monitoring", "platform"));
        assert_eq!(converted.resource_version, 7);
        assert_eq!(converted.version(), "v1beta1");
        assert_eq!(registry.target_versions().len(), 1);
    }

    #[test]
    fn pointer_helpers_handle_escapes() {
        let mut value = json!({"a/b": {"c": 1}});
        assert_eq!(remove_pointer(&mut value, "/a~1b/c"), Some(json!(1)));
        insert_pointer(&mut value, "/x/y", json!("z")).unwrap();
        assert_eq!(value, json!({"a/b": {}, "x": {"y": "z"}}));
        assert!(insert_pointer(&mut value, "/x/y/z", json!(1)).is_err());
    }
}
