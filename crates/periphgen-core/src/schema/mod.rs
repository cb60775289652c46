//! Versioned metadata schemas.
//!
//! A schema is a flat list of field rules addressed by dotted paths
//! (`toolchain.flags`, `peripherals[]`). Validation walks every rule and
//! every object key of the document and collects all violations before
//! returning, so an author sees the complete list in one pass.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{SchemaError, SchemaErrors, SchemaViolation};
use crate::metadata::{DocumentKind, MetadataDocument, ValidatedMetadata};

/// Key every document uses to select its schema version.
pub const VERSION_KEY: &str = "schema_version";

const BUILTIN: &[&str] = &[
    include_str!("builtin/platform.v1.json"),
    include_str!("builtin/peripheral.v1.json"),
    include_str!("builtin/board.v1.json"),
];

/// Value types a field rule can demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    /// Non-negative integer or a `0x`-prefixed hex string.
    Address,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Address => "address",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Address => match value {
                Value::Number(n) => n.is_u64(),
                Value::String(s) => s
                    .strip_prefix("0x")
                    .or_else(|| s.strip_prefix("0X"))
                    .is_some_and(|h| !h.is_empty() && u64::from_str_radix(h, 16).is_ok()),
                _ => false,
            },
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One field rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRule {
    pub path: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Numeric lower bound; minimum length for arrays.
    pub min: Option<i64>,
    /// Numeric upper bound; maximum length for arrays.
    pub max: Option<i64>,
    #[serde(rename = "enum")]
    pub allowed: Option<Vec<String>>,
    pub pattern: Option<String>,
    /// Element type for arrays.
    pub items: Option<FieldType>,
    /// Value type for open objects; objects without it are closed.
    pub values: Option<FieldType>,
}

/// A versioned schema for one document kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub kind: DocumentKind,
    pub version: u32,
    pub fields: Vec<FieldRule>,
}

impl Schema {
    fn rule(&self, normalized: &str) -> Option<&FieldRule> {
        self.fields.iter().find(|r| r.path == normalized)
    }

    /// Keys declared directly under the object at `normalized` (`""` for the
    /// document root).
    fn declared_children(&self, normalized: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter_map(|r| {
                let (parent, leaf) = match r.path.rsplit_once('.') {
                    Some((parent, leaf)) => (parent, leaf),
                    None => ("", r.path.as_str()),
                };
                (parent == normalized).then(|| leaf.trim_end_matches("[]"))
            })
            .collect()
    }
}

/// Schemas keyed by `(kind, version)`.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<(DocumentKind, u32), Schema>,
    /// Field patterns compiled once at registration, keyed by source text.
    patterns: HashMap<String, Result<Regex, String>>,
}

impl SchemaRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The schemas bundled with this build.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for text in BUILTIN {
            match serde_json::from_str::<Schema>(text) {
                Ok(schema) => registry.register(schema),
                Err(e) => warn!(error = %e, "skipping malformed bundled schema"),
            }
        }
        registry
    }

    pub fn register(&mut self, schema: Schema) {
        for pattern in schema.fields.iter().filter_map(|r| r.pattern.as_ref()) {
            if self.patterns.contains_key(pattern) {
                continue;
            }
            let compiled = Regex::new(pattern).map_err(|e| e.to_string());
            if let Err(error) = &compiled {
                warn!(
                    kind = schema.kind.as_str(),
                    version = schema.version,
                    %pattern,
                    %error,
                    "schema pattern does not compile"
                );
            }
            self.patterns.insert(pattern.clone(), compiled);
        }
        self.schemas.insert((schema.kind, schema.version), schema);
    }

    pub fn get(&self, kind: DocumentKind, version: u32) -> Option<&Schema> {
        self.schemas.get(&(kind, version))
    }

    /// Newest registered schema of `kind`.
    pub fn latest(&self, kind: DocumentKind) -> Option<&Schema> {
        self.schemas
            .range((kind, 0)..=(kind, u32::MAX))
            .next_back()
            .map(|(_, s)| s)
    }

    pub fn versions(&self, kind: DocumentKind) -> Vec<u32> {
        self.schemas
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Validate `document` as `kind`, collecting every violation.
    pub fn validate(
        &self,
        document: &MetadataDocument,
        kind: DocumentKind,
    ) -> Result<ValidatedMetadata, SchemaErrors> {
        let name = document.name();
        let mut errors = Vec::new();
        let mut push = |path: &str, violation: SchemaViolation| {
            errors.push(SchemaError {
                document: name.clone(),
                path: path.to_string(),
                violation,
            })
        };

        let Some(latest) = self.latest(kind) else {
            push(
                "$",
                SchemaViolation::UnknownKind {
                    kind: kind.as_str().to_string(),
                },
            );
            return Err(SchemaErrors(errors));
        };

        let Some(root) = document.value.as_object() else {
            push(
                "$",
                SchemaViolation::WrongType {
                    expected: "object".to_string(),
                    found: json_type_name(&document.value).to_string(),
                },
            );
            return Err(SchemaErrors(errors));
        };

        let schema = match root.get(VERSION_KEY) {
            None => {
                push(VERSION_KEY, SchemaViolation::MissingRequired);
                latest
            }
            Some(v) => match v.as_u64().and_then(|v| u32::try_from(v).ok()) {
                Some(version) => match self.get(kind, version) {
                    Some(schema) => schema,
                    None => {
                        push(
                            VERSION_KEY,
                            SchemaViolation::UnknownSchemaVersion {
                                version: version.to_string(),
                                known: self.versions(kind),
                            },
                        );
                        latest
                    }
                },
                None => {
                    push(
                        VERSION_KEY,
                        SchemaViolation::UnknownSchemaVersion {
                            version: v.to_string(),
                            known: self.versions(kind),
                        },
                    );
                    latest
                }
            },
        };

        for rule in &schema.fields {
            for (path, value) in resolve(&document.value, &rule.path) {
                check_rule(rule, &self.patterns, &path, value, &mut push);
            }
        }
        check_unknown_keys(schema, &document.value, "", "", &mut push);

        if errors.is_empty() {
            Ok(ValidatedMetadata::new(
                kind,
                schema.version,
                document.value.clone(),
                document.source.clone(),
            ))
        } else {
            Err(SchemaErrors(errors))
        }
    }
}

fn builtin_registry() -> &'static SchemaRegistry {
    static REGISTRY: OnceLock<SchemaRegistry> = OnceLock::new();
    REGISTRY.get_or_init(SchemaRegistry::builtin)
}

/// Validate `document` as `kind` against the bundled schemas.
pub fn validate(
    document: &MetadataDocument,
    kind: DocumentKind,
) -> Result<ValidatedMetadata, SchemaErrors> {
    builtin_registry().validate(document, kind)
}

/// Concrete `(path, value)` pairs a rule path addresses. A missing leaf is
/// reported as `None`; a missing intermediate yields nothing, since the
/// parent's own rule reports it.
fn resolve<'a>(root: &'a Value, rule_path: &str) -> Vec<(String, Option<&'a Value>)> {
    let segments: Vec<&str> = rule_path.split('.').collect();
    let mut out = Vec::new();
    resolve_into(root, &segments, String::new(), &mut out);
    out
}

fn resolve_into<'a>(
    value: &'a Value,
    segments: &[&str],
    prefix: String,
    out: &mut Vec<(String, Option<&'a Value>)>,
) {
    let Some((segment, rest)) = segments.split_first() else {
        return;
    };
    let Some(object) = value.as_object() else {
        return;
    };
    let (key, each) = match segment.strip_suffix("[]") {
        Some(key) => (key, true),
        None => (*segment, false),
    };
    let path = if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    };

    match object.get(key) {
        None => {
            if rest.is_empty() {
                out.push((path, None));
            }
        }
        Some(child) if rest.is_empty() => out.push((path, Some(child))),
        Some(child) if each => {
            if let Some(items) = child.as_array() {
                for (i, item) in items.iter().enumerate() {
                    resolve_into(item, rest, format!("{path}[{i}]"), out);
                }
            }
        }
        Some(child) => resolve_into(child, rest, path, out),
    }
}

fn check_rule(
    rule: &FieldRule,
    patterns: &HashMap<String, Result<Regex, String>>,
    path: &str,
    value: Option<&Value>,
    push: &mut impl FnMut(&str, SchemaViolation),
) {
    let Some(value) = value else {
        if rule.required {
            push(path, SchemaViolation::MissingRequired);
        }
        return;
    };

    if !rule.field_type.accepts(value) {
        push(
            path,
            SchemaViolation::WrongType {
                expected: rule.field_type.name().to_string(),
                found: json_type_name(value).to_string(),
            },
        );
        return;
    }

    let measured = match value {
        Value::Number(n) => n.as_f64(),
        Value::Array(items) => Some(items.len() as f64),
        _ => None,
    };
    if let Some(measured) = measured {
        let below = rule.min.is_some_and(|min| measured < min as f64);
        let above = rule.max.is_some_and(|max| measured > max as f64);
        if below || above {
            let shown = match value {
                Value::Array(items) => format!("length {}", items.len()),
                other => other.to_string(),
            };
            push(
                path,
                SchemaViolation::OutOfRange {
                    value: shown,
                    min: rule.min,
                    max: rule.max,
                },
            );
        }
    }

    if let Some(text) = value.as_str() {
        if let Some(allowed) = &rule.allowed {
            if !allowed.iter().any(|a| a == text) {
                push(
                    path,
                    SchemaViolation::NotInEnum {
                        value: text.to_string(),
                        allowed: allowed.clone(),
                    },
                );
            }
        }
        if let Some(pattern) = &rule.pattern {
            match patterns.get(pattern) {
                Some(Ok(re)) if re.is_match(text) => {}
                Some(Ok(_)) => push(
                    path,
                    SchemaViolation::PatternMismatch {
                        value: text.to_string(),
                        pattern: pattern.clone(),
                    },
                ),
                Some(Err(error)) => push(
                    path,
                    SchemaViolation::InvalidPattern {
                        pattern: pattern.clone(),
                        error: error.clone(),
                    },
                ),
                None => push(
                    path,
                    SchemaViolation::InvalidPattern {
                        pattern: pattern.clone(),
                        error: "pattern was never registered".to_string(),
                    },
                ),
            }
        }
    }

    if let (Some(items_type), Some(items)) = (rule.items, value.as_array()) {
        for (i, item) in items.iter().enumerate() {
            if !items_type.accepts(item) {
                push(
                    &format!("{path}[{i}]"),
                    SchemaViolation::WrongType {
                        expected: items_type.name().to_string(),
                        found: json_type_name(item).to_string(),
                    },
                );
            }
        }
    }

    if let (Some(values_type), Some(map)) = (rule.values, value.as_object()) {
        for (key, entry) in map {
            if !values_type.accepts(entry) {
                push(
                    &format!("{path}.{key}"),
                    SchemaViolation::WrongType {
                        expected: values_type.name().to_string(),
                        found: json_type_name(entry).to_string(),
                    },
                );
            }
        }
    }
}

/// Reject keys of closed objects that no rule declares.
fn check_unknown_keys(
    schema: &Schema,
    value: &Value,
    normalized: &str,
    concrete: &str,
    push: &mut impl FnMut(&str, SchemaViolation),
) {
    match value {
        Value::Object(map) => {
            if !normalized.is_empty() {
                match schema.rule(normalized) {
                    // Undeclared subtree; its key was already reported.
                    None => return,
                    Some(rule) if rule.values.is_some() => return,
                    Some(_) => {}
                }
            }
            let declared = schema.declared_children(normalized);
            for (key, child) in map {
                let child_concrete = if concrete.is_empty() {
                    key.clone()
                } else {
                    format!("{concrete}.{key}")
                };
                if normalized.is_empty() && key == VERSION_KEY {
                    continue;
                }
                if !declared.contains(&key.as_str()) {
                    push(&child_concrete, SchemaViolation::UnknownField);
                    continue;
                }
                let child_normalized = if normalized.is_empty() {
                    key.clone()
                } else {
                    format!("{normalized}.{key}")
                };
                check_unknown_keys(schema, child, &child_normalized, &child_concrete, push);
            }
        }
        Value::Array(items) => {
            let element = format!("{normalized}[]");
            if schema.fields.iter().any(|r| r.path.starts_with(&format!("{element}."))) {
                for (i, item) in items.iter().enumerate() {
                    if let Value::Object(map) = item {
                        let declared = schema.declared_children(&element);
                        for (key, child) in map {
                            let child_concrete = format!("{concrete}[{i}].{key}");
                            if !declared.contains(&key.as_str()) {
                                push(&child_concrete, SchemaViolation::UnknownField);
                                continue;
                            }
                            check_unknown_keys(
                                schema,
                                child,
                                &format!("{element}.{key}"),
                                &child_concrete,
                                push,
                            );
                        }
                    }
                }
            }
        }
        _ => {}
    }
}
