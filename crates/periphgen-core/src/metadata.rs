//! Hand-authored metadata documents and their typed views.
//!
//! Documents are loaded as raw JSON ([`MetadataDocument`]) and only become
//! usable for generation once the schema validator has turned them into
//! [`ValidatedMetadata`]. The typed views below are derived from validated
//! documents only.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::digest::json_digest;
use crate::error::{ContextError, GenerationError};

/// Metadata document kinds, each with its own schema family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Platform,
    Peripheral,
    Board,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Platform => "platform",
            DocumentKind::Peripheral => "peripheral",
            DocumentKind::Board => "board",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "platform" => Ok(DocumentKind::Platform),
            "peripheral" => Ok(DocumentKind::Peripheral),
            "board" => Ok(DocumentKind::Board),
            other => Err(format!(
                "unknown document kind {other:?} (expected platform, peripheral or board)"
            )),
        }
    }
}

/// A metadata document as read from disk, not yet validated.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataDocument {
    pub source: PathBuf,
    pub value: Value,
}

impl MetadataDocument {
    /// Read and parse a JSON document.
    pub fn load(path: &Path) -> Result<Self, GenerationError> {
        let text = std::fs::read_to_string(path).map_err(|source| GenerationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value = serde_json::from_str(&text).map_err(|source| GenerationError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            source: path.to_path_buf(),
            value,
        })
    }

    pub fn from_value(source: impl Into<PathBuf>, value: Value) -> Self {
        Self {
            source: source.into(),
            value,
        }
    }

    /// Name used in diagnostics.
    pub fn name(&self) -> String {
        self.source.display().to_string()
    }
}

/// A document that passed schema validation.
///
/// There is no public constructor: the only way to obtain one is
/// [`crate::schema::validate`] (or [`crate::SchemaRegistry::validate`]).
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedMetadata {
    kind: DocumentKind,
    version: u32,
    document: Value,
    digest: String,
    source: PathBuf,
}

impl ValidatedMetadata {
    pub(crate) fn new(kind: DocumentKind, version: u32, document: Value, source: PathBuf) -> Self {
        let digest = json_digest(&document);
        Self {
            kind,
            version,
            document,
            digest,
            source,
        }
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// SHA-256 of the canonical document.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Resolve a path written in the document relative to the document's
    /// own directory.
    pub fn resolve_path(&self, relative: &str) -> PathBuf {
        let base = self.source.parent().unwrap_or_else(|| Path::new(""));
        base.join(relative)
    }

    fn view<T: DeserializeOwned>(&self, expected: DocumentKind) -> Result<T, ContextError> {
        if self.kind != expected {
            return Err(ContextError::WrongKind {
                expected: expected.to_string(),
                found: self.kind.to_string(),
            });
        }
        serde_json::from_value(self.document.clone()).map_err(|e| ContextError::InvalidMetadata {
            kind: expected.to_string(),
            detail: e.to_string(),
        })
    }
}

/// Source language the toolchain is driven in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceLanguage {
    #[serde(rename = "c")]
    C,
    #[serde(rename = "c++")]
    Cpp,
}

impl SourceLanguage {
    /// Value passed to the compiler's `-x` option.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceLanguage::C => "c",
            SourceLanguage::Cpp => "c++",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Toolchain {
    pub cc: String,
    pub language: SourceLanguage,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub include_paths: Vec<String>,
    pub syntax_checker: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Hardware idiom flags templates branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Idioms {
    /// Dedicated set/clear register (e.g. `BSRR`) instead of read-modify-write.
    pub atomic_set_clear: bool,
    pub toggle_register: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformMetadata {
    pub name: String,
    pub family: String,
    pub description: Option<String>,
    /// Descriptor path relative to the platform document.
    pub descriptor: String,
    pub arch: String,
    pub cpu: String,
    pub toolchain: Toolchain,
    pub idioms: Idioms,
}

impl PlatformMetadata {
    pub fn from_validated(meta: &ValidatedMetadata) -> Result<Self, ContextError> {
        meta.view(DocumentKind::Platform)
    }
}

/// Peripheral abstraction class; selects the smoke test shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeripheralClass {
    DigitalOutput,
    DigitalInput,
    Serial,
}

impl PeripheralClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeripheralClass::DigitalOutput => "digital_output",
            PeripheralClass::DigitalInput => "digital_input",
            PeripheralClass::Serial => "serial",
        }
    }

    /// Entry-point roles the smoke test calls, in call order.
    pub fn required_entry_points(&self) -> &'static [&'static str] {
        match self {
            PeripheralClass::DigitalOutput => &["set", "read"],
            PeripheralClass::DigitalInput => &["read"],
            PeripheralClass::Serial => &["configure", "transfer"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeripheralMetadata {
    pub name: String,
    pub description: Option<String>,
    pub class: PeripheralClass,
    /// Descriptor instance name, e.g. `GPIOA`.
    pub instance: String,
    /// Template path relative to the peripheral document.
    pub template: String,
    pub pins: Option<u32>,
    /// Role → register name.
    pub roles: BTreeMap<String, String>,
    /// Role → C symbol.
    pub entry_points: BTreeMap<String, String>,
}

impl PeripheralMetadata {
    pub fn from_validated(meta: &ValidatedMetadata) -> Result<Self, ContextError> {
        meta.view(DocumentKind::Peripheral)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardMetadata {
    pub name: String,
    pub description: Option<String>,
    /// Platform document path relative to the board document.
    pub platform: String,
    /// Peripheral document paths relative to the board document.
    pub peripherals: Vec<String>,
    pub clock_hz: Option<u64>,
}

impl BoardMetadata {
    pub fn from_validated(meta: &ValidatedMetadata) -> Result<Self, ContextError> {
        meta.view(DocumentKind::Board)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::validate;
    use serde_json::json;

    fn peripheral_doc() -> MetadataDocument {
        MetadataDocument::from_value(
            "meta/gpioa.json",
            json!({
                "schema_version": 1,
                "name": "gpioa",
                "class": "digital_output",
                "instance": "GPIOA",
                "template": "../templates/gpio.c.j2",
                "pins": 16,
                "roles": { "set": "BSRR", "read": "IDR" },
                "entry_points": { "set": "gpioa_set", "read": "gpioa_read" }
            }),
        )
    }

    #[test]
    fn test_typed_peripheral_view() {
        let validated = validate(&peripheral_doc(), DocumentKind::Peripheral).unwrap();
        let view = PeripheralMetadata::from_validated(&validated).unwrap();
        assert_eq!(view.class, PeripheralClass::DigitalOutput);
        assert_eq!(view.roles["set"], "BSRR");
        assert_eq!(view.pins, Some(16));
        assert_eq!(
            validated.resolve_path(&view.template),
            PathBuf::from("meta/../templates/gpio.c.j2")
        );
    }

    #[test]
    fn test_wrong_kind_view_rejected() {
        let validated = validate(&peripheral_doc(), DocumentKind::Peripheral).unwrap();
        let err = PlatformMetadata::from_validated(&validated).unwrap_err();
        assert!(matches!(err, ContextError::WrongKind { .. }));
    }

    #[test]
    fn test_digest_ignores_key_order() {
        let a = validate(&peripheral_doc(), DocumentKind::Peripheral).unwrap();
        let mut value = peripheral_doc().value;
        let reordered: serde_json::Map<String, Value> = value
            .as_object_mut()
            .unwrap()
            .iter()
            .rev()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let b = validate(
            &MetadataDocument::from_value("meta/gpioa.json", Value::Object(reordered)),
            DocumentKind::Peripheral,
        )
        .unwrap();
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_load_reports_json_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{\n  \"name\": \n}").unwrap();
        let err = MetadataDocument::load(&path).unwrap_err();
        assert_eq!(err.phase(), "input");
        let (location, _) = &err.located_messages()[0];
        assert!(location.as_deref().unwrap().ends_with(":3"));
    }

    #[test]
    fn test_document_kind_from_str() {
        assert_eq!("board".parse::<DocumentKind>().unwrap(), DocumentKind::Board);
        assert!("widget".parse::<DocumentKind>().is_err());
    }
}
