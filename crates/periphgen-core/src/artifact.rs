//! Generated artifacts and their provenance.

use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::sha256_hex;

/// First line of every provenance header (followed by the version).
pub const PROVENANCE_BEGIN: &str = "// @generated by periphgen";
/// Last line of every provenance header.
pub const PROVENANCE_END: &str = "// end of provenance";

/// A named input identified by content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIdentity {
    /// File name, without directories.
    pub name: String,
    pub sha256: String,
}

impl SourceIdentity {
    pub fn new(name: impl Into<String>, content: &[u8]) -> Self {
        Self {
            name: name.into(),
            sha256: sha256_hex(content),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub descriptor: SourceIdentity,
    pub template: SourceIdentity,
    /// Digest over the canonical platform/peripheral/board documents.
    pub metadata_digest: String,
    pub generator_version: String,
    /// Wall-clock time of this render. Never embedded in the header.
    pub generation_timestamp: DateTime<Utc>,
    /// Timestamp pinned by `SOURCE_DATE_EPOCH`, embedded in the header.
    pub reproducible_timestamp: Option<DateTime<Utc>>,
}

impl Provenance {
    /// Header lines prepended to the rendered body, newline-terminated.
    pub fn header(&self) -> String {
        let mut out = format!(
            "{PROVENANCE_BEGIN} {}. DO NOT EDIT.\n",
            self.generator_version
        );
        out.push_str(&format!(
            "// descriptor: {} sha256:{}\n",
            self.descriptor.name, self.descriptor.sha256
        ));
        out.push_str(&format!(
            "// template: {} sha256:{}\n",
            self.template.name, self.template.sha256
        ));
        out.push_str(&format!("// metadata: sha256:{}\n", self.metadata_digest));
        if let Some(ts) = self.reproducible_timestamp {
            out.push_str(&format!(
                "// generated: {}\n",
                ts.to_rfc3339_opts(SecondsFormat::Secs, true)
            ));
        }
        out.push_str(PROVENANCE_END);
        out.push('\n');
        out
    }
}

/// One generated source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// File name, e.g. `gpioa.c`.
    pub file_name: String,
    /// Output path relative to the output directory: `<family>/<file_name>`.
    pub relative_path: PathBuf,
    /// Full text including the provenance header.
    pub text: String,
    pub provenance: Provenance,
}

impl Artifact {
    /// SHA-256 of the full artifact text.
    pub fn digest(&self) -> String {
        sha256_hex(self.text.as_bytes())
    }

    /// Number of lines occupied by the provenance header.
    pub fn header_line_count(&self) -> usize {
        self.text
            .lines()
            .position(|l| l == PROVENANCE_END)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// Text after the provenance header.
    pub fn body(&self) -> &str {
        match self.text.find(PROVENANCE_END) {
            Some(pos) => {
                let rest = &self.text[pos + PROVENANCE_END.len()..];
                rest.strip_prefix('\n').unwrap_or(rest)
            }
            None => &self.text,
        }
    }
}
