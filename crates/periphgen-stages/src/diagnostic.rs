//! Structured stage diagnostics and toolchain output parsing.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Diagnostic severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Note,
    Warning,
    Error,
}

impl Severity {
    fn from_tool(raw: &str) -> Self {
        match raw {
            "error" | "fatal error" => Severity::Error,
            "warning" => Severity::Warning,
            _ => Severity::Note,
        }
    }
}

/// Source location a diagnostic points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl Location {
    pub fn new(file: impl Into<String>, line: Option<usize>, column: Option<usize>) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.file)?;
        if let Some(line) = self.line {
            write!(f, ":{line}")?;
            if let Some(column) = self.column {
                write!(f, ":{column}")?;
            }
        }
        Ok(())
    }
}

/// One finding reported by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDiagnostic {
    pub severity: Severity,
    pub location: Option<Location>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found: Option<String>,
}

impl StageDiagnostic {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            location: None,
            message: message.into(),
            expected: None,
            found: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_values(mut self, expected: impl Into<String>, found: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self.found = Some(found.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for StageDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Note => "note",
        };
        if let Some(location) = &self.location {
            write!(f, "{location}: ")?;
        }
        write!(f, "{severity}: {}", self.message)?;
        if let (Some(expected), Some(found)) = (&self.expected, &self.found) {
            write!(f, " (expected {expected}, found {found})")?;
        }
        Ok(())
    }
}

fn toolchain_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^(?P<file>[^:\n]+):(?P<line>\d+):(?:(?P<col>\d+):)?\s*(?P<sev>fatal error|error|warning|note):\s*(?P<msg>.*?)\s*$",
        )
        .ok()
    })
    .as_ref()
}

/// Parse gcc/clang style `file:line[:col]: severity: message` lines.
///
/// Paths ending in one of `rename` keys' file names are reported under the
/// mapped name, so diagnostics point at the artifact rather than a
/// temporary directory.
pub fn parse_toolchain_output(output: &str, rename: &[(&str, &str)]) -> Vec<StageDiagnostic> {
    let Some(re) = toolchain_line() else {
        return Vec::new();
    };
    re.captures_iter(output)
        .map(|caps| {
            let raw_file = &caps["file"];
            let file = rename
                .iter()
                .find(|(suffix, _)| raw_file.ends_with(suffix))
                .map(|(_, name)| name.to_string())
                .unwrap_or_else(|| raw_file.to_string());
            let line = caps["line"].parse().ok();
            let column = caps.name("col").and_then(|c| c.as_str().parse().ok());
            StageDiagnostic::new(Severity::from_tool(&caps["sev"]), &caps["msg"])
                .with_location(Location::new(file, line, column))
        })
        .collect()
}

/// Diagnostic for a failing tool whose output had no parseable line.
pub fn fallback_diagnostic(tool: &str, exit_code: Option<i32>, stderr: &str) -> StageDiagnostic {
    let message = stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| match exit_code {
            Some(code) => format!("{tool} exited with status {code}"),
            None => format!("{tool} was terminated by a signal"),
        });
    StageDiagnostic::error(message)
}
