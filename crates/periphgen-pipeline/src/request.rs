//! Generation requests and board expansion.

use std::path::{Path, PathBuf};

use periphgen_core::{
    validate, BoardMetadata, DocumentKind, GenerationError, MetadataDocument,
};
use serde::{Deserialize, Serialize};

/// One (platform, peripheral) pair, optionally in the context of a board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub platform: PathBuf,
    pub peripheral: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board: Option<PathBuf>,
}

impl GenerationRequest {
    pub fn new(platform: impl Into<PathBuf>, peripheral: impl Into<PathBuf>) -> Self {
        Self {
            platform: platform.into(),
            peripheral: peripheral.into(),
            board: None,
        }
    }

    pub fn with_board(mut self, board: impl Into<PathBuf>) -> Self {
        self.board = Some(board.into());
        self
    }

    /// `platform/peripheral` from file stems; used until the metadata
    /// itself has been validated.
    pub fn label(&self) -> String {
        format!("{}/{}", stem(&self.platform), stem(&self.peripheral))
    }

    /// Expand a board document into one request per listed peripheral.
    /// Paths inside the board are relative to the board file.
    pub fn from_board(board: &Path) -> Result<Vec<Self>, GenerationError> {
        let document = MetadataDocument::load(board)?;
        let validated = validate(&document, DocumentKind::Board)?;
        let view = BoardMetadata::from_validated(&validated)?;
        let platform = validated.resolve_path(&view.platform);
        Ok(view
            .peripherals
            .iter()
            .map(|p| Self {
                platform: platform.clone(),
                peripheral: validated.resolve_path(p),
                board: Some(board.to_path_buf()),
            })
            .collect())
    }
}

pub(crate) fn stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    // `stm32f4.platform.json` → `stm32f4`
    name.split('.').next().unwrap_or(&name).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_uses_file_stems() {
        let request = GenerationRequest::new("meta/stm32f4.platform.json", "meta/gpioa.json");
        assert_eq!(request.label(), "stm32f4/gpioa");
    }

    #[test]
    fn test_board_expands_relative_to_board_file() {
        let dir = tempfile::tempdir().unwrap();
        let board = dir.path().join("nucleo.board.json");
        std::fs::write(
            &board,
            r#"{
                "schema_version": 1,
                "name": "nucleo-f401re",
                "platform": "stm32f4.platform.json",
                "peripherals": ["gpioa.json", "gpiob.json"],
                "clock_hz": 84000000
            }"#,
        )
        .unwrap();

        let requests = GenerationRequest::from_board(&board).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].platform, dir.path().join("stm32f4.platform.json"));
        assert_eq!(requests[1].peripheral, dir.path().join("gpiob.json"));
        assert_eq!(requests[0].board.as_deref(), Some(board.as_path()));
    }

    #[test]
    fn test_invalid_board_reports_schema_errors() {
        let dir = tempfile::tempdir().unwrap();
        let board = dir.path().join("broken.json");
        std::fs::write(&board, r#"{ "schema_version": 1, "name": "x" }"#).unwrap();
        let err = GenerationRequest::from_board(&board).unwrap_err();
        assert_eq!(err.phase(), "schema");
    }
}
