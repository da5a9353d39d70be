//! Pre-extracted document input.
//!
//! OCR and layout analysis happen upstream; this crate consumes their output
//! as [`Document`] values.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::errors::FundGraphResult;
use crate::models::Document;

pub trait DocumentSource {
    fn documents(&self) -> FundGraphResult<Vec<Document>>;
}

/// One JSON-serialized [`Document`] per file, anywhere under `root`.
#[derive(Clone, Debug)]
pub struct JsonDirectorySource {
    root: PathBuf,
}

impl JsonDirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `.json` files under the root, sorted by path.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .map(|ext| ext.eq_ignore_ascii_case("json"))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        paths
    }

    pub fn load(path: &Path) -> FundGraphResult<Document> {
        let content = std::fs::read_to_string(path)?;
        let document: Document = serde_json::from_str(&content)?;
        document.as_of.validate()?;
        Ok(document)
    }
}

impl DocumentSource for JsonDirectorySource {
    /// Unreadable or invalid files are logged and skipped.
    fn documents(&self) -> FundGraphResult<Vec<Document>> {
        let mut documents = Vec::new();
        for path in self.paths() {
            match Self::load(&path) {
                Ok(doc) => {
                    debug!(path = %path.display(), document_id = doc.document_id.as_str(), "loaded document");
                    documents.push(doc);
                }
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable document"),
            }
        }
        Ok(documents)
    }
}
