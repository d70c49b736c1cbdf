//! Writes parameter values into the case definition and persists it.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::document::tree::{ConfigDocument, ElementPath};
use crate::errors::{CalResult, CalibrationError};
use crate::params::{ParameterContract, ParameterSet};

/// Owns one case definition for the duration of a session. It is the only
/// writer of that file.
#[derive(Debug)]
pub struct ConfigDocumentBinder {
    path: PathBuf,
    document: ConfigDocument,
}

impl ConfigDocumentBinder {
    pub fn open(path: &Path) -> CalResult<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            document: ConfigDocument::load(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &ConfigDocument {
        &self.document
    }

    pub fn apply(&mut self, params: &ParameterSet) -> CalResult<()> {
        apply(&mut self.document, params)
    }

    pub fn persist(&self) -> CalResult<PathBuf> {
        persist(&self.document, &self.path)
    }
}

/// Locate the single element `contract` addresses.
pub fn resolve(document: &ConfigDocument, contract: &ParameterContract) -> CalResult<ElementPath> {
    let mut matches = document.select(contract.node_id())?;
    if matches.is_empty() {
        return Err(CalibrationError::NodeNotFound(contract.node_id().to_string()));
    }
    if let Some(key) = contract.secondary_key() {
        return matches
            .into_iter()
            .find(|path| {
                document
                    .element(path)
                    .and_then(|e| e.attribute(&key.attribute))
                    == Some(key.value.as_str())
            })
            .ok_or_else(|| {
                CalibrationError::NodeNotFound(format!(
                    "{} with {}='{}'",
                    contract.node_id(),
                    key.attribute,
                    key.value
                ))
            });
    }
    if contract.index() >= matches.len() {
        return Err(CalibrationError::AmbiguousKey {
            node_id: contract.node_id().to_string(),
            index: contract.index(),
            matches: matches.len(),
        });
    }
    Ok(matches.swap_remove(contract.index()))
}

/// Overwrite the target attribute of every contract in `params`.
///
/// All targets are resolved before anything is written, so a failing
/// contract leaves the document untouched.
pub fn apply(document: &mut ConfigDocument, params: &ParameterSet) -> CalResult<()> {
    let mut writes = Vec::with_capacity(params.len());
    for (contract, value) in params.iter() {
        let path = resolve(document, contract)?;
        let has_attribute = document
            .element(&path)
            .map(|e| e.attribute(contract.attribute()).is_some())
            .unwrap_or(false);
        if !has_attribute {
            return Err(CalibrationError::AttributeNotFound {
                node_id: contract.node_id().to_string(),
                attribute: contract.attribute().to_string(),
            });
        }
        writes.push((path, contract, contract.render(value)));
    }

    for (path, contract, rendered) in writes {
        if let Some(element) = document.element_mut(&path) {
            element.set_attribute(contract.attribute(), rendered.as_str());
            debug!(contract = %contract.label(), value = %rendered, "bound parameter");
        }
    }
    Ok(())
}

/// `<stem>_backup.<ext>` beside `original`.
pub fn backup_path(original: &Path) -> PathBuf {
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match original.extension() {
        Some(ext) => format!("{stem}_backup.{}", ext.to_string_lossy()),
        None => format!("{stem}_backup"),
    };
    original.with_file_name(name)
}

/// Write `document` over `original_path`. The first call copies the
/// original bytes to [`backup_path`]; later calls leave that copy alone.
pub fn persist(document: &ConfigDocument, original_path: &Path) -> CalResult<PathBuf> {
    let backup = backup_path(original_path);
    if !backup.exists() && original_path.exists() {
        fs::copy(original_path, &backup)?;
        info!(backup = %backup.display(), "backed up case definition");
    }
    fs::write(original_path, document.to_xml_string()?)?;
    debug!(path = %original_path.display(), "persisted case definition");
    Ok(backup)
}
