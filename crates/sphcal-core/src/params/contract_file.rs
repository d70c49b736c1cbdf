//! Human-editable contract file: one `<serialized contract>=><value>` per
//! line. Blank lines and lines starting with `#` are ignored.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::errors::{CalResult, CalibrationError};
use crate::models::{content_digest, CONTRACT_FILE_PREFIX};
use crate::params::contract::ParameterContract;
use crate::params::set::ParameterSet;

const VALUE_SEPARATOR: &str = "=>";

/// A contract file loaded from disk.
#[derive(Debug, Clone)]
pub struct ContractFile {
    pub path: PathBuf,
    pub parameters: ParameterSet,
    /// SHA-256 of the raw file contents.
    pub digest: String,
}

impl ContractFile {
    pub fn load(path: &Path) -> CalResult<Self> {
        let text = fs::read_to_string(path)?;
        let parameters = parse_contracts(&text)?;
        info!(path = %path.display(), count = parameters.len(), "loaded parameter contracts");
        Ok(Self {
            path: path.to_path_buf(),
            parameters,
            digest: content_digest(text.as_bytes()),
        })
    }

    /// Session name: the file-name suffix after the first `-`, without
    /// extension (`HyperParameter_Contract-Viscosity.txt` → `Viscosity`).
    pub fn session_name(&self) -> String {
        session_name_for(&self.path)
    }
}

pub fn session_name_for(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match stem.split_once('-') {
        Some((_, suffix)) if !suffix.is_empty() => suffix.to_string(),
        _ => stem,
    }
}

/// Conventional file name for a named contract set.
pub fn contract_file_name(name: &str) -> String {
    format!("{CONTRACT_FILE_PREFIX}-{name}.txt")
}

pub fn parse_contracts(text: &str) -> CalResult<ParameterSet> {
    let mut set = ParameterSet::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (slug, value) = line.rsplit_once(VALUE_SEPARATOR).ok_or_else(|| {
            CalibrationError::Validation(format!(
                "line {}: expected '<contract>{VALUE_SEPARATOR}<value>'",
                line_no + 1
            ))
        })?;
        let contract = ParameterContract::deserialize(slug)?;
        let value = contract.kind().parse(value).ok_or_else(|| {
            CalibrationError::Validation(format!(
                "line {}: value '{}' is not numeric",
                line_no + 1,
                value.trim()
            ))
        })?;
        if set.get(&contract).is_some() {
            return Err(CalibrationError::Validation(format!(
                "line {}: duplicate contract {}",
                line_no + 1,
                contract.label()
            )));
        }
        set.append(contract, value)?;
    }
    Ok(set)
}

pub fn render_contracts(set: &ParameterSet) -> String {
    let mut out = String::new();
    for (contract, value) in set.iter() {
        out.push_str(&contract.serialize());
        out.push_str(VALUE_SEPARATOR);
        out.push_str(&contract.render(value));
        out.push('\n');
    }
    out
}

/// Write `set` to `path`, creating parent directories.
pub fn write_contract_file(path: &Path, set: &ParameterSet) -> CalResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    file.write_all(render_contracts(set).as_bytes())?;
    info!(path = %path.display(), count = set.len(), "wrote parameter contracts");
    Ok(())
}
