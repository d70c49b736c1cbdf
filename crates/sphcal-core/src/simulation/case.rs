//! Case directory layout.
//!
//! ```text
//! <cases_dir>/<Case>/<Case>_Def.xml          case definition
//! <cases_dir>/<Case>/<Case>_linux64_GPU.sh   launch script (win64: .bat)
//! <cases_dir>/<Case>/<Case>_out/measurements engine output
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{CalResult, CalibrationError};
use crate::models::CONTRACT_FILE_PREFIX;

const BACKUP_MARKER: &str = "backup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Whatever the current build targets.
    #[default]
    Auto,
    Win64,
    Linux64,
}

impl Platform {
    pub fn resolve(self) -> Platform {
        match self {
            Platform::Auto if cfg!(windows) => Platform::Win64,
            Platform::Auto => Platform::Linux64,
            other => other,
        }
    }

    fn script_extension(self) -> &'static str {
        match self.resolve() {
            Platform::Win64 => "bat",
            _ => "sh",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Platform::Auto => "auto",
            Platform::Win64 => "win64",
            Platform::Linux64 => "linux64",
        })
    }
}

impl FromStr for Platform {
    type Err = CalibrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Platform::Auto),
            "win64" | "windows" => Ok(Platform::Win64),
            "linux64" | "linux" => Ok(Platform::Linux64),
            other => Err(CalibrationError::Config(format!("unknown platform '{other}'"))),
        }
    }
}

/// A simulation case on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Case {
    pub name: String,
    pub dir: PathBuf,
    pub definition: PathBuf,
    pub platform: Platform,
}

impl Case {
    pub fn open(cases_dir: &Path, name: &str, platform: Platform) -> CalResult<Self> {
        Self::from_dir(&cases_dir.join(name), platform)
    }

    pub fn from_dir(dir: &Path, platform: Platform) -> CalResult<Self> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CalibrationError::Config(format!("'{}' is not a case directory", dir.display())))?;
        if !dir.is_dir() {
            return Err(CalibrationError::Config(format!(
                "case directory '{}' does not exist",
                dir.display()
            )));
        }

        let mut definitions: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                let file_name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
                path.extension().is_some_and(|ext| ext == "xml")
                    && file_name.contains(name.as_str())
                    && !file_name.contains(BACKUP_MARKER)
            })
            .collect();
        definitions.sort();
        if definitions.len() > 1 {
            warn!(case = %name, count = definitions.len(), "multiple case definitions found, using the first");
        }
        let definition = definitions.into_iter().next().ok_or_else(|| {
            CalibrationError::Config(format!("no case definition for '{name}' in {}", dir.display()))
        })?;

        Ok(Self {
            name,
            dir: dir.to_path_buf(),
            definition,
            platform: platform.resolve(),
        })
    }

    pub fn launch_script(&self) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_GPU.{}",
            self.name,
            self.platform,
            self.platform.script_extension()
        ))
    }

    /// Output directory the engine leaves behind; its presence triggers the
    /// overwrite prompt.
    pub fn output_dir(&self) -> PathBuf {
        self.dir.join(format!("{}_out", self.name))
    }

    pub fn measurement_dir(&self) -> PathBuf {
        self.output_dir().join("measurements")
    }
}

/// Names of all case directories, sorted.
pub fn list_cases(cases_dir: &Path) -> CalResult<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(cases_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}

/// Contract files (`HyperParameter_Contract*.txt`) in `dir`, sorted.
pub fn list_contract_files(dir: &Path) -> CalResult<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path.extension().is_some_and(|ext| ext == "txt")
                && path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with(CONTRACT_FILE_PREFIX))
        })
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_case(root: &Path, name: &str, files: &[&str]) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for file in files {
            fs::write(dir.join(file), "<case/>").unwrap();
        }
        dir
    }

    #[test]
    fn test_case_layout() {
        let root = tempfile::tempdir().unwrap();
        make_case(root.path(), "Flume", &["Flume_Def_backup.xml", "Flume_Def.xml", "other.xml"]);
        let case = Case::open(root.path(), "Flume", Platform::Linux64).unwrap();
        assert_eq!(case.definition, root.path().join("Flume/Flume_Def.xml"));
        assert_eq!(case.launch_script(), root.path().join("Flume/Flume_linux64_GPU.sh"));
        assert_eq!(case.measurement_dir(), root.path().join("Flume/Flume_out/measurements"));

        let win = Case::open(root.path(), "Flume", Platform::Win64).unwrap();
        assert_eq!(win.launch_script(), root.path().join("Flume/Flume_win64_GPU.bat"));
    }

    #[test]
    fn test_case_without_definition() {
        let root = tempfile::tempdir().unwrap();
        make_case(root.path(), "Empty", &["Empty_Def_backup.xml"]);
        assert!(matches!(
            Case::open(root.path(), "Empty", Platform::Linux64),
            Err(CalibrationError::Config(_))
        ));
        assert!(Case::open(root.path(), "Missing", Platform::Linux64).is_err());
    }

    #[test]
    fn test_listing() {
        let root = tempfile::tempdir().unwrap();
        make_case(root.path(), "B", &[]);
        make_case(root.path(), "A", &[]);
        fs::write(root.path().join("HyperParameter_Contract-X.txt"), "").unwrap();
        fs::write(root.path().join("notes.txt"), "").unwrap();
        assert_eq!(list_cases(root.path()).unwrap(), ["A", "B"]);
        assert_eq!(
            list_contract_files(root.path()).unwrap(),
            [root.path().join("HyperParameter_Contract-X.txt")]
        );
    }

    #[test]
    fn test_platform_parse_and_resolve() {
        assert_eq!("LINUX64".parse::<Platform>().unwrap(), Platform::Linux64);
        assert!("amiga".parse::<Platform>().is_err());
        assert_ne!(Platform::Auto.resolve(), Platform::Auto);
    }
}
