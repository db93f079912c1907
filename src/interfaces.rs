//! Boundaries to the outside world.
//!
//! The transformation itself only sees a [`Program`]. Getting one in and out,
//! reading the host package and compiling native sources are left to
//! collaborators behind these traits.

use crate::ir::Program;
use crate::{SdcError, SdcResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

/// Produces the program to protect
pub trait ProgramSource {
    fn load(&self) -> SdcResult<Program>;
}

/// Receives the protected program
pub trait ProgramSink {
    fn store(&self, program: &Program) -> SdcResult<()>;
}

/// Read access to the entries of the host package
pub trait PackageContents: Send + Sync {
    /// Entry names, `/`-separated and relative to the package root
    fn entries(&self) -> SdcResult<Vec<String>>;

    fn read(&self, entry: &str) -> SdcResult<Vec<u8>>;
}

/// Compiles generated native sources into shared libraries
pub trait NativeToolchain {
    fn build(&self, source_dir: &Path, out_dir: &Path) -> anyhow::Result<()>;
}

/// Program stored as a JSON document
#[derive(Debug, Clone)]
pub struct JsonProgramFile {
    path: PathBuf,
}

impl JsonProgramFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ProgramSource for JsonProgramFile {
    fn load(&self) -> SdcResult<Program> {
        if !self.path.exists() {
            return Err(SdcError::FileNotFound(self.path.display().to_string()));
        }
        let text = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl ProgramSink for JsonProgramFile {
    fn store(&self, program: &Program) -> SdcResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(program)?)?;
        Ok(())
    }
}

/// Unpacked package on disk
#[derive(Debug, Clone)]
pub struct DirectoryPackage {
    root: PathBuf,
}

impl DirectoryPackage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PackageContents for DirectoryPackage {
    fn entries(&self) -> SdcResult<Vec<String>> {
        if !self.root.is_dir() {
            return Err(SdcError::FileNotFound(self.root.display().to_string()));
        }
        let mut entries: Vec<String> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let relative = e.path().strip_prefix(&self.root).ok()?;
                let parts: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                Some(parts.join("/"))
            })
            .collect();
        entries.sort();
        Ok(entries)
    }

    fn read(&self, entry: &str) -> SdcResult<Vec<u8>> {
        let path = self.root.join(entry);
        if !path.is_file() {
            return Err(SdcError::FileNotFound(path.display().to_string()));
        }
        Ok(std::fs::read(path)?)
    }
}

/// Package held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryPackage {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MemoryPackage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.entries.insert(name.into(), data.into());
        self
    }
}

impl PackageContents for MemoryPackage {
    fn entries(&self) -> SdcResult<Vec<String>> {
        Ok(self.entries.keys().cloned().collect())
    }

    fn read(&self, entry: &str) -> SdcResult<Vec<u8>> {
        self.entries
            .get(entry)
            .cloned()
            .ok_or_else(|| SdcError::FileNotFound(entry.to_string()))
    }
}

/// External build command, run as `<program> <args...> <source_dir> <out_dir>`
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandToolchain {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl NativeToolchain for CommandToolchain {
    fn build(&self, source_dir: &Path, out_dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(out_dir)?;
        tracing::info!(
            "Building native sources in {} with {}",
            source_dir.display(),
            self.program.display()
        );
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(source_dir)
            .arg(out_dir)
            .output()?;
        if !output.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
