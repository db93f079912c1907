//! Configuration for self-decrypting code protection

use crate::{SdcError, SdcResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Native gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeConfig {
    /// Emit a native check routine for every extracted unit
    #[serde(default)]
    pub enabled: bool,

    /// Redirect one call per unit through its native routine.
    /// When disabled, every routine is a check-only stub.
    #[serde(default = "default_true")]
    pub weave_calls: bool,

    /// Package name baked into the generated native source
    #[serde(default)]
    pub package_name: Option<String>,

    /// Glob selecting package entries that may serve as gate files
    #[serde(default = "default_gate_pattern")]
    pub gate_pattern: String,

    /// Offset of the checksummed range inside the gate file
    #[serde(default)]
    pub gate_offset: usize,

    /// Upper bound on the checksummed range length
    #[serde(default = "default_gate_max_len")]
    pub gate_max_len: usize,

    /// Shared library name loaded by the gate class
    #[serde(default = "default_library_name")]
    pub library_name: String,
}

fn default_true() -> bool {
    true
}

fn default_gate_pattern() -> String {
    "**/*.dex".to_string()
}

fn default_gate_max_len() -> usize {
    100
}

fn default_library_name() -> String {
    "native-lib".to_string()
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            weave_calls: true,
            package_name: None,
            gate_pattern: default_gate_pattern(),
            gate_offset: 0,
            gate_max_len: default_gate_max_len(),
            library_name: default_library_name(),
        }
    }
}

impl NativeConfig {
    /// Native routines enabled with call weaving
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Only emit check-only stubs
    pub fn check_only(mut self) -> Self {
        self.weave_calls = false;
        self
    }

    /// Set the package name
    pub fn package_name(mut self, name: impl Into<String>) -> Self {
        self.package_name = Some(name.into());
        self
    }

    /// Set the gate file pattern
    pub fn gate_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.gate_pattern = pattern.into();
        self
    }
}

/// Configuration for a protection pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdcConfig {
    /// Encrypt extracted units and load them through the managed loader.
    /// When disabled, unit classes are added to the program and called directly.
    #[serde(default = "default_true")]
    pub encrypt_units: bool,

    /// Only replace guards with digest checks, without extracting blocks
    #[serde(default)]
    pub guard_only: bool,

    /// Class name patterns to leave untouched (`*`, `**`, `?` globs over dotted names)
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    /// Native gate settings
    #[serde(default)]
    pub native: NativeConfig,
}

fn default_exclude() -> Vec<String> {
    vec!["org.spongycastle.crypto.digests.**".to_string()]
}

impl Default for SdcConfig {
    fn default() -> Self {
        Self {
            encrypt_units: true,
            guard_only: false,
            exclude: default_exclude(),
            native: NativeConfig::default(),
        }
    }
}

impl SdcConfig {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config from a JSON file
    pub fn from_json_file(path: &Path) -> SdcResult<Self> {
        if !path.exists() {
            return Err(SdcError::FileNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parse a config from JSON text
    pub fn from_json_str(text: &str) -> SdcResult<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| SdcError::Config(e.to_string()))?;
        if config.guard_only && config.native.enabled {
            return Err(SdcError::Config(
                "native routines require block extraction; disable guard_only".to_string(),
            ));
        }
        Ok(config)
    }

    /// Encrypt units (default) or call them directly
    pub fn encrypt_units(mut self, encrypt: bool) -> Self {
        self.encrypt_units = encrypt;
        self
    }

    /// Only rewrite guards
    pub fn guard_only(mut self, guard_only: bool) -> Self {
        self.guard_only = guard_only;
        self
    }

    /// Add exclude pattern
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    /// Set native configuration
    pub fn native(mut self, native: NativeConfig) -> Self {
        self.native = native;
        self
    }
}

/// Compile a glob over `/`-separated names: `**/` spans any number of
/// segments, `*` and `?` stay inside one.
pub(crate) fn glob_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let chars: Vec<char> = pattern.replace('\\', "/").chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                out.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                out.push_str("[^/]");
                i += 1;
            }
            c => {
                out.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }
    out.push('$');
    Regex::new(&out)
}

/// Class patterns use dots where paths use slashes
pub(crate) fn class_glob(pattern: &str) -> Result<Regex, regex::Error> {
    glob_regex(&pattern.replace('.', "/"))
}

pub(crate) fn class_path(name: &str) -> String {
    name.replace('.', "/")
}
