//! Packaging of the compiled native library
//!
//! Two steps run around the native build:
//!
//! 1. [`assign_gates`] picks, per routine, a package entry and byte range
//!    whose checksum the routine verifies before decrypting itself.
//! 2. After compilation, [`encrypt_library`] encrypts every implementation
//!    symbol in place. The key is read back from the symbol name and the
//!    range ends at the next global code symbol, which is the routine's
//!    plaintext wrapper.

use crate::config::{glob_regex, NativeConfig};
use crate::crypto::{apply_keystream, hash_range, key_from_hex};
use crate::interfaces::PackageContents;
use crate::native_weaver::{GateChecksum, NativeCheckRoutine, KEY_MARKER};
use crate::{SdcError, SdcResult};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use walkdir::WalkDir;

/// Suffix of the plaintext copy kept next to each encrypted library
pub const DECRYPTED_SUFFIX: &str = ".decrypted";

/// Global code symbol type in symbol listings
const CODE_SYMBOL: &str = "T";

/// One line of a symbol listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSymbol {
    pub address: u64,
    pub kind: String,
    pub name: String,
}

impl FromStr for NativeSymbol {
    type Err = SdcError;

    /// `<hex address> <type> <name>`
    fn from_str(line: &str) -> SdcResult<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [address, kind, name] => Ok(Self {
                address: u64::from_str_radix(address, 16).map_err(|e| {
                    SdcError::Native(format!("bad symbol address {:?}: {}", address, e))
                })?,
                kind: kind.to_string(),
                name: name.to_string(),
            }),
            _ => Err(SdcError::Native(format!("unrecognized symbol line {:?}", line))),
        }
    }
}

/// Parse a symbol listing, skipping lines that carry no address
pub fn parse_symbols(listing: &str) -> Vec<NativeSymbol> {
    listing
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match line.parse::<NativeSymbol>() {
            Ok(symbol) => Some(symbol),
            Err(e) => {
                if line.split_whitespace().count() == 2 {
                    tracing::debug!("Skipping debug symbol {:?}", line.trim());
                } else {
                    tracing::warn!("{}", e);
                }
                None
            }
        })
        .collect()
}

/// Whether `name` is an encrypted routine implementation
pub fn is_encrypted_symbol(name: &str) -> bool {
    name.starts_with("Java_") && name.contains(KEY_MARKER) && !name.starts_with('_')
}

/// A range of the library image that was encrypted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncryptedSection {
    pub symbol: String,
    pub offset: usize,
    pub len: usize,
}

/// Encrypt the code of every marked symbol in `image`.
///
/// Symbol addresses are taken as offsets into the image.
pub fn encrypt_marked_sections(
    image: &mut [u8],
    symbols: &[NativeSymbol],
) -> SdcResult<Vec<EncryptedSection>> {
    let mut ordered: Vec<&NativeSymbol> = symbols.iter().collect();
    ordered.sort_by_key(|s| s.address);

    let mut sections = Vec::new();
    for (i, symbol) in ordered.iter().enumerate() {
        if !is_encrypted_symbol(&symbol.name) {
            continue;
        }
        let key_hex = symbol.name.rsplit('_').next().unwrap_or_default();
        let key = key_from_hex(key_hex)?;

        let mut end = None;
        for next in &ordered[i + 1..] {
            if next.kind == CODE_SYMBOL {
                end = Some(*next);
                break;
            }
            tracing::warn!(
                "Skipping {} symbol {} after {}",
                next.kind,
                next.name,
                symbol.name
            );
        }
        let end = end.ok_or_else(|| {
            SdcError::Native(format!("no code symbol follows {}", symbol.name))
        })?;
        if is_encrypted_symbol(&end.name) {
            return Err(SdcError::Native(format!(
                "{} is directly followed by another encrypted symbol {}",
                symbol.name, end.name
            )));
        }

        let offset = usize::try_from(symbol.address)
            .map_err(|e| SdcError::Native(format!("{}: {}", symbol.name, e)))?;
        let len = end
            .address
            .checked_sub(symbol.address)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| SdcError::Native(format!("bad extent for {}", symbol.name)))?;
        let code = offset
            .checked_add(len)
            .and_then(|stop| image.get_mut(offset..stop))
            .ok_or_else(|| {
                SdcError::Native(format!(
                    "{} spans {:#x}..{:#x} outside the image",
                    symbol.name,
                    offset,
                    offset.saturating_add(len)
                ))
            })?;
        apply_keystream(&key, code);
        tracing::debug!("Encrypted {} ({} bytes at {:#x})", symbol.name, len, offset);
        sections.push(EncryptedSection {
            symbol: symbol.name.clone(),
            offset,
            len,
        });
    }
    Ok(sections)
}

/// Lists the defined symbols of a shared library
pub trait SymbolSource {
    fn symbols(&self, library: &Path) -> SdcResult<Vec<NativeSymbol>>;
}

/// Symbols from `nm --numeric-sort --defined-only`
#[derive(Debug, Clone)]
pub struct NmSymbolSource {
    nm: PathBuf,
}

impl Default for NmSymbolSource {
    fn default() -> Self {
        Self::new("nm")
    }
}

impl NmSymbolSource {
    pub fn new(nm: impl Into<PathBuf>) -> Self {
        Self { nm: nm.into() }
    }
}

impl SymbolSource for NmSymbolSource {
    fn symbols(&self, library: &Path) -> SdcResult<Vec<NativeSymbol>> {
        let output = Command::new(&self.nm)
            .args(["--numeric-sort", "--defined-only"])
            .arg(library)
            .output()
            .map_err(|e| anyhow::anyhow!("failed to run {}: {}", self.nm.display(), e))?;
        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "{} failed on {}: {}",
                self.nm.display(),
                library.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )
            .into());
        }
        Ok(parse_symbols(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Encrypt the marked symbols of `library` in place, keeping a plaintext
/// copy with [`DECRYPTED_SUFFIX`] next to it.
pub fn encrypt_library(
    library: &Path,
    source: &dyn SymbolSource,
) -> SdcResult<Vec<EncryptedSection>> {
    if !library.is_file() {
        return Err(SdcError::FileNotFound(library.display().to_string()));
    }
    let symbols = source.symbols(library)?;
    let mut image = std::fs::read(library)?;
    let sections = encrypt_marked_sections(&mut image, &symbols)?;

    let mut backup = library.as_os_str().to_owned();
    backup.push(DECRYPTED_SUFFIX);
    std::fs::copy(library, PathBuf::from(backup))?;
    std::fs::write(library, image)?;

    tracing::info!(
        "Encrypted {} routines in {}",
        sections.len(),
        library.display()
    );
    Ok(sections)
}

/// Encrypt every `.so` under `dir`, one per target architecture
pub fn encrypt_library_dir(
    dir: &Path,
    source: &dyn SymbolSource,
) -> SdcResult<Vec<(PathBuf, Vec<EncryptedSection>)>> {
    let libraries: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "so"))
        .collect();

    let mut results = Vec::with_capacity(libraries.len());
    for library in libraries {
        let sections = encrypt_library(&library, source)?;
        results.push((library, sections));
    }
    Ok(results)
}

/// Fail unless every routine's implementation was encrypted
pub fn check_coverage(
    routines: &[NativeCheckRoutine],
    sections: &[EncryptedSection],
) -> SdcResult<()> {
    for routine in routines {
        if !sections.iter().any(|s| s.symbol == routine.encrypted_symbol) {
            return Err(SdcError::Native(format!(
                "routine {} was not found in the library",
                routine.encrypted_symbol
            )));
        }
    }
    Ok(())
}

/// Choose a gate file and checksum range for every routine.
pub fn assign_gates(
    routines: &mut [NativeCheckRoutine],
    package: &dyn PackageContents,
    config: &NativeConfig,
) -> SdcResult<()> {
    if routines.is_empty() {
        return Ok(());
    }
    let pattern = glob_regex(&config.gate_pattern)
        .map_err(|e| SdcError::Config(format!("gate pattern {}: {}", config.gate_pattern, e)))?;
    let mut candidates: Vec<(String, Vec<u8>)> = Vec::new();
    for entry in package.entries()? {
        if !pattern.is_match(&entry) {
            continue;
        }
        let data = package.read(&entry)?;
        // an entry without bytes past the offset would gate on nothing
        if data.len() > config.gate_offset {
            candidates.push((entry, data));
        }
    }
    if candidates.is_empty() {
        return Err(SdcError::Native(format!(
            "no package entry matching {} has bytes past offset {}",
            config.gate_pattern, config.gate_offset
        )));
    }

    let mut rng = rand::thread_rng();
    for routine in routines.iter_mut() {
        let Some((file, data)) = candidates.choose(&mut rng) else {
            break;
        };
        let offset = config.gate_offset;
        let count = config.gate_max_len.min(data.len() - offset);
        if count == 0 {
            return Err(SdcError::Config("gate_max_len must be positive".into()));
        }
        let value = hash_range(data, offset, count)
            .ok_or_else(|| SdcError::Native(format!("empty gate range in {}", file)))?;
        tracing::debug!(
            "Gate for {}: {}[{}..{}] = {:#010x}",
            routine.method_name,
            file,
            offset,
            offset + count,
            value
        );
        routine.gate = Some(GateChecksum {
            file: file.clone(),
            offset,
            count,
            value,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hex_upper;
    use crate::interfaces::MemoryPackage;
    use crate::native_weaver::{encrypted_symbol, wrapper_symbol};

    const KEY: [u8; 16] = *b"0123456789abcdef";

    fn listing() -> String {
        let wrapper = wrapper_symbol("aBf1");
        format!(
            "0000000000000010 T {enc}\n\
             0000000000000020 t local_helper\n\
             0000000000000030 T {wrapper}\n\
             \x20                N debug_info\n\
             0000000000000038 T Java_sdc_Gate_plain\n",
            enc = encrypted_symbol(&wrapper, &KEY),
        )
    }

    #[test]
    fn test_parse_symbols() {
        let symbols = parse_symbols(&listing());
        assert_eq!(symbols.len(), 4);
        assert_eq!(symbols[1].address, 0x20);
        assert_eq!(symbols[1].kind, "t");
        assert!(is_encrypted_symbol(&symbols[0].name));
        assert!(!is_encrypted_symbol(&symbols[2].name));
        assert!(!is_encrypted_symbol("_Java_sdc_Gate_x_KEY_00"));
    }

    #[test]
    fn test_encrypts_up_to_next_code_symbol() {
        let symbols = parse_symbols(&listing());
        let original: Vec<u8> = (0..64u8).collect();
        let mut image = original.clone();

        let sections = encrypt_marked_sections(&mut image, &symbols).unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!((sections[0].offset, sections[0].len), (0x10, 0x20));
        assert_eq!(image[..0x10], original[..0x10]);
        assert_eq!(image[0x30..], original[0x30..]);
        assert_ne!(image[0x10..0x30], original[0x10..0x30]);

        apply_keystream(&KEY, &mut image[0x10..0x30]);
        assert_eq!(image, original);
    }

    #[test]
    fn test_rejects_bad_layouts() {
        let enc = |name: &str| format!("Java_sdc_Gate_{}_KEY_{}", name, hex_upper(&KEY));
        let adjacent = vec![
            NativeSymbol {
                address: 0,
                kind: "T".into(),
                name: enc("a"),
            },
            NativeSymbol {
                address: 8,
                kind: "T".into(),
                name: enc("b"),
            },
        ];
        assert!(encrypt_marked_sections(&mut [0u8; 16], &adjacent).is_err());

        let past_end = vec![
            NativeSymbol {
                address: 0,
                kind: "T".into(),
                name: enc("a"),
            },
            NativeSymbol {
                address: 64,
                kind: "T".into(),
                name: "Java_sdc_Gate_a".into(),
            },
        ];
        assert!(encrypt_marked_sections(&mut [0u8; 16], &past_end).is_err());
        assert!(encrypt_marked_sections(&mut [0u8; 16], &past_end[..1]).is_err());
    }

    struct FixedSymbols(String);

    impl SymbolSource for FixedSymbols {
        fn symbols(&self, _library: &Path) -> SdcResult<Vec<NativeSymbol>> {
            Ok(parse_symbols(&self.0))
        }
    }

    #[test]
    fn test_encrypt_library_dir_keeps_plaintext_copy() {
        let dir = tempfile::tempdir().unwrap();
        let arch = dir.path().join("arm64-v8a");
        std::fs::create_dir_all(&arch).unwrap();
        let library = arch.join("libnative-lib.so");
        let original: Vec<u8> = (0..64u8).collect();
        std::fs::write(&library, &original).unwrap();
        std::fs::write(arch.join("notes.txt"), b"not a library").unwrap();

        let results = encrypt_library_dir(dir.path(), &FixedSymbols(listing())).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.len(), 1);
        assert_ne!(std::fs::read(&library).unwrap(), original);
        assert_eq!(
            std::fs::read(arch.join("libnative-lib.so.decrypted")).unwrap(),
            original
        );
    }

    #[test]
    fn test_assign_gates() {
        let dex: Vec<u8> = (1..=200u8).collect();
        let package = MemoryPackage::new()
            .with_entry("classes.dex", dex.clone())
            .with_entry("res/raw/data.bin", vec![9u8; 10]);
        let mut routines = vec![
            NativeCheckRoutine::new("a.B_f_1", KEY, None),
            NativeCheckRoutine::new("a.B_g_2", KEY, None),
        ];
        assign_gates(&mut routines, &package, &NativeConfig::enabled()).unwrap();

        for routine in &routines {
            let gate = routine.gate.as_ref().unwrap();
            assert_eq!(gate.file, "classes.dex");
            assert_eq!((gate.offset, gate.count), (0, 100));
            assert_eq!(Some(gate.value), hash_range(&dex, 0, 100));
        }
        check_coverage(&routines[..0], &[]).unwrap();
        assert!(check_coverage(&routines, &[]).is_err());

        let config = NativeConfig::enabled().gate_pattern("**/*.odex");
        assert!(assign_gates(&mut routines, &package, &config).is_err());
    }

    #[test]
    fn test_assign_gates_skips_empty_entries() {
        let mut routines = vec![NativeCheckRoutine::new("a.B_f_1", KEY, None)];
        let package = MemoryPackage::new()
            .with_entry("classes.dex", Vec::new())
            .with_entry("classes2.dex", vec![7u8; 8]);
        for _ in 0..16 {
            assign_gates(&mut routines, &package, &NativeConfig::enabled()).unwrap();
            let gate = routines[0].gate.as_ref().unwrap();
            assert_eq!(gate.file, "classes2.dex");
            assert_eq!(gate.count, 8);
        }

        let empty = MemoryPackage::new().with_entry("classes.dex", Vec::new());
        assert!(matches!(
            assign_gates(&mut routines, &empty, &NativeConfig::enabled()),
            Err(SdcError::Native(_))
        ));

        let mut config = NativeConfig::enabled();
        config.gate_offset = 8;
        assert!(assign_gates(&mut routines, &package, &config).is_err());
    }
}
