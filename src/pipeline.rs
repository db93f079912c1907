//! End-to-end run over the collaborator traits
//!
//! ```text
//! ProgramSource -> Protector -> ProgramSink
//!                      |
//!                      +-> routines -> gates -> native sources
//!                                                  |
//!                                       NativeToolchain -> section encryption
//! ```

use crate::interfaces::{NativeToolchain, PackageContents, ProgramSink, ProgramSource};
use crate::native_gen::NativeSourceGenerator;
use crate::native_pack::{assign_gates, check_coverage, encrypt_library_dir, EncryptedSection, SymbolSource};
use crate::protector::{ProtectReport, Protector};
use crate::{SdcConfig, SdcError, SdcResult};
use std::path::PathBuf;

/// Collaborators and locations for the native half of a run
pub struct NativeStage<'a> {
    /// Package whose entries serve as gate files
    pub package: &'a dyn PackageContents,
    /// Where generated sources are written
    pub source_dir: PathBuf,
    /// Where the toolchain puts compiled libraries
    pub out_dir: PathBuf,
    /// Sources are only generated when absent
    pub toolchain: Option<&'a dyn NativeToolchain>,
    pub symbols: &'a dyn SymbolSource,
}

/// Everything a run produced
#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub report: ProtectReport,
    pub native_sources: Vec<PathBuf>,
    pub libraries: Vec<(PathBuf, Vec<EncryptedSection>)>,
}

/// Load, protect and store a program, then build and encrypt its native
/// routines if native gates are enabled.
pub fn run(
    config: &SdcConfig,
    source: &dyn ProgramSource,
    sink: &dyn ProgramSink,
    native: Option<NativeStage<'_>>,
) -> SdcResult<PipelineOutput> {
    let mut program = source.load()?;
    let protector = Protector::new(config.clone());
    let report = protector.protect_program(&mut program)?;
    sink.store(&program)?;

    let mut output = PipelineOutput {
        report,
        ..Default::default()
    };
    if !config.native.enabled || output.report.routines.is_empty() {
        return Ok(output);
    }

    let stage = native.ok_or_else(|| {
        SdcError::Config("native gates are enabled but no native stage was given".to_string())
    })?;
    assign_gates(&mut output.report.routines, stage.package, &config.native)?;
    let generator = NativeSourceGenerator::new(config.native.clone());
    output.native_sources = generator.write_to(&stage.source_dir, &output.report.routines)?;

    let Some(toolchain) = stage.toolchain else {
        tracing::info!(
            "Native sources written to {}; no toolchain configured",
            stage.source_dir.display()
        );
        return Ok(output);
    };
    toolchain.build(&stage.source_dir, &stage.out_dir)?;
    output.libraries = encrypt_library_dir(&stage.out_dir, stage.symbols)?;
    if output.libraries.is_empty() {
        return Err(SdcError::Native(format!(
            "toolchain produced no library in {}",
            stage.out_dir.display()
        )));
    }
    for (library, sections) in &output.libraries {
        check_coverage(&output.report.routines, sections).map_err(|e| {
            SdcError::Native(format!("{}: {}", library.display(), e))
        })?;
    }
    Ok(output)
}
