//! SDC Protect - Self-Decrypting Code for managed bytecode
//!
//! Finds equality guards against multi-character constants, moves the code
//! they protect into separate units and encrypts each unit under a key
//! derived from the constant. The constant itself no longer appears in the
//! program: only its digest is kept, and a unit can only be decrypted by
//! the value that passes the guard.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Protect Time (Build Machine)               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  if (x != "BEEF") goto skip; <block>; skip:                     │
//! │                              │                                  │
//! │                              ▼                                  │
//! │        guard ──► if (!Loader.match(x, SHA1("BEEF"))) goto skip  │
//! │        block ──► unit class, serialized                         │
//! │                              │                                  │
//! │                              ▼                                  │
//! │         AES-128-CTR(SHA256(x) ^ SHA256(unit id)) ──► payload    │
//! │                                                                 │
//! │  Optional: one native routine per unit, itself encrypted in     │
//! │  the shared library and gated on a package checksum             │
//! └─────────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Run Time (User Device)                    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  1. x matches the digest ──► derive unit key from x            │
//! │                                                                 │
//! │  2. payload ──► decrypt ──► define unit class (cached)          │
//! │                                                                 │
//! │  3. unit.main(captured locals) ──► envelope                     │
//! │                                                                 │
//! │  4. envelope ──► write back locals, then return / jump / fall   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sdc_protect::{Protector, SdcConfig};
//! use sdc_protect::interfaces::{JsonProgramFile, ProgramSink, ProgramSource};
//!
//! let file = JsonProgramFile::new("program.json");
//! let mut program = file.load()?;
//!
//! let protector = Protector::new(SdcConfig::default());
//! let report = protector.protect_program(&mut program)?;
//! println!("{} units extracted", report.units.len());
//!
//! JsonProgramFile::new("program.protected.json").store(&program)?;
//! ```

pub mod access;
pub mod cfg;
mod config;
pub mod crypto;
pub mod digest_guard;
pub mod envelope;
mod error;
pub mod extractor;
pub mod hierarchy;
pub mod interfaces;
pub mod ir;
pub mod loader;
pub mod native_gen;
pub mod native_host;
pub mod native_pack;
pub mod native_weaver;
pub mod payload;
pub mod pipeline;
mod protector;
pub mod vm;

pub use config::{NativeConfig, SdcConfig};
pub use crypto::GuardValue;
pub use error::{LoaderError, Rejection, SdcError, SdcResult};
pub use native_gen::NativeSourceGenerator;
pub use native_weaver::NativeCheckRoutine;
pub use protector::{ProtectReport, Protector, RejectedBlock, UnitReport};
pub use vm::{Runtime, Value};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
