//! Self-decrypting code pass over a whole program

use crate::access::AccessPolicy;
use crate::cfg::uninitialized_reads;
use crate::config::{class_glob, class_path};
use crate::crypto::random_key;
use crate::digest_guard;
use crate::envelope::{boxed_operand, stitch, Stitch, ENVELOPE_CLASS};
use crate::error::Rejection;
use crate::extractor::{self, ExtractedUnit};
use crate::hierarchy::{scan, GuardForest, GuardedBlock};
use crate::ir::{
    validate, Body, Class, Expr, Fragment, InvokeExpr, Method, Operand, Program, Relocation,
    Stmt, Type, OBJECT_CLASS,
};
use crate::loader::decrypt_method;
use crate::native_weaver::{gate_class, weave, NativeCheckRoutine, GATE_CLASS};
use crate::{payload, SdcConfig, SdcError, SdcResult};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;

/// Package of the runtime support classes, never transformed
const RUNTIME_PACKAGE: &str = "sdc.runtime.";

/// One guarded block turned into a unit
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub id: String,
    pub class: String,
    pub method: String,
    /// Guard index in the body as it was when the block was processed
    pub guard: usize,
    pub captured: usize,
    pub jump_targets: usize,
    /// Encrypted payload size; `None` when the unit is called directly
    pub payload_len: Option<usize>,
}

/// A guard that was left as it was
#[derive(Debug, Clone, Serialize)]
pub struct RejectedBlock {
    pub class: String,
    pub method: String,
    pub guard: usize,
    pub reason: String,
}

/// Result of protecting a program
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProtectReport {
    pub units: Vec<UnitReport>,
    /// Guards replaced by a digest check without extraction
    pub guards_rewritten: usize,
    pub rejected: Vec<RejectedBlock>,
    /// Classes and members made public for the units
    pub widened: usize,
    /// Native routines, one per unit when native gates are enabled
    pub routines: Vec<NativeCheckRoutine>,
}

impl ProtectReport {
    fn reject(&mut self, class: &str, method: &str, guard: usize, reason: &Rejection) {
        self.rejected.push(RejectedBlock {
            class: class.to_string(),
            method: method.to_string(),
            guard,
            reason: reason.to_string(),
        });
    }
}

/// What committing one block did to the method body
struct Committed {
    relocations: Vec<Relocation>,
    unit: Option<ExtractedUnit>,
    payload_len: Option<usize>,
    routine: Option<NativeCheckRoutine>,
}

/// Self-decrypting code protector
pub struct Protector {
    config: SdcConfig,
    exclude: Vec<Regex>,
}

impl Protector {
    /// Create a new protector; invalid exclude patterns are skipped
    pub fn new(config: SdcConfig) -> Self {
        let exclude = config
            .exclude
            .iter()
            .filter_map(|pattern| match class_glob(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!("Ignoring exclude pattern {}: {}", pattern, e);
                    None
                }
            })
            .collect();
        Self { config, exclude }
    }

    pub fn config(&self) -> &SdcConfig {
        &self.config
    }

    /// Whether `class` is left untouched
    pub fn should_skip(&self, class: &str) -> bool {
        if class.starts_with(RUNTIME_PACKAGE) || class == GATE_CLASS {
            return true;
        }
        let path = class_path(class);
        self.exclude.iter().any(|re| re.is_match(&path))
    }

    /// Protect every eligible guarded block of `program` in place.
    pub fn protect_program(&self, program: &mut Program) -> SdcResult<ProtectReport> {
        let mut report = ProtectReport::default();
        let mut policy = AccessPolicy::new();
        let mut direct_units = Vec::new();

        let targets: Vec<(String, usize)> = program
            .classes
            .values()
            .filter(|c| {
                let skip = self.should_skip(&c.name);
                if skip {
                    tracing::debug!("Skipping excluded class: {}", c.name);
                }
                !skip
            })
            .flat_map(|c| {
                c.methods
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| !m.is_native && m.body.is_some())
                    .map(|(i, _)| (c.name.clone(), i))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (class_name, index) in targets {
            let Some(class) = program.class(&class_name).cloned() else {
                continue;
            };
            let method = &class.methods[index];
            let Some(mut body) = method.body.clone() else {
                continue;
            };
            let changed = self.protect_method(
                program,
                &class,
                method,
                &mut body,
                &mut policy,
                &mut direct_units,
                &mut report,
            );
            if changed {
                if let Some(target) = program.class_mut(&class_name) {
                    target.methods[index].body = Some(body);
                }
            }
        }

        report.widened = policy.apply(program);
        for unit in direct_units {
            program.add_class(unit);
        }
        if !report.routines.is_empty() {
            program.add_class(gate_class(&report.routines));
        }

        tracing::info!(
            "Protected {} blocks ({} guards rewritten, {} rejected, {} symbols widened)",
            report.units.len(),
            report.guards_rewritten,
            report.rejected.len(),
            report.widened
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn protect_method(
        &self,
        program: &Program,
        class: &Class,
        method: &Method,
        body: &mut Body,
        policy: &mut AccessPolicy,
        direct_units: &mut Vec<Class>,
        report: &mut ProtectReport,
    ) -> bool {
        let signature = method.signature();
        let scan = scan(&class.name, &signature, body);
        for (guard, reason) in &scan.rejected {
            report.reject(&class.name, &signature, *guard, reason);
        }
        let (forest, rejected) = GuardForest::build(scan.candidates);
        for (guard, reason) in &rejected {
            report.reject(&class.name, &signature, *guard, reason);
        }
        if forest.is_empty() {
            return false;
        }

        let mut pending: Vec<Option<GuardedBlock>> =
            forest.bottom_up().into_iter().cloned().map(Some).collect();
        let mut counter = 0usize;
        let mut changed = false;

        for i in 0..pending.len() {
            let Some(block) = pending[i].take() else {
                continue;
            };
            let prefix = fresh_prefix(body, &mut counter);
            let result = self.protect_block(program, class, method, body, &block, &prefix);
            let committed = match result {
                Ok(committed) => committed,
                Err(reason) => {
                    tracing::warn!(
                        "Skipping guard in {}.{} at {}: {}",
                        class.name,
                        signature,
                        block.guard,
                        reason
                    );
                    report.reject(&class.name, &signature, block.guard, &reason);
                    continue;
                }
            };
            changed = true;

            for reloc in &committed.relocations {
                for later in pending[i + 1..].iter_mut() {
                    *later = later.take().and_then(|b| b.relocate(reloc));
                }
            }

            let Some(unit) = committed.unit else {
                report.guards_rewritten += 1;
                continue;
            };
            for symbol in &unit.required {
                policy.require_public(program, symbol.clone());
            }
            tracing::info!(
                "Extracted {}.{} [{}..{}) into {}",
                class.name,
                signature,
                block.start,
                block.end,
                unit.id
            );
            report.units.push(UnitReport {
                id: unit.id.clone(),
                class: class.name.clone(),
                method: signature.clone(),
                guard: block.guard,
                captured: unit.captured.len(),
                jump_targets: unit.jump_targets.len(),
                payload_len: committed.payload_len,
            });
            report.routines.extend(committed.routine);
            if committed.payload_len.is_none() {
                direct_units.push(unit.class);
            }
        }
        changed
    }

    /// Rewrite one block; on error `body` is left as it was.
    fn protect_block(
        &self,
        program: &Program,
        class: &Class,
        method: &Method,
        body: &mut Body,
        block: &GuardedBlock,
        prefix: &str,
    ) -> Result<Committed, Rejection> {
        let guard = digest_guard::prepare(block)?;
        if self.config.guard_only {
            let reloc = digest_guard::rewrite(body, block, prefix)?;
            return Ok(Committed {
                relocations: vec![reloc],
                unit: None,
                payload_len: None,
                routine: None,
            });
        }

        let mut unit = extractor::extract(program, class, method, body, block)?;
        let routine = if self.config.native.enabled {
            let routine = weave(&mut unit.class, random_key(), self.config.native.weave_calls)
                .map_err(invalid)?;
            Some(routine)
        } else {
            None
        };

        let mut fragment = Fragment::new();
        let secret = digest_guard::emit(&mut fragment, block, &guard, prefix);
        let args: Vec<Operand> = unit
            .captured
            .iter()
            .enumerate()
            .map(|(i, c)| {
                boxed_operand(
                    &mut fragment,
                    format!("{}arg{}", prefix, i),
                    Operand::local(c.name.clone()),
                    &c.ty,
                )
            })
            .collect();

        let envelope = format!("{}envelope", prefix);
        fragment.declare(envelope.clone(), Type::object(ENVELOPE_CLASS));
        let payload_len = if self.config.encrypt_units {
            let sealed = payload::seal(&unit.id, &unit.class, &guard.value).map_err(invalid)?;
            let payload_len = sealed.len();
            let array = format!("{}args", prefix);
            let bytes = format!("{}payload", prefix);
            fragment.declare(array.clone(), Type::array(Type::object(OBJECT_CLASS)));
            fragment.declare(bytes.clone(), Type::bytes());
            fragment.push(Stmt::assign(
                array.clone(),
                Expr::ArrayOf {
                    elem: Type::object(OBJECT_CLASS),
                    items: args,
                },
            ));
            fragment.push(Stmt::assign(bytes.clone(), Expr::ByteArray(sealed)));
            fragment.push(Stmt::assign(
                envelope.clone(),
                Expr::Invoke(InvokeExpr::new_static(
                    decrypt_method(),
                    vec![
                        Operand::string(unit.id.clone()),
                        Operand::Local(bytes),
                        secret,
                        Operand::Local(array),
                    ],
                )),
            ));
            Some(payload_len)
        } else {
            fragment.push(Stmt::assign(
                envelope.clone(),
                Expr::Invoke(InvokeExpr::new_static(unit.entry(), args)),
            ));
            None
        };
        stitch(
            &mut fragment,
            &Stitch {
                envelope: &envelope,
                captured: &unit.captured,
                jump_targets: &unit.jump_targets,
                return_type: &method.ret,
                fallthrough: block.end,
                prefix,
            },
        );

        let mut candidate = body.clone();
        let spliced = candidate.splice(block.span(), fragment, true).map_err(invalid)?;
        let mut relocations = vec![spliced];
        if let Some(reloc) = initialize_captured(&mut candidate, &unit).map_err(invalid)? {
            relocations.push(reloc);
        }
        validate(&candidate, method).map_err(invalid)?;
        *body = candidate;

        Ok(Committed {
            relocations,
            unit: Some(unit),
            payload_len,
            routine,
        })
    }
}

fn invalid(e: SdcError) -> Rejection {
    Rejection::Validation(e.to_string())
}

/// Prefix for caller-side locals not used in `body` yet
fn fresh_prefix(body: &Body, counter: &mut usize) -> String {
    loop {
        let prefix = format!("$sdc{}_", *counter);
        *counter += 1;
        if !body.locals.keys().any(|k| k.starts_with(&prefix)) {
            return prefix;
        }
    }
}

/// Default-initialize captured locals the caller may now read before any
/// assignment, right after the method's parameter bindings.
fn initialize_captured(body: &mut Body, unit: &ExtractedUnit) -> SdcResult<Option<Relocation>> {
    let captured: BTreeSet<&str> = unit.captured.iter().map(|c| c.name.as_str()).collect();
    let unset: BTreeSet<String> = uninitialized_reads(body)
        .into_iter()
        .map(|(_, name)| name)
        .filter(|name| captured.contains(name.as_str()))
        .collect();
    if unset.is_empty() {
        return Ok(None);
    }

    let mut init = Fragment::new();
    for name in unset {
        let ty = body
            .local_type(&name)
            .cloned()
            .ok_or_else(|| SdcError::Validation(format!("undeclared local {}", name)))?;
        init.push(Stmt::assign(
            name,
            Expr::Use(Operand::Const(ty.default_value())),
        ));
    }
    let entry = body
        .stmts
        .iter()
        .take_while(|s| matches!(s.expr(), Some(Expr::Param(_) | Expr::This)))
        .count();
    body.splice(entry..entry, init, false).map(Some)
}
