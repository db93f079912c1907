//! Slice a guarded block out of its method into a standalone unit.
//!
//! The unit is a public class with one public static `main` taking every
//! captured local as an `Object` and returning an envelope. Its body is
//!
//! ```text
//! <unbox/cast each parameter into its captured local>
//! <default-initialize locals private to the block>
//! <the guarded statements, with exits rewritten>
//! <fallthrough exit>
//! <relocated jump exits for conditional branches leaving the block>
//! ```
//!
//! Exits are rewritten as follows:
//! - `return v` builds `Value(box(v))`
//! - `goto t` with `t` outside the block builds `Jump(index(t), saved)`
//! - `if c goto t` with `t` outside the block jumps to a relocated label that
//!   builds `Jump(index(t), saved)`
//! - reaching the end of the block, or jumping to it, builds `Fallthrough(saved)`

use crate::access::Symbol;
use crate::cfg::UnitGraph;
use crate::envelope::{emit_exit, unboxed, Captured, Exit, ENVELOPE_CLASS};
use crate::error::Rejection;
use crate::hierarchy::GuardedBlock;
use crate::ir::{
    validate, Body, Class, Constant, Expr, Fragment, InvokeKind, Label, Method, MethodRef,
    Operand, Place, Program, Stmt, Type, OBJECT_CLASS,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Name of a unit's entry point
pub const UNIT_ENTRY: &str = "main";

/// Prefix of locals generated inside units
const UNIT_PREFIX: &str = "$u_";

/// A guarded block turned into a standalone class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedUnit {
    pub id: String,
    pub class: Class,
    /// Parameters of the entry point, in order
    pub captured: Vec<Captured>,
    /// Original body index of each jump index
    pub jump_targets: Vec<usize>,
    /// Symbols the unit references, to be made public
    #[serde(skip)]
    pub required: Vec<Symbol>,
}

impl ExtractedUnit {
    /// Reference to the unit's entry point
    pub fn entry(&self) -> MethodRef {
        entry_ref(&self.id, self.captured.len())
    }
}

/// `static Envelope main(Object, ...)` of unit `id`
pub fn entry_ref(id: &str, arity: usize) -> MethodRef {
    MethodRef::new(
        id,
        UNIT_ENTRY,
        vec![Type::object(OBJECT_CLASS); arity],
        Type::object(ENVELOPE_CLASS),
    )
}

/// Fresh unit identifier: enclosing class, method and a random suffix
pub fn unit_id(class: &str, method: &str) -> String {
    format!(
        "{}_{}_{}",
        class,
        method.trim_matches(|c| c == '<' || c == '>'),
        Uuid::new_v4().simple()
    )
}

/// Extract `block` from `method` of `class`.
///
/// `body` is the method's current body; it is only read.
pub fn extract(
    program: &Program,
    class: &Class,
    method: &Method,
    body: &Body,
    block: &GuardedBlock,
) -> Result<ExtractedUnit, Rejection> {
    let slice = block.slice();
    if slice.is_empty() || slice.end > body.len() {
        return Err(Rejection::EmptyBlock);
    }
    check_entries(body, block)?;
    check_traps(body, block)?;

    let this_locals: BTreeSet<&str> = body
        .stmts
        .iter()
        .filter(|s| s.expr() == Some(&Expr::This))
        .filter_map(Stmt::writes)
        .collect();
    for i in slice.clone() {
        check_statement(class, &body.stmts[i], i, &this_locals)?;
    }

    let captured = captured_locals(body, block)?;
    let id = unit_id(&class.name, &method.name);
    let (unit_body, jump_targets) = build_body(program, class, method, body, block, &captured)?;

    let main = Method::new(
        UNIT_ENTRY,
        vec![Type::object(OBJECT_CLASS); captured.len()],
        Type::object(ENVELOPE_CLASS),
    )
    .make_static()
    .with_body(unit_body);
    if let Some(body) = &main.body {
        validate(body, &main).map_err(|e| Rejection::Validation(e.to_string()))?;
    }
    let required = main
        .body
        .as_ref()
        .map(|b| required_symbols(program, b))
        .unwrap_or_default();

    tracing::debug!(
        "Extracted {}..{} of {}.{} into {} ({} captured, {} jump targets)",
        block.start,
        block.end,
        class.name,
        method.name,
        id,
        captured.len(),
        jump_targets.len()
    );

    Ok(ExtractedUnit {
        class: Class::new(id.clone()).with_method(main),
        id,
        captured,
        jump_targets,
        required,
    })
}

/// No statement outside the block may jump into it, except the guard
/// falling through to the first guarded statement.
fn check_entries(body: &Body, block: &GuardedBlock) -> Result<(), Rejection> {
    let graph = UnitGraph::new(body);
    for to in block.slice() {
        for from in graph.preds(to) {
            let internal = block.slice().contains(&from);
            let guard_entry = from == block.guard && to == block.start;
            if !internal && !guard_entry {
                return Err(Rejection::JumpIntoBlock { from, to });
            }
        }
    }
    Ok(())
}

fn check_traps(body: &Body, block: &GuardedBlock) -> Result<(), Rejection> {
    let slice = block.slice();
    for trap in &body.traps {
        let disjoint = trap.end <= block.guard || trap.begin >= block.end;
        let encloses = trap.begin <= block.guard && trap.end >= block.end;
        let inside = trap.begin >= slice.start
            && trap.end <= slice.end
            && slice.contains(&trap.handler);
        if !(disjoint || encloses || inside) {
            return Err(Rejection::PartialTrap {
                begin: trap.begin,
                end: trap.end,
            });
        }
    }
    Ok(())
}

fn check_statement(
    class: &Class,
    stmt: &Stmt,
    index: usize,
    this_locals: &BTreeSet<&str>,
) -> Result<(), Rejection> {
    if matches!(stmt, Stmt::Switch { .. }) {
        return Err(Rejection::SwitchInBlock(index));
    }
    if let Some(Expr::Param(_) | Expr::This) = stmt.expr() {
        return Err(Rejection::Validation(format!(
            "statement {} reads a method parameter directly",
            index
        )));
    }
    if let Some(inv) = stmt.invoke() {
        if inv.kind == InvokeKind::Special {
            let foreign = inv.method.class != class.name;
            let on_this = inv
                .receiver
                .as_ref()
                .and_then(Operand::as_local)
                .is_some_and(|r| this_locals.contains(r));
            let super_call = if inv.method.is_constructor() {
                on_this
            } else {
                foreign
            };
            if super_call {
                return Err(Rejection::SuperCall(inv.method.to_string()));
            }
        }
    }
    Ok(())
}

/// Locals referenced inside the block that are also referenced outside it,
/// in order of first appearance inside the block.
fn captured_locals(body: &Body, block: &GuardedBlock) -> Result<Vec<Captured>, Rejection> {
    let slice = block.slice();
    let outside: BTreeSet<&str> = body
        .stmts
        .iter()
        .enumerate()
        .filter(|(i, _)| !slice.contains(i))
        .flat_map(|(_, s)| s.locals())
        .collect();

    let mut seen = BTreeSet::new();
    let mut captured = Vec::new();
    for stmt in &body.stmts[slice] {
        for name in stmt.locals() {
            if outside.contains(name) && seen.insert(name) {
                let ty = body.local_type(name).cloned().ok_or_else(|| {
                    Rejection::Validation(format!("undeclared local {}", name))
                })?;
                captured.push(Captured::new(name, ty));
            }
        }
    }
    Ok(captured)
}

/// Index of `target` in the jump table, appending it on first sight
fn jump_index(targets: &mut Vec<usize>, target: usize) -> u32 {
    match targets.iter().position(|&t| t == target) {
        Some(i) => i as u32,
        None => {
            targets.push(target);
            (targets.len() - 1) as u32
        }
    }
}

/// Unit body and its jump table
fn build_body(
    program: &Program,
    class: &Class,
    method: &Method,
    body: &Body,
    block: &GuardedBlock,
    captured: &[Captured],
) -> Result<(Body, Vec<usize>), Rejection> {
    let slice = block.slice();
    let mut fragment = Fragment::new();

    let mut referenced: Vec<&str> = Vec::new();
    for stmt in &body.stmts[slice.clone()] {
        for name in stmt.locals() {
            if !referenced.contains(&name) {
                referenced.push(name);
            }
        }
    }
    for name in &referenced {
        let ty = body
            .local_type(name)
            .cloned()
            .ok_or_else(|| Rejection::Validation(format!("undeclared local {}", name)))?;
        fragment.declare(*name, ty);
    }

    for (i, c) in captured.iter().enumerate() {
        let param = format!("{}param{}", UNIT_PREFIX, i);
        fragment.declare(param.clone(), Type::object(OBJECT_CLASS));
        fragment.push(Stmt::assign(param.clone(), Expr::Param(i)));
        fragment.push(Stmt::assign(
            c.name.clone(),
            unboxed(&c.ty, Operand::Local(param)),
        ));
    }
    for name in &referenced {
        if captured.iter().any(|c| c.name == *name) {
            continue;
        }
        if let Some(ty) = body.local_type(name) {
            fragment.push(Stmt::assign(
                *name,
                Expr::Use(Operand::Const(ty.default_value())),
            ));
        }
    }

    // one label per guarded statement, plus one for the block end
    let labels: Vec<Label> = (slice.start..=slice.end).map(|_| fragment.label()).collect();
    let label_of = |t: usize| -> Option<Label> {
        if t >= slice.start && t <= slice.end {
            Some(labels[t - slice.start])
        } else {
            None
        }
    };

    let mut jump_targets: Vec<usize> = Vec::new();
    let mut relocated: BTreeMap<usize, Label> = BTreeMap::new();

    for i in slice.clone() {
        fragment.bind(labels[i - slice.start]);
        let mut stmt = body.stmts[i].clone();
        match &stmt {
            Stmt::Return(value) => {
                let value = value.clone().map(|v| (v, method.ret.clone()));
                emit_exit(&mut fragment, UNIT_PREFIX, captured, Exit::Value(value));
                continue;
            }
            Stmt::Goto(t) if label_of(*t).is_none() => {
                let index = jump_index(&mut jump_targets, *t);
                emit_exit(&mut fragment, UNIT_PREFIX, captured, Exit::Jump(index));
                continue;
            }
            _ => {}
        }

        stmt.retarget(|t| {
            label_of(t).or_else(|| Some(*relocated.entry(t).or_insert_with(|| fragment.label())))
        })
        .map_err(|t| Rejection::Validation(format!("unmappable target {}", t)))?;

        if let Some(inv) = stmt.invoke_mut() {
            if inv.kind == InvokeKind::Special && !inv.method.is_constructor() {
                let own_instance_method = program
                    .resolve_method(&inv.method)
                    .is_some_and(|(c, m)| c.name == class.name && !m.is_static);
                if own_instance_method {
                    inv.kind = InvokeKind::Virtual;
                }
            }
        }
        fragment.push(stmt);
    }

    fragment.bind(labels[slice.end - slice.start]);
    emit_exit(&mut fragment, UNIT_PREFIX, captured, Exit::Fallthrough);

    for (&target, &label) in &relocated {
        fragment.bind(label);
        let index = jump_index(&mut jump_targets, target);
        emit_exit(&mut fragment, UNIT_PREFIX, captured, Exit::Jump(index));
    }

    for trap in &body.traps {
        if trap.begin >= slice.start && trap.end <= slice.end {
            if let (Some(b), Some(e), Some(h)) =
                (label_of(trap.begin), label_of(trap.end), label_of(trap.handler))
            {
                fragment.trap(b, e, h, trap.exception.clone());
            }
        }
    }

    let unit = fragment
        .into_body()
        .map_err(|e| Rejection::Validation(e.to_string()))?;
    Ok((unit, jump_targets))
}

/// Program symbols a unit body references
fn required_symbols(program: &Program, body: &Body) -> Vec<Symbol> {
    let mut symbols = BTreeSet::new();
    let class_of = |ty: &Type, symbols: &mut BTreeSet<Symbol>| {
        if let Some(name) = ty.class_name() {
            symbols.insert(Symbol::Class(name.to_string()));
        }
    };

    for stmt in &body.stmts {
        if let Some(inv) = stmt.invoke() {
            if let Some((c, m)) = program.resolve_method(&inv.method) {
                symbols.insert(Symbol::Method {
                    class: c.name.clone(),
                    name: m.name.clone(),
                    params: m.params.clone(),
                });
            }
            symbols.insert(Symbol::Class(inv.method.class.clone()));
        }
        let field = match stmt {
            Stmt::Assign {
                dest: Place::Field { field, .. },
                ..
            }
            | Stmt::Assign {
                value: Expr::FieldGet { field, .. },
                ..
            } => Some(field),
            _ => None,
        };
        if let Some(field) = field {
            if let Some((c, f)) = program.resolve_field(field) {
                symbols.insert(Symbol::Class(c.name.clone()));
                symbols.insert(Symbol::Field {
                    class: c.name.clone(),
                    name: f.name.clone(),
                });
            }
        }
        match stmt.expr() {
            Some(Expr::New(name)) => {
                symbols.insert(Symbol::Class(name.clone()));
            }
            Some(Expr::Cast { ty, .. })
            | Some(Expr::NewArray { elem: ty, .. })
            | Some(Expr::ArrayOf { elem: ty, .. }) => class_of(ty, &mut symbols),
            _ => {}
        }
        for operand in stmt.operands() {
            if let Operand::Const(Constant::Class(name)) = operand {
                symbols.insert(Symbol::Class(name.clone()));
            }
        }
    }
    symbols
        .into_iter()
        .filter(|s| match s {
            Symbol::Class(name) => program.class(name).is_some(),
            _ => true,
        })
        .collect()
}
