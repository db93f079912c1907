//! Outcome protocol between an extracted unit and its caller.
//!
//! A unit never returns or jumps on behalf of its caller. Instead it hands
//! back an [`Envelope`] describing what the original code would have done:
//! return a value, continue after the block, or jump to one of the block's
//! external targets. Unless a value is returned, the envelope also carries the
//! current values of every captured local so the caller can restore them.
//!
//! Outcome codes as seen by the caller:
//!
//! | outcome       | code  |
//! |---------------|-------|
//! | value         | -1    |
//! | fallthrough   | -2    |
//! | jump to index | index |

use crate::ir::{CmpOp, EnvelopeOp, Expr, Fragment, InvokeExpr, MethodRef, Operand, Stmt, Type};

/// Runtime class of envelopes
pub const ENVELOPE_CLASS: &str = "sdc.runtime.Envelope";

/// Raised by the caller when a jump index is unknown
pub const STATE_FAULT_CLASS: &str = "java.lang.IllegalStateException";

pub const VALUE_CODE: i32 = -1;
pub const FALLTHROUGH_CODE: i32 = -2;

/// Outcome of one unit invocation
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope<V> {
    /// The block returned; boxed result, `None` for void
    Value(Option<V>),
    Jump { index: u32, saved: Vec<V> },
    Fallthrough { saved: Vec<V> },
}

impl<V> Envelope<V> {
    pub fn code(&self) -> i32 {
        match self {
            Envelope::Value(_) => VALUE_CODE,
            Envelope::Fallthrough { .. } => FALLTHROUGH_CODE,
            Envelope::Jump { index, .. } => *index as i32,
        }
    }

    pub fn saved(&self) -> &[V] {
        match self {
            Envelope::Value(_) => &[],
            Envelope::Jump { saved, .. } | Envelope::Fallthrough { saved } => saved,
        }
    }

    pub fn payload(&self) -> Option<&V> {
        match self {
            Envelope::Value(v) => v.as_ref(),
            _ => None,
        }
    }
}

/// A local crossing the unit boundary
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Captured {
    pub name: String,
    pub ty: Type,
}

impl Captured {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

fn object() -> Type {
    Type::object(crate::ir::OBJECT_CLASS)
}

/// `value` as an object operand, boxing primitives into `local`
pub(crate) fn boxed_operand(
    fragment: &mut Fragment,
    local: String,
    value: Operand,
    ty: &Type,
) -> Operand {
    if ty.is_primitive() {
        fragment.declare(local.clone(), object());
        fragment.push(Stmt::assign(
            local.clone(),
            Expr::Box {
                ty: ty.clone(),
                value,
            },
        ));
        Operand::Local(local)
    } else {
        value
    }
}

/// Object operand converted back to `ty`
pub(crate) fn unboxed(ty: &Type, value: Operand) -> Expr {
    if ty.is_primitive() {
        Expr::Unbox {
            ty: ty.clone(),
            value,
        }
    } else {
        Expr::Cast {
            ty: ty.clone(),
            value,
        }
    }
}

// ============================================================================
// Unit side
// ============================================================================

/// How a unit leaves a given point
#[derive(Debug, Clone)]
pub enum Exit {
    /// Original `return`, with its operand and the method's return type
    Value(Option<(Operand, Type)>),
    Jump(u32),
    Fallthrough,
}

/// Emit "build envelope; return it" for `exit`.
pub fn emit_exit(fragment: &mut Fragment, prefix: &str, captured: &[Captured], exit: Exit) {
    let env = format!("{}env", prefix);
    fragment.declare(env.clone(), Type::object(ENVELOPE_CLASS));

    let saved = |fragment: &mut Fragment| -> Vec<Operand> {
        captured
            .iter()
            .enumerate()
            .map(|(i, c)| {
                boxed_operand(
                    fragment,
                    format!("{}save{}", prefix, i),
                    Operand::local(c.name.clone()),
                    &c.ty,
                )
            })
            .collect()
    };

    let op = match exit {
        Exit::Value(None) => EnvelopeOp::MakeValue(None),
        Exit::Value(Some((value, ty))) => {
            let boxed = boxed_operand(fragment, format!("{}result", prefix), value, &ty);
            EnvelopeOp::MakeValue(Some(boxed))
        }
        Exit::Jump(index) => EnvelopeOp::MakeJump {
            index,
            saved: saved(&mut *fragment),
        },
        Exit::Fallthrough => EnvelopeOp::MakeFallthrough {
            saved: saved(&mut *fragment),
        },
    };
    fragment.push(Stmt::assign(env.clone(), Expr::Envelope(op)));
    fragment.push(Stmt::Return(Some(Operand::Local(env))));
}

// ============================================================================
// Caller side
// ============================================================================

/// Inputs of the caller-side stitch for one unit call
#[derive(Debug)]
pub struct Stitch<'a> {
    /// Local holding the returned envelope
    pub envelope: &'a str,
    pub captured: &'a [Captured],
    /// Body indices of the unit's jump table
    pub jump_targets: &'a [usize],
    /// Declared return type of the enclosing method
    pub return_type: &'a Type,
    /// Body index where execution continues after the block
    pub fallthrough: usize,
    /// Prefix for generated locals
    pub prefix: &'a str,
}

/// Emit the caller-side handling of a returned envelope.
///
/// Dispatch uses equality tests rather than a switch so the stitched code
/// can itself sit inside an outer guarded block.
pub fn stitch(fragment: &mut Fragment, s: &Stitch<'_>) {
    let env = Operand::local(s.envelope);
    let code = format!("{}code", s.prefix);
    fragment.declare(code.clone(), Type::Int);
    fragment.push(Stmt::assign(
        code.clone(),
        Expr::Envelope(EnvelopeOp::Code(env.clone())),
    ));
    let value = fragment.label();
    fragment.push(Stmt::if_(
        CmpOp::Eq,
        Operand::local(code.clone()),
        Operand::int(VALUE_CODE),
        value,
    ));

    let slot = format!("{}slot", s.prefix);
    if !s.captured.is_empty() {
        fragment.declare(slot.clone(), object());
    }
    for (i, c) in s.captured.iter().enumerate() {
        fragment.push(Stmt::assign(
            slot.clone(),
            Expr::Envelope(EnvelopeOp::Saved {
                envelope: env.clone(),
                slot: i,
            }),
        ));
        fragment.push(Stmt::assign(
            c.name.clone(),
            unboxed(&c.ty, Operand::local(slot.clone())),
        ));
    }

    let after = fragment.external(s.fallthrough);
    fragment.push(Stmt::if_(
        CmpOp::Eq,
        Operand::local(code.clone()),
        Operand::int(FALLTHROUGH_CODE),
        after,
    ));
    for (index, &target) in s.jump_targets.iter().enumerate() {
        let label = fragment.external(target);
        fragment.push(Stmt::if_(
            CmpOp::Eq,
            Operand::local(code.clone()),
            Operand::int(index as i32),
            label,
        ));
    }

    let fault = format!("{}fault", s.prefix);
    fragment.declare(fault.clone(), Type::object(STATE_FAULT_CLASS));
    fragment.push(Stmt::assign(
        fault.clone(),
        Expr::New(STATE_FAULT_CLASS.to_string()),
    ));
    fragment.push(Stmt::Invoke(InvokeExpr::new_special(
        MethodRef::new(STATE_FAULT_CLASS, "<init>", vec![], Type::Void),
        Operand::local(fault.clone()),
        vec![],
    )));
    fragment.push(Stmt::Throw(Operand::Local(fault)));

    fragment.bind(value);
    if *s.return_type == Type::Void {
        fragment.push(Stmt::Return(None));
    } else {
        let payload = format!("{}payload", s.prefix);
        let result = format!("{}result", s.prefix);
        fragment.declare(payload.clone(), object());
        fragment.declare(result.clone(), s.return_type.clone());
        fragment.push(Stmt::assign(
            payload.clone(),
            Expr::Envelope(EnvelopeOp::Payload(env)),
        ));
        fragment.push(Stmt::assign(
            result.clone(),
            unboxed(s.return_type, Operand::Local(payload)),
        ));
        fragment.push(Stmt::Return(Some(Operand::Local(result))));
    }
}
