//! Method-body representation consumed and produced by the transformation.
//!
//! A [`Body`] is a flat list of statements addressed by index, with explicit
//! jump targets and exception regions. New code is never written into a body
//! while it is being analysed: it is assembled in a [`Fragment`] (a separate
//! arena addressed by labels) and spliced in once complete with
//! [`Body::splice`], which also relocates every surviving jump target.

use crate::{SdcError, SdcResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

// ============================================================================
// Types and constants
// ============================================================================

/// Root of the class hierarchy
pub const OBJECT_CLASS: &str = "java.lang.Object";

/// Text type
pub const STRING_CLASS: &str = "java.lang.String";

/// Type-name type
pub const CLASS_CLASS: &str = "java.lang.Class";

/// Statement index inside a body, or label id inside a fragment
pub type Label = usize;

/// Value types
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Type {
    Void,
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Object(String),
    Array(Box<Type>),
}

impl Type {
    /// Reference type of the named class
    pub fn object(name: impl Into<String>) -> Self {
        Type::Object(name.into())
    }

    /// `java.lang.String`
    pub fn string() -> Self {
        Type::Object(STRING_CLASS.to_string())
    }

    /// Array of `elem`
    pub fn array(elem: Type) -> Self {
        Type::Array(Box::new(elem))
    }

    /// `byte[]`
    pub fn bytes() -> Self {
        Type::array(Type::Byte)
    }

    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Type::Boolean | Type::Byte | Type::Char | Type::Short | Type::Int | Type::Long
        )
    }

    /// Primitive types stored as a 32-bit int at runtime
    pub fn is_int_like(&self) -> bool {
        matches!(
            self,
            Type::Boolean | Type::Byte | Type::Char | Type::Short | Type::Int
        )
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Type::Object(_) | Type::Array(_))
    }

    /// Wrapper class used when a primitive crosses a reference-only boundary
    pub fn boxed_class(&self) -> Option<&'static str> {
        match self {
            Type::Boolean => Some("java.lang.Boolean"),
            Type::Byte => Some("java.lang.Byte"),
            Type::Char => Some("java.lang.Character"),
            Type::Short => Some("java.lang.Short"),
            Type::Int => Some("java.lang.Integer"),
            Type::Long => Some("java.lang.Long"),
            _ => None,
        }
    }

    /// Zero value used to initialize a local of this type
    pub fn default_value(&self) -> Constant {
        match self {
            Type::Long => Constant::Long(0),
            t if t.is_int_like() => Constant::Int(0),
            _ => Constant::Null,
        }
    }

    /// Class named by this type, looking through arrays
    pub fn class_name(&self) -> Option<&str> {
        match self {
            Type::Object(name) => Some(name),
            Type::Array(elem) => elem.class_name(),
            _ => None,
        }
    }

    /// Bytecode type descriptor (`I`, `J`, `Ljava/lang/String;`, `[B`)
    pub fn descriptor(&self) -> String {
        match self {
            Type::Void => "V".to_string(),
            Type::Boolean => "Z".to_string(),
            Type::Byte => "B".to_string(),
            Type::Char => "C".to_string(),
            Type::Short => "S".to_string(),
            Type::Int => "I".to_string(),
            Type::Long => "J".to_string(),
            Type::Object(name) => format!("L{};", name.replace('.', "/")),
            Type::Array(elem) => format!("[{}", elem.descriptor()),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Boolean => write!(f, "boolean"),
            Type::Byte => write!(f, "byte"),
            Type::Char => write!(f, "char"),
            Type::Short => write!(f, "short"),
            Type::Int => write!(f, "int"),
            Type::Long => write!(f, "long"),
            Type::Object(name) => write!(f, "{}", name),
            Type::Array(elem) => write!(f, "{}[]", elem),
        }
    }
}

/// Literal values
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Constant {
    Null,
    Int(i32),
    Long(i64),
    Str(String),
    /// Class literal, by dotted name
    Class(String),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Null => write!(f, "null"),
            Constant::Int(v) => write!(f, "{}", v),
            Constant::Long(v) => write!(f, "{}L", v),
            Constant::Str(s) => write!(f, "{:?}", s),
            Constant::Class(name) => write!(f, "class \"{}\"", name),
        }
    }
}

/// Statement operand: a local or an immediate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Local(String),
    Const(Constant),
}

impl Operand {
    pub fn local(name: impl Into<String>) -> Self {
        Operand::Local(name.into())
    }

    pub fn int(value: i32) -> Self {
        Operand::Const(Constant::Int(value))
    }

    pub fn long(value: i64) -> Self {
        Operand::Const(Constant::Long(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Operand::Const(Constant::Str(value.into()))
    }

    pub fn null() -> Self {
        Operand::Const(Constant::Null)
    }

    pub fn as_local(&self) -> Option<&str> {
        match self {
            Operand::Local(name) => Some(name),
            Operand::Const(_) => None,
        }
    }

    pub fn as_const(&self) -> Option<&Constant> {
        match self {
            Operand::Const(c) => Some(c),
            Operand::Local(_) => None,
        }
    }
}

// ============================================================================
// Expressions and statements
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

/// `lhs op rhs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub op: CmpOp,
    pub lhs: Operand,
    pub rhs: Operand,
}

impl Condition {
    pub fn new(op: CmpOp, lhs: Operand, rhs: Operand) -> Self {
        Self { op, lhs, rhs }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvokeKind {
    Static,
    Virtual,
    /// Constructors, private methods and superclass calls
    Special,
}

/// Symbolic method reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    pub class: String,
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
}

impl MethodRef {
    pub fn new(
        class: impl Into<String>,
        name: impl Into<String>,
        params: Vec<Type>,
        ret: Type,
    ) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            params,
            ret,
        }
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    /// Bytecode method descriptor, e.g. `(ILjava/lang/String;)J`
    pub fn descriptor(&self) -> String {
        let params: String = self.params.iter().map(Type::descriptor).collect();
        format!("({}){}", params, self.ret.descriptor())
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class, self.name, self.descriptor())
    }
}

/// Symbolic field reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    pub class: String,
    pub name: String,
    pub ty: Type,
}

impl FieldRef {
    pub fn new(class: impl Into<String>, name: impl Into<String>, ty: Type) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            ty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeExpr {
    pub kind: InvokeKind,
    pub method: MethodRef,
    pub receiver: Option<Operand>,
    pub args: Vec<Operand>,
}

impl InvokeExpr {
    pub fn new_static(method: MethodRef, args: Vec<Operand>) -> Self {
        Self {
            kind: InvokeKind::Static,
            method,
            receiver: None,
            args,
        }
    }

    pub fn new_virtual(method: MethodRef, receiver: Operand, args: Vec<Operand>) -> Self {
        Self {
            kind: InvokeKind::Virtual,
            method,
            receiver: Some(receiver),
            args,
        }
    }

    pub fn new_special(method: MethodRef, receiver: Operand, args: Vec<Operand>) -> Self {
        Self {
            kind: InvokeKind::Special,
            method,
            receiver: Some(receiver),
            args,
        }
    }

    pub fn operands(&self) -> impl Iterator<Item = &Operand> {
        self.receiver.iter().chain(self.args.iter())
    }
}

/// Envelope construction and inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeOp {
    /// `Envelope.Value(boxed)`; `None` for void
    MakeValue(Option<Operand>),
    MakeJump { index: u32, saved: Vec<Operand> },
    MakeFallthrough { saved: Vec<Operand> },
    /// Outcome code: -1 value, -2 fallthrough, jump index otherwise
    Code(Operand),
    /// Boxed result of a value envelope
    Payload(Operand),
    /// Saved captured value at `slot`
    Saved { envelope: Operand, slot: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expr {
    Use(Operand),
    Binary {
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
    },
    Invoke(InvokeExpr),
    /// Allocate an instance (constructor invoked separately)
    New(String),
    NewArray {
        elem: Type,
        len: Operand,
    },
    /// `byte[]` literal
    ByteArray(Vec<u8>),
    /// Filled array literal
    ArrayOf {
        elem: Type,
        items: Vec<Operand>,
    },
    ArrayGet {
        array: Operand,
        index: Operand,
    },
    ArrayLen(Operand),
    FieldGet {
        base: Option<Operand>,
        field: FieldRef,
    },
    Cast {
        ty: Type,
        value: Operand,
    },
    Box {
        ty: Type,
        value: Operand,
    },
    Unbox {
        ty: Type,
        value: Operand,
    },
    /// Method parameter by position
    Param(usize),
    This,
    CaughtException,
    Envelope(EnvelopeOp),
}

impl Expr {
    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            Expr::Use(o)
            | Expr::ArrayLen(o)
            | Expr::Cast { value: o, .. }
            | Expr::Box { value: o, .. }
            | Expr::Unbox { value: o, .. } => vec![o],
            Expr::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Expr::Invoke(inv) => inv.operands().collect(),
            Expr::NewArray { len, .. } => vec![len],
            Expr::ArrayOf { items, .. } => items.iter().collect(),
            Expr::ArrayGet { array, index } => vec![array, index],
            Expr::FieldGet { base, .. } => base.iter().collect(),
            Expr::Envelope(op) => match op {
                EnvelopeOp::MakeValue(v) => v.iter().collect(),
                EnvelopeOp::MakeJump { saved, .. } | EnvelopeOp::MakeFallthrough { saved } => {
                    saved.iter().collect()
                }
                EnvelopeOp::Code(o) | EnvelopeOp::Payload(o) => vec![o],
                EnvelopeOp::Saved { envelope, .. } => vec![envelope],
            },
            Expr::New(_)
            | Expr::ByteArray(_)
            | Expr::Param(_)
            | Expr::This
            | Expr::CaughtException => Vec::new(),
        }
    }
}

/// Assignment destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Place {
    Local(String),
    Field {
        base: Option<Operand>,
        field: FieldRef,
    },
    ArrayElem {
        array: Operand,
        index: Operand,
    },
}

impl Place {
    pub fn local(name: impl Into<String>) -> Self {
        Place::Local(name.into())
    }

    fn operands(&self) -> Vec<&Operand> {
        match self {
            Place::Local(_) => Vec::new(),
            Place::Field { base, .. } => base.iter().collect(),
            Place::ArrayElem { array, index } => vec![array, index],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stmt {
    Assign {
        dest: Place,
        value: Expr,
    },
    Invoke(InvokeExpr),
    /// Jump to `target` when `cond` holds
    If {
        cond: Condition,
        target: Label,
    },
    Goto(Label),
    /// Jump to `targets[key - low]`, or `default`
    Switch {
        key: Operand,
        low: i32,
        targets: Vec<Label>,
        default: Label,
    },
    Return(Option<Operand>),
    Throw(Operand),
    Nop,
}

impl Stmt {
    pub fn assign(dest: impl Into<String>, value: Expr) -> Self {
        Stmt::Assign {
            dest: Place::Local(dest.into()),
            value,
        }
    }

    pub fn if_(op: CmpOp, lhs: Operand, rhs: Operand, target: Label) -> Self {
        Stmt::If {
            cond: Condition::new(op, lhs, rhs),
            target,
        }
    }

    /// Jump targets in statement order
    pub fn targets(&self) -> Vec<Label> {
        match self {
            Stmt::If { target, .. } | Stmt::Goto(target) => vec![*target],
            Stmt::Switch {
                targets, default, ..
            } => targets.iter().chain(std::iter::once(default)).copied().collect(),
            _ => Vec::new(),
        }
    }

    /// Rewrite every jump target; fails with the first target `f` cannot map.
    pub fn retarget<F>(&mut self, mut f: F) -> Result<(), Label>
    where
        F: FnMut(Label) -> Option<Label>,
    {
        let mut apply = |t: &mut Label| -> Result<(), Label> {
            *t = f(*t).ok_or(*t)?;
            Ok(())
        };
        match self {
            Stmt::If { target, .. } | Stmt::Goto(target) => apply(target),
            Stmt::Switch {
                targets, default, ..
            } => {
                for t in targets.iter_mut() {
                    apply(t)?;
                }
                apply(default)
            }
            _ => Ok(()),
        }
    }

    /// Whether control can reach the next statement
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Stmt::Goto(_) | Stmt::Switch { .. } | Stmt::Return(_) | Stmt::Throw(_)
        )
    }

    pub fn invoke(&self) -> Option<&InvokeExpr> {
        match self {
            Stmt::Invoke(inv)
            | Stmt::Assign {
                value: Expr::Invoke(inv),
                ..
            } => Some(inv),
            _ => None,
        }
    }

    pub fn invoke_mut(&mut self) -> Option<&mut InvokeExpr> {
        match self {
            Stmt::Invoke(inv)
            | Stmt::Assign {
                value: Expr::Invoke(inv),
                ..
            } => Some(inv),
            _ => None,
        }
    }

    pub fn expr(&self) -> Option<&Expr> {
        match self {
            Stmt::Assign { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Operands read by this statement
    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            Stmt::Assign { dest, value } => {
                let mut ops = dest.operands();
                ops.extend(value.operands());
                ops
            }
            Stmt::Invoke(inv) => inv.operands().collect(),
            Stmt::If { cond, .. } => vec![&cond.lhs, &cond.rhs],
            Stmt::Switch { key, .. } => vec![key],
            Stmt::Return(Some(o)) | Stmt::Throw(o) => vec![o],
            Stmt::Return(None) | Stmt::Goto(_) | Stmt::Nop => Vec::new(),
        }
    }

    /// Locals read by this statement
    pub fn reads(&self) -> Vec<&str> {
        self.operands()
            .into_iter()
            .filter_map(Operand::as_local)
            .collect()
    }

    /// Local written by this statement
    pub fn writes(&self) -> Option<&str> {
        match self {
            Stmt::Assign {
                dest: Place::Local(name),
                ..
            } => Some(name),
            _ => None,
        }
    }

    /// Every local this statement mentions, reads first
    pub fn locals(&self) -> Vec<&str> {
        let mut names = self.reads();
        names.extend(self.writes());
        names
    }
}

/// Exception region `[begin, end)` handled at `handler`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trap {
    pub begin: Label,
    pub end: Label,
    pub handler: Label,
    /// Caught class; `None` catches everything
    pub exception: Option<String>,
}

impl Trap {
    pub fn covers(&self, index: usize) -> bool {
        self.begin <= index && index < self.end
    }
}

// ============================================================================
// Bodies
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    pub locals: BTreeMap<String, Type>,
    pub stmts: Vec<Stmt>,
    pub traps: Vec<Trap>,
}

/// How indices of a body moved after [`Body::splice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub start: usize,
    pub end: usize,
    pub inserted: usize,
    /// Jumps to `start` land on the inserted code rather than after it
    pub redirect_entry: bool,
}

impl Relocation {
    /// New index of old statement `index`; `None` if it was replaced.
    pub fn map(&self, index: usize) -> Option<usize> {
        if index < self.start {
            Some(index)
        } else if index == self.start && self.redirect_entry {
            Some(self.start)
        } else if index >= self.end {
            Some(index - (self.end - self.start) + self.inserted)
        } else {
            None
        }
    }

    /// Map an exclusive range end
    pub fn map_end(&self, index: usize) -> Option<usize> {
        if index == self.start {
            Some(self.start)
        } else {
            self.map(index)
        }
    }
}

impl Body {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, name: impl Into<String>, ty: Type) {
        self.locals.insert(name.into(), ty);
    }

    pub fn len(&self) -> usize {
        self.stmts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    pub fn local_type(&self, name: &str) -> Option<&Type> {
        self.locals.get(name)
    }

    /// Replace `range` with `fragment` and relocate every jump target.
    ///
    /// Fails without touching the body if a surviving jump or exception
    /// region points strictly inside the replaced range, or if the fragment
    /// has an unbound label.
    pub fn splice(
        &mut self,
        range: Range<usize>,
        fragment: Fragment,
        redirect_entry: bool,
    ) -> SdcResult<Relocation> {
        if range.start > range.end || range.end > self.stmts.len() {
            return Err(SdcError::Validation(format!(
                "splice range {:?} outside body of {} statements",
                range,
                self.stmts.len()
            )));
        }
        let reloc = Relocation {
            start: range.start,
            end: range.end,
            inserted: fragment.stmts.len(),
            redirect_entry,
        };

        let Fragment {
            stmts: mut inserted,
            labels,
            locals,
            traps: fragment_traps,
        } = fragment;
        let resolve = |label: Label| -> Option<usize> {
            match labels.get(label)? {
                Slot::Bound(pos) => Some(range.start + pos),
                Slot::External(old) => reloc.map(*old),
                Slot::Unbound => None,
            }
        };
        for stmt in inserted.iter_mut() {
            stmt.retarget(resolve)
                .map_err(|l| SdcError::Validation(format!("fragment label {} does not resolve", l)))?;
        }

        let mut head = self.stmts[..range.start].to_vec();
        let mut tail = self.stmts[range.end..].to_vec();
        for stmt in head.iter_mut().chain(tail.iter_mut()) {
            stmt.retarget(|t| reloc.map(t)).map_err(|t| {
                SdcError::Validation(format!("jump to {} lands inside replaced range", t))
            })?;
        }

        let mut traps = Vec::with_capacity(self.traps.len() + fragment_traps.len());
        for trap in &self.traps {
            let moved = range.start < range.end && trap.begin >= range.start && trap.end <= range.end;
            if moved {
                continue;
            }
            let mapped = (
                reloc.map(trap.begin),
                reloc.map_end(trap.end),
                reloc.map(trap.handler),
            );
            match mapped {
                (Some(begin), Some(end), Some(handler)) => traps.push(Trap {
                    begin,
                    end,
                    handler,
                    exception: trap.exception.clone(),
                }),
                _ => {
                    return Err(SdcError::Validation(format!(
                        "exception region {}..{} straddles replaced range",
                        trap.begin, trap.end
                    )))
                }
            }
        }
        for trap in fragment_traps {
            let end = match labels.get(trap.end) {
                Some(Slot::Bound(pos)) => Some(range.start + pos),
                _ => None,
            };
            match (resolve(trap.begin), end, resolve(trap.handler)) {
                (Some(begin), Some(end), Some(handler)) => traps.push(Trap {
                    begin,
                    end,
                    handler,
                    exception: trap.exception,
                }),
                _ => {
                    return Err(SdcError::Validation(
                        "fragment exception region does not resolve".to_string(),
                    ))
                }
            }
        }

        head.extend(inserted);
        head.extend(tail);
        self.stmts = head;
        self.traps = traps;
        self.locals.extend(locals);
        Ok(reloc)
    }
}

// ============================================================================
// Fragments
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Unbound,
    Bound(usize),
    /// Statement index in the body the fragment is spliced into
    External(usize),
}

/// Code under construction, addressed by labels.
///
/// Jump targets inside a fragment are label ids handed out by [`label`],
/// [`here`] or [`external`]; they only become statement indices when the
/// fragment is spliced or turned into a standalone body.
///
/// [`label`]: Fragment::label
/// [`here`]: Fragment::here
/// [`external`]: Fragment::external
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    stmts: Vec<Stmt>,
    labels: Vec<Slot>,
    locals: BTreeMap<String, Type>,
    traps: Vec<Trap>,
}

impl Fragment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh unbound label
    pub fn label(&mut self) -> Label {
        self.labels.push(Slot::Unbound);
        self.labels.len() - 1
    }

    /// Bind `label` to the next pushed statement
    pub fn bind(&mut self, label: Label) {
        if let Some(slot) = self.labels.get_mut(label) {
            *slot = Slot::Bound(self.stmts.len());
        }
    }

    /// Label bound to the next pushed statement
    pub fn here(&mut self) -> Label {
        let label = self.label();
        self.bind(label);
        label
    }

    /// Label for statement `target` of the enclosing body
    pub fn external(&mut self, target: usize) -> Label {
        self.labels.push(Slot::External(target));
        self.labels.len() - 1
    }

    pub fn push(&mut self, stmt: Stmt) {
        self.stmts.push(stmt);
    }

    pub fn declare(&mut self, name: impl Into<String>, ty: Type) {
        self.locals.insert(name.into(), ty);
    }

    /// Exception region over labels; `end` is exclusive
    pub fn trap(&mut self, begin: Label, end: Label, handler: Label, exception: Option<String>) {
        self.traps.push(Trap {
            begin,
            end,
            handler,
            exception,
        });
    }

    pub fn len(&self) -> usize {
        self.stmts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    /// Standalone body; every label must be bound.
    pub fn into_body(self) -> SdcResult<Body> {
        let len = self.stmts.len();
        let labels = self.labels;
        let resolve = |label: Label| match labels.get(label) {
            Some(Slot::Bound(pos)) => Some(*pos),
            _ => None,
        };
        let mut stmts = self.stmts;
        for stmt in stmts.iter_mut() {
            stmt.retarget(resolve)
                .map_err(|l| SdcError::Validation(format!("label {} is not bound", l)))?;
        }
        let traps = self
            .traps
            .into_iter()
            .map(|t| match (resolve(t.begin), resolve(t.end), resolve(t.handler)) {
                (Some(begin), Some(end), Some(handler)) if end <= len => Ok(Trap {
                    begin,
                    end,
                    handler,
                    exception: t.exception,
                }),
                _ => Err(SdcError::Validation(
                    "exception region label is not bound".to_string(),
                )),
            })
            .collect::<SdcResult<Vec<_>>>()?;
        Ok(Body {
            locals: self.locals,
            stmts,
            traps,
        })
    }
}

// ============================================================================
// Program model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Visibility {
    Private,
    Package,
    Protected,
    Public,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
    pub is_static: bool,
    pub is_native: bool,
    pub visibility: Visibility,
    pub body: Option<Body>,
}

impl Method {
    /// Public instance method without a body
    pub fn new(name: impl Into<String>, params: Vec<Type>, ret: Type) -> Self {
        Self {
            name: name.into(),
            params,
            ret,
            is_static: false,
            is_native: false,
            visibility: Visibility::Public,
            body: None,
        }
    }

    pub fn make_static(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn make_native(mut self) -> Self {
        self.is_native = true;
        self
    }

    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn reference(&self, class: &str) -> MethodRef {
        MethodRef::new(class, self.name.clone(), self.params.clone(), self.ret.clone())
    }

    pub fn matches(&self, method: &MethodRef) -> bool {
        self.name == method.name && self.params == method.params
    }

    /// `name(params)` identity inside its class
    pub fn signature(&self) -> String {
        let params: Vec<String> = self.params.iter().map(|t| t.to_string()).collect();
        format!("{}({})", self.name, params.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: Type,
    pub is_static: bool,
    pub visibility: Visibility,
    pub initial: Option<Constant>,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            is_static: false,
            visibility: Visibility::Public,
            initial: None,
        }
    }

    pub fn make_static(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn initial(mut self, value: Constant) -> Self {
        self.initial = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Class {
    pub name: String,
    pub super_class: Option<String>,
    /// Enclosing class of a nested class
    pub outer: Option<String>,
    pub visibility: Visibility,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
}

impl Class {
    /// Public class extending `java.lang.Object`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            super_class: Some(OBJECT_CLASS.to_string()),
            outer: None,
            visibility: Visibility::Public,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn extends(mut self, super_class: impl Into<String>) -> Self {
        self.super_class = Some(super_class.into());
        self
    }

    pub fn nested_in(mut self, outer: impl Into<String>) -> Self {
        self.outer = Some(outer.into());
        self
    }

    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    /// Package part of the dotted name
    pub fn package(&self) -> &str {
        package_of(&self.name)
    }

    /// First method with this name
    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn method_mut(&mut self, name: &str) -> Option<&mut Method> {
        self.methods.iter_mut().find(|m| m.name == name)
    }

    pub fn declared_method(&self, method: &MethodRef) -> Option<&Method> {
        self.methods.iter().find(|m| m.matches(method))
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Package part of a dotted class name
pub fn package_of(class: &str) -> &str {
    class.rsplit_once('.').map(|(pkg, _)| pkg).unwrap_or("")
}

/// The set of classes being transformed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub classes: BTreeMap<String, Class>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_class(&mut self, class: Class) {
        self.classes.insert(class.name.clone(), class);
    }

    pub fn with_class(mut self, class: Class) -> Self {
        self.add_class(class);
        self
    }

    pub fn class(&self, name: &str) -> Option<&Class> {
        self.classes.get(name)
    }

    pub fn class_mut(&mut self, name: &str) -> Option<&mut Class> {
        self.classes.get_mut(name)
    }

    /// Class declaring `method`, searching superclasses
    pub fn resolve_method(&self, method: &MethodRef) -> Option<(&Class, &Method)> {
        let mut current = self.class(&method.class);
        while let Some(class) = current {
            if let Some(m) = class.declared_method(method) {
                return Some((class, m));
            }
            current = class.super_class.as_deref().and_then(|s| self.class(s));
        }
        None
    }

    /// Class declaring `field`, searching superclasses
    pub fn resolve_field(&self, field: &FieldRef) -> Option<(&Class, &Field)> {
        let mut current = self.class(&field.class);
        while let Some(class) = current {
            if let Some(f) = class.field(&field.name) {
                return Some((class, f));
            }
            current = class.super_class.as_deref().and_then(|s| self.class(s));
        }
        None
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Structural checks the target runtime's verifier would perform.
pub fn validate(body: &Body, method: &Method) -> SdcResult<()> {
    let fail = |msg: String| Err(SdcError::Validation(format!("{}: {}", method.name, msg)));
    let len = body.stmts.len();

    match body.stmts.last() {
        None => return fail("empty body".to_string()),
        Some(last) if last.falls_through() => {
            return fail("control falls off the end of the body".to_string())
        }
        _ => {}
    }

    for (i, stmt) in body.stmts.iter().enumerate() {
        if let Some(t) = stmt.targets().into_iter().find(|t| *t >= len) {
            return fail(format!("statement {} jumps to {} past the end", i, t));
        }
        if let Some(name) = stmt.locals().into_iter().find(|n| !body.locals.contains_key(*n)) {
            return fail(format!("statement {} uses undeclared local {}", i, name));
        }
        match stmt.expr() {
            Some(Expr::Param(p)) if *p >= method.params.len() => {
                return fail(format!("statement {} reads missing parameter {}", i, p))
            }
            Some(Expr::This) if method.is_static => {
                return fail(format!("statement {} reads this in a static method", i))
            }
            _ => {}
        }
        match stmt {
            Stmt::Return(Some(_)) if method.ret == Type::Void => {
                return fail(format!("statement {} returns a value from a void method", i))
            }
            Stmt::Return(None) if method.ret != Type::Void => {
                return fail(format!("statement {} returns without a value", i))
            }
            _ => {}
        }
    }

    for trap in &body.traps {
        if trap.begin >= trap.end || trap.end > len || trap.handler >= len {
            return fail(format!(
                "malformed exception region {}..{} -> {}",
                trap.begin, trap.end, trap.handler
            ));
        }
    }

    if let Some((i, name)) = crate::cfg::uninitialized_reads(body).into_iter().next() {
        return fail(format!("statement {} may read {} before it is assigned", i, name));
    }
    Ok(())
}
