//! Reference execution runtime for the IR.
//!
//! Stands in for the target runtime when checking that a protected program
//! still behaves like the original. It enforces the constraints the
//! transformation has to respect:
//!
//! - locals must be assigned before they are read
//! - class and member access is checked against visibility and load origin
//!   (a unit loaded at runtime does not share package access with the base
//!   image, even when its name puts it in the same package)
//! - exceptions unwind through trap regions
//!
//! `sdc.runtime.Loader` and `sdc.runtime.Console` are intrinsics; methods of
//! other classes may be backed by registered [`NativeMethod`]s.

use crate::crypto::{matches_digest, GuardValue};
use crate::digest_guard::{LOADER_CLASS, MATCH_METHOD};
use crate::envelope::{Envelope, ENVELOPE_CLASS, STATE_FAULT_CLASS};
use crate::error::LoaderError;
use crate::extractor::UNIT_ENTRY;
use crate::ir::{
    package_of, validate, BinOp, Body, Class, CmpOp, Condition, Constant, EnvelopeOp, Expr,
    Field, FieldRef, InvokeExpr, InvokeKind, Method, MethodRef, Operand, Place, Program, Stmt,
    Type, Visibility, CLASS_CLASS, OBJECT_CLASS, STRING_CLASS,
};
use crate::loader::{FatalHook, ManagedLoader, UnitLinker, DECRYPT_METHOD};
use crate::payload::UnitImage;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Diagnostic output class
pub const CONSOLE_CLASS: &str = "sdc.runtime.Console";

pub const THROWABLE_CLASS: &str = "java.lang.Throwable";
pub const EXCEPTION_CLASS: &str = "java.lang.Exception";
pub const RUNTIME_EXCEPTION_CLASS: &str = "java.lang.RuntimeException";
pub const ARITHMETIC_EXCEPTION_CLASS: &str = "java.lang.ArithmeticException";
pub const NULL_POINTER_CLASS: &str = "java.lang.NullPointerException";
pub const CLASS_CAST_CLASS: &str = "java.lang.ClassCastException";
pub const INDEX_OUT_OF_BOUNDS_CLASS: &str = "java.lang.ArrayIndexOutOfBoundsException";

/// Statements one frame may execute before the runtime gives up
pub const DEFAULT_STEP_LIMIT: u64 = 1_000_000;

// ============================================================================
// Values
// ============================================================================

#[derive(Debug, Clone)]
pub enum Value {
    /// boolean, byte, char, short and int
    Int(i32),
    Long(i64),
    Null,
    Ref(Arc<Object>),
}

#[derive(Debug)]
pub enum Object {
    Str(String),
    /// Class literal
    Class(String),
    Boxed(Type, Value),
    Array {
        elem: Type,
        items: Mutex<Vec<Value>>,
    },
    Instance {
        class: String,
        fields: Mutex<HashMap<String, Value>>,
    },
    Envelope(Envelope<Value>),
}

impl Object {
    pub fn class_name(&self) -> String {
        match self {
            Object::Str(_) => STRING_CLASS.to_string(),
            Object::Class(_) => CLASS_CLASS.to_string(),
            Object::Boxed(ty, _) => ty.boxed_class().unwrap_or(OBJECT_CLASS).to_string(),
            Object::Array { elem, .. } => Type::array(elem.clone()).to_string(),
            Object::Instance { class, .. } => class.clone(),
            Object::Envelope(_) => ENVELOPE_CLASS.to_string(),
        }
    }
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Ref(Arc::new(Object::Str(s.into())))
    }

    pub fn class(name: impl Into<String>) -> Self {
        Value::Ref(Arc::new(Object::Class(name.into())))
    }

    pub fn boxed(ty: Type, value: Value) -> Self {
        Value::Ref(Arc::new(Object::Boxed(ty, value)))
    }

    pub fn array(elem: Type, items: Vec<Value>) -> Self {
        Value::Ref(Arc::new(Object::Array {
            elem,
            items: Mutex::new(items),
        }))
    }

    pub fn bytes(data: &[u8]) -> Self {
        Value::array(
            Type::Byte,
            data.iter().map(|&b| Value::Int(i32::from(b as i8))).collect(),
        )
    }

    fn object(&self) -> Option<&Object> {
        match self {
            Value::Ref(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.object() {
            Some(Object::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Contents of a `byte[]`
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self.object() {
            Some(Object::Array { items, .. }) => items
                .lock()
                .iter()
                .map(|v| v.as_int().map(|b| b as u8))
                .collect(),
            _ => None,
        }
    }

    /// Elements of any array
    pub fn to_items(&self) -> Option<Vec<Value>> {
        match self.object() {
            Some(Object::Array { items, .. }) => Some(items.lock().clone()),
            _ => None,
        }
    }

    /// Primitive inside a boxed value
    pub fn unboxed(&self) -> Option<&Value> {
        match self.object() {
            Some(Object::Boxed(_, inner)) => Some(inner),
            _ => None,
        }
    }

    pub fn as_envelope(&self) -> Option<&Envelope<Value>> {
        match self.object() {
            Some(Object::Envelope(env)) => Some(env),
            _ => None,
        }
    }

    /// Secret form of a boxed compared value
    pub fn guard_value(&self) -> Option<GuardValue> {
        match self.object()? {
            Object::Boxed(Type::Long, Value::Long(v)) => Some(GuardValue::Long(*v)),
            Object::Boxed(ty, Value::Int(v)) if ty.is_int_like() => Some(GuardValue::Int(*v)),
            Object::Str(s) => Some(GuardValue::Text(s.clone())),
            Object::Class(c) => Some(GuardValue::TypeName(c.clone())),
            _ => None,
        }
    }
}

/// Identity for references, except strings, class literals and boxes,
/// which compare by content.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Ref(a), Value::Ref(b)) => {
                Arc::ptr_eq(a, b)
                    || match (a.as_ref(), b.as_ref()) {
                        (Object::Str(x), Object::Str(y)) => x == y,
                        (Object::Class(x), Object::Class(y)) => x == y,
                        (Object::Boxed(tx, x), Object::Boxed(ty, y)) => tx == ty && x == y,
                        _ => false,
                    }
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}L", v),
            Value::Null => write!(f, "null"),
            Value::Ref(obj) => match obj.as_ref() {
                Object::Str(s) => write!(f, "{}", s),
                Object::Class(c) => write!(f, "class {}", c),
                Object::Boxed(_, v) => write!(f, "{}", v),
                other => write!(f, "{}", other.class_name()),
            },
        }
    }
}

fn const_value(constant: &Constant) -> Value {
    match constant {
        Constant::Null => Value::Null,
        Constant::Int(v) => Value::Int(*v),
        Constant::Long(v) => Value::Long(*v),
        Constant::Str(s) => Value::str(s.clone()),
        Constant::Class(c) => Value::class(c.clone()),
    }
}

/// Zero value of `ty`: 0, 0L or null
pub fn default_value(ty: &Type) -> Value {
    const_value(&ty.default_value())
}

/// Numeric conversion to primitive `ty`
fn coerce(ty: &Type, value: &Value) -> Result<Value, VmError> {
    let wide = match value {
        Value::Int(v) => i64::from(*v),
        Value::Long(v) => *v,
        other => return Err(VmError::Fault(format!("{} is not numeric", other))),
    };
    Ok(match ty {
        Type::Long => Value::Long(wide),
        Type::Int => Value::Int(wide as i32),
        Type::Short => Value::Int(i32::from(wide as i16)),
        Type::Byte => Value::Int(i32::from(wide as i8)),
        Type::Char => Value::Int(i32::from(wide as u16)),
        Type::Boolean => Value::Int(i32::from(wide != 0)),
        other => return Err(VmError::Fault(format!("{} is not primitive", other))),
    })
}

// ============================================================================
// Errors and natives
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmError {
    /// A managed exception escaped the outermost frame
    #[error("uncaught {0}")]
    Thrown(Value),

    /// The program did something the runtime's verifier would refuse
    #[error("runtime fault: {0}")]
    Fault(String),
}

impl VmError {
    /// Class of a thrown exception
    pub fn thrown_class(&self) -> Option<String> {
        match self {
            VmError::Thrown(Value::Ref(obj)) => Some(obj.class_name()),
            _ => None,
        }
    }
}

/// A method implemented outside the IR
pub trait NativeMethod: Send + Sync {
    /// Receiver first for instance methods
    fn invoke(&self, runtime: &Runtime, args: Vec<Value>) -> Result<Value, VmError>;
}

impl<F> NativeMethod for F
where
    F: Fn(&Runtime, Vec<Value>) -> Result<Value, VmError> + Send + Sync,
{
    fn invoke(&self, runtime: &Runtime, args: Vec<Value>) -> Result<Value, VmError> {
        self(runtime, args)
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Where a class came from
#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    Base,
    Unit(String),
}

#[derive(Debug, Clone)]
struct Loaded {
    class: Arc<Class>,
    origin: Origin,
}

/// A linked unit entry point
#[derive(Debug)]
pub struct UnitEntry {
    pub id: String,
    class: Arc<Class>,
    index: usize,
}

enum Flow {
    Next,
    Jump(usize),
    Return(Value),
}

struct Frame<'a> {
    ctx: &'a Loaded,
    this: Option<Value>,
    args: Vec<Value>,
    locals: HashMap<String, Value>,
    caught: Option<Value>,
}

pub struct Runtime {
    classes: HashMap<String, Arc<Class>>,
    units: RwLock<HashMap<String, Arc<Class>>>,
    statics: Mutex<HashMap<(String, String), Value>>,
    natives: RwLock<HashMap<String, Arc<dyn NativeMethod>>>,
    loader: ManagedLoader<UnitEntry>,
    console: Mutex<Vec<String>>,
    step_limit: u64,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("classes", &self.classes.len())
            .field("units", &self.units.read().len())
            .field("loader", &self.loader)
            .finish()
    }
}

fn builtin_classes() -> Vec<Class> {
    let mut ctor_body = Body::new();
    ctor_body.stmts = vec![Stmt::Return(None)];
    let ctor = Method::new("<init>", vec![], Type::Void).with_body(ctor_body);

    let mut object = Class::new(OBJECT_CLASS).with_method(ctor.clone());
    object.super_class = None;
    let mut classes = vec![
        object,
        Class::new(THROWABLE_CLASS).with_method(ctor.clone()),
        Class::new(EXCEPTION_CLASS)
            .extends(THROWABLE_CLASS)
            .with_method(ctor.clone()),
        Class::new(RUNTIME_EXCEPTION_CLASS)
            .extends(EXCEPTION_CLASS)
            .with_method(ctor.clone()),
        Class::new(ENVELOPE_CLASS),
    ];
    for name in [
        STATE_FAULT_CLASS,
        ARITHMETIC_EXCEPTION_CLASS,
        NULL_POINTER_CLASS,
        CLASS_CAST_CLASS,
        INDEX_OUT_OF_BOUNDS_CLASS,
    ] {
        classes.push(
            Class::new(name)
                .extends(RUNTIME_EXCEPTION_CLASS)
                .with_method(ctor.clone()),
        );
    }
    classes
}

fn take<const N: usize>(args: Vec<Value>, what: &str) -> Result<[Value; N], VmError> {
    let got = args.len();
    args.try_into()
        .map_err(|_| VmError::Fault(format!("{} expects {} arguments, got {}", what, N, got)))
}

impl Runtime {
    pub fn new(program: Program) -> Self {
        let mut classes: HashMap<String, Arc<Class>> = builtin_classes()
            .into_iter()
            .map(|c| (c.name.clone(), Arc::new(c)))
            .collect();
        for (name, class) in program.classes {
            classes.insert(name, Arc::new(class));
        }
        Self {
            classes,
            units: RwLock::new(HashMap::new()),
            statics: Mutex::new(HashMap::new()),
            natives: RwLock::new(HashMap::new()),
            loader: ManagedLoader::new(),
            console: Mutex::new(Vec::new()),
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    /// Hook run on fatal loader failures before the process aborts
    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.loader = self.loader.with_fatal_hook(hook);
        self
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Back `class.name` with `native`
    pub fn register_native(&self, class: &str, name: &str, native: Arc<dyn NativeMethod>) {
        self.natives
            .write()
            .insert(format!("{}.{}", class, name), native);
    }

    /// Lines written through `sdc.runtime.Console.log`
    pub fn console(&self) -> Vec<String> {
        self.console.lock().clone()
    }

    pub fn loader(&self) -> &ManagedLoader<UnitEntry> {
        &self.loader
    }

    pub fn load_count(&self) -> usize {
        self.loader.load_count()
    }

    /// Run static method `name` of `class` on behalf of the host.
    pub fn call_static(&self, class: &str, name: &str, args: Vec<Value>) -> Result<Value, VmError> {
        let loaded = self
            .lookup(class)
            .ok_or_else(|| VmError::Fault(format!("no class {}", class)))?;
        let index = loaded
            .class
            .methods
            .iter()
            .position(|m| m.name == name && m.is_static)
            .ok_or_else(|| VmError::Fault(format!("no static method {}.{}", class, name)))?;
        self.execute(&loaded, index, None, args)
    }

    /// Invoke `method` on behalf of the host, bypassing access checks.
    pub fn invoke(
        &self,
        method: &MethodRef,
        kind: InvokeKind,
        receiver: Option<Value>,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        self.dispatch(None, method, kind, receiver, args)
    }

    /// Allocate an instance of `class` with default field values
    pub fn new_instance(&self, class: &str) -> Result<Value, VmError> {
        self.allocate(None, class)
    }

    fn lookup(&self, name: &str) -> Option<Loaded> {
        if let Some(class) = self.classes.get(name) {
            return Some(Loaded {
                class: Arc::clone(class),
                origin: Origin::Base,
            });
        }
        self.units.read().get(name).map(|class| Loaded {
            class: Arc::clone(class),
            origin: Origin::Unit(name.to_string()),
        })
    }

    fn super_of(&self, name: &str) -> Option<String> {
        self.lookup(name).and_then(|l| l.class.super_class.clone())
    }

    fn is_subclass(&self, from: &str, to: &str) -> bool {
        let mut current = from.to_string();
        loop {
            if current == to {
                return true;
            }
            match self.super_of(&current) {
                Some(next) => current = next,
                None => return to == OBJECT_CLASS,
            }
        }
    }

    fn instance_of(&self, value: &Value, ty: &Type) -> bool {
        let Some(obj) = value.object() else {
            return false;
        };
        match ty {
            Type::Object(name) => self.is_subclass(&obj.class_name(), name),
            array => obj.class_name() == array.to_string(),
        }
    }

    fn exception(&self, class: &str) -> VmError {
        VmError::Thrown(Value::Ref(Arc::new(Object::Instance {
            class: class.to_string(),
            fields: Mutex::new(HashMap::new()),
        })))
    }

    // ------------------------------------------------------------------------
    // Access control
    // ------------------------------------------------------------------------

    fn class_accessible(&self, ctx: Option<&Loaded>, target: &Loaded) -> bool {
        let Some(ctx) = ctx else {
            return true;
        };
        if ctx.class.name == target.class.name {
            return true;
        }
        let same_runtime_package = package_of(&ctx.class.name) == package_of(&target.class.name)
            && ctx.origin == target.origin;
        let visible = target.class.visibility == Visibility::Public || same_runtime_package;
        visible
            && target
                .class
                .outer
                .as_deref()
                .and_then(|outer| self.lookup(outer))
                .map_or(true, |outer| self.class_accessible(Some(ctx), &outer))
    }

    fn member_accessible(&self, ctx: Option<&Loaded>, owner: &Loaded, visibility: Visibility) -> bool {
        let Some(ctx) = ctx else {
            return true;
        };
        if !self.class_accessible(Some(ctx), owner) {
            return false;
        }
        let same_class = ctx.class.name == owner.class.name;
        match visibility {
            Visibility::Public => true,
            Visibility::Private => same_class,
            Visibility::Package | Visibility::Protected => {
                same_class
                    || (package_of(&ctx.class.name) == package_of(&owner.class.name)
                        && ctx.origin == owner.origin)
            }
        }
    }

    fn illegal_access(ctx: Option<&Loaded>, what: impl fmt::Display) -> VmError {
        let from = ctx.map(|c| c.class.name.as_str()).unwrap_or("<host>");
        VmError::Fault(format!("illegal access to {} from {}", what, from))
    }

    // ------------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------------

    fn resolve_method(&self, class: &str, method: &MethodRef) -> Option<(Loaded, usize)> {
        let mut current = Some(class.to_string());
        while let Some(name) = current {
            let loaded = self.lookup(&name)?;
            if let Some(index) = loaded.class.methods.iter().position(|m| m.matches(method)) {
                return Some((loaded, index));
            }
            current = loaded.class.super_class.clone();
        }
        None
    }

    fn resolve_field(&self, field: &FieldRef) -> Option<(Loaded, Field)> {
        let mut current = Some(field.class.clone());
        while let Some(name) = current {
            let loaded = self.lookup(&name)?;
            if let Some(f) = loaded.class.field(&field.name).cloned() {
                return Some((loaded, f));
            }
            current = loaded.class.super_class.clone();
        }
        None
    }

    fn native(&self, class: &str, name: &str) -> Option<Arc<dyn NativeMethod>> {
        self.natives.read().get(&format!("{}.{}", class, name)).cloned()
    }

    fn allocate(&self, ctx: Option<&Loaded>, class: &str) -> Result<Value, VmError> {
        let loaded = self
            .lookup(class)
            .ok_or_else(|| VmError::Fault(format!("no class {}", class)))?;
        if !self.class_accessible(ctx, &loaded) {
            return Err(Self::illegal_access(ctx, class));
        }
        let mut fields = HashMap::new();
        let mut current = Some(loaded);
        while let Some(l) = current {
            for f in l.class.fields.iter().filter(|f| !f.is_static) {
                let value = f
                    .initial
                    .as_ref()
                    .map(const_value)
                    .unwrap_or_else(|| default_value(&f.ty));
                fields.entry(f.name.clone()).or_insert(value);
            }
            current = l.class.super_class.as_deref().and_then(|s| self.lookup(s));
        }
        Ok(Value::Ref(Arc::new(Object::Instance {
            class: class.to_string(),
            fields: Mutex::new(fields),
        })))
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    fn execute(
        &self,
        loaded: &Loaded,
        index: usize,
        this: Option<Value>,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        let method = &loaded.class.methods[index];
        if let Some(native) = self.native(&loaded.class.name, &method.name) {
            let mut all: Vec<Value> = this.into_iter().collect();
            all.extend(args);
            return native.invoke(self, all);
        }
        let body = method.body.as_ref().ok_or_else(|| {
            VmError::Fault(format!(
                "{}.{} has no body",
                loaded.class.name,
                method.signature()
            ))
        })?;
        if args.len() != method.params.len() {
            return Err(VmError::Fault(format!(
                "{}.{} called with {} arguments",
                loaded.class.name,
                method.signature(),
                args.len()
            )));
        }

        let mut frame = Frame {
            ctx: loaded,
            this,
            args,
            locals: HashMap::new(),
            caught: None,
        };
        let mut pc = 0usize;
        let mut steps = 0u64;
        loop {
            steps += 1;
            if steps > self.step_limit {
                return Err(VmError::Fault(format!(
                    "step limit exceeded in {}.{}",
                    loaded.class.name, method.name
                )));
            }
            let stmt = body.stmts.get(pc).ok_or_else(|| {
                VmError::Fault(format!("{}.{} ran past its end", loaded.class.name, method.name))
            })?;
            match self.step(&mut frame, stmt) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Jump(target)) => pc = target,
                Ok(Flow::Return(value)) => return Ok(value),
                Err(VmError::Thrown(exc)) => {
                    let handler = body.traps.iter().find(|t| {
                        t.covers(pc)
                            && t.exception
                                .as_deref()
                                .map_or(true, |c| self.instance_of(&exc, &Type::object(c)))
                    });
                    match handler {
                        Some(trap) => {
                            frame.caught = Some(exc);
                            pc = trap.handler;
                        }
                        None => return Err(VmError::Thrown(exc)),
                    }
                }
                Err(fault) => return Err(fault),
            }
        }
    }

    fn step(&self, frame: &mut Frame<'_>, stmt: &Stmt) -> Result<Flow, VmError> {
        match stmt {
            Stmt::Assign { dest, value } => {
                let value = self.eval(frame, value)?;
                self.store(frame, dest, value)?;
                Ok(Flow::Next)
            }
            Stmt::Invoke(inv) => {
                self.invoke_expr(frame, inv)?;
                Ok(Flow::Next)
            }
            Stmt::If { cond, target } => {
                if self.compare(frame, cond)? {
                    Ok(Flow::Jump(*target))
                } else {
                    Ok(Flow::Next)
                }
            }
            Stmt::Goto(target) => Ok(Flow::Jump(*target)),
            Stmt::Switch {
                key,
                low,
                targets,
                default,
            } => {
                let key = self.int(frame, key)?;
                let slot = i64::from(key) - i64::from(*low);
                let target = usize::try_from(slot)
                    .ok()
                    .and_then(|i| targets.get(i))
                    .unwrap_or(default);
                Ok(Flow::Jump(*target))
            }
            Stmt::Return(None) => Ok(Flow::Return(Value::Null)),
            Stmt::Return(Some(op)) => Ok(Flow::Return(self.operand(frame, op)?)),
            Stmt::Throw(op) => match self.operand(frame, op)? {
                Value::Null => Err(self.exception(NULL_POINTER_CLASS)),
                exc => Err(VmError::Thrown(exc)),
            },
            Stmt::Nop => Ok(Flow::Next),
        }
    }

    fn operand(&self, frame: &Frame<'_>, op: &Operand) -> Result<Value, VmError> {
        match op {
            Operand::Local(name) => frame
                .locals
                .get(name)
                .cloned()
                .ok_or_else(|| VmError::Fault(format!("read of unassigned local {}", name))),
            Operand::Const(c) => Ok(const_value(c)),
        }
    }

    fn int(&self, frame: &Frame<'_>, op: &Operand) -> Result<i32, VmError> {
        match self.operand(frame, op)? {
            Value::Int(v) => Ok(v),
            Value::Long(v) => Ok(v as i32),
            other => Err(VmError::Fault(format!("{} is not an int", other))),
        }
    }

    fn non_null(&self, value: Value) -> Result<Arc<Object>, VmError> {
        match value {
            Value::Ref(obj) => Ok(obj),
            Value::Null => Err(self.exception(NULL_POINTER_CLASS)),
            other => Err(VmError::Fault(format!("{} is not a reference", other))),
        }
    }

    fn compare(&self, frame: &Frame<'_>, cond: &Condition) -> Result<bool, VmError> {
        let lhs = self.operand(frame, &cond.lhs)?;
        let rhs = self.operand(frame, &cond.rhs)?;
        let numeric = match (&lhs, &rhs) {
            (Value::Int(a), Value::Int(b)) => Some((i64::from(*a), i64::from(*b))),
            (Value::Long(a), Value::Long(b)) => Some((*a, *b)),
            (Value::Int(a), Value::Long(b)) => Some((i64::from(*a), *b)),
            (Value::Long(a), Value::Int(b)) => Some((*a, i64::from(*b))),
            _ => None,
        };
        match (cond.op, numeric) {
            (CmpOp::Eq, None) => Ok(lhs == rhs),
            (CmpOp::Ne, None) => Ok(lhs != rhs),
            (op, Some((a, b))) => Ok(match op {
                CmpOp::Eq => a == b,
                CmpOp::Ne => a != b,
                CmpOp::Lt => a < b,
                CmpOp::Ge => a >= b,
                CmpOp::Gt => a > b,
                CmpOp::Le => a <= b,
            }),
            (op, None) => Err(VmError::Fault(format!(
                "ordered comparison {:?} of {} and {}",
                op, lhs, rhs
            ))),
        }
    }

    fn binary(&self, op: BinOp, lhs: Value, rhs: Value) -> Result<Value, VmError> {
        match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => {
                if matches!(op, BinOp::Div | BinOp::Rem) && b == 0 {
                    return Err(self.exception(ARITHMETIC_EXCEPTION_CLASS));
                }
                Ok(Value::Int(match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::Div => a.wrapping_div(b),
                    BinOp::Rem => a.wrapping_rem(b),
                    BinOp::And => a & b,
                    BinOp::Or => a | b,
                    BinOp::Xor => a ^ b,
                    BinOp::Shl => a.wrapping_shl(b as u32 & 31),
                    BinOp::Shr => a.wrapping_shr(b as u32 & 31),
                }))
            }
            (a @ (Value::Int(_) | Value::Long(_)), b @ (Value::Int(_) | Value::Long(_))) => {
                let a = coerce(&Type::Long, &a)?.as_long().unwrap_or_default();
                let b = coerce(&Type::Long, &b)?.as_long().unwrap_or_default();
                if matches!(op, BinOp::Div | BinOp::Rem) && b == 0 {
                    return Err(self.exception(ARITHMETIC_EXCEPTION_CLASS));
                }
                Ok(Value::Long(match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::Div => a.wrapping_div(b),
                    BinOp::Rem => a.wrapping_rem(b),
                    BinOp::And => a & b,
                    BinOp::Or => a | b,
                    BinOp::Xor => a ^ b,
                    BinOp::Shl => a.wrapping_shl(b as u32 & 63),
                    BinOp::Shr => a.wrapping_shr(b as u32 & 63),
                }))
            }
            (a, b) => Err(VmError::Fault(format!(
                "arithmetic {:?} on {} and {}",
                op, a, b
            ))),
        }
    }

    fn envelope(&self, frame: &Frame<'_>, op: &Operand) -> Result<Arc<Object>, VmError> {
        let obj = self.non_null(self.operand(frame, op)?)?;
        match obj.as_ref() {
            Object::Envelope(_) => Ok(obj),
            other => Err(VmError::Fault(format!(
                "{} is not an envelope",
                other.class_name()
            ))),
        }
    }

    fn eval(&self, frame: &mut Frame<'_>, expr: &Expr) -> Result<Value, VmError> {
        let ctx = Some(frame.ctx);
        match expr {
            Expr::Use(op) => self.operand(frame, op),
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.operand(frame, lhs)?;
                let rhs = self.operand(frame, rhs)?;
                self.binary(*op, lhs, rhs)
            }
            Expr::Invoke(inv) => self.invoke_expr(frame, inv),
            Expr::New(class) => self.allocate(ctx, class),
            Expr::NewArray { elem, len } => {
                let len = self.int(frame, len)?;
                let len = usize::try_from(len)
                    .map_err(|_| self.exception(INDEX_OUT_OF_BOUNDS_CLASS))?;
                Ok(Value::array(elem.clone(), vec![default_value(elem); len]))
            }
            Expr::ByteArray(bytes) => Ok(Value::bytes(bytes)),
            Expr::ArrayOf { elem, items } => {
                let items = items
                    .iter()
                    .map(|i| self.operand(frame, i))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::array(elem.clone(), items))
            }
            Expr::ArrayGet { array, index } => {
                let obj = self.non_null(self.operand(frame, array)?)?;
                let index = self.int(frame, index)?;
                match obj.as_ref() {
                    Object::Array { items, .. } => usize::try_from(index)
                        .ok()
                        .and_then(|i| items.lock().get(i).cloned())
                        .ok_or_else(|| self.exception(INDEX_OUT_OF_BOUNDS_CLASS)),
                    other => Err(VmError::Fault(format!("{} is not an array", other.class_name()))),
                }
            }
            Expr::ArrayLen(array) => match self.non_null(self.operand(frame, array)?)?.as_ref() {
                Object::Array { items, .. } => Ok(Value::Int(items.lock().len() as i32)),
                other => Err(VmError::Fault(format!("{} is not an array", other.class_name()))),
            },
            Expr::FieldGet { base, field } => {
                let base = base.as_ref().map(|b| self.operand(frame, b)).transpose()?;
                self.read_field(ctx, base, field)
            }
            Expr::Cast { ty, value } => {
                let value = self.operand(frame, value)?;
                if ty.is_primitive() {
                    coerce(ty, &value)
                } else if value.is_null() || self.instance_of(&value, ty) {
                    Ok(value)
                } else {
                    Err(self.exception(CLASS_CAST_CLASS))
                }
            }
            Expr::Box { ty, value } => {
                let value = coerce(ty, &self.operand(frame, value)?)?;
                Ok(Value::boxed(ty.clone(), value))
            }
            Expr::Unbox { ty, value } => {
                let obj = self.non_null(self.operand(frame, value)?)?;
                match obj.as_ref() {
                    Object::Boxed(_, inner) => coerce(ty, inner),
                    _ => Err(self.exception(CLASS_CAST_CLASS)),
                }
            }
            Expr::Param(i) => frame
                .args
                .get(*i)
                .cloned()
                .ok_or_else(|| VmError::Fault(format!("no parameter {}", i))),
            Expr::This => frame
                .this
                .clone()
                .ok_or_else(|| VmError::Fault("no receiver in static context".to_string())),
            Expr::CaughtException => frame
                .caught
                .take()
                .ok_or_else(|| VmError::Fault("no exception in flight".to_string())),
            Expr::Envelope(op) => self.eval_envelope(frame, op),
        }
    }

    fn eval_envelope(&self, frame: &Frame<'_>, op: &EnvelopeOp) -> Result<Value, VmError> {
        let saved = |ops: &[Operand]| -> Result<Vec<Value>, VmError> {
            ops.iter().map(|o| self.operand(frame, o)).collect()
        };
        let wrap = |env: Envelope<Value>| -> Result<Value, VmError> {
            Ok(Value::Ref(Arc::new(Object::Envelope(env))))
        };
        match op {
            EnvelopeOp::MakeValue(value) => {
                let value = value.as_ref().map(|v| self.operand(frame, v)).transpose()?;
                wrap(Envelope::Value(value))
            }
            EnvelopeOp::MakeJump { index, saved: ops } => wrap(Envelope::Jump {
                index: *index,
                saved: saved(ops)?,
            }),
            EnvelopeOp::MakeFallthrough { saved: ops } => {
                wrap(Envelope::Fallthrough { saved: saved(ops)? })
            }
            EnvelopeOp::Code(env) => {
                let obj = self.envelope(frame, env)?;
                let code = match obj.as_ref() {
                    Object::Envelope(e) => e.code(),
                    _ => 0,
                };
                Ok(Value::Int(code))
            }
            EnvelopeOp::Payload(env) => {
                let obj = self.envelope(frame, env)?;
                match obj.as_ref() {
                    Object::Envelope(e) => Ok(e.payload().cloned().unwrap_or(Value::Null)),
                    _ => Ok(Value::Null),
                }
            }
            EnvelopeOp::Saved { envelope, slot } => {
                let obj = self.envelope(frame, envelope)?;
                match obj.as_ref() {
                    Object::Envelope(e) => e.saved().get(*slot).cloned().ok_or_else(|| {
                        VmError::Fault(format!("envelope has no saved slot {}", slot))
                    }),
                    _ => Ok(Value::Null),
                }
            }
        }
    }

    fn read_field(
        &self,
        ctx: Option<&Loaded>,
        base: Option<Value>,
        field: &FieldRef,
    ) -> Result<Value, VmError> {
        let (owner, declared) = self
            .resolve_field(field)
            .ok_or_else(|| VmError::Fault(format!("no field {}.{}", field.class, field.name)))?;
        if !self.member_accessible(ctx, &owner, declared.visibility) {
            return Err(Self::illegal_access(
                ctx,
                format!("{}.{}", owner.class.name, declared.name),
            ));
        }
        match base {
            None => {
                let key = (owner.class.name.clone(), declared.name.clone());
                let mut statics = self.statics.lock();
                let value = statics.entry(key).or_insert_with(|| {
                    declared
                        .initial
                        .as_ref()
                        .map(const_value)
                        .unwrap_or_else(|| default_value(&declared.ty))
                });
                Ok(value.clone())
            }
            Some(base) => match self.non_null(base)?.as_ref() {
                Object::Instance { fields, .. } => Ok(fields
                    .lock()
                    .get(&declared.name)
                    .cloned()
                    .unwrap_or_else(|| default_value(&declared.ty))),
                other => Err(VmError::Fault(format!("{} has no fields", other.class_name()))),
            },
        }
    }

    fn store(&self, frame: &mut Frame<'_>, dest: &Place, value: Value) -> Result<(), VmError> {
        match dest {
            Place::Local(name) => {
                frame.locals.insert(name.clone(), value);
                Ok(())
            }
            Place::Field { base, field } => {
                let ctx = Some(frame.ctx);
                let (owner, declared) = self.resolve_field(field).ok_or_else(|| {
                    VmError::Fault(format!("no field {}.{}", field.class, field.name))
                })?;
                if !self.member_accessible(ctx, &owner, declared.visibility) {
                    return Err(Self::illegal_access(
                        ctx,
                        format!("{}.{}", owner.class.name, declared.name),
                    ));
                }
                match base {
                    None => {
                        self.statics
                            .lock()
                            .insert((owner.class.name.clone(), declared.name), value);
                        Ok(())
                    }
                    Some(base) => match self.non_null(self.operand(frame, base)?)?.as_ref() {
                        Object::Instance { fields, .. } => {
                            fields.lock().insert(declared.name, value);
                            Ok(())
                        }
                        other => Err(VmError::Fault(format!(
                            "{} has no fields",
                            other.class_name()
                        ))),
                    },
                }
            }
            Place::ArrayElem { array, index } => {
                let obj = self.non_null(self.operand(frame, array)?)?;
                let index = self.int(frame, index)?;
                match obj.as_ref() {
                    Object::Array { items, .. } => {
                        let mut items = items.lock();
                        let slot = usize::try_from(index)
                            .ok()
                            .and_then(|i| items.get_mut(i))
                            .ok_or_else(|| self.exception(INDEX_OUT_OF_BOUNDS_CLASS))?;
                        *slot = value;
                        Ok(())
                    }
                    other => Err(VmError::Fault(format!("{} is not an array", other.class_name()))),
                }
            }
        }
    }

    fn invoke_expr(&self, frame: &Frame<'_>, inv: &InvokeExpr) -> Result<Value, VmError> {
        let receiver = inv
            .receiver
            .as_ref()
            .map(|r| self.operand(frame, r))
            .transpose()?;
        let args = inv
            .args
            .iter()
            .map(|a| self.operand(frame, a))
            .collect::<Result<Vec<_>, _>>()?;
        self.dispatch(Some(frame.ctx), &inv.method, inv.kind, receiver, args)
    }

    fn dispatch(
        &self,
        ctx: Option<&Loaded>,
        method: &MethodRef,
        kind: InvokeKind,
        receiver: Option<Value>,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        if method.class == LOADER_CLASS || method.class == CONSOLE_CLASS {
            return self.intrinsic(method, args);
        }
        if let Some(native) = self.native(&method.class, &method.name) {
            let mut all: Vec<Value> = receiver.into_iter().collect();
            all.extend(args);
            return native.invoke(self, all);
        }

        let resolved = match (kind, &receiver) {
            (InvokeKind::Virtual, Some(recv)) => {
                let dynamic = self.non_null(recv.clone())?.class_name();
                self.resolve_method(&dynamic, method)
                    .or_else(|| self.resolve_method(&method.class, method))
            }
            _ => self.resolve_method(&method.class, method),
        };
        let (loaded, index) =
            resolved.ok_or_else(|| VmError::Fault(format!("no such method {}", method)))?;
        let target = &loaded.class.methods[index];
        if !self.member_accessible(ctx, &loaded, target.visibility) {
            return Err(Self::illegal_access(ctx, target.reference(&loaded.class.name)));
        }
        if !target.is_static {
            match &receiver {
                Some(Value::Null) | None => return Err(self.exception(NULL_POINTER_CLASS)),
                Some(_) => {}
            }
        }
        self.execute(&loaded, index, receiver, args)
    }

    fn intrinsic(&self, method: &MethodRef, args: Vec<Value>) -> Result<Value, VmError> {
        match (method.class.as_str(), method.name.as_str()) {
            (LOADER_CLASS, MATCH_METHOD) => {
                let [value, digest] = take::<2>(args, MATCH_METHOD)?;
                let digest = digest
                    .to_bytes()
                    .ok_or_else(|| VmError::Fault("digest is not a byte array".to_string()))?;
                let matched = value
                    .guard_value()
                    .is_some_and(|g| matches_digest(&g, &digest));
                Ok(Value::Int(i32::from(matched)))
            }
            (LOADER_CLASS, DECRYPT_METHOD) => {
                let [id, payload, secret, unit_args] = take::<4>(args, DECRYPT_METHOD)?;
                let id = id
                    .as_str()
                    .ok_or_else(|| VmError::Fault("unit id is not a string".to_string()))?
                    .to_string();
                let payload = payload
                    .to_bytes()
                    .ok_or_else(|| VmError::Fault("payload is not a byte array".to_string()))?;
                let secret = secret
                    .guard_value()
                    .ok_or_else(|| VmError::Fault(format!("{} cannot key a unit", secret)))?;
                let unit_args = unit_args
                    .to_items()
                    .ok_or_else(|| VmError::Fault("unit arguments are not an array".to_string()))?;
                let linker = VmLinker { runtime: self };
                self.loader
                    .decrypt_and_invoke(&linker, &id, &payload, &secret, unit_args)
            }
            (CONSOLE_CLASS, "log") => {
                let line = args
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                tracing::info!("{}", line);
                self.console.lock().push(line);
                Ok(Value::Null)
            }
            _ => Err(VmError::Fault(format!("unknown intrinsic {}", method))),
        }
    }
}

// ============================================================================
// Unit linking
// ============================================================================

/// Links unit images into a [`Runtime`] as classes of their own origin
pub struct VmLinker<'a> {
    runtime: &'a Runtime,
}

impl<'a> VmLinker<'a> {
    pub fn new(runtime: &'a Runtime) -> Self {
        Self { runtime }
    }
}

impl UnitLinker for VmLinker<'_> {
    type Entry = UnitEntry;
    type Value = Value;
    type Error = VmError;

    fn link(&self, image: UnitImage) -> Result<UnitEntry, LoaderError> {
        let class = image.class;
        for method in &class.methods {
            if let Some(body) = &method.body {
                validate(body, method).map_err(|e| LoaderError::Link {
                    unit: image.id.clone(),
                    reason: e.to_string(),
                })?;
            }
        }
        let index = class
            .methods
            .iter()
            .position(|m| m.name == UNIT_ENTRY && m.is_static && m.visibility == Visibility::Public)
            .ok_or_else(|| LoaderError::EntryNotFound(image.id.clone()))?;
        let class = Arc::new(class);
        self.runtime
            .units
            .write()
            .insert(class.name.clone(), Arc::clone(&class));
        tracing::debug!("Linked unit {}", image.id);
        Ok(UnitEntry {
            id: image.id,
            class,
            index,
        })
    }

    fn invoke(&self, entry: &UnitEntry, args: Vec<Value>) -> Result<Value, VmError> {
        let loaded = Loaded {
            class: Arc::clone(&entry.class),
            origin: Origin::Unit(entry.id.clone()),
        };
        self.runtime.execute(&loaded, entry.index, None, args)
    }
}
