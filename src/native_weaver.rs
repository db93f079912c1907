//! Tie extracted units to self-decrypting native routines.
//!
//! Every unit gets one routine on the gate class. The unit's entry point
//! starts by materializing the routine key, then either
//!
//! - calls one of its original invocations through the routine
//!   (`sdc.Gate.<name>(key, [receiver], args...)`), or
//! - calls a check-only routine that verifies the package and returns.
//!
//! The routine itself lives in the native library and is described by a
//! [`NativeCheckRoutine`]; see `native_gen` for its source and `native_pack`
//! for how its instructions get encrypted.

use crate::crypto::{hex_upper, KEY_LEN};
use crate::extractor::UNIT_ENTRY;
use crate::ir::{
    Body, Class, Expr, Fragment, InvokeExpr, InvokeKind, Method, MethodRef, Operand, Stmt, Type,
};
use crate::{SdcError, SdcResult};
use serde::{Deserialize, Serialize};

/// Class declaring every native routine
pub const GATE_CLASS: &str = "sdc.Gate";

/// Separates a routine's wrapper symbol from its key in the encrypted symbol
pub const KEY_MARKER: &str = "_KEY_";

/// Local holding the routine key inside the unit
const KEY_LOCAL: &str = "$u_key";

/// The invocation a routine performs on behalf of the unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeaveTarget {
    pub method: MethodRef,
    pub kind: InvokeKind,
}

/// Expected checksum of a byte range of one package entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateChecksum {
    pub file: String,
    pub offset: usize,
    pub count: usize,
    pub value: i32,
}

/// One native routine guarding one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCheckRoutine {
    pub unit_id: String,
    /// Method name on the gate class
    pub method_name: String,
    /// Exported JNI symbol, stays plaintext
    pub wrapper_symbol: String,
    /// Symbol of the encrypted implementation, carrying the key in hex
    pub encrypted_symbol: String,
    pub key: [u8; KEY_LEN],
    /// Managed parameters: key, then receiver if any, then arguments
    pub params: Vec<Type>,
    pub ret: Type,
    /// `None` for check-only routines
    pub target: Option<WeaveTarget>,
    /// Assigned at packaging time
    pub gate: Option<GateChecksum>,
}

impl NativeCheckRoutine {
    pub fn new(unit_id: &str, key: [u8; KEY_LEN], target: Option<WeaveTarget>) -> Self {
        let method_name = native_method_name(unit_id);
        let wrapper_symbol = wrapper_symbol(&method_name);
        let encrypted_symbol = encrypted_symbol(&wrapper_symbol, &key);
        let mut params = vec![Type::bytes()];
        let ret = match &target {
            Some(t) => {
                if t.kind != InvokeKind::Static {
                    params.push(Type::object(t.method.class.clone()));
                }
                params.extend(t.method.params.iter().cloned());
                t.method.ret.clone()
            }
            None => Type::Void,
        };
        Self {
            unit_id: unit_id.to_string(),
            method_name,
            wrapper_symbol,
            encrypted_symbol,
            key,
            params,
            ret,
            target,
            gate: None,
        }
    }

    pub fn is_check_only(&self) -> bool {
        self.target.is_none()
    }

    /// Reference to the routine's method on the gate class
    pub fn gate_method(&self) -> MethodRef {
        MethodRef::new(
            GATE_CLASS,
            self.method_name.clone(),
            self.params.clone(),
            self.ret.clone(),
        )
    }

    /// Native method declaration for the gate class
    pub fn declaration(&self) -> Method {
        Method::new(self.method_name.clone(), self.params.clone(), self.ret.clone())
            .make_static()
            .make_native()
    }
}

/// Unit id reduced to its ASCII letters and digits, as JNI symbols require
pub fn native_method_name(unit_id: &str) -> String {
    unit_id.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// `Java_<gate class>_<method>`
pub fn wrapper_symbol(method_name: &str) -> String {
    format!("Java_{}_{}", GATE_CLASS.replace('.', "_"), method_name)
}

/// `<wrapper>_KEY_<HEX>`
pub fn encrypted_symbol(wrapper_symbol: &str, key: &[u8; KEY_LEN]) -> String {
    format!("{}{}{}", wrapper_symbol, KEY_MARKER, hex_upper(key))
}

/// Route `unit` through a fresh native routine keyed with `key`.
///
/// With `weave_calls`, the first eligible invocation of the entry point is
/// redirected; otherwise, or if none qualifies, a check-only call is inserted
/// right after the key is materialized.
pub fn weave(
    unit: &mut Class,
    key: [u8; KEY_LEN],
    weave_calls: bool,
) -> SdcResult<NativeCheckRoutine> {
    let unit_id = unit.name.clone();
    let main = unit
        .method_mut(UNIT_ENTRY)
        .ok_or_else(|| SdcError::Native(format!("unit {} has no entry point", unit_id)))?;
    let body = main
        .body
        .as_mut()
        .ok_or_else(|| SdcError::Native(format!("unit {} has no body", unit_id)))?;

    let eligible = if weave_calls {
        first_eligible_call(body, &unit_id)
    } else {
        None
    };

    let mut prelude = Fragment::new();
    prelude.declare(KEY_LOCAL, Type::bytes());
    prelude.push(Stmt::assign(KEY_LOCAL, Expr::ByteArray(key.to_vec())));

    let routine = match eligible {
        Some(index) => {
            let Some(inv) = body.stmts[index].invoke_mut() else {
                return Err(SdcError::Native(format!("statement {} lost its call", index)));
            };
            let routine = NativeCheckRoutine::new(
                &unit_id,
                key,
                Some(WeaveTarget {
                    method: inv.method.clone(),
                    kind: inv.kind,
                }),
            );
            let mut args = vec![Operand::local(KEY_LOCAL)];
            args.extend(inv.receiver.take());
            args.append(&mut inv.args);
            *inv = InvokeExpr::new_static(routine.gate_method(), args);
            tracing::debug!(
                "Woven call at {} of {} through {}",
                index,
                unit_id,
                routine.method_name
            );
            routine
        }
        None => {
            let routine = NativeCheckRoutine::new(&unit_id, key, None);
            prelude.push(Stmt::Invoke(InvokeExpr::new_static(
                routine.gate_method(),
                vec![Operand::local(KEY_LOCAL)],
            )));
            tracing::debug!("Check-only routine {} for {}", routine.method_name, unit_id);
            routine
        }
    };

    body.splice(0..0, prelude, false)?;
    Ok(routine)
}

/// First call that can be made from native code on the unit's behalf
fn first_eligible_call(body: &Body, unit_id: &str) -> Option<usize> {
    body.stmts.iter().position(|stmt| {
        stmt.invoke().is_some_and(|inv| {
            inv.kind != InvokeKind::Special
                && !inv.method.is_constructor()
                && inv.method.class != unit_id
                && inv.method.class != GATE_CLASS
        })
    })
}

/// The gate class declaring every routine in `routines`
pub fn gate_class(routines: &[NativeCheckRoutine]) -> Class {
    routines
        .iter()
        .fold(Class::new(GATE_CLASS), |class, r| {
            class.with_method(r.declaration())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{validate, Body, Operand, Stmt};

    fn unit(stmts: Vec<Stmt>) -> Class {
        let mut body = Body::new();
        body.declare("s", Type::string());
        body.declare("n", Type::Int);
        body.stmts = stmts;
        Class::new("a.B_f_0123").with_method(
            Method::new(UNIT_ENTRY, vec![], Type::object("sdc.runtime.Envelope"))
                .make_static()
                .with_body(body),
        )
    }

    fn length_call() -> Stmt {
        Stmt::assign(
            "n",
            Expr::Invoke(InvokeExpr::new_virtual(
                MethodRef::new("java.lang.String", "length", vec![], Type::Int),
                Operand::local("s"),
                vec![],
            )),
        )
    }

    #[test]
    fn test_naming() {
        let key = [0xABu8; KEY_LEN];
        assert_eq!(native_method_name("com.x.Foo_bar_1f2e"), "comxFoobar1f2e");
        let wrapper = wrapper_symbol("comxFoobar1f2e");
        assert_eq!(wrapper, "Java_sdc_Gate_comxFoobar1f2e");
        let encrypted = encrypted_symbol(&wrapper, &key);
        assert!(encrypted.starts_with("Java_sdc_Gate_comxFoobar1f2e_KEY_ABAB"));
        assert_eq!(encrypted.rsplit('_').next().map(str::len), Some(32));
    }

    #[test]
    fn test_naming_drops_non_ascii() {
        let name = native_method_name("com.x.Café_Übung_2a");
        assert_eq!(name, "comxCafbung2a");
        assert!(wrapper_symbol(&name).is_ascii());
    }

    #[test]
    fn test_weave_redirects_first_call() {
        let mut class = unit(vec![
            Stmt::assign("s", Expr::Use(Operand::string("abc"))),
            length_call(),
            Stmt::Return(Some(Operand::null())),
        ]);
        let routine = weave(&mut class, [7u8; KEY_LEN], true).unwrap();

        assert_eq!(routine.params, vec![Type::bytes(), Type::string()]);
        assert_eq!(routine.ret, Type::Int);
        assert_eq!(
            routine.target.as_ref().map(|t| t.kind),
            Some(InvokeKind::Virtual)
        );

        let main = class.method(UNIT_ENTRY).unwrap();
        let body = main.body.as_ref().unwrap();
        assert_eq!(
            body.stmts[0],
            Stmt::assign(KEY_LOCAL, Expr::ByteArray(vec![7u8; KEY_LEN]))
        );
        let inv = body.stmts[2].invoke().unwrap();
        assert_eq!(inv.kind, InvokeKind::Static);
        assert_eq!(inv.method, routine.gate_method());
        assert_eq!(
            inv.args,
            vec![Operand::local(KEY_LOCAL), Operand::local("s")]
        );
        validate(body, main).unwrap();
    }

    #[test]
    fn test_weave_without_eligible_call_inserts_check() {
        let ctor = Stmt::Invoke(InvokeExpr::new_special(
            MethodRef::new("a.Thing", "<init>", vec![], Type::Void),
            Operand::local("s"),
            vec![],
        ));
        let mut class = unit(vec![ctor, Stmt::Return(Some(Operand::null()))]);
        let routine = weave(&mut class, [1u8; KEY_LEN], true).unwrap();
        assert!(routine.is_check_only());
        assert_eq!(routine.ret, Type::Void);

        let body = class.method(UNIT_ENTRY).unwrap().body.as_ref().unwrap();
        assert_eq!(body.stmts.len(), 4);
        assert!(matches!(&body.stmts[1], Stmt::Invoke(inv) if inv.method.class == GATE_CLASS));
    }

    #[test]
    fn test_check_only_when_weaving_disabled() {
        let mut class = unit(vec![length_call(), Stmt::Return(Some(Operand::null()))]);
        let routine = weave(&mut class, [2u8; KEY_LEN], false).unwrap();
        assert!(routine.is_check_only());

        let gate = gate_class(&[routine.clone()]);
        let declared = gate.method(&routine.method_name).unwrap();
        assert!(declared.is_native && declared.is_static);
        assert_eq!(declared.params, vec![Type::bytes()]);
    }
}
