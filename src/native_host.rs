//! In-process host for native gate routines.
//!
//! A [`SelfDecryptingStub`] stands in for one routine of the native library
//! when the protected program runs on the reference [`Runtime`]. It follows
//! the generated wrapper step by step:
//!
//! 1. checksum the gate range of the package once, and give up with the
//!    type's default value if it does not match
//! 2. decrypt the routine in place with the key passed from managed code,
//!    exactly once even under concurrent first calls
//! 3. perform the woven call, or return for check-only routines
//!
//! The "code" is the routine's serialized target, encrypted with the routine
//! key the same way the packager encrypts machine code.

use crate::crypto::{apply_keystream, hash_range, KEY_LEN};
use crate::interfaces::PackageContents;
use crate::ir::{InvokeKind, Type};
use crate::native_weaver::{GateChecksum, NativeCheckRoutine, WeaveTarget, GATE_CLASS};
use crate::vm::{default_value, NativeMethod, Runtime, Value, VmError};
use crate::SdcResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

const ENCRYPTED: u8 = 0;
const DECRYPTING: u8 = 1;
const DECRYPTED: u8 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RoutineCode {
    method_name: String,
    target: Option<WeaveTarget>,
}

pub struct SelfDecryptingStub {
    method_name: String,
    ret: Type,
    gate: Option<GateChecksum>,
    package: Arc<dyn PackageContents>,
    gate_passed: OnceLock<bool>,
    state: AtomicU8,
    code: Mutex<Vec<u8>>,
    routine: OnceLock<RoutineCode>,
    decryptions: AtomicUsize,
}

impl std::fmt::Debug for SelfDecryptingStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfDecryptingStub")
            .field("method_name", &self.method_name)
            .field("gate", &self.gate)
            .field("state", &self.state.load(Ordering::Acquire))
            .finish()
    }
}

impl SelfDecryptingStub {
    /// Encrypt `routine` under its own key
    pub fn new(routine: &NativeCheckRoutine, package: Arc<dyn PackageContents>) -> SdcResult<Self> {
        let mut code = serde_json::to_vec(&RoutineCode {
            method_name: routine.method_name.clone(),
            target: routine.target.clone(),
        })?;
        apply_keystream(&routine.key, &mut code);
        Ok(Self {
            method_name: routine.method_name.clone(),
            ret: routine.ret.clone(),
            gate: routine.gate.clone(),
            package,
            gate_passed: OnceLock::new(),
            state: AtomicU8::new(ENCRYPTED),
            code: Mutex::new(code),
            routine: OnceLock::new(),
            decryptions: AtomicUsize::new(0),
        })
    }

    pub fn is_decrypted(&self) -> bool {
        self.state.load(Ordering::Acquire) == DECRYPTED
    }

    /// Number of in-place decryptions performed
    pub fn decryptions(&self) -> usize {
        self.decryptions.load(Ordering::SeqCst)
    }

    /// A routine without an assigned gate has nothing to verify.
    fn gate_passed(&self) -> bool {
        *self.gate_passed.get_or_init(|| {
            let Some(gate) = &self.gate else {
                return true;
            };
            let actual = self
                .package
                .read(&gate.file)
                .ok()
                .and_then(|data| hash_range(&data, gate.offset, gate.count));
            let passed = actual == Some(gate.value);
            if !passed {
                tracing::warn!("Package check failed for {}", self.method_name);
            }
            passed
        })
    }

    fn decrypted(&self, key: &[u8; KEY_LEN]) -> Option<&RoutineCode> {
        if self.state.load(Ordering::Acquire) == DECRYPTED {
            return self.routine.get();
        }
        let mut code = self.code.lock();
        if self
            .state
            .compare_exchange(ENCRYPTED, DECRYPTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // decrypted by the caller we waited for
            return self.routine.get();
        }

        apply_keystream(key, &mut code);
        match serde_json::from_slice::<RoutineCode>(&code) {
            Ok(routine) if routine.method_name == self.method_name => {
                let routine = self.routine.get_or_init(|| routine);
                self.decryptions.fetch_add(1, Ordering::SeqCst);
                self.state.store(DECRYPTED, Ordering::Release);
                tracing::debug!("Decrypted routine {}", self.method_name);
                Some(routine)
            }
            _ => {
                apply_keystream(key, &mut code);
                self.state.store(ENCRYPTED, Ordering::Release);
                tracing::warn!("Routine {} did not decrypt with the supplied key", self.method_name);
                None
            }
        }
    }
}

impl NativeMethod for SelfDecryptingStub {
    fn invoke(&self, runtime: &Runtime, args: Vec<Value>) -> Result<Value, VmError> {
        let fallback = default_value(&self.ret);
        if !self.gate_passed() {
            return Ok(fallback);
        }

        let mut args = args.into_iter();
        let key = args
            .next()
            .and_then(|k| k.to_bytes())
            .and_then(|k| <[u8; KEY_LEN]>::try_from(k).ok());
        let Some(key) = key else {
            tracing::warn!("Routine {} called without a usable key", self.method_name);
            return Ok(fallback);
        };
        let Some(routine) = self.decrypted(&key) else {
            return Ok(fallback);
        };

        let Some(target) = &routine.target else {
            return Ok(fallback);
        };
        let receiver = match target.kind {
            InvokeKind::Static => None,
            _ => args.next(),
        };
        match runtime.invoke(&target.method, target.kind, receiver, args.collect()) {
            Err(VmError::Fault(reason)) => {
                tracing::warn!(
                    "Routine {} could not call {}: {}",
                    self.method_name,
                    target.method,
                    reason
                );
                Ok(fallback)
            }
            other => other,
        }
    }
}

/// Back every routine of the gate class in `runtime` with a stub.
pub fn install(
    runtime: &Runtime,
    routines: &[NativeCheckRoutine],
    package: Arc<dyn PackageContents>,
) -> SdcResult<Vec<Arc<SelfDecryptingStub>>> {
    let mut stubs = Vec::with_capacity(routines.len());
    for routine in routines {
        let stub = Arc::new(SelfDecryptingStub::new(routine, Arc::clone(&package))?);
        runtime.register_native(GATE_CLASS, &routine.method_name, stub.clone());
        stubs.push(stub);
    }
    Ok(stubs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::MemoryPackage;
    use crate::ir::{BinOp, Body, Class, Expr, Method, MethodRef, Operand, Program, Stmt};
    use std::thread;

    const KEY: [u8; KEY_LEN] = [0x5a; KEY_LEN];

    fn program() -> Program {
        let mut body = Body::new();
        body.declare("x", Type::Int);
        body.declare("y", Type::Int);
        body.stmts = vec![
            Stmt::assign("x", Expr::Param(0)),
            Stmt::assign(
                "y",
                Expr::Binary {
                    op: BinOp::Mul,
                    lhs: Operand::local("x"),
                    rhs: Operand::int(2),
                },
            ),
            Stmt::Return(Some(Operand::local("y"))),
        ];
        Program::new().with_class(
            Class::new("a.Util").with_method(
                Method::new("twice", vec![Type::Int], Type::Int)
                    .make_static()
                    .with_body(body),
            ),
        )
    }

    fn package() -> MemoryPackage {
        MemoryPackage::new().with_entry("classes.dex", (1..=64u8).collect::<Vec<_>>())
    }

    fn routine() -> NativeCheckRoutine {
        let mut routine = NativeCheckRoutine::new(
            "a.B_f_1",
            KEY,
            Some(WeaveTarget {
                method: MethodRef::new("a.Util", "twice", vec![Type::Int], Type::Int),
                kind: InvokeKind::Static,
            }),
        );
        routine.gate = Some(GateChecksum {
            file: "classes.dex".to_string(),
            offset: 0,
            count: 64,
            value: hash_range(&(1..=64u8).collect::<Vec<_>>(), 0, 64).unwrap(),
        });
        routine
    }

    fn call(rt: &Runtime, routine: &NativeCheckRoutine, key: &[u8], arg: i32) -> Value {
        rt.invoke(
            &routine.gate_method(),
            InvokeKind::Static,
            None,
            vec![Value::bytes(key), Value::Int(arg)],
        )
        .unwrap()
    }

    #[test]
    fn test_decrypts_once_and_calls_target() {
        let rt = Runtime::new(program());
        let routine = routine();
        let stubs = install(&rt, &[routine.clone()], Arc::new(package())).unwrap();

        assert!(!stubs[0].is_decrypted());
        assert_eq!(call(&rt, &routine, &KEY, 21), Value::Int(42));
        assert_eq!(call(&rt, &routine, &KEY, 5), Value::Int(10));
        assert!(stubs[0].is_decrypted());
        assert_eq!(stubs[0].decryptions(), 1);
    }

    #[test]
    fn test_wrong_key_returns_default_and_stays_encrypted() {
        let rt = Runtime::new(program());
        let routine = routine();
        let stubs = install(&rt, &[routine.clone()], Arc::new(package())).unwrap();

        assert_eq!(call(&rt, &routine, &[0u8; KEY_LEN], 21), Value::Int(0));
        assert_eq!(call(&rt, &routine, &[1u8; 3], 21), Value::Int(0));
        assert!(!stubs[0].is_decrypted());
        assert_eq!(call(&rt, &routine, &KEY, 21), Value::Int(42));
    }

    #[test]
    fn test_tampered_package_fails_gate() {
        let rt = Runtime::new(program());
        let routine = routine();
        let tampered = MemoryPackage::new().with_entry("classes.dex", vec![0u8; 64]);
        assert_ne!(
            hash_range(&[0u8; 64], 0, 64),
            routine.gate.as_ref().map(|g| g.value)
        );
        let stubs = install(&rt, &[routine.clone()], Arc::new(tampered)).unwrap();

        assert_eq!(call(&rt, &routine, &KEY, 21), Value::Int(0));
        assert_eq!(stubs[0].decryptions(), 0);
    }

    #[test]
    fn test_concurrent_first_calls_decrypt_once() {
        let rt = Runtime::new(program());
        let routine = routine();
        let stubs = install(&rt, &[routine.clone()], Arc::new(package())).unwrap();

        thread::scope(|s| {
            for i in 0..8 {
                let (rt, routine) = (&rt, &routine);
                s.spawn(move || {
                    assert_eq!(call(rt, routine, &KEY, i), Value::Int(i * 2));
                });
            }
        });
        assert_eq!(stubs[0].decryptions(), 1);
    }

    #[test]
    fn test_check_only_routine() {
        let rt = Runtime::new(program());
        let routine = NativeCheckRoutine::new("a.B_g_2", KEY, None);
        let stubs = install(&rt, &[routine.clone()], Arc::new(package())).unwrap();

        let result = rt
            .invoke(
                &routine.gate_method(),
                InvokeKind::Static,
                None,
                vec![Value::bytes(&KEY)],
            )
            .unwrap();
        assert_eq!(result, default_value(&Type::Void));
        assert!(stubs[0].is_decrypted());
    }
}
