//! Integration tests for self-decrypting code protection

use proptest::prelude::*;
use sdc_protect::crypto::{hex_upper, unit_key};
use sdc_protect::envelope::{self, Captured, Stitch, ENVELOPE_CLASS, STATE_FAULT_CLASS};
use sdc_protect::interfaces::{
    DirectoryPackage, JsonProgramFile, MemoryPackage, NativeToolchain, ProgramSink, ProgramSource,
};
use sdc_protect::ir::{
    BinOp, Body, Class, CmpOp, Constant, EnvelopeOp, Expr, Field, FieldRef, Fragment, InvokeExpr,
    Method, MethodRef, Operand, Place, Program, Stmt, Trap, Type, Visibility, OBJECT_CLASS,
};
use sdc_protect::native_pack::{parse_symbols, NativeSymbol, SymbolSource, DECRYPTED_SUFFIX};
use sdc_protect::pipeline::{self, NativeStage};
use sdc_protect::vm::{VmError, ARITHMETIC_EXCEPTION_CLASS, CONSOLE_CLASS, THROWABLE_CLASS};
use sdc_protect::{
    native_host, native_pack, payload, GuardValue, NativeConfig, Protector, Runtime, SdcConfig,
    SdcResult, Value,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn add(dest: &str, lhs: Operand, rhs: Operand) -> Stmt {
    Stmt::assign(
        dest,
        Expr::Binary {
            op: BinOp::Add,
            lhs,
            rhs,
        },
    )
}

fn log(value: Operand) -> Stmt {
    Stmt::Invoke(InvokeExpr::new_static(
        MethodRef::new(CONSOLE_CLASS, "log", vec![Type::object("java.lang.Object")], Type::Void),
        vec![value],
    ))
}

/// ```text
/// static int knock(String s, int code) {
///     int n = 0;
///     if (s == "open sesame") {
///         log(s);
///         n += 10;
///         if (code == 0x1234) { n += 100; return n; }
///     }
///     return n;
/// }
/// ```
fn door_program() -> Program {
    let mut body = Body::new();
    body.declare("s", Type::string());
    body.declare("code", Type::Int);
    body.declare("n", Type::Int);
    body.stmts = vec![
        Stmt::assign("s", Expr::Param(0)),
        Stmt::assign("code", Expr::Param(1)),
        Stmt::assign("n", Expr::Use(Operand::int(0))),
        Stmt::if_(CmpOp::Ne, Operand::local("s"), Operand::string("open sesame"), 9),
        log(Operand::local("s")),
        add("n", Operand::local("n"), Operand::int(10)),
        Stmt::if_(CmpOp::Ne, Operand::local("code"), Operand::int(0x1234), 9),
        add("n", Operand::local("n"), Operand::int(100)),
        Stmt::Return(Some(Operand::local("n"))),
        Stmt::Return(Some(Operand::local("n"))),
    ];
    Program::new().with_class(
        Class::new("demo.Door").with_method(
            Method::new("knock", vec![Type::string(), Type::Int], Type::Int)
                .make_static()
                .with_body(body),
        ),
    )
}

/// ```text
/// static int count(int limit) {
///     int acc = 0;
///     for (int i = 0; i < limit; i++) {
///         if (i == 42) { acc += 1000; break; }
///         acc += i;
///     }
///     return acc;
/// }
/// ```
fn loop_program() -> Program {
    let mut body = Body::new();
    body.declare("limit", Type::Int);
    body.declare("i", Type::Int);
    body.declare("acc", Type::Int);
    body.stmts = vec![
        Stmt::assign("limit", Expr::Param(0)),
        Stmt::assign("i", Expr::Use(Operand::int(0))),
        Stmt::assign("acc", Expr::Use(Operand::int(0))),
        Stmt::if_(CmpOp::Ge, Operand::local("i"), Operand::local("limit"), 10),
        Stmt::if_(CmpOp::Ne, Operand::local("i"), Operand::int(42), 7),
        add("acc", Operand::local("acc"), Operand::int(1000)),
        Stmt::Goto(10),
        add("acc", Operand::local("acc"), Operand::local("i")),
        add("i", Operand::local("i"), Operand::int(1)),
        Stmt::Goto(3),
        Stmt::Return(Some(Operand::local("acc"))),
    ];
    Program::new().with_class(
        Class::new("demo.Counter").with_method(
            Method::new("count", vec![Type::Int], Type::Int)
                .make_static()
                .with_body(body),
        ),
    )
}

/// `static int check(int v) { int r = 0; if (v == 4660) r = Util.twice(v); return r; }`
fn gated_program() -> Program {
    let twice = MethodRef::new("demo.Util", "twice", vec![Type::Int], Type::Int);

    let mut util = Body::new();
    util.declare("x", Type::Int);
    util.declare("y", Type::Int);
    util.stmts = vec![
        Stmt::assign("x", Expr::Param(0)),
        add("y", Operand::local("x"), Operand::local("x")),
        Stmt::Return(Some(Operand::local("y"))),
    ];

    let mut body = Body::new();
    body.declare("v", Type::Int);
    body.declare("r", Type::Int);
    body.stmts = vec![
        Stmt::assign("v", Expr::Param(0)),
        Stmt::assign("r", Expr::Use(Operand::int(0))),
        Stmt::if_(CmpOp::Ne, Operand::local("v"), Operand::int(4660), 4),
        Stmt::assign(
            "r",
            Expr::Invoke(InvokeExpr::new_static(twice, vec![Operand::local("v")])),
        ),
        Stmt::Return(Some(Operand::local("r"))),
    ];

    Program::new()
        .with_class(
            Class::new("demo.Util").with_method(
                Method::new("twice", vec![Type::Int], Type::Int)
                    .make_static()
                    .with_body(util),
            ),
        )
        .with_class(
            Class::new("demo.Lock").with_method(
                Method::new("check", vec![Type::Int], Type::Int)
                    .make_static()
                    .with_body(body),
            ),
        )
}

fn constants(program: &Program) -> Vec<Constant> {
    program
        .classes
        .values()
        .flat_map(|c| c.methods.iter())
        .filter_map(|m| m.body.as_ref())
        .flat_map(|b| b.stmts.iter())
        .flat_map(|s| s.operands())
        .filter_map(|o| o.as_const().cloned())
        .collect()
}

fn protected(program: &Program, config: SdcConfig) -> Program {
    let mut program = program.clone();
    Protector::new(config).protect_program(&mut program).unwrap();
    program
}

fn knock(rt: &Runtime, s: &str, code: i32) -> Value {
    rt.call_static("demo.Door", "knock", vec![Value::str(s), Value::Int(code)])
        .unwrap()
}

#[test]
fn test_nested_guards_are_extracted_inner_first() {
    let mut program = door_program();
    let report = Protector::new(SdcConfig::default())
        .protect_program(&mut program)
        .unwrap();

    assert_eq!(report.units.len(), 2);
    assert!(report.rejected.is_empty());
    // the inner unit ends up inside the outer payload
    let remaining = constants(&program);
    assert!(!remaining.contains(&Constant::Str("open sesame".to_string())));
    assert!(!remaining.contains(&Constant::Int(0x1234)));

    let rt = Runtime::new(program);
    assert_eq!(knock(&rt, "closed", 0x1234), Value::Int(0));
    assert_eq!(rt.load_count(), 0);
    assert!(rt.console().is_empty());

    assert_eq!(knock(&rt, "open sesame", 1), Value::Int(10));
    assert_eq!(rt.load_count(), 1);
    assert_eq!(knock(&rt, "open sesame", 0x1234), Value::Int(110));
    assert_eq!(knock(&rt, "open sesame", 0x1234), Value::Int(110));
    assert_eq!(rt.load_count(), 2);
    assert_eq!(rt.console().len(), 3);
    assert!(rt.console().iter().all(|line| line.contains("open sesame")));
}

#[test]
fn test_loop_with_break_matches_original() {
    let original = Runtime::new(loop_program());
    let rt = Runtime::new(protected(&loop_program(), SdcConfig::default()));

    for limit in [-3, 0, 1, 42, 43, 44, 100] {
        let args = || vec![Value::Int(limit)];
        assert_eq!(
            rt.call_static("demo.Counter", "count", args()),
            original.call_static("demo.Counter", "count", args()),
            "limit {}",
            limit
        );
    }
    assert_eq!(
        rt.call_static("demo.Counter", "count", vec![Value::Int(100)]),
        Ok(Value::Int(861 + 1000))
    );
}

#[test]
fn test_direct_mode_matches_encrypted_mode() {
    let encrypted = Runtime::new(protected(&door_program(), SdcConfig::default()));
    let direct = Runtime::new(protected(
        &door_program(),
        SdcConfig::default().encrypt_units(false),
    ));

    for (s, code) in [("closed", 0), ("open sesame", 0), ("open sesame", 0x1234)] {
        assert_eq!(knock(&encrypted, s, code), knock(&direct, s, code));
    }
    assert_eq!(direct.load_count(), 0);
}

#[test]
fn test_second_pass_changes_nothing() {
    let once = protected(&door_program(), SdcConfig::default());
    let mut twice = once.clone();
    let report = Protector::new(SdcConfig::default())
        .protect_program(&mut twice)
        .unwrap();

    assert!(report.units.is_empty());
    assert_eq!(report.guards_rewritten, 0);
    assert_eq!(once, twice);
}

#[test]
fn test_concurrent_callers_share_one_load() {
    let rt = Runtime::new(protected(&door_program(), SdcConfig::default()));

    thread::scope(|s| {
        for _ in 0..8 {
            let rt = &rt;
            s.spawn(move || {
                assert_eq!(knock(rt, "open sesame", 0x1234), Value::Int(110));
            });
        }
    });
    assert_eq!(rt.load_count(), 2);
}

#[test]
fn test_native_gate_end_to_end() {
    let config = SdcConfig::default().native(NativeConfig::enabled().package_name("com.demo"));
    let mut program = gated_program();
    let mut report = Protector::new(config.clone())
        .protect_program(&mut program)
        .unwrap();
    assert_eq!(report.routines.len(), 1);
    assert!(report.routines[0].target.is_some());

    let dex: Vec<u8> = (0..200u32).map(|b| (b * 7) as u8).collect();
    let package = MemoryPackage::new().with_entry("classes.dex", dex.clone());
    native_pack::assign_gates(&mut report.routines, &package, &config.native).unwrap();

    let rt = Runtime::new(program.clone());
    let stubs = native_host::install(&rt, &report.routines, Arc::new(package)).unwrap();
    let check = |rt: &Runtime, v: i32| rt.call_static("demo.Lock", "check", vec![Value::Int(v)]);
    assert_eq!(check(&rt, 1), Ok(Value::Int(0)));
    assert!(!stubs[0].is_decrypted());
    assert_eq!(check(&rt, 4660), Ok(Value::Int(9320)));
    assert_eq!(check(&rt, 4660), Ok(Value::Int(9320)));
    assert_eq!(stubs[0].decryptions(), 1);

    let mut tampered = dex;
    tampered.iter_mut().for_each(|b| *b ^= 0xff);
    let rt = Runtime::new(program);
    native_host::install(
        &rt,
        &report.routines,
        Arc::new(MemoryPackage::new().with_entry("classes.dex", tampered)),
    )
    .unwrap();
    assert_eq!(check(&rt, 4660), Ok(Value::Int(0)));
}

/// Lays out one fake library per run: each encrypted routine is followed by
/// its wrapper, with a listing written next to the library.
struct FakeToolchain;

impl NativeToolchain for FakeToolchain {
    fn build(&self, source_dir: &Path, out_dir: &Path) -> anyhow::Result<()> {
        let manifest: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(source_dir.join("manifest.json"))?)?;
        let routines = manifest["routines"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("manifest has no routines"))?;

        let lib_dir = out_dir.join("arm64-v8a");
        fs::create_dir_all(&lib_dir)?;
        let mut listing = String::new();
        for (i, routine) in routines.iter().enumerate() {
            let base = 0x100 + i as u64 * 0x40;
            listing.push_str(&format!(
                "{:016x} T {}\n{:016x} T {}\n",
                base,
                routine["encrypted_symbol"].as_str().unwrap_or_default(),
                base + 0x20,
                routine["wrapper_symbol"].as_str().unwrap_or_default(),
            ));
        }
        let image: Vec<u8> = (0..0x100 + routines.len() * 0x40).map(|b| b as u8).collect();
        fs::write(lib_dir.join("libnative-lib.so"), image)?;
        fs::write(lib_dir.join("libnative-lib.nm"), listing)?;
        Ok(())
    }
}

struct ListingFile;

impl SymbolSource for ListingFile {
    fn symbols(&self, library: &Path) -> SdcResult<Vec<NativeSymbol>> {
        Ok(parse_symbols(&fs::read_to_string(library.with_extension("nm"))?))
    }
}

#[test]
fn test_pipeline_with_native_stage() {
    let temp_dir = TempDir::new().unwrap();
    let input = JsonProgramFile::new(temp_dir.path().join("in.json"));
    let output = JsonProgramFile::new(temp_dir.path().join("out.json"));
    input.store(&gated_program()).unwrap();

    let package_dir = temp_dir.path().join("package");
    fs::create_dir_all(&package_dir).unwrap();
    fs::write(package_dir.join("classes.dex"), vec![0x64u8; 300]).unwrap();
    fs::write(package_dir.join("resources.arsc"), b"res").unwrap();
    let package = DirectoryPackage::new(&package_dir);

    let config = SdcConfig::default().native(NativeConfig::enabled().package_name("com.demo"));
    let result = pipeline::run(
        &config,
        &input,
        &output,
        Some(NativeStage {
            package: &package,
            source_dir: temp_dir.path().join("jni"),
            out_dir: temp_dir.path().join("libs"),
            toolchain: Some(&FakeToolchain),
            symbols: &ListingFile,
        }),
    )
    .unwrap();

    assert_eq!(result.report.units.len(), 1);
    assert_eq!(result.native_sources.len(), 6);
    let routine = &result.report.routines[0];
    let gate = routine.gate.as_ref().unwrap();
    assert_eq!(gate.file, "classes.dex");
    assert_eq!(gate.count, 100);

    let routines_cpp = fs::read_to_string(temp_dir.path().join("jni/routines.cpp")).unwrap();
    assert!(routines_cpp.contains(&routine.encrypted_symbol));
    assert!(routine.encrypted_symbol.ends_with(&hex_upper(&routine.key)));

    let (library, sections) = &result.libraries[0];
    assert_eq!(sections.len(), 1);
    assert_eq!((sections[0].offset, sections[0].len), (0x100, 0x20));
    let encrypted = fs::read(library).unwrap();
    let mut plain = library.as_os_str().to_owned();
    plain.push(DECRYPTED_SUFFIX);
    let plain = fs::read(plain).unwrap();
    assert_ne!(encrypted[0x100..0x120], plain[0x100..0x120]);
    assert_eq!(encrypted[0x120..], plain[0x120..]);

    let stored = output.load().unwrap();
    assert!(stored.class("sdc.Gate").is_some());
    assert!(!constants(&stored).contains(&Constant::Int(4660)));
}

#[test]
fn test_pipeline_without_native_stage_fails_when_enabled() {
    let temp_dir = TempDir::new().unwrap();
    let input = JsonProgramFile::new(temp_dir.path().join("program.json"));
    let output = JsonProgramFile::new(temp_dir.path().join("protected.json"));
    input.store(&gated_program()).unwrap();

    let config = SdcConfig::default().native(NativeConfig::enabled().package_name("com.demo"));
    assert!(pipeline::run(&config, &input, &output, None).is_err());

    let result = pipeline::run(&SdcConfig::default(), &input, &output, None).unwrap();
    assert_eq!(result.report.units.len(), 1);
    assert!(result.libraries.is_empty());
}

proptest! {
    #[test]
    fn prop_protected_check_matches_original(v in any::<i32>()) {
        let original = Runtime::new(gated_program());
        let rt = Runtime::new(protected(&gated_program(), SdcConfig::default()));
        let args = || vec![Value::Int(v)];
        prop_assert_eq!(
            rt.call_static("demo.Lock", "check", args()),
            original.call_static("demo.Lock", "check", args())
        );
    }

    #[test]
    fn prop_unit_key_depends_on_id_and_secret(
        id in "[a-z.]{1,12}_[a-z]{1,6}_[0-9a-f]{8}",
        other in "[a-z.]{1,12}_[a-z]{1,6}_[0-9a-f]{8}",
        secret in ".{2,16}",
    ) {
        let value = GuardValue::Text(secret.clone());
        prop_assert_eq!(unit_key(&id, &value), unit_key(&id, &value));
        if id != other {
            prop_assert_ne!(unit_key(&id, &value), unit_key(&other, &value));
        }
    }

    #[test]
    fn prop_payload_opens_only_with_its_secret(secret in "[ -~]{2,24}", wrong in "[ -~]{2,24}") {
        prop_assume!(secret != wrong);
        let class = Class::new("demo.Unit");
        let sealed = payload::seal("demo.Unit", &class, &GuardValue::Text(secret.clone())).unwrap();
        let image = payload::open("demo.Unit", &sealed, &GuardValue::Text(secret)).unwrap();
        prop_assert_eq!(image.class, class);
        prop_assert!(payload::open("demo.Unit", &sealed, &GuardValue::Text(wrong)).is_err());
    }
}

#[test]
fn test_string_guard_compares_by_content() {
    let rt = Runtime::new(protected(&door_program(), SdcConfig::default()));
    let built: String = ["open", " ", "sesame"].concat();
    assert_eq!(knock(&rt, &built, 0), Value::Int(10));
    assert_eq!(knock(&rt, "open sesame ", 0), Value::Int(0));
}

/// Single static method `class.name(int...)` returning int
fn static_program(class: &str, name: &str, arity: usize, body: Body) -> Program {
    Program::new().with_class(
        Class::new(class).with_method(
            Method::new(name, vec![Type::Int; arity], Type::Int)
                .make_static()
                .with_body(body),
        ),
    )
}

/// Runs `inputs` through the original and the protected program and
/// returns the protected runtime.
fn assert_same_results(program: &Program, class: &str, name: &str, inputs: &[&[i32]]) -> Runtime {
    let original = Runtime::new(program.clone());
    let rt = Runtime::new(protected(program, SdcConfig::default()));
    for input in inputs {
        let args = || input.iter().map(|&v| Value::Int(v)).collect::<Vec<_>>();
        assert_eq!(
            rt.call_static(class, name, args()),
            original.call_static(class, name, args()),
            "{}.{}{:?}",
            class,
            name,
            input
        );
    }
    rt
}

/// ```text
/// static int divide(int k, int d) {
///     int r = 0;
///     try {
///         if (k == 4660) { r = 100 / d; r += 1; }
///         r += 5;
///     } catch (ArithmeticException e) { r = -7; }
///     return r;
/// }
/// ```
#[test]
fn test_exception_from_unit_reaches_enclosing_handler() {
    let mut body = Body::new();
    body.declare("k", Type::Int);
    body.declare("d", Type::Int);
    body.declare("r", Type::Int);
    body.declare("e", Type::object(THROWABLE_CLASS));
    body.stmts = vec![
        Stmt::assign("k", Expr::Param(0)),
        Stmt::assign("d", Expr::Param(1)),
        Stmt::assign("r", Expr::Use(Operand::int(0))),
        Stmt::if_(CmpOp::Ne, Operand::local("k"), Operand::int(4660), 6),
        Stmt::assign(
            "r",
            Expr::Binary {
                op: BinOp::Div,
                lhs: Operand::int(100),
                rhs: Operand::local("d"),
            },
        ),
        add("r", Operand::local("r"), Operand::int(1)),
        add("r", Operand::local("r"), Operand::int(5)),
        Stmt::Return(Some(Operand::local("r"))),
        Stmt::assign("e", Expr::CaughtException),
        Stmt::assign("r", Expr::Use(Operand::int(-7))),
        Stmt::Return(Some(Operand::local("r"))),
    ];
    body.traps.push(Trap {
        begin: 3,
        end: 7,
        handler: 8,
        exception: Some(ARITHMETIC_EXCEPTION_CLASS.to_string()),
    });
    let program = static_program("demo.Calc", "divide", 2, body);

    let rt = assert_same_results(
        &program,
        "demo.Calc",
        "divide",
        &[&[1, 0], &[4660, 4], &[4660, 0], &[4661, 0]],
    );
    let divide = |d: i32| {
        rt.call_static("demo.Calc", "divide", vec![Value::Int(4660), Value::Int(d)])
    };
    assert_eq!(divide(0), Ok(Value::Int(-7)));
    assert_eq!(divide(4), Ok(Value::Int(31)));
    assert_eq!(rt.load_count(), 1);
}

/// ```text
/// static int route(int k, int a) {
///     int r = 0;
///     if (k == 4660) {
///         if (a < 0) goto negative;
///         if (a > 100) goto large;
///         r = a + 1;
///     }
///     r += 1000;
///     return r;
/// negative: r = -1; return r;
/// large:    r = 500; return r;
/// }
/// ```
#[test]
fn test_conditional_exits_reach_their_own_targets() {
    let mut body = Body::new();
    body.declare("k", Type::Int);
    body.declare("a", Type::Int);
    body.declare("r", Type::Int);
    body.stmts = vec![
        Stmt::assign("k", Expr::Param(0)),
        Stmt::assign("a", Expr::Param(1)),
        Stmt::assign("r", Expr::Use(Operand::int(0))),
        Stmt::if_(CmpOp::Ne, Operand::local("k"), Operand::int(4660), 7),
        Stmt::if_(CmpOp::Lt, Operand::local("a"), Operand::int(0), 9),
        Stmt::if_(CmpOp::Gt, Operand::local("a"), Operand::int(100), 11),
        add("r", Operand::local("a"), Operand::int(1)),
        add("r", Operand::local("r"), Operand::int(1000)),
        Stmt::Return(Some(Operand::local("r"))),
        Stmt::assign("r", Expr::Use(Operand::int(-1))),
        Stmt::Return(Some(Operand::local("r"))),
        Stmt::assign("r", Expr::Use(Operand::int(500))),
        Stmt::Return(Some(Operand::local("r"))),
    ];
    let program = static_program("demo.Router", "route", 2, body);

    let rt = assert_same_results(
        &program,
        "demo.Router",
        "route",
        &[&[0, 5], &[4660, -5], &[4660, 200], &[4660, 5], &[4660, 100]],
    );
    let route = |a: i32| {
        rt.call_static("demo.Router", "route", vec![Value::Int(4660), Value::Int(a)])
    };
    assert_eq!(route(-5), Ok(Value::Int(-1)));
    assert_eq!(route(200), Ok(Value::Int(500)));
    assert_eq!(route(5), Ok(Value::Int(1006)));
}

/// ```text
/// static int skip(int limit) {
///     int i = 0, acc = 0;
///     while (i < limit) {
///         i++;
///         if (i == 10) { acc += 1000; continue; }
///         acc += i;
///     }
///     return acc;
/// }
/// ```
#[test]
fn test_continue_jumps_back_out_of_unit() {
    let mut body = Body::new();
    body.declare("limit", Type::Int);
    body.declare("i", Type::Int);
    body.declare("acc", Type::Int);
    body.stmts = vec![
        Stmt::assign("limit", Expr::Param(0)),
        Stmt::assign("i", Expr::Use(Operand::int(0))),
        Stmt::assign("acc", Expr::Use(Operand::int(0))),
        Stmt::if_(CmpOp::Ge, Operand::local("i"), Operand::local("limit"), 10),
        add("i", Operand::local("i"), Operand::int(1)),
        Stmt::if_(CmpOp::Ne, Operand::local("i"), Operand::int(10), 8),
        add("acc", Operand::local("acc"), Operand::int(1000)),
        Stmt::Goto(3),
        add("acc", Operand::local("acc"), Operand::local("i")),
        Stmt::Goto(3),
        Stmt::Return(Some(Operand::local("acc"))),
    ];
    let program = static_program("demo.Skipper", "skip", 1, body);

    let rt = assert_same_results(
        &program,
        "demo.Skipper",
        "skip",
        &[&[0], &[9], &[10], &[11], &[20]],
    );
    assert_eq!(
        rt.call_static("demo.Skipper", "skip", vec![Value::Int(20)]),
        Ok(Value::Int(210 - 10 + 1000))
    );
}

/// `private static class Vault { private static int hits; }` touched only
/// inside the guarded block of `Vault.open`.
fn vault_program() -> Program {
    let hits = FieldRef::new("demo.Outer$Vault", "hits", Type::Int);
    let mut body = Body::new();
    body.declare("k", Type::Int);
    body.declare("r", Type::Int);
    body.declare("h", Type::Int);
    body.stmts = vec![
        Stmt::assign("k", Expr::Param(0)),
        Stmt::assign("r", Expr::Use(Operand::int(-1))),
        Stmt::if_(CmpOp::Ne, Operand::local("k"), Operand::int(4660), 7),
        Stmt::assign(
            "h",
            Expr::FieldGet {
                base: None,
                field: hits.clone(),
            },
        ),
        add("h", Operand::local("h"), Operand::int(1)),
        Stmt::Assign {
            dest: Place::Field {
                base: None,
                field: hits,
            },
            value: Expr::Use(Operand::local("h")),
        },
        Stmt::assign("r", Expr::Use(Operand::local("h"))),
        Stmt::Return(Some(Operand::local("r"))),
    ];

    Program::new().with_class(Class::new("demo.Outer")).with_class(
        Class::new("demo.Outer$Vault")
            .nested_in("demo.Outer")
            .visibility(Visibility::Private)
            .with_field(
                Field::new("hits", Type::Int)
                    .make_static()
                    .visibility(Visibility::Private),
            )
            .with_method(
                Method::new("open", vec![Type::Int], Type::Int)
                    .make_static()
                    .with_body(body),
            ),
    )
}

#[test]
fn test_private_members_reached_from_unit_are_widened() {
    let rt = assert_same_results(
        &vault_program(),
        "demo.Outer$Vault",
        "open",
        &[&[1], &[4660], &[4660], &[4661]],
    );
    let open = |rt: &Runtime| rt.call_static("demo.Outer$Vault", "open", vec![Value::Int(4660)]);
    assert_eq!(open(&rt), Ok(Value::Int(3)));

    let mut program = protected(&vault_program(), SdcConfig::default());
    let vault = program.class("demo.Outer$Vault").unwrap();
    assert_eq!(vault.visibility, Visibility::Public);
    assert_eq!(vault.field("hits").unwrap().visibility, Visibility::Public);

    // the unit runs outside the class, so undoing the widening breaks it
    let vault = program.class_mut("demo.Outer$Vault").unwrap();
    vault.visibility = Visibility::Private;
    vault.fields[0].visibility = Visibility::Private;
    let rt = Runtime::new(program);
    assert_eq!(
        rt.call_static("demo.Outer$Vault", "open", vec![Value::Int(1)]),
        Ok(Value::Int(-1))
    );
    assert!(matches!(
        open(&rt),
        Err(VmError::Fault(msg)) if msg.contains("illegal access")
    ));
}

/// `dispatch(n)`: builds an envelope jumping to `index`, then runs the
/// caller-side stitch with a one-entry jump table.
fn dispatch_program(index: u32) -> Program {
    let mut body = Body::new();
    body.declare("n", Type::Int);
    body.declare("boxed", Type::object(OBJECT_CLASS));
    body.declare("env", Type::object(ENVELOPE_CLASS));
    body.stmts = vec![
        Stmt::assign("n", Expr::Param(0)),
        Stmt::assign(
            "boxed",
            Expr::Box {
                ty: Type::Int,
                value: Operand::local("n"),
            },
        ),
        Stmt::assign(
            "env",
            Expr::Envelope(EnvelopeOp::MakeJump {
                index,
                saved: vec![Operand::local("boxed")],
            }),
        ),
        Stmt::Nop,
        Stmt::Return(Some(Operand::local("n"))),
        add("n", Operand::local("n"), Operand::int(100)),
        Stmt::Return(Some(Operand::local("n"))),
    ];

    let captured = [Captured::new("n", Type::Int)];
    let mut fragment = Fragment::new();
    envelope::stitch(
        &mut fragment,
        &Stitch {
            envelope: "env",
            captured: &captured,
            jump_targets: &[5],
            return_type: &Type::Int,
            fallthrough: 4,
            prefix: "$s_",
        },
    );
    body.splice(3..4, fragment, true).unwrap();
    static_program("demo.Dispatch", "dispatch", 1, body)
}

#[test]
fn test_unknown_jump_index_throws_state_fault() {
    let call = |rt: &Runtime| rt.call_static("demo.Dispatch", "dispatch", vec![Value::Int(7)]);

    let rt = Runtime::new(dispatch_program(0));
    assert_eq!(call(&rt), Ok(Value::Int(107)));

    let rt = Runtime::new(dispatch_program(3));
    let err = call(&rt).unwrap_err();
    assert_eq!(err.thrown_class().as_deref(), Some(STATE_FAULT_CLASS));
}
