//! Native source generator for gate routines
//!
//! Produces the C++ side of every [`NativeCheckRoutine`]: a shared scaffold
//! (package checksum, in-place code decryption) plus, per routine, an
//! implementation function that `native_pack` encrypts after compilation
//! and the exported JNI wrapper that decrypts it on first use.
//!
//! The wrapper measures the implementation as the distance between the two
//! function addresses, so each implementation is emitted directly before its
//! wrapper and the library must be built without function reordering.

use crate::config::NativeConfig;
use crate::ir::{InvokeKind, Type};
use crate::native_weaver::{GateChecksum, NativeCheckRoutine, WeaveTarget};
use crate::{SdcError, SdcResult};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Generator for the native library sources
pub struct NativeSourceGenerator {
    config: NativeConfig,
}

/// What packaging needs to know about the generated library
#[derive(Debug, Serialize)]
struct NativeManifest<'a> {
    package_name: &'a str,
    library_name: &'a str,
    routines: Vec<ManifestEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct ManifestEntry<'a> {
    unit_id: &'a str,
    method_name: &'a str,
    wrapper_symbol: &'a str,
    encrypted_symbol: &'a str,
    check_only: bool,
    target: Option<&'a WeaveTarget>,
    gate: Option<&'a GateChecksum>,
}

impl NativeSourceGenerator {
    /// Create a new native source generator
    pub fn new(config: NativeConfig) -> Self {
        Self { config }
    }

    fn package_name(&self) -> SdcResult<&str> {
        self.config
            .package_name
            .as_deref()
            .ok_or_else(|| SdcError::Config("native.package_name is required".to_string()))
    }

    /// `vendor.h`: values baked in at build time
    pub fn generate_vendor_header(&self) -> SdcResult<String> {
        let package = self.package_name()?;
        if package.contains(|c: char| c == '"' || c == '\\' || c.is_whitespace()) {
            return Err(SdcError::Config(format!("invalid package name {:?}", package)));
        }
        Ok(format!(
            r#"#pragma once

#define PACKAGE_NAME "{package}"
#define PACKAGE_DATA_DIR "/data/data/{package}/"
"#
        ))
    }

    /// `check.h`: scaffold declarations shared by every routine
    pub fn generate_check_header(&self) -> String {
        r#"#pragma once

#include <jni.h>
#include <stddef.h>
#include <atomic>
#include <android/log.h>

#define LOG_TAG "sdc"
#define LOGW(...) __android_log_print(ANDROID_LOG_WARN, LOG_TAG, __VA_ARGS__)

#if defined(__thumb__)
#define FPTR_CORRECTION (-1)
#else
#define FPTR_CORRECTION 0
#endif

#define STATE_ENCRYPTED 0
#define STATE_DECRYPTING 1
#define STATE_DECRYPTED 2

#define GATE_UNCHECKED 0
#define GATE_PASSED 1
#define GATE_FAILED 2

int hash_bytes(const unsigned char *data, size_t count);
int hash_file_in_package(const char *file_name, size_t count, size_t offset, int *hash);
int decrypt_code(void *start, size_t count, const unsigned char *key);
int ensure_decrypted(JNIEnv *env, jbyteArray key, std::atomic<int> *state, void *begin, void *end);
int gate_passed(std::atomic<int> *gate, const char *file_name, size_t count, size_t offset, int expected);
"#
        .to_string()
    }

    /// `check.cpp`: checksum and decryption scaffold
    pub fn generate_scaffold(&self) -> String {
        r#"#include "check.h"
#include "vendor.h"

#include <limits.h>
#include <sched.h>
#include <stdint.h>
#include <stdio.h>
#include <stdlib.h>
#include <string.h>
#include <unistd.h>
#include <sys/mman.h>
#include <zip.h>

extern "C" {
#include "aes.h"
}

int hash_bytes(const unsigned char *data, size_t count) {
    unsigned char hash[4] = {0, 0, 0, 0};
    for (size_t i = 0; i < count; i++) {
        hash[i % 4] ^= data[i];
    }
    return (int) ((unsigned int) hash[0] | ((unsigned int) hash[1] << 8) |
                  ((unsigned int) hash[2] << 16) | ((unsigned int) hash[3] << 24));
}

static int hash_in_zip(const char *archive_path, const char *file_name, size_t count,
                       size_t offset, int *hash) {
    int err = 0;
    zip_t *archive = zip_open(archive_path, ZIP_RDONLY, &err);
    if (archive == NULL) {
        return -1;
    }
    zip_stat_t st;
    zip_stat_init(&st);
    if (zip_stat(archive, file_name, 0, &st) != 0 || offset + count > st.size) {
        zip_close(archive);
        return -1;
    }
    zip_file_t *file = zip_fopen(archive, file_name, 0);
    if (file == NULL) {
        zip_close(archive);
        return -1;
    }
    unsigned char *contents = (unsigned char *) malloc(st.size);
    int status = -1;
    if (contents != NULL && zip_fread(file, contents, st.size) == (zip_int64_t) st.size) {
        *hash = hash_bytes(contents + offset, count);
        status = 0;
    }
    free(contents);
    zip_fclose(file);
    zip_close(archive);
    return status;
}

static int get_package_path(char *out, size_t len) {
    if (access(PACKAGE_DATA_DIR, F_OK) != 0) {
        return -1;
    }
    FILE *pipe = popen("pm path " PACKAGE_NAME, "r");
    if (pipe == NULL) {
        return -1;
    }
    char line[PATH_MAX + 16];
    char *read = fgets(line, sizeof line, pipe);
    pclose(pipe);
    if (read == NULL) {
        return -1;
    }
    const char *prefix = "package:";
    size_t prefix_len = strlen(prefix);
    if (strncmp(line, prefix, prefix_len) != 0) {
        return -1;
    }
    char *path = line + prefix_len;
    path[strcspn(path, "\r\n")] = '\0';
    snprintf(out, len, "%s", path);
    return 0;
}

int hash_file_in_package(const char *file_name, size_t count, size_t offset, int *hash) {
    char path[PATH_MAX];
    if (get_package_path(path, sizeof path) != 0) {
        return -1;
    }
    return hash_in_zip(path, file_name, count, offset, hash);
}

int decrypt_code(void *start, size_t count, const unsigned char *key) {
    uintptr_t page = (uintptr_t) sysconf(_SC_PAGESIZE);
    uintptr_t begin = (uintptr_t) start & ~(page - 1);
    uintptr_t end = ((uintptr_t) start + count + page - 1) & ~(page - 1);
    if (mprotect((void *) begin, end - begin, PROT_READ | PROT_WRITE | PROT_EXEC) != 0) {
        return -1;
    }
    uint8_t iv[16] = {0};
    struct AES_ctx ctx;
    AES_init_ctx_iv(&ctx, key, iv);
    AES_CTR_xcrypt_buffer(&ctx, (uint8_t *) start, count);
    __builtin___clear_cache((char *) start, (char *) start + count);
    return 0;
}

int ensure_decrypted(JNIEnv *env, jbyteArray key, std::atomic<int> *state, void *begin, void *end) {
    for (;;) {
        int expected = STATE_ENCRYPTED;
        if (state->compare_exchange_strong(expected, STATE_DECRYPTING)) {
            break;
        }
        if (expected == STATE_DECRYPTED) {
            return 1;
        }
        sched_yield();
    }
    jbyte *bytes = env->functions->GetByteArrayElements(env, key, NULL);
    if (bytes == NULL) {
        state->store(STATE_ENCRYPTED);
        return 0;
    }
    size_t count = (size_t) ((char *) end - (char *) begin);
    int status = decrypt_code((char *) begin + FPTR_CORRECTION, count, (const unsigned char *) bytes);
    env->functions->ReleaseByteArrayElements(env, key, bytes, JNI_ABORT);
    state->store(status == 0 ? STATE_DECRYPTED : STATE_ENCRYPTED);
    return status == 0;
}

int gate_passed(std::atomic<int> *gate, const char *file_name, size_t count, size_t offset, int expected) {
    if (gate->load() == GATE_UNCHECKED) {
        int hash = 0;
        int ok = hash_file_in_package(file_name, count, offset, &hash) == 0 && hash == expected;
        gate->store(ok ? GATE_PASSED : GATE_FAILED);
    }
    if (gate->load() != GATE_PASSED) {
        LOGW("Package check failed");
        return 0;
    }
    return 1;
}
"#
        .to_string()
    }

    /// `routines.cpp`: one implementation and wrapper per routine
    ///
    /// Every routine must already carry its gate checksum.
    pub fn generate_routines(&self, routines: &[NativeCheckRoutine]) -> SdcResult<String> {
        let mut out = String::from("#include \"check.h\"\n");
        for routine in routines {
            out.push('\n');
            out.push_str(&self.routine_source(routine)?);
        }
        Ok(out)
    }

    fn routine_source(&self, routine: &NativeCheckRoutine) -> SdcResult<String> {
        let gate = routine.gate.as_ref().ok_or_else(|| {
            SdcError::Native(format!("routine {} has no gate assigned", routine.method_name))
        })?;
        let file = c_string(&gate.file)?;
        let ret = jni_type(&routine.ret);
        let fallback = default_return(&routine.ret);
        let has_receiver = routine
            .target
            .as_ref()
            .is_some_and(|t| t.kind != InvokeKind::Static);

        let mut names = vec!["env".to_string(), "gate_class".to_string(), "key".to_string()];
        let mut params = vec![
            "JNIEnv *env".to_string(),
            "jclass gate_class".to_string(),
            "jbyteArray key".to_string(),
        ];
        let mut call_args = String::new();
        for (i, ty) in routine.params.iter().enumerate().skip(1) {
            let name = if has_receiver && i == 1 {
                "receiver".to_string()
            } else {
                let arg = format!("a{}", i - 1 - usize::from(has_receiver));
                call_args.push_str(", ");
                call_args.push_str(&arg);
                arg
            };
            params.push(format!("{} {}", jni_type(ty), name));
            names.push(name);
        }
        let params = params.join(", ");
        let names = names.join(", ");

        let body = match &routine.target {
            None => "    (void) env;\n    (void) gate_class;\n    (void) key;\n    return;\n".to_string(),
            Some(target) => {
                let method = &target.method;
                let call = call_kind(&method.ret);
                // a failed lookup leaves a pending exception behind
                let bail = format!("env->functions->ExceptionClear(env);\n        {}", fallback);
                let (lookup, invoke) = if has_receiver {
                    (
                        "jclass cls = env->functions->GetObjectClass(env, receiver);\n    \
                         jmethodID mid = env->functions->GetMethodID"
                            .to_string(),
                        format!(
                            "env->functions->Call{}Method(env, receiver, mid{})",
                            call, call_args
                        ),
                    )
                } else {
                    (
                        format!(
                            "jclass cls = env->functions->FindClass(env, \"{}\");\n    \
                             if (cls == NULL) {{\n        {}\n    }}\n    \
                             jmethodID mid = env->functions->GetStaticMethodID",
                            method.class.replace('.', "/"),
                            bail
                        ),
                        format!(
                            "env->functions->CallStatic{}Method(env, cls, mid{})",
                            call, call_args
                        ),
                    )
                };
                format!(
                    "    (void) gate_class;\n    (void) key;\n    {lookup}(env, cls, \"{name}\", \"{descriptor}\");\n    \
                     if (mid == NULL) {{\n        {bail}\n    }}\n    return {invoke};\n",
                    name = method.name,
                    descriptor = method.descriptor(),
                )
            }
        };

        Ok(format!(
            r#"extern "C" {ret} {enc}({params}) {{
{body}}}

extern "C" JNIEXPORT {ret} JNICALL {wrapper}({params}) {{
    static std::atomic<int> state(STATE_ENCRYPTED);
    static std::atomic<int> gate(GATE_UNCHECKED);
    if (!gate_passed(&gate, "{file}", {count}, {offset}, {value})) {{
        {fallback}
    }}
    if (!ensure_decrypted(env, key, &state, (void *) &{enc}, (void *) &{wrapper})) {{
        {fallback}
    }}
    return {enc}({names});
}}
"#,
            enc = routine.encrypted_symbol,
            wrapper = routine.wrapper_symbol,
            count = gate.count,
            offset = gate.offset,
            value = gate.value,
        ))
    }

    /// `CMakeLists.txt` building the shared library
    pub fn generate_build_file(&self) -> String {
        format!(
            r#"cmake_minimum_required(VERSION 3.10)
project({lib} CXX C)

add_library({lib} SHARED check.cpp routines.cpp)
target_compile_options({lib} PRIVATE -O1 -fno-reorder-functions -fno-toplevel-reorder)
target_link_libraries({lib} tiny-aes zip log)
"#,
            lib = self.config.library_name
        )
    }

    /// JSON manifest of the generated routines
    pub fn generate_manifest(&self, routines: &[NativeCheckRoutine]) -> SdcResult<String> {
        let manifest = NativeManifest {
            package_name: self.package_name()?,
            library_name: &self.config.library_name,
            routines: routines
                .iter()
                .map(|r| ManifestEntry {
                    unit_id: &r.unit_id,
                    method_name: &r.method_name,
                    wrapper_symbol: &r.wrapper_symbol,
                    encrypted_symbol: &r.encrypted_symbol,
                    check_only: r.is_check_only(),
                    target: r.target.as_ref(),
                    gate: r.gate.as_ref(),
                })
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&manifest)?)
    }

    /// Write every generated file into `dir`
    pub fn write_to(&self, dir: &Path, routines: &[NativeCheckRoutine]) -> SdcResult<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let files = [
            ("vendor.h", self.generate_vendor_header()?),
            ("check.h", self.generate_check_header()),
            ("check.cpp", self.generate_scaffold()),
            ("routines.cpp", self.generate_routines(routines)?),
            ("CMakeLists.txt", self.generate_build_file()),
            ("manifest.json", self.generate_manifest(routines)?),
        ];
        let mut written = Vec::with_capacity(files.len());
        for (name, contents) in files {
            let path = dir.join(name);
            std::fs::write(&path, contents)?;
            written.push(path);
        }
        tracing::info!(
            "Generated native sources for {} routines in {}",
            routines.len(),
            dir.display()
        );
        Ok(written)
    }
}

fn jni_type(ty: &Type) -> &'static str {
    match ty {
        Type::Void => "void",
        Type::Boolean => "jboolean",
        Type::Byte => "jbyte",
        Type::Char => "jchar",
        Type::Short => "jshort",
        Type::Int => "jint",
        Type::Long => "jlong",
        Type::Object(_) | Type::Array(_) => "jobject",
    }
}

/// Infix of the matching `Call<Kind>Method`
fn call_kind(ty: &Type) -> &'static str {
    match ty {
        Type::Void => "Void",
        Type::Boolean => "Boolean",
        Type::Byte => "Byte",
        Type::Char => "Char",
        Type::Short => "Short",
        Type::Int => "Int",
        Type::Long => "Long",
        Type::Object(_) | Type::Array(_) => "Object",
    }
}

fn default_return(ty: &Type) -> &'static str {
    match ty {
        Type::Void => "return;",
        Type::Object(_) | Type::Array(_) => "return NULL;",
        _ => "return 0;",
    }
}

fn c_string(s: &str) -> SdcResult<&str> {
    if s.contains(|c: char| c == '"' || c == '\\' || c.is_control()) {
        return Err(SdcError::Native(format!("cannot embed {:?} in native source", s)));
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::MethodRef;

    fn generator() -> NativeSourceGenerator {
        NativeSourceGenerator::new(NativeConfig::enabled().package_name("com.example.app"))
    }

    fn gated(mut routine: NativeCheckRoutine) -> NativeCheckRoutine {
        routine.gate = Some(GateChecksum {
            file: "classes.dex".to_string(),
            offset: 0,
            count: 100,
            value: 0x1234,
        });
        routine
    }

    #[test]
    fn test_vendor_header() {
        let header = generator().generate_vendor_header().unwrap();
        assert!(header.contains("#define PACKAGE_NAME \"com.example.app\""));

        let missing = NativeSourceGenerator::new(NativeConfig::enabled());
        assert!(matches!(
            missing.generate_vendor_header(),
            Err(SdcError::Config(_))
        ));
    }

    #[test]
    fn test_virtual_routine() {
        let routine = gated(NativeCheckRoutine::new(
            "com.x.Foo_bar_01",
            [0x11; 16],
            Some(WeaveTarget {
                method: MethodRef::new(
                    "java.lang.String",
                    "charAt",
                    vec![Type::Int],
                    Type::Char,
                ),
                kind: InvokeKind::Virtual,
            }),
        ));
        let source = generator().generate_routines(&[routine.clone()]).unwrap();

        assert!(source.contains(&format!(
            "extern \"C\" jchar {}(JNIEnv *env, jclass gate_class, jbyteArray key, jobject receiver, jint a0)",
            routine.encrypted_symbol
        )));
        assert!(source.contains(&format!(
            "extern \"C\" JNIEXPORT jchar JNICALL {}(",
            routine.wrapper_symbol
        )));
        assert!(source.contains("GetMethodID(env, cls, \"charAt\", \"(I)C\")"));
        assert!(source.contains("CallCharMethod(env, receiver, mid, a0)"));
        assert!(source.contains("gate_passed(&gate, \"classes.dex\", 100, 0, 4660)"));
        // implementation precedes its wrapper
        let enc = source.find(&format!("{}(", routine.encrypted_symbol)).unwrap();
        let wrapper = source.find(&format!("{}(", routine.wrapper_symbol)).unwrap();
        assert!(enc < wrapper);
    }

    #[test]
    fn test_static_and_check_only_routines() {
        let stat = gated(NativeCheckRoutine::new(
            "a.B_f_02",
            [0x22; 16],
            Some(WeaveTarget {
                method: MethodRef::new("a.Util", "scale", vec![Type::Long], Type::Long),
                kind: InvokeKind::Static,
            }),
        ));
        let check = gated(NativeCheckRoutine::new("a.B_g_03", [0x33; 16], None));
        let source = generator().generate_routines(&[stat, check]).unwrap();

        assert!(source.contains("FindClass(env, \"a/Util\")"));
        assert!(source.contains("CallStaticLongMethod(env, cls, mid, a0)"));
        assert!(source.contains("extern \"C\" JNIEXPORT void JNICALL Java_sdc_Gate_aBg03("));
    }

    #[test]
    fn test_failed_lookups_clear_pending_exception() {
        let routine = gated(NativeCheckRoutine::new(
            "a.B_f_06",
            [0x66; 16],
            Some(WeaveTarget {
                method: MethodRef::new("a.Util", "scale", vec![Type::Int], Type::Int),
                kind: InvokeKind::Static,
            }),
        ));
        let source = generator().generate_routines(&[routine]).unwrap();

        let cleared = "{\n        env->functions->ExceptionClear(env);\n        return 0;\n    }";
        assert!(source.contains(&format!("if (cls == NULL) {}", cleared)));
        assert!(source.contains(&format!("if (mid == NULL) {}", cleared)));
        assert_eq!(source.matches("ExceptionClear").count(), 2);
    }

    #[test]
    fn test_routine_without_gate_is_rejected() {
        let routine = NativeCheckRoutine::new("a.B_f_04", [0x44; 16], None);
        assert!(matches!(
            generator().generate_routines(&[routine]),
            Err(SdcError::Native(_))
        ));
    }

    #[test]
    fn test_write_to() {
        let dir = tempfile::tempdir().unwrap();
        let routine = gated(NativeCheckRoutine::new("a.B_f_05", [0x55; 16], None));
        let written = generator().write_to(dir.path(), &[routine]).unwrap();
        assert_eq!(written.len(), 6);

        let manifest: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest["library_name"], "native-lib");
        assert_eq!(manifest["routines"][0]["check_only"], true);
        assert!(std::fs::read_to_string(dir.path().join("CMakeLists.txt"))
            .unwrap()
            .contains("add_library(native-lib SHARED"));
    }
}
