//! Replace plaintext guard comparisons with digest checks.
//!
//! `if x != C goto t` becomes
//!
//! ```text
//! digest = <SHA-1 of ser(C)>
//! boxed  = box(x)
//! m      = sdc.runtime.Loader.match(boxed, digest)
//! if m != 1 goto t
//! ```
//!
//! so the secret no longer appears in the retained code.

use crate::crypto::{guard_digest, GuardValue, GUARD_DIGEST_LEN};
use crate::envelope::boxed_operand;
use crate::error::Rejection;
use crate::hierarchy::GuardedBlock;
use crate::ir::{
    Body, CmpOp, Expr, Fragment, InvokeExpr, MethodRef, Operand, Relocation, Stmt, Type,
    OBJECT_CLASS,
};

/// Runtime class hosting the loader and guard check
pub const LOADER_CLASS: &str = "sdc.runtime.Loader";

/// Guard check entry point name
pub const MATCH_METHOD: &str = "match";

/// `boolean match(Object value, byte[] digest)`
pub fn match_method() -> MethodRef {
    MethodRef::new(
        LOADER_CLASS,
        MATCH_METHOD,
        vec![Type::object(OBJECT_CLASS), Type::bytes()],
        Type::Boolean,
    )
}

/// Digest material for one guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestGuard {
    pub value: GuardValue,
    pub digest: [u8; GUARD_DIGEST_LEN],
}

/// Check eligibility and compute the digest for `block`'s secret.
pub fn prepare(block: &GuardedBlock) -> Result<DigestGuard, Rejection> {
    let value = GuardValue::from_constant(&block.compared_type, &block.constant).ok_or_else(|| {
        Rejection::UnsupportedCompareType(format!(
            "{} compared against {}",
            block.compared_type, block.constant
        ))
    })?;
    let digest = guard_digest(&value);
    Ok(DigestGuard { value, digest })
}

/// Emit the digest check; returns the boxed compared value.
///
/// When the check fails control goes to the block's exit target.
pub fn emit(
    fragment: &mut Fragment,
    block: &GuardedBlock,
    guard: &DigestGuard,
    prefix: &str,
) -> Operand {
    let digest = format!("{}digest", prefix);
    let matched = format!("{}match", prefix);
    fragment.declare(digest.clone(), Type::bytes());
    fragment.declare(matched.clone(), Type::Boolean);

    fragment.push(Stmt::assign(
        digest.clone(),
        Expr::ByteArray(guard.digest.to_vec()),
    ));
    let boxed = boxed_operand(
        fragment,
        format!("{}guard", prefix),
        Operand::local(block.compared.clone()),
        &block.compared_type,
    );
    fragment.push(Stmt::assign(
        matched.clone(),
        Expr::Invoke(InvokeExpr::new_static(
            match_method(),
            vec![boxed.clone(), Operand::Local(digest)],
        )),
    ));
    let skip = fragment.external(block.end);
    fragment.push(Stmt::if_(
        CmpOp::Ne,
        Operand::Local(matched),
        Operand::int(1),
        skip,
    ));
    boxed
}

/// Rewrite only the guard of `block`, leaving its body in place.
pub fn rewrite(body: &mut Body, block: &GuardedBlock, prefix: &str) -> Result<Relocation, Rejection> {
    let guard = prepare(block)?;
    let mut fragment = Fragment::new();
    emit(&mut fragment, block, &guard, prefix);
    body.splice(block.guard..block.guard + 1, fragment, true)
        .map_err(|e| Rejection::Validation(e.to_string()))
}
