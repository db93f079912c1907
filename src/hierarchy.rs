//! Guard candidate discovery and nesting.
//!
//! A guard is a conditional `if x != C goto t` where `x` is a local and `C`
//! a constant with enough entropy to act as a secret. The guarded block is
//! `[guard + 1, t)`; it executes only when `x == C`.
//!
//! Candidates of one method form a [`GuardForest`]: each block is a child of
//! the deepest block fully containing it, and [`GuardForest::bottom_up`]
//! yields children before their parents so inner blocks are extracted first.

use crate::error::Rejection;
use crate::ir::{Body, CmpOp, Constant, Operand, Stmt, Type};
use serde::{Deserialize, Serialize};

/// Kind of secret constant a guard compares against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstantKind {
    Text,
    TypeName,
    Numeric,
}

impl ConstantKind {
    /// Kind of `constant`, or why it cannot serve as a secret
    pub fn classify(constant: &Constant) -> Result<Self, Rejection> {
        match constant {
            Constant::Str(_) => Ok(ConstantKind::Text),
            Constant::Class(_) => Ok(ConstantKind::TypeName),
            Constant::Int(v) if v.to_string().len() > 1 => Ok(ConstantKind::Numeric),
            Constant::Long(v) if v.to_string().len() > 1 => Ok(ConstantKind::Numeric),
            other => Err(Rejection::LowEntropyConstant(other.to_string())),
        }
    }
}

/// A conditional region gated by comparing a local to a secret constant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardedBlock {
    /// Enclosing class
    pub class: String,
    /// Enclosing method signature
    pub method: String,
    /// Index of the guard conditional
    pub guard: usize,
    /// First guarded statement (`guard + 1`)
    pub start: usize,
    /// Exit target of the guard, exclusive end of the block
    pub end: usize,
    pub compared: String,
    pub compared_type: Type,
    pub constant: Constant,
    pub kind: ConstantKind,
}

impl GuardedBlock {
    /// Guard and guarded statements
    pub fn span(&self) -> std::ops::Range<usize> {
        self.guard..self.end
    }

    /// Guarded statements only
    pub fn slice(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }

    /// Whether `other` lies within this block's guarded statements
    pub fn contains(&self, other: &GuardedBlock) -> bool {
        self.start <= other.guard && other.end <= self.end && self.span() != other.span()
    }

    fn overlaps(&self, other: &GuardedBlock) -> bool {
        self.guard < other.end && other.guard < self.end
    }

    /// Follow a splice elsewhere in the body; `None` if this block was
    /// inside the replaced range.
    pub fn relocate(&self, reloc: &crate::ir::Relocation) -> Option<Self> {
        let guard = reloc.map(self.guard)?;
        let end = reloc.map_end(self.end)?;
        if end <= guard + 1 {
            return None;
        }
        Some(Self {
            guard,
            start: guard + 1,
            end,
            ..self.clone()
        })
    }
}

/// Candidates found in one method body
#[derive(Debug, Default)]
pub struct Scan {
    pub candidates: Vec<GuardedBlock>,
    /// Conditionals shaped like a guard but unusable, by guard index
    pub rejected: Vec<(usize, Rejection)>,
}

/// Examine one conditional. `Ok(None)` means it is not guard-shaped at all.
pub fn candidate_at(
    class: &str,
    method: &str,
    body: &Body,
    index: usize,
) -> Result<Option<GuardedBlock>, Rejection> {
    let Some(Stmt::If { cond, target }) = body.stmts.get(index) else {
        return Ok(None);
    };
    if cond.op != CmpOp::Ne {
        return Ok(None);
    }
    let (compared, constant) = match (&cond.lhs, &cond.rhs) {
        (Operand::Local(l), Operand::Const(c)) | (Operand::Const(c), Operand::Local(l)) => {
            (l, c)
        }
        _ => return Ok(None),
    };
    let kind = ConstantKind::classify(constant)?;
    if *target <= index {
        return Err(Rejection::BackwardJump { target: *target });
    }
    if *target == index + 1 {
        return Err(Rejection::EmptyBlock);
    }
    let compared_type = body
        .local_type(compared)
        .cloned()
        .ok_or_else(|| Rejection::NotACandidate(format!("undeclared local {}", compared)))?;

    for trap in &body.traps {
        let disjoint = trap.end <= index || trap.begin >= *target;
        let encloses = trap.begin <= index && trap.end >= *target;
        let inside = trap.begin > index
            && trap.end <= *target
            && trap.handler > index
            && trap.handler < *target;
        if !(disjoint || encloses || inside) {
            return Err(Rejection::PartialTrap {
                begin: trap.begin,
                end: trap.end,
            });
        }
    }

    Ok(Some(GuardedBlock {
        class: class.to_string(),
        method: method.to_string(),
        guard: index,
        start: index + 1,
        end: *target,
        compared: compared.clone(),
        compared_type,
        constant: constant.clone(),
        kind,
    }))
}

/// Find every guard candidate in `body`, in statement order.
pub fn scan(class: &str, method: &str, body: &Body) -> Scan {
    let mut result = Scan::default();
    for index in 0..body.stmts.len() {
        match candidate_at(class, method, body, index) {
            Ok(Some(block)) => {
                tracing::debug!(
                    "Guard candidate in {}.{} at {}: {} != {}",
                    class,
                    method,
                    index,
                    block.compared,
                    block.constant
                );
                result.candidates.push(block);
            }
            Ok(None) => {}
            Err(Rejection::LowEntropyConstant(_)) => {}
            Err(reason) => {
                tracing::warn!("Skipping guard in {}.{} at {}: {}", class, method, index, reason);
                result.rejected.push((index, reason));
            }
        }
    }
    result
}

// ============================================================================
// Forest
// ============================================================================

#[derive(Debug, Clone)]
struct Node {
    block: GuardedBlock,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Containment forest of guarded blocks
#[derive(Debug, Clone, Default)]
pub struct GuardForest {
    nodes: Vec<Node>,
    roots: Vec<usize>,
}

impl GuardForest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a forest from candidates, logging and collecting the ones that
    /// partially overlap an earlier candidate.
    pub fn build(candidates: Vec<GuardedBlock>) -> (Self, Vec<(usize, Rejection)>) {
        let mut forest = Self::new();
        let mut rejected = Vec::new();
        for block in candidates {
            let guard = block.guard;
            if let Err(reason) = forest.insert(block) {
                tracing::warn!("Skipping guard at {}: {}", guard, reason);
                rejected.push((guard, reason));
            }
        }
        (forest, rejected)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn block(&self, id: usize) -> Option<&GuardedBlock> {
        self.nodes.get(id).map(|n| &n.block)
    }

    pub fn parent(&self, id: usize) -> Option<usize> {
        self.nodes.get(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: usize) -> &[usize] {
        self.nodes.get(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    fn siblings(&self, parent: Option<usize>) -> &[usize] {
        match parent {
            Some(p) => self.children(p),
            None => &self.roots,
        }
    }

    /// Deepest node whose block contains `block`.
    ///
    /// Fails if `block` partially overlaps any node on the way down.
    pub fn containing(&self, block: &GuardedBlock) -> Result<Option<usize>, Rejection> {
        let mut parent = None;
        'descend: loop {
            for &id in self.siblings(parent) {
                let other = &self.nodes[id].block;
                if other.contains(block) {
                    parent = Some(id);
                    continue 'descend;
                }
                if other.overlaps(block) && !block.contains(other) {
                    return Err(Rejection::PartialContainment {
                        start: block.guard,
                        end: block.end,
                        other_start: other.guard,
                        other_end: other.end,
                    });
                }
            }
            return Ok(parent);
        }
    }

    /// Insert `block` under the deepest node containing it. Existing
    /// siblings that `block` contains become its children.
    pub fn insert(&mut self, block: GuardedBlock) -> Result<usize, Rejection> {
        let parent = self.containing(&block)?;
        let id = self.nodes.len();

        let (adopted, kept): (Vec<usize>, Vec<usize>) = self
            .siblings(parent)
            .iter()
            .partition(|&&s| block.contains(&self.nodes[s].block));
        for &child in &adopted {
            self.nodes[child].parent = Some(id);
        }
        let mut siblings = kept;
        siblings.push(id);
        siblings.sort_by_key(|&s| if s == id { block.guard } else { self.nodes[s].block.guard });

        self.nodes.push(Node {
            block,
            parent,
            children: adopted,
        });
        match parent {
            Some(p) => self.nodes[p].children = siblings,
            None => self.roots = siblings,
        }
        Ok(id)
    }

    /// Post-order: every block after all blocks it contains
    pub fn bottom_up(&self) -> Vec<&GuardedBlock> {
        fn visit<'a>(forest: &'a GuardForest, id: usize, out: &mut Vec<&'a GuardedBlock>) {
            for &child in forest.children(id) {
                visit(forest, child, out);
            }
            out.push(&forest.nodes[id].block);
        }
        let mut out = Vec::with_capacity(self.nodes.len());
        for &root in &self.roots {
            visit(self, root, &mut out);
        }
        out
    }
}
