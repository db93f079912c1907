//! Visibility widening for symbols referenced from extracted units.
//!
//! An extracted unit is loaded on its own and has no privileged relationship
//! with the class it came from, so everything it touches must be public. The
//! policy records, once per symbol, the declared visibility next to the
//! effective one, and is applied to the program in a single pass at the end.

use crate::ir::{Program, Type, Visibility};
use std::collections::BTreeMap;

/// A class or member whose visibility may need widening
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Symbol {
    Class(String),
    Method {
        class: String,
        name: String,
        params: Vec<Type>,
    },
    Field {
        class: String,
        name: String,
    },
}

impl Symbol {
    fn owner(&self) -> &str {
        match self {
            Symbol::Class(name) => name,
            Symbol::Method { class, .. } | Symbol::Field { class, .. } => class,
        }
    }
}

/// Declared and post-extraction visibility of one symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessLevel {
    pub declared: Visibility,
    pub effective: Visibility,
}

#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    levels: BTreeMap<Symbol, AccessLevel>,
}

impl AccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn declared(program: &Program, symbol: &Symbol) -> Option<Visibility> {
        let class = program.class(symbol.owner())?;
        match symbol {
            Symbol::Class(_) => Some(class.visibility),
            Symbol::Method { name, params, .. } => class
                .methods
                .iter()
                .find(|m| &m.name == name && &m.params == params)
                .map(|m| m.visibility),
            Symbol::Field { name, .. } => class.field(name).map(|f| f.visibility),
        }
    }

    /// Require `symbol` to be reachable from any unit.
    ///
    /// Members also require their class, and classes their enclosing classes.
    /// Symbols outside the program (platform classes) are left alone.
    pub fn require_public(&mut self, program: &Program, symbol: Symbol) {
        let mut pending = vec![symbol];
        while let Some(symbol) = pending.pop() {
            if self.levels.contains_key(&symbol) {
                continue;
            }
            let Some(declared) = Self::declared(program, &symbol) else {
                continue;
            };
            match &symbol {
                Symbol::Class(name) => {
                    if let Some(outer) = program.class(name).and_then(|c| c.outer.clone()) {
                        pending.push(Symbol::Class(outer));
                    }
                }
                other => pending.push(Symbol::Class(other.owner().to_string())),
            }
            self.levels.insert(
                symbol,
                AccessLevel {
                    declared,
                    effective: Visibility::Public,
                },
            );
        }
    }

    pub fn level(&self, symbol: &Symbol) -> Option<AccessLevel> {
        self.levels.get(symbol).copied()
    }

    /// Symbols whose visibility changes
    pub fn widened(&self) -> impl Iterator<Item = &Symbol> {
        self.levels
            .iter()
            .filter(|(_, l)| l.declared != l.effective)
            .map(|(s, _)| s)
    }

    /// Write effective visibilities into `program`; returns how many changed.
    pub fn apply(&self, program: &mut Program) -> usize {
        let mut changed = 0;
        for (symbol, level) in &self.levels {
            if level.declared == level.effective {
                continue;
            }
            let Some(class) = program.class_mut(symbol.owner()) else {
                continue;
            };
            let slot = match symbol {
                Symbol::Class(_) => Some(&mut class.visibility),
                Symbol::Method { name, params, .. } => class
                    .methods
                    .iter_mut()
                    .find(|m| &m.name == name && &m.params == params)
                    .map(|m| &mut m.visibility),
                Symbol::Field { name, .. } => class
                    .fields
                    .iter_mut()
                    .find(|f| &f.name == name)
                    .map(|f| &mut f.visibility),
            };
            if let Some(visibility) = slot {
                if *visibility != level.effective {
                    tracing::debug!("Widening {:?} to {:?}", symbol, level.effective);
                    *visibility = level.effective;
                    changed += 1;
                }
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Class, Field, Method};

    fn program() -> Program {
        Program::new()
            .with_class(Class::new("app.Outer").visibility(Visibility::Package))
            .with_class(
                Class::new("app.Outer$Inner")
                    .nested_in("app.Outer")
                    .visibility(Visibility::Private)
                    .with_field(Field::new("secret", Type::Int).visibility(Visibility::Private))
                    .with_method(
                        Method::new("helper", vec![Type::Int], Type::Int)
                            .visibility(Visibility::Protected),
                    ),
            )
    }

    #[test]
    fn test_member_widens_class_chain() {
        let mut program = program();
        let mut policy = AccessPolicy::new();
        policy.require_public(
            &program,
            Symbol::Field {
                class: "app.Outer$Inner".into(),
                name: "secret".into(),
            },
        );
        assert_eq!(policy.widened().count(), 3);
        assert_eq!(
            policy.level(&Symbol::Class("app.Outer".into())),
            Some(AccessLevel {
                declared: Visibility::Package,
                effective: Visibility::Public
            })
        );

        assert_eq!(policy.apply(&mut program), 3);
        let inner = program.class("app.Outer$Inner").unwrap();
        assert_eq!(inner.visibility, Visibility::Public);
        assert_eq!(inner.field("secret").unwrap().visibility, Visibility::Public);
        assert_eq!(
            inner.method("helper").unwrap().visibility,
            Visibility::Protected
        );
        assert_eq!(program.class("app.Outer").unwrap().visibility, Visibility::Public);
    }

    #[test]
    fn test_memoized_and_platform_symbols_ignored() {
        let program = program();
        let mut policy = AccessPolicy::new();
        let helper = Symbol::Method {
            class: "app.Outer$Inner".into(),
            name: "helper".into(),
            params: vec![Type::Int],
        };
        policy.require_public(&program, helper.clone());
        policy.require_public(&program, helper.clone());
        policy.require_public(&program, Symbol::Class("java.lang.String".into()));
        assert_eq!(policy.widened().count(), 3);
        assert_eq!(
            policy.level(&helper).map(|l| l.declared),
            Some(Visibility::Protected)
        );
        assert!(policy.level(&Symbol::Class("java.lang.String".into())).is_none());
    }
}
