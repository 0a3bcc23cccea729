use bincode::{Decode, Encode};
use rustc_hash::FxHashMap;
use std::fmt;

/// A constant argument of a ground atom.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub enum Constant {
    Str(String),
    Int(i64),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Str(s) => write!(f, "{}", s),
            Constant::Int(i) => write!(f, "{}", i),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum ArgType {
    String,
    UniqueStringId,
    Integer,
    UniqueIntId,
}

impl ArgType {
    pub fn parse(&self, token: &str) -> Result<Constant, String> {
        match self {
            ArgType::String | ArgType::UniqueStringId => {
                if token.is_empty() {
                    return Err("empty string argument".to_string());
                }
                Ok(Constant::Str(token.to_string()))
            }
            ArgType::Integer | ArgType::UniqueIntId => token
                .parse::<i64>()
                .map(Constant::Int)
                .map_err(|_| format!("expected an integer argument, got '{}'", token)),
        }
    }

    pub fn accepts(&self, constant: &Constant) -> bool {
        matches!(
            (self, constant),
            (ArgType::String | ArgType::UniqueStringId, Constant::Str(_))
                | (ArgType::Integer | ArgType::UniqueIntId, Constant::Int(_))
        )
    }
}

/// Standard predicates have atoms stored in the atom table. Derived predicates
/// compute their truth value and can never be fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum PredicateKind {
    Standard,
    Derived,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Predicate {
    pub name: String,
    pub arg_types: Vec<ArgType>,
    pub kind: PredicateKind,
}

impl Predicate {
    pub fn standard(name: &str, arg_types: Vec<ArgType>) -> Self {
        Predicate {
            name: name.to_string(),
            arg_types,
            kind: PredicateKind::Standard,
        }
    }

    pub fn derived(name: &str, arg_types: Vec<ArgType>) -> Self {
        Predicate {
            name: name.to_string(),
            arg_types,
            kind: PredicateKind::Derived,
        }
    }

    pub fn arity(&self) -> usize {
        self.arg_types.len()
    }
}

pub type PredicateId = u32;

/// Predicates known to one session. Lookups are case-insensitive.
///
/// Passed explicitly to whatever needs it so that several sessions can live
/// in the same process.
#[derive(Debug, Clone, Default)]
pub struct PredicateCatalog {
    predicates: Vec<Predicate>,
    by_name: FxHashMap<String, PredicateId>,
}

impl PredicateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_predicates(predicates: Vec<Predicate>) -> Result<Self, String> {
        let mut catalog = Self::new();
        for predicate in predicates {
            catalog.register(predicate)?;
        }
        Ok(catalog)
    }

    pub fn register(&mut self, predicate: Predicate) -> Result<PredicateId, String> {
        let key = predicate.name.to_ascii_uppercase();
        if self.by_name.contains_key(&key) {
            return Err(format!("Predicate registered twice: {}", predicate.name));
        }
        let id = self.predicates.len() as PredicateId;
        self.predicates.push(predicate);
        self.by_name.insert(key, id);
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<(PredicateId, &Predicate)> {
        let id = *self.by_name.get(&name.to_ascii_uppercase())?;
        Some((id, &self.predicates[id as usize]))
    }

    pub fn get(&self, id: PredicateId) -> &Predicate {
        &self.predicates[id as usize]
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

/// Identity of a ground atom inside one catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct AtomKey {
    pub predicate: PredicateId,
    pub arguments: Vec<Constant>,
}

impl AtomKey {
    pub fn new(predicate: PredicateId, arguments: Vec<Constant>) -> Self {
        AtomKey { predicate, arguments }
    }

    pub fn describe(&self, catalog: &PredicateCatalog) -> String {
        format!(
            "{}({})",
            catalog.get(self.predicate).name,
            itertools::join(&self.arguments, ", ")
        )
    }
}
