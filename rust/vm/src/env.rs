//! Persistent environments: chained name to value bindings.
//!
//! Extending an environment never mutates it, so frames and closures share
//! their tails freely.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::rc::Rc;

use crate::value::Value;

struct Binding {
    name: String,
    value: Value,
    next: Option<Rc<Binding>>,
}

/// An immutable binding chain. Inner bindings shadow outer ones.
#[derive(Clone, Default)]
pub struct Env {
    head: Option<Rc<Binding>>,
    len: usize,
}

impl Env {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend with one binding.
    #[must_use]
    pub fn bind(&self, name: impl Into<String>, value: Value) -> Self {
        Env {
            head: Some(Rc::new(Binding {
                name: name.into(),
                value,
                next: self.head.clone(),
            })),
            len: self.len + 1,
        }
    }

    /// Extend with parameters bound pairwise; the caller checks arity.
    #[must_use]
    pub fn bind_all(&self, names: &[String], values: impl IntoIterator<Item = Value>) -> Self {
        names
            .iter()
            .zip(values)
            .fold(self.clone(), |env, (name, value)| env.bind(name.clone(), value))
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    /// Bindings innermost first, shadowed ones included.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        let mut cursor = self.head.as_deref();
        std::iter::from_fn(move || {
            let binding = cursor?;
            cursor = binding.next.as_deref();
            Some((binding.name.as_str(), &binding.value))
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bindings outermost first, so folding `bind` over them rebuilds this
    /// environment.
    #[must_use]
    pub fn bindings(&self) -> Vec<(String, Value)> {
        let mut out: Vec<(String, Value)> = self
            .iter()
            .map(|(n, v)| (n.to_string(), v.clone()))
            .collect();
        out.reverse();
        out
    }

    #[must_use]
    pub fn from_bindings(bindings: impl IntoIterator<Item = (String, Value)>) -> Self {
        bindings
            .into_iter()
            .fold(Env::new(), |env, (name, value)| env.bind(name, value))
    }

    /// Rebuild with every value passed through `f`.
    pub fn try_map_values<E>(&self, mut f: impl FnMut(&Value) -> Result<Value, E>) -> Result<Self, E> {
        let mut out = Env::new();
        for (name, value) in self.bindings() {
            out = out.bind(name, f(&value)?);
        }
        Ok(out)
    }

    pub(crate) fn ptr_eq(&self, other: &Env) -> bool {
        match (&self.head, &other.head) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Drop for Env {
    // Unlink iteratively so long chains do not overflow the host stack.
    fn drop(&mut self) {
        let mut next = self.head.take();
        while let Some(binding) = next {
            match Rc::try_unwrap(binding) {
                Ok(mut owned) => next = owned.next.take(),
                Err(_) => break,
            }
        }
    }
}

impl PartialEq for Env {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
            || (self.len == other.len
                && self.iter().zip(other.iter()).all(|(a, b)| a == b))
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl Serialize for Env {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bindings().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Env {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<(String, Value)>::deserialize(deserializer).map(Env::from_bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadowing() {
        let env = Env::new().bind("x", Value::Int(1)).bind("x", Value::Int(2));
        assert_eq!(env.lookup("x"), Some(&Value::Int(2)));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_extension_is_persistent() {
        let base = Env::new().bind("a", Value::Int(1));
        let extended = base.bind("b", Value::Int(2));
        assert!(base.lookup("b").is_none());
        assert_eq!(extended.lookup("a"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_serde_preserves_shadowing_order() {
        let env = Env::new().bind("x", Value::Int(1)).bind("y", Value::Nil).bind("x", Value::Bool(true));
        let json = serde_json::to_string(&env).unwrap();
        let back: Env = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.lookup("x"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_long_chain_drops() {
        let mut env = Env::new();
        for i in 0..200_000 {
            env = env.bind("v", Value::Int(i));
        }
        drop(env);
    }
}
