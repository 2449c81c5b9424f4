//! Named read-only functions for multi-key reads.
//!
//! Functions are registered by name on every node; a [`ReadOnlyManyCommand`]
//! carries only the name and its [`Params`], never code.
//!
//! [`ReadOnlyManyCommand`]: super::ReadOnlyManyCommand

use crate::commands::Flags;
use crate::error::{CommandError, Result};
use crate::types::EntryVersion;
use bytes::Bytes;
use dashmap::DashMap;
use smol_str::SmolStr;
use std::sync::Arc;

/// Invocation parameters forwarded with a functional command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    pub flags: Flags,
    pub arguments: Vec<Bytes>,
}

impl Params {
    pub fn new(arguments: Vec<Bytes>) -> Self {
        Self {
            flags: Flags::NONE,
            arguments,
        }
    }

    pub fn argument(&self, index: usize) -> Option<&Bytes> {
        self.arguments.get(index)
    }
}

/// Read-only view of one entry handed to a function.
#[derive(Debug, Clone, Copy)]
pub struct ReadEntryView<'a> {
    key: &'a Bytes,
    value: Option<&'a Bytes>,
    version: Option<EntryVersion>,
}

impl<'a> ReadEntryView<'a> {
    pub fn new(key: &'a Bytes, value: Option<&'a Bytes>, version: Option<EntryVersion>) -> Self {
        Self {
            key,
            value,
            version,
        }
    }

    pub fn key(&self) -> &Bytes {
        self.key
    }

    /// The value, if the entry exists.
    pub fn find(&self) -> Option<&Bytes> {
        self.value
    }

    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    pub fn version(&self) -> Option<EntryVersion> {
        self.version
    }
}

/// A function applied to each entry of a multi-key read.
pub type ReadFunction =
    Arc<dyn Fn(&ReadEntryView<'_>, &Params) -> Result<Option<Bytes>> + Send + Sync>;

/// Functions known to this node, by name.
pub struct FunctionRegistry {
    functions: DashMap<SmolStr, ReadFunction>,
}

impl FunctionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            functions: DashMap::new(),
        }
    }

    /// Registry pre-populated with `value`, `exists` and `length`.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("value", |view, _| Ok(view.find().cloned()));
        registry.register("exists", |view, _| {
            Ok(Some(Bytes::from_static(if view.exists() {
                &[1]
            } else {
                &[0]
            })))
        });
        registry.register("length", |view, _| {
            Ok(view
                .find()
                .map(|v| Bytes::copy_from_slice(&(v.len() as u64).to_be_bytes())))
        });
        registry
    }

    /// Register or replace a function.
    pub fn register<F>(&self, name: impl Into<SmolStr>, function: F)
    where
        F: Fn(&ReadEntryView<'_>, &Params) -> Result<Option<Bytes>> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    /// Look up a function by name.
    pub fn get(&self, name: &str) -> Result<ReadFunction> {
        self.functions
            .get(name)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| CommandError::UnknownFunction(name.to_string()).into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<SmolStr> = self.functions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}
