//! `ScriptEnvironment` contract for `Script` steps and predicates.
//!
//! The core ships no interpreter; production deployments plug in a real
//! one (`ale`, `lua`, ...). `TestScriptEnv` is the in-memory fake used by
//! engine tests, following the pattern of registering named fakes for
//! external collaborators in `#[cfg(test)]`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use flowcore_domain::AttributeName;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::PredicateError;

/// Opaque handle to a compiled script, keyed by `(language, sha256(source))`
/// so a `ScriptEnvironment` implementation (or the cache in front of it)
/// can memoize compilation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptCacheKey {
    pub language: String,
    pub source_digest: String,
}

impl ScriptCacheKey {
    #[must_use]
    pub fn new(language: &str, source: &str) -> Self {
        let digest = Sha256::digest(source.as_bytes());
        Self {
            language: language.to_string(),
            source_digest: format!("{digest:x}"),
        }
    }
}

#[async_trait]
pub trait ScriptEnvironment: Send + Sync {
    type Compiled: Clone + Send + Sync;

    async fn compile(&self, language: &str, source: &str) -> Result<Self::Compiled, PredicateError>;

    async fn evaluate(
        &self,
        compiled: &Self::Compiled,
        inputs: &HashMap<AttributeName, Value>,
    ) -> Result<HashMap<AttributeName, Value>, PredicateError>;

    async fn evaluate_predicate(
        &self,
        compiled: &Self::Compiled,
        inputs: &HashMap<AttributeName, Value>,
    ) -> Result<bool, PredicateError>;
}

type BoxedEval = Box<dyn Fn(&HashMap<AttributeName, Value>) -> HashMap<AttributeName, Value> + Send + Sync>;
type BoxedPredicate = Box<dyn Fn(&HashMap<AttributeName, Value>) -> bool + Send + Sync>;

/// Registers scripts by source text rather than actually interpreting
/// anything: test authors register a closure for the exact source string
/// their fixture step uses.
#[derive(Default)]
pub struct TestScriptEnv {
    evaluators: RwLock<HashMap<String, Arc<BoxedEval>>>,
    predicates: RwLock<HashMap<String, Arc<BoxedPredicate>>>,
}

impl TestScriptEnv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        source: impl Into<String>,
        eval: impl Fn(&HashMap<AttributeName, Value>) -> HashMap<AttributeName, Value> + Send + Sync + 'static,
    ) {
        self.evaluators
            .write()
            .expect("test script env lock poisoned")
            .insert(source.into(), Arc::new(Box::new(eval)));
    }

    pub fn register_predicate(
        &self,
        source: impl Into<String>,
        predicate: impl Fn(&HashMap<AttributeName, Value>) -> bool + Send + Sync + 'static,
    ) {
        self.predicates
            .write()
            .expect("test script env lock poisoned")
            .insert(source.into(), Arc::new(Box::new(predicate)));
    }
}

#[async_trait]
impl ScriptEnvironment for TestScriptEnv {
    type Compiled = String;

    async fn compile(&self, _language: &str, source: &str) -> Result<Self::Compiled, PredicateError> {
        Ok(source.to_string())
    }

    async fn evaluate(
        &self,
        compiled: &Self::Compiled,
        inputs: &HashMap<AttributeName, Value>,
    ) -> Result<HashMap<AttributeName, Value>, PredicateError> {
        let evaluators = self.evaluators.read().expect("test script env lock poisoned");
        let eval = evaluators.get(compiled).ok_or_else(|| PredicateError::Eval {
            step: flowcore_domain::StepId::new("unknown"),
            message: format!("no registered evaluator for source {compiled:?}"),
        })?;
        Ok(eval(inputs))
    }

    async fn evaluate_predicate(
        &self,
        compiled: &Self::Compiled,
        inputs: &HashMap<AttributeName, Value>,
    ) -> Result<bool, PredicateError> {
        let predicates = self.predicates.read().expect("test script env lock poisoned");
        let predicate = predicates.get(compiled).ok_or_else(|| PredicateError::Eval {
            step: flowcore_domain::StepId::new("unknown"),
            message: format!("no registered predicate for source {compiled:?}"),
        })?;
        Ok(predicate(inputs))
    }
}
