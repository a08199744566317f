//! Deferred construction of task members that are built inside the worker
//!
//! A [`ConstructionPlan`] names a registered constructor plus its arguments;
//! arguments are plain JSON values or nested plans, resolved depth-first.
//! Task descriptors carry [`Deferred`] members holding only the plan; the
//! runner resolves them in the worker right before a job executes.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Constructor name plus arguments, recursively resolvable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstructionPlan {
    pub constructor: String,
    #[serde(default)]
    pub args: Vec<PlanArg>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanArg {
    Value(serde_json::Value),
    Plan(ConstructionPlan),
}

impl ConstructionPlan {
    pub fn new(constructor: impl Into<String>) -> Self {
        Self {
            constructor: constructor.into(),
            args: Vec::new(),
        }
    }

    /// Append a plain argument, failing if it does not serialize to JSON.
    pub fn arg(mut self, value: impl Serialize) -> Result<Self> {
        let value = serde_json::to_value(value).map_err(|source| Error::PlanArgument {
            constructor: self.constructor.clone(),
            index: self.args.len(),
            source,
        })?;
        self.args.push(PlanArg::Value(value));
        Ok(self)
    }

    /// Append an argument built by another plan.
    pub fn nested(mut self, plan: ConstructionPlan) -> Self {
        self.args.push(PlanArg::Plan(plan));
        self
    }
}

enum Resolved {
    Value(serde_json::Value),
    Object(Option<Box<dyn Any + Send>>),
}

/// Resolved arguments handed to a constructor.
pub struct Args {
    constructor: String,
    items: Vec<Resolved>,
}

impl Args {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Decode plain argument `index`.
    pub fn value<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        match self.items.get(index) {
            Some(Resolved::Value(v)) => {
                serde_json::from_value(v.clone()).map_err(|_| self.type_error(index, type_name::<T>()))
            }
            _ => Err(self.type_error(index, type_name::<T>())),
        }
    }

    /// Take ownership of nested-plan argument `index`.
    pub fn take<T: Any>(&mut self, index: usize) -> Result<T> {
        let expected = type_name::<T>();
        let boxed = match self.items.get_mut(index) {
            Some(Resolved::Object(slot)) => slot.take(),
            _ => None,
        };
        let boxed = boxed.ok_or_else(|| self.type_error(index, expected))?;
        boxed
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| self.type_error(index, expected))
    }

    fn type_error(&self, index: usize, expected: &'static str) -> Error {
        Error::DeferredType {
            context: format!("{} argument {index}", self.constructor),
            expected,
        }
    }
}

type Constructor = dyn Fn(&mut Args) -> anyhow::Result<Box<dyn Any + Send>> + Send + Sync;

/// Named constructors available to workers.
#[derive(Default, Clone)]
pub struct Registry {
    constructors: HashMap<String, Arc<Constructor>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.constructors.keys().collect();
        names.sort();
        f.debug_struct("Registry").field("constructors", &names).finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `build` under `name`, replacing any previous entry.
    pub fn register<T, F>(&mut self, name: &str, build: F) -> &mut Self
    where
        T: Any + Send,
        F: Fn(&mut Args) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.constructors.insert(
            name.to_string(),
            Arc::new(move |args: &mut Args| {
                build(args).map(|v| Box::new(v) as Box<dyn Any + Send>)
            }),
        );
        self
    }

    /// Evaluate a plan and downcast the result.
    pub fn build<T: Any>(&self, plan: &ConstructionPlan) -> Result<T> {
        self.evaluate(plan)?
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| Error::DeferredType {
                context: plan.constructor.clone(),
                expected: type_name::<T>(),
            })
    }

    fn evaluate(&self, plan: &ConstructionPlan) -> Result<Box<dyn Any + Send>> {
        let constructor = self
            .constructors
            .get(&plan.constructor)
            .ok_or_else(|| Error::UnknownConstructor(plan.constructor.clone()))?;
        let mut items = Vec::with_capacity(plan.args.len());
        for arg in &plan.args {
            items.push(match arg {
                PlanArg::Value(v) => Resolved::Value(v.clone()),
                PlanArg::Plan(inner) => Resolved::Object(Some(self.evaluate(inner)?)),
            });
        }
        let mut args = Args {
            constructor: plan.constructor.clone(),
            items,
        };
        constructor(&mut args).map_err(|e| Error::run(&plan.constructor, e))
    }
}

/// Task member built from a plan inside the worker.
///
/// Cloning keeps the plan and drops any resolved value, so a task cloned
/// for a new job always rebuilds its members there.
pub struct Deferred<T> {
    plan: ConstructionPlan,
    value: Option<T>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            plan: self.plan.clone(),
            value: None,
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("plan", &self.plan)
            .field("resolved", &self.value.is_some())
            .finish()
    }
}

impl<T: Any> Deferred<T> {
    pub fn new(plan: ConstructionPlan) -> Self {
        Self { plan, value: None }
    }

    pub fn plan(&self) -> &ConstructionPlan {
        &self.plan
    }

    pub fn is_resolved(&self) -> bool {
        self.value.is_some()
    }

    /// Build the value if not built yet.
    pub fn resolve(&mut self, registry: &Registry) -> Result<&mut T> {
        let value = match self.value.take() {
            Some(v) => v,
            None => registry.build::<T>(&self.plan)?,
        };
        Ok(self.value.insert(value))
    }

    pub fn get(&self) -> Result<&T> {
        self.value
            .as_ref()
            .ok_or_else(|| Error::Unresolved(self.plan.constructor.clone()))
    }
}

/// What a worker knows when it resolves a task before a job.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    registry: Arc<Registry>,
    job_id: usize,
    worker: usize,
}

impl WorkerContext {
    pub fn new(registry: Arc<Registry>, job_id: usize, worker: usize) -> Self {
        Self {
            registry,
            job_id,
            worker,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn job_id(&self) -> usize {
        self.job_id
    }

    /// Index of the pool thread running the job.
    pub fn worker(&self) -> usize {
        self.worker
    }
}
