use mediator_core::{validate_method_name, CallReturn, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// A callable a worker process can execute on behalf of the parent
pub trait CallHandler: Send + Sync {
    /// Execute the call with the given arguments
    fn call(&self, args: &[Value]) -> CallReturn;
}

impl<F> CallHandler for F
where
    F: Fn(&[Value]) -> CallReturn + Send + Sync,
{
    fn call(&self, args: &[Value]) -> CallReturn {
        self(args)
    }
}

type Hook = Arc<dyn Fn() -> std::result::Result<(), String> + Send + Sync>;
type EnvironmentCheck = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// Registry of call handlers by method name, plus worker lifecycle hooks
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CallHandler>>,
    setup: Option<Hook>,
    teardown: Option<Hook>,
    check_environment: Option<EnvironmentCheck>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a method. Invalid names are rejected here so
    /// that `invoke` only ever sees known identifiers.
    pub fn register<H: CallHandler + 'static>(&mut self, method: &str, handler: H) -> Result<()> {
        validate_method_name(method)?;
        if self.handlers.insert(method.to_string(), Arc::new(handler)).is_some() {
            warn!("Handler for method `{}` replaced", method);
        }
        Ok(())
    }

    /// Builder-style `register`
    pub fn with<H: CallHandler + 'static>(mut self, method: &str, handler: H) -> Result<Self> {
        self.register(method, handler)?;
        Ok(self)
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn CallHandler>> {
        self.handlers.get(method).cloned()
    }

    pub fn has_handler(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.handlers.keys().cloned().collect();
        methods.sort();
        methods
    }

    /// Run in every worker process right after it is forked
    pub fn on_setup<F>(&mut self, hook: F)
    where
        F: Fn() -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(hook));
    }

    /// Run in every worker process before it exits
    pub fn on_teardown<F>(&mut self, hook: F)
    where
        F: Fn() -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.teardown = Some(Arc::new(hook));
    }

    /// Validate the environment before the pool starts; returns error messages
    pub fn on_check_environment<F>(&mut self, check: F)
    where
        F: Fn() -> Vec<String> + Send + Sync + 'static,
    {
        self.check_environment = Some(Arc::new(check));
    }

    pub fn run_setup(&self) -> std::result::Result<(), String> {
        self.setup.as_ref().map_or(Ok(()), |hook| hook())
    }

    pub fn run_teardown(&self) -> std::result::Result<(), String> {
        self.teardown.as_ref().map_or(Ok(()), |hook| hook())
    }

    pub fn check_environment(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.handlers.is_empty() {
            errors.push("No call handlers registered".to_string());
        }
        if let Some(check) = &self.check_environment {
            errors.extend(check());
        }
        errors
    }
}
