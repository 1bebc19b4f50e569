use crate::handler::HandlerRegistry;
use mediator_core::{CallId, CallReturn};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;
use tracing::{debug, error};

/// Runs registered handlers, turning failures and panics into error returns
pub struct CallExecutor<'a> {
    registry: &'a HandlerRegistry,
}

impl<'a> CallExecutor<'a> {
    pub fn new(registry: &'a HandlerRegistry) -> Self {
        CallExecutor { registry }
    }

    /// Execute `method` for call `id`.
    ///
    /// A panicking handler never takes the worker down with it; the panic
    /// message becomes the call's error indicator.
    pub fn execute(&self, id: CallId, method: &str, args: &[Value]) -> CallReturn {
        let Some(handler) = self.registry.get(method) else {
            error!("Call {}: no handler registered for method `{}`", id, method);
            return Err(format!("Unknown method: {}", method));
        };

        let started = Instant::now();
        let result = match catch_unwind(AssertUnwindSafe(|| handler.call(args))) {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Call {} to `{}` panicked: {}", id, method, message);
                Err(format!("Call panicked: {}", message))
            }
        };

        match &result {
            Ok(_) => debug!("Call {} to `{}` completed in {:?}", id, method, started.elapsed()),
            Err(e) => debug!("Call {} to `{}` failed: {}", id, method, e),
        }
        result
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register("echo", |args: &[Value]| -> CallReturn { Ok(json!(args)) })
            .unwrap();
        registry
            .register("explode", |_: &[Value]| -> CallReturn { panic!("boom") })
            .unwrap();
        registry
    }

    #[test]
    fn test_executor_success() {
        let registry = registry();
        let executor = CallExecutor::new(&registry);

        let result = executor.execute(2, "echo", &[json!("test data")]);
        assert_eq!(result, Ok(json!(["test data"])));
    }

    #[test]
    fn test_executor_captures_panic() {
        let registry = registry();
        let executor = CallExecutor::new(&registry);

        let result = executor.execute(3, "explode", &[]);
        assert_eq!(result, Err("Call panicked: boom".to_string()));
    }

    #[test]
    fn test_executor_unknown_method() {
        let registry = registry();
        let executor = CallExecutor::new(&registry);

        assert!(executor.execute(4, "missing", &[]).is_err());
    }
}
