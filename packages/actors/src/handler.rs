//! Job handler trait and registry.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use queue_core::Params;
use serde::de::DeserializeOwned;

/// Result type for job handlers: an optional output mapping, or an error message.
pub type HandlerResult = Result<Option<Params>, String>;

/// Future type for async job handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Trait for job handlers.
///
/// Implement this trait to define how jobs naming a function are processed.
pub trait JobHandler: Send + Sync + 'static {
    /// The function name jobs use to select this handler.
    fn func_name(&self) -> &str;

    /// Run the function on a job's params.
    fn call(&self, params: Params) -> HandlerFuture;
}

/// Registry for job handlers.
///
/// Maps function names to their handlers for dynamic dispatch.
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any handler with the same function name.
    pub fn register<H: JobHandler>(&mut self, handler: H) -> &mut Self {
        let func_name = handler.func_name().to_string();
        self.handlers.insert(func_name, Arc::new(handler));
        self
    }

    pub fn get(&self, func_name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(func_name).cloned()
    }

    pub fn has_handler(&self, func_name: &str) -> bool {
        self.handlers.contains_key(func_name)
    }

    /// Registered function names, sorted.
    pub fn func_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

/// A simple function-based job handler.
pub struct FnHandler<F>
where
    F: Fn(Params) -> HandlerFuture + Send + Sync + 'static,
{
    func_name: String,
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(Params) -> HandlerFuture + Send + Sync + 'static,
{
    pub fn new(func_name: impl Into<String>, handler: F) -> Self {
        Self {
            func_name: func_name.into(),
            handler,
        }
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(Params) -> HandlerFuture + Send + Sync + 'static,
{
    fn func_name(&self) -> &str {
        &self.func_name
    }

    fn call(&self, params: Params) -> HandlerFuture {
        (self.handler)(params)
    }
}

/// Handler whose params are deserialized into `P` before the call.
///
/// Params that do not fit `P` fail the job without invoking the function.
pub struct TypedHandler<P, F> {
    func_name: String,
    handler: F,
    _params: PhantomData<fn(P)>,
}

impl<P, F> TypedHandler<P, F>
where
    P: DeserializeOwned + 'static,
    F: Fn(P) -> HandlerFuture + Send + Sync + 'static,
{
    pub fn new(func_name: impl Into<String>, handler: F) -> Self {
        Self {
            func_name: func_name.into(),
            handler,
            _params: PhantomData,
        }
    }
}

impl<P, F> JobHandler for TypedHandler<P, F>
where
    P: DeserializeOwned + 'static,
    F: Fn(P) -> HandlerFuture + Send + Sync + 'static,
{
    fn func_name(&self) -> &str {
        &self.func_name
    }

    fn call(&self, params: Params) -> HandlerFuture {
        match serde_json::from_value::<P>(serde_json::Value::Object(params)) {
            Ok(params) => (self.handler)(params),
            Err(e) => {
                let message = format!("invalid params for {}: {}", self.func_name, e);
                Box::pin(async move { Err::<Option<Params>, String>(message) })
            }
        }
    }
}

/// Helper macro for creating job handlers from async bodies.
///
/// ```ignore
/// registry.register(job_handler!("echo", |params| Ok(Some(params))));
/// ```
#[macro_export]
macro_rules! job_handler {
    ($func_name:expr, |$params:ident| $body:expr) => {
        $crate::FnHandler::new(
            $func_name,
            |$params: $crate::Params| -> $crate::HandlerFuture {
                Box::pin(async move {
                    let result: $crate::HandlerResult = $body;
                    result
                })
            },
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Pair {
        a: i64,
        b: i64,
    }

    fn params(value: serde_json::Value) -> Params {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Params::new(),
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_name() {
        let mut registry = JobHandlerRegistry::new();
        registry
            .register(crate::job_handler!("echo", |params| Ok(Some(params))))
            .register(TypedHandler::new("add", |pair: Pair| -> HandlerFuture {
                Box::pin(async move {
                    let mut out = Params::new();
                    out.insert("sum".into(), json!(pair.a + pair.b));
                    Ok::<_, String>(Some(out))
                })
            }));

        assert_eq!(registry.func_names(), vec!["add", "echo"]);
        assert!(registry.has_handler("echo"));
        assert!(registry.get("missing").is_none());

        let echoed = registry
            .get("echo")
            .unwrap()
            .call(params(json!({"x": 1})))
            .await;
        assert_eq!(echoed, Ok(Some(params(json!({"x": 1})))));

        let sum = registry
            .get("add")
            .unwrap()
            .call(params(json!({"a": 2, "b": 3})))
            .await;
        assert_eq!(sum, Ok(Some(params(json!({"sum": 5})))));
    }

    #[tokio::test]
    async fn typed_handler_rejects_bad_params() {
        let handler = TypedHandler::new("add", |_: Pair| -> HandlerFuture {
            Box::pin(async { Ok::<_, String>(None) })
        });
        let result = handler.call(params(json!({"a": "two"}))).await;
        assert!(result.unwrap_err().starts_with("invalid params for add"));
    }
}
