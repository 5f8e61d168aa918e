//! Demo job functions served by the stock worker binary.

use std::time::Duration;

use actors::{FnHandler, HandlerFuture, JobHandlerRegistry, Params, TypedHandler};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct AddParams {
    a: i64,
    b: i64,
}

#[derive(Debug, Deserialize)]
struct SleepParams {
    #[serde(default = "default_sleep_secs")]
    seconds: u64,
}

fn default_sleep_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
struct FailParams {
    #[serde(default = "default_fail")]
    fail: bool,
}

fn default_fail() -> bool {
    true
}

/// Registry with the `echo`, `add`, `sleep` and `fail` functions.
pub fn demo_handlers() -> JobHandlerRegistry {
    let mut handlers = JobHandlerRegistry::new();

    handlers
        .register(FnHandler::new("echo", |params: Params| -> HandlerFuture {
            Box::pin(async move {
                tracing::info!("Echo job: {:?}", params);
                Ok::<_, String>(Some(params))
            })
        }))
        .register(TypedHandler::new("add", |p: AddParams| -> HandlerFuture {
            Box::pin(async move {
                let sum = p.a.checked_add(p.b).ok_or_else(|| "sum overflows".to_string())?;
                Ok::<_, String>(result(json!({ "sum": sum })))
            })
        }))
        .register(TypedHandler::new("sleep", |p: SleepParams| -> HandlerFuture {
            Box::pin(async move {
                tracing::info!("Sleeping for {} seconds", p.seconds);
                tokio::time::sleep(Duration::from_secs(p.seconds)).await;
                Ok::<_, String>(result(json!({ "slept": p.seconds })))
            })
        }))
        // For exercising retries.
        .register(TypedHandler::new("fail", |p: FailParams| -> HandlerFuture {
            Box::pin(async move {
                if p.fail {
                    Err("Intentional failure".to_string())
                } else {
                    Ok::<_, String>(None)
                }
            })
        }));

    handlers
}

fn result(value: serde_json::Value) -> Option<Params> {
    match value {
        serde_json::Value::Object(map) => Some(map),
        _ => None,
    }
}
