//! Typed schemas at the facade: schemas generated from Rust types gate
//! enqueue, and handlers deserialize the same types back out of the input.

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

use keel::{declare, Config, CoreError, HandlerError, Runtime, WorkflowKind};

#[derive(Debug, Deserialize, JsonSchema)]
struct OrderInput {
    sku: String,
    quantity: i64,
}

fn fast_config() -> Config {
    Config {
        worker_id: "it-worker".into(),
        slots: 4,
        durable_slots: 8,
        poll_interval_ms: 5,
        lease_secs: 5,
        wakeup_interval_ms: 5,
    }
}

#[tokio::test]
async fn typed_schema_gates_enqueue_and_feeds_the_handler() {
    let price = declare(WorkflowKind::Tool, "price")
        .input_type::<OrderInput>()
        .output_type::<i64>()
        .tool(|ctx| async move {
            let order: OrderInput = ctx
                .input_as()
                .map_err(|e| HandlerError::failed(e.to_string()))?;
            Ok(json!(order.quantity * order.sku.len() as i64))
        })
        .build()
        .unwrap();

    let runtime = Runtime::builder()
        .config(fast_config())
        .declare(price)
        .unwrap()
        .build();
    runtime.start();
    let client = runtime.client();

    let out = client
        .run("price", json!({"sku": "ab", "quantity": 3}), Default::default())
        .await
        .unwrap();
    assert_eq!(out, json!(6));

    // A payload the generated schema rejects never reaches a worker.
    let err = client
        .run("price", json!({"sku": "ab"}), Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput { .. }));

    let err = client
        .run(
            "price",
            json!({"sku": "ab", "quantity": "three"}),
            Default::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput { .. }));

    runtime.shutdown();
}
