//! Integration tests for calling functions in the bundled hello plugin.

use procplug::{Client, ClientConfig, Connection, FunctionStub};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Serialize)]
struct HelloInput {
    name: String,
}

#[derive(Debug, Deserialize, PartialEq)]
struct HelloOutput {
    greeting: String,
}

#[derive(Debug, Deserialize)]
struct Invocations {
    count: u64,
}

async fn open_hello() -> Client {
    let client = Client::new(ClientConfig::new(env!("CARGO_BIN_EXE_hello-plugin")));
    client.open(CancellationToken::new()).await.unwrap();
    client
}

fn hello_stub(client: &Client) -> FunctionStub<HelloInput, HelloOutput> {
    FunctionStub::new("hello", &client.connection().unwrap()).unwrap()
}

async fn invocation_count(client: &Client) -> u64 {
    let stub: FunctionStub<Value, Invocations> =
        FunctionStub::new("invocations", &client.connection().unwrap()).unwrap();
    stub.call(&json!({})).await.unwrap().count
}

#[tokio::test]
async fn test_hello_round_trip() {
    let client = open_hello().await;

    let output = hello_stub(&client)
        .call(&HelloInput {
            name: "world".into(),
        })
        .await
        .unwrap();
    assert_eq!(
        output,
        HelloOutput {
            greeting: "hello, world!".into()
        }
    );
    assert_eq!(invocation_count(&client).await, 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_invalid_input_never_reaches_function() {
    let client = open_hello().await;

    let err = hello_stub(&client)
        .call(&HelloInput {
            name: String::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(400));
    assert!(err.to_string().contains("invalid input"), "{err}");
    assert_eq!(invocation_count(&client).await, 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_fields_are_rejected() {
    let client = open_hello().await;
    let stub: FunctionStub<Value, Value> =
        FunctionStub::new("hello", &client.connection().unwrap()).unwrap();

    let err = stub
        .call(&json!({"name": "world", "shout": true}))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(400));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_function_error_is_500() {
    let client = open_hello().await;
    let stub: FunctionStub<Value, Value> =
        FunctionStub::new("fail", &client.connection().unwrap()).unwrap();

    let err = stub.call(&json!({})).await.unwrap_err();
    assert_eq!(err.status(), Some(500));
    assert!(err.to_string().contains("always fails"), "{err}");

    // The failure is local to the call
    assert_eq!(invocation_count(&client).await, 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_function_is_404() {
    let client = open_hello().await;
    let stub: FunctionStub<Value, Value> =
        FunctionStub::new("goodbye", &client.connection().unwrap()).unwrap();

    let err = stub.call(&json!({})).await.unwrap_err();
    assert_eq!(err.status(), Some(404));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_schemas_lists_every_function() {
    let client = open_hello().await;

    let schemas = client.schemas().await.unwrap();
    let mut names: Vec<_> = schemas.keys().cloned().collect();
    names.sort();
    assert_eq!(names, vec!["fail", "hello", "invocations"]);
    assert_eq!(schemas["hello"].input["properties"]["name"]["minLength"], 3);
    assert_eq!(
        schemas["hello"].output["properties"]["greeting"]["type"],
        "string"
    );

    let single = hello_stub(&client).schema().await.unwrap();
    assert_eq!(single, schemas["hello"]);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_calls_after_close_fail() {
    let client = open_hello().await;
    let stub = hello_stub(&client);

    client.close().await.unwrap();

    let err = stub
        .call(&HelloInput {
            name: "world".into(),
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("closed"), "{err}");
    assert!(client.schemas().await.is_err());
}

#[tokio::test]
async fn test_unreachable_connection_fails_cleanly() {
    let connection = Arc::new(Connection::new(
        Url::parse("http://127.0.0.1:9").unwrap(),
        Duration::from_secs(1),
    ));
    let stub: FunctionStub<HelloInput, HelloOutput> =
        FunctionStub::new("hello", &connection).unwrap();

    let err = stub
        .call(&HelloInput {
            name: "world".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.function, "hello");
    assert_eq!(err.status(), None);
}

#[tokio::test]
async fn test_concurrent_calls_share_connection() {
    let client = open_hello().await;
    let stub = Arc::new(hello_stub(&client));

    let calls: Vec<_> = (0..8)
        .map(|i| {
            let stub = stub.clone();
            tokio::spawn(async move {
                stub.call(&HelloInput {
                    name: format!("caller-{i}"),
                })
                .await
            })
        })
        .collect();

    for (i, call) in calls.into_iter().enumerate() {
        let output = call.await.unwrap().unwrap();
        assert_eq!(output.greeting, format!("hello, caller-{i}!"));
    }
    assert_eq!(invocation_count(&client).await, 8);

    client.close().await.unwrap();
}
