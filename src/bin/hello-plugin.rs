//! Demo plugin exposing `hello`, `invocations` and `fail`.
//!
//! Set `HELLO_PLUGIN_EXIT_AFTER_MS` to make the plugin stop serving on its own
//! after that many milliseconds.

use anyhow::anyhow;
use procplug::plugin::{CallContext, FunctionEndpoint, PluginServer};
use procplug::schema::Validator;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const EXIT_AFTER_ENV: &str = "HELLO_PLUGIN_EXIT_AFTER_MS";

#[derive(Debug, Deserialize, JsonSchema)]
struct HelloInput {
    #[schemars(length(min = 3))]
    name: String,
}

#[derive(Debug, Serialize, JsonSchema)]
struct HelloOutput {
    greeting: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct Empty {}

#[derive(Debug, Serialize, JsonSchema)]
struct Invocations {
    /// Times the `hello` function body has run
    count: u64,
}

fn functions(server: &mut PluginServer) -> anyhow::Result<()> {
    let invocations = Arc::new(AtomicU64::new(0));

    let counter = invocations.clone();
    server.register_function(
        "hello",
        FunctionEndpoint::new(
            move |_context: CallContext, input: HelloInput| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok::<_, anyhow::Error>(HelloOutput {
                        greeting: format!("hello, {}!", input.name),
                    })
                }
            },
            Some(Validator::new()?),
        ),
    );

    server.register_function(
        "invocations",
        FunctionEndpoint::new(
            move |_context: CallContext, _input: Empty| {
                let count = invocations.load(Ordering::SeqCst);
                async move { Ok::<_, anyhow::Error>(Invocations { count }) }
            },
            None,
        ),
    );

    server.register_function(
        "fail",
        FunctionEndpoint::new(
            |_context: CallContext, _input: Empty| async {
                Err::<Invocations, _>(anyhow!("this function always fails"))
            },
            None,
        ),
    );

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    procplug::logging::init_for_plugin();

    let mut server = PluginServer::new();
    functions(&mut server)?;
    let server = Arc::new(server);

    if let Some(exit_after) = std::env::var(EXIT_AFTER_ENV)
        .ok()
        .and_then(|ms| ms.parse::<u64>().ok())
    {
        let server = server.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(exit_after)).await;
            info!(exit_after_ms = exit_after, "Stopping on schedule");
            server.stop();
        });
    }

    server.start().await?;
    Ok(())
}
