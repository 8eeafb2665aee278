//! Echo Server - serve a small service tree over WebSocket.
//!
//! This example demonstrates:
//! - Loading a `Config` (from a JSON file when a path is given)
//! - Mounting typed and dynamic echoes
//! - Printing the exported schema and periodic per-echo stats
//!
//! # Running
//!
//! ```text
//! cargo run --example echo_server -- [config.json]
//! cargo run --example echo_client
//! ```

use std::sync::Arc;
use std::time::Duration;

use echowire::codec::{RpcMap, Value};
use echowire::config::Config;
use echowire::handler::{Context, Registry};
use echowire::transport::Server;

const ADDR: &str = "127.0.0.1:8080";

fn build_registry(config: &Config) -> echowire::Result<Registry> {
    let mut registry = Registry::from_config(config);

    let user = registry.add_service("$", "user")?;
    registry.add_echo(&user, "sayHello", true, |ctx: &mut Context, name: String| {
        if name.is_empty() {
            return ctx.error("name is empty");
        }
        ctx.ok(format!("hello {}", name))
    })?;

    let math = registry.add_service("$", "math")?;
    registry.add_echo(&math, "div", true, |ctx: &mut Context, a: f64, b: f64| {
        if b == 0.0 {
            return ctx.error("division by zero");
        }
        ctx.ok(a / b)
    })?;

    // Dynamic echo: the handler sees decoded values
    registry
        .echo(&math, "describe")
        .arg_array()
        .build(|ctx, args| {
            let Some(items) = args[0].as_array() else {
                return ctx.error("expected an array");
            };
            let mut out = RpcMap::new();
            let values: Vec<Value> = items.values().collect();
            let ints: Vec<i64> = values.iter().filter_map(Value::as_i64).collect();
            if out.set("count", &(values.len() as u64)).is_err()
                || out.set("sum", &ints.iter().sum::<i64>()).is_err()
            {
                return ctx.error("encode failed");
            }
            ctx.ok(out)
        })?;

    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::default().with_workers_per_slot(256),
    };
    echowire::logging::init(config.log_level);

    let registry = build_registry(&config)?;
    println!("{}", serde_json::to_string_pretty(&registry.schema())?);

    let server = Arc::new(Server::new(registry, config)?);

    let reporter = server.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            match reporter.processor().stats_json() {
                Ok(json) => tracing::info!("stats: {}", json),
                Err(e) => tracing::warn!("stats unavailable: {}", e),
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(ADDR).await?;
    server.serve(listener).await?;
    Ok(())
}
