//! Echo Client - call the echoes mounted by `echo_server`.
//!
//! Start the server first:
//!
//! ```text
//! cargo run --example echo_server
//! cargo run --example echo_client
//! ```

use std::time::Duration;

use echowire::codec::{RpcArray, Value};
use echowire::transport::Client;
use echowire::EchowireError;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::connect("ws://127.0.0.1:8080")
        .await?
        .with_origin("echo_client")
        .with_timeout(Duration::from_secs(5));

    let hello = client.call("$.user:sayHello", &[Value::from("world")]).await?;
    println!("sayHello -> {:?}", hello);

    let ratio = client
        .call("$.math:div", &[Value::Float(1.0), Value::Float(4.0)])
        .await?;
    println!("div -> {:?}", ratio);

    // Handler errors come back as EchowireError::Rpc
    match client
        .call("$.math:div", &[Value::Float(1.0), Value::Float(0.0)])
        .await
    {
        Err(EchowireError::Rpc(e)) => println!("div by zero -> {}", e.message),
        other => println!("div by zero -> unexpected {:?}", other),
    }

    let items = RpcArray::try_from_iter([Value::Int(3), Value::from("x"), Value::Int(4)])?;
    let summary = client
        .call("$.math:describe", &[Value::Array(items)])
        .await?;
    println!("describe -> {:?}", summary);

    Ok(())
}
