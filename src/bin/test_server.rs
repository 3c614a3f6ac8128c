use anyhow::Result;
use krpc_prototype::{ServerConfig, TestServer, init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let address = std::env::var("ADDRESS").unwrap_or_else(|_| "127.0.0.1".to_string());
    let rpc_port = std::env::var("RPC_PORT").unwrap_or_else(|_| "50000".to_string());
    let stream_port = std::env::var("STREAM_PORT").unwrap_or_else(|_| "50001".to_string());

    let config = ServerConfig::builder()
        .address(address.parse()?)
        .rpc_port(rpc_port.parse()?)
        .stream_port(stream_port.parse()?)
        .build();

    let server = TestServer::bind(config).await?;
    println!(
        "Test server listening: rpc on {}, streams on {}",
        server.rpc_addr(),
        server.stream_addr()
    );

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    Ok(())
}
