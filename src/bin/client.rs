use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use krpc_lite::codec::WireValue;
use krpc_lite::schema::ProcedureCall;
use krpc_lite::{Connection, ConnectionConfig};
use krpc_prototype::init_tracing;

fn main() -> Result<()> {
    init_tracing();

    let address = std::env::var("ADDRESS").unwrap_or_else(|_| "127.0.0.1".to_string());
    let rpc_port = std::env::var("RPC_PORT").unwrap_or_else(|_| "50000".to_string());
    let stream_port = std::env::var("STREAM_PORT").unwrap_or_else(|_| "50001".to_string());
    let name = std::env::var("CLIENT_NAME").unwrap_or_else(|_| "krpc-client".to_string());

    let config = ConnectionConfig::new(name)
        .with_address(address)
        .with_rpc_port(rpc_port.parse()?)
        .with_stream_port(stream_port.parse()?);
    let mut connection = Connection::connect(config)?;
    println!("Connected as {}", connection.client_id());

    let value = connection.invoke("TestService", "Int32ToString", [42i32.to_bytes()])?;
    println!("Int32ToString(42) = {:?}", String::decode(&value)?);

    let counter = connection.add_stream(ProcedureCall::new("TestService", "Counter", []))?;
    let (tx, rx) = mpsc::channel();
    counter.add_callback(move |update| {
        if let Ok(value) = update.map(|value| i32::decode(value)) {
            let _ = tx.send(value);
        }
    })?;
    counter.set_rate(10.0)?;
    counter.start_and_wait(Duration::from_secs(2))?;

    for _ in 0..5 {
        match rx.recv_timeout(Duration::from_secs(2))? {
            Ok(value) => println!("Counter = {value}"),
            Err(e) => println!("Counter sent an undecodable value: {e}"),
        }
    }

    connection.freeze_streams()?;
    let frozen = counter.get::<i32>()?;
    thread::sleep(Duration::from_millis(300));
    println!("While frozen: {frozen} -> {}", counter.get::<i32>()?);
    connection.thaw_streams()?;

    counter.wait(Some(Duration::from_secs(2)))?;
    println!("After thaw: {}", counter.get::<i32>()?);

    counter.remove()?;
    connection.close();
    println!("Disconnected");
    Ok(())
}
