//! Echo over a socket pair, both sides in one process.
//!
//! Run with:
//!   cargo run --example echo-pair
//!
//! The server runs its I/O loop on a thread; the client posts a few echo
//! requests, one of them large enough to be wrapped, and waits for each reply.

use std::thread;

use ipclink::connection::{ConnectionBuilder, Endpoints};
use ipclink::demo::{DemoCatalog, DemoMessage, EchoStub, CLIENT_ENDPOINT, ECHO_REPLY, SERVER_ENDPOINT};
use ipclink::transport::{UnixTransport, MAX_SINGLE_TRANSFER_SIZE};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (client_side, server_side) = UnixTransport::pair()?;

    let server = thread::spawn(move || -> Result<u64, ipclink::connection::ConnectionError> {
        let mut connection = ConnectionBuilder::new(
            server_side,
            DemoCatalog,
            Endpoints::new(SERVER_ENDPOINT, CLIENT_ENDPOINT),
        )
        .with_stub(EchoStub::default())
        .build()?;
        connection.run();
        Ok(connection.send_stats().transferred)
    });

    let mut client = ConnectionBuilder::new(
        client_side,
        DemoCatalog,
        Endpoints::new(CLIENT_ENDPOINT, SERVER_ENDPOINT),
    )
    .build()?;

    let texts = [
        "hello".to_string(),
        "x".repeat(MAX_SINGLE_TRANSFER_SIZE * 2),
        "bye".to_string(),
    ];
    for (seq, text) in texts.into_iter().enumerate() {
        client.post_message(&DemoMessage::Echo {
            seq: seq as u64,
            text,
        })?;
        match client.wait_for_specific_endpoint_message(SERVER_ENDPOINT, ECHO_REPLY) {
            Some(DemoMessage::EchoReply { seq, text }) => {
                eprintln!("reply {seq}: {} bytes", text.len());
            }
            other => {
                eprintln!("no reply: {other:?}");
                break;
            }
        }
    }

    drop(client);
    let transferred = server
        .join()
        .map_err(|_| "server thread panicked")??;
    eprintln!("server transferred {transferred} messages");
    Ok(())
}
