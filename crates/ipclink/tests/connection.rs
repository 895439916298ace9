#![cfg(unix)]

use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ipclink::connection::{
    Connection, ConnectionBuilder, ConnectionConfig, ConnectionObserver, Endpoints, Message,
    Result, Stub,
};
use ipclink::demo::{
    DemoCatalog, DemoMessage, EchoStub, CLIENT_ENDPOINT, ECHO_REPLY, SERVER_ENDPOINT,
};
use ipclink::frame::{MessageHeader, PayloadWriter};
use ipclink::transport::{MessageBuffer, Transport, UnixTransport, MAX_SINGLE_TRANSFER_SIZE};

type DemoConnection = Connection<UnixTransport, DemoCatalog>;

fn client(transport: UnixTransport) -> DemoConnection {
    ConnectionBuilder::new(
        transport,
        DemoCatalog,
        Endpoints::new(CLIENT_ENDPOINT, SERVER_ENDPOINT),
    )
    .build()
    .expect("client connection should start")
}

/// Run a server connection on its own thread until the client goes away.
fn spawn_server<F>(transport: UnixTransport, stub: F) -> thread::JoinHandle<()>
where
    F: FnMut(DemoMessage) -> Result<Option<DemoMessage>> + Send + 'static,
{
    thread::spawn(move || {
        let mut connection = ConnectionBuilder::new(
            transport,
            DemoCatalog,
            Endpoints::new(SERVER_ENDPOINT, CLIENT_ENDPOINT),
        )
        .with_stub(stub)
        .build()
        .expect("server connection should start");
        connection.run();
    })
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn wire_frame(buffer: &MessageBuffer) -> Vec<u8> {
    let mut out = (buffer.data().len() as u32).to_ne_bytes().to_vec();
    out.extend_from_slice(buffer.data());
    out
}

fn echo(seq: u64, text: &str) -> DemoMessage {
    DemoMessage::Echo {
        seq,
        text: text.to_string(),
    }
}

#[test]
fn messages_arrive_in_posting_order() {
    let (client_side, server_side) = UnixTransport::pair().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let server = spawn_server(server_side, move |message| {
        if let DemoMessage::Echo { seq, .. } = message {
            recorder.lock().unwrap().push(seq);
        }
        Ok(None)
    });

    let connection = client(client_side);
    for seq in 0..50 {
        connection.post_message(&echo(seq, "ordered")).unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || {
        seen.lock().unwrap().len() == 50
    }));

    drop(connection);
    server.join().unwrap();
    assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
}

#[test]
fn echo_reply_through_blocking_wait() {
    let (client_side, server_side) = UnixTransport::pair().unwrap();
    let mut stub = EchoStub::default();
    let server = spawn_server(server_side, move |message| stub.handle(message));

    let mut connection = client(client_side);
    connection.post_message(&echo(11, "are you there")).unwrap();

    match connection.wait_for_specific_endpoint_message(SERVER_ENDPOINT, ECHO_REPLY) {
        Some(DemoMessage::EchoReply { seq, text }) => {
            assert_eq!(seq, 11);
            assert_eq!(text, "are you there");
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    drop(connection);
    server.join().unwrap();
}

#[test]
fn large_message_with_handle_is_reconstructed() {
    let (client_side, server_side) = UnixTransport::pair().unwrap();
    let (tx, rx) = mpsc::channel::<(usize, OwnedFd)>();
    let tx = Mutex::new(tx);
    let server = spawn_server(server_side, move |message| {
        if let DemoMessage::ShareHandle { note, handle } = message {
            tx.lock().unwrap().send((note.len(), handle)).unwrap();
        }
        Ok(None)
    });

    let (ours, theirs) = UnixStream::pair().unwrap();
    let note = "n".repeat(MAX_SINGLE_TRANSFER_SIZE * 3);
    let connection = client(client_side);
    connection
        .post_message(&DemoMessage::ShareHandle {
            note: note.clone(),
            handle: OwnedFd::from(theirs),
        })
        .unwrap();

    let (note_len, handle) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(note_len, note.len());

    // The received handle is the other end of our stream.
    let mut received = UnixStream::from(handle);
    received.write_all(b"through the handle").unwrap();
    let mut ours = ours;
    let mut buf = [0u8; 18];
    ours.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"through the handle");

    drop(connection);
    server.join().unwrap();
}

#[test]
fn concurrent_posters_deliver_each_message_once() {
    let (client_side, server_side) = UnixTransport::pair().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let server = spawn_server(server_side, move |message| {
        if let DemoMessage::Echo { seq, .. } = message {
            recorder.lock().unwrap().push(seq);
        }
        Ok(None)
    });

    let mut connection = client(client_side);
    let posters: Vec<_> = [vec![1u64, 2], vec![3]]
        .into_iter()
        .map(|seqs| {
            let sender = connection.sender();
            thread::spawn(move || {
                for seq in seqs {
                    sender.post_message(&echo(seq, "rapid")).unwrap();
                }
            })
        })
        .collect();
    for poster in posters {
        poster.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || {
        connection.send_stats().transferred == 3
    }));
    assert_eq!(connection.send_stats().processed(), 3);

    // Drain the server's acknowledgements until nothing is outstanding.
    let deadline = Instant::now() + Duration::from_secs(5);
    while connection.pending_acknowledgements() > 0 && Instant::now() < deadline {
        connection.transport().wait_until_readable();
        connection.drain_messages_from_peer().unwrap();
    }
    assert_eq!(connection.pending_acknowledgements(), 0);

    assert!(wait_until(Duration::from_secs(5), || {
        seen.lock().unwrap().len() == 3
    }));
    let mut seqs = seen.lock().unwrap().clone();
    seqs.sort_unstable();
    assert_eq!(seqs, vec![1, 2, 3]);

    drop(connection);
    server.join().unwrap();
}

#[test]
fn reply_behind_malformed_frame_ends_the_wait() {
    let (ours, mut peer) = UnixStream::pair().unwrap();
    let mut connection = client(UnixTransport::new(ours));

    let mut unknown = PayloadWriter::new(MessageHeader::new(SERVER_ENDPOINT, 42));
    unknown.put_u32(7);
    let reply = DemoMessage::EchoReply {
        seq: 9,
        text: "behind the bad one".to_string(),
    };
    let mut bytes = wire_frame(&unknown.finish());
    bytes.extend(wire_frame(&reply.encode().unwrap()));
    peer.write_all(&bytes).unwrap();

    // Closing the transport releases the wait if the reply is never seen.
    let (disarm, armed) = mpsc::channel::<()>();
    let transport = Arc::clone(connection.transport());
    let watchdog = thread::spawn(move || {
        if armed.recv_timeout(Duration::from_secs(2)).is_err() {
            transport.close();
        }
    });

    let received = connection.wait_for_specific_endpoint_message(SERVER_ENDPOINT, ECHO_REPLY);
    let _ = disarm.send(());
    watchdog.join().unwrap();

    match received {
        Some(DemoMessage::EchoReply { seq, text }) => {
            assert_eq!(seq, 9);
            assert_eq!(text, "behind the bad one");
        }
        other => panic!("unexpected reply: {other:?}"),
    }
    assert!(connection.is_open());
}

#[test]
fn wait_returns_none_when_peer_closes() {
    let (client_side, server_side) = UnixTransport::pair().unwrap();
    let mut connection = client(client_side);
    drop(server_side);

    assert!(connection
        .wait_for_specific_endpoint_message(SERVER_ENDPOINT, ECHO_REPLY)
        .is_none());
    connection.process_deferred();
    assert!(!connection.is_open());
}

#[derive(Default)]
struct CountingObserver {
    unresponsive: AtomicUsize,
}

impl ConnectionObserver for CountingObserver {
    fn may_have_become_unresponsive(&self) {
        self.unresponsive.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn silent_peer_is_reported_unresponsive() {
    let (client_side, _silent_server) = UnixTransport::pair().unwrap();
    let observer = Arc::new(CountingObserver::default());
    let connection = ConnectionBuilder::new(
        client_side,
        DemoCatalog,
        Endpoints::new(CLIENT_ENDPOINT, SERVER_ENDPOINT),
    )
    .with_observer(observer.clone())
    .with_config(ConnectionConfig {
        responsiveness_timeout: Duration::from_millis(30),
    })
    .build()
    .unwrap();

    connection.post_message(&echo(1, "anyone?")).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        observer.unresponsive.load(Ordering::SeqCst) == 1
    }));
}
