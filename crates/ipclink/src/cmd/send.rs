use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ipclink::demo::{DemoCatalog, DemoMessage, CLIENT_ENDPOINT, ECHO_REPLY, SERVER_ENDPOINT};
use ipclink_connection::{ConnectionBuilder, Endpoints};
use ipclink_transport::{Transport, UnixDomainSocket, UnixTransport};

use crate::cmd::{LoggingObserver, SendArgs};
use crate::exit::{
    connection_error, transport_error, CliError, CliResult, DATA_INVALID, FAILURE, SUCCESS,
    TIMEOUT, USAGE,
};
use crate::output::{print_replies, OutputFormat, ReplyRecord};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    if args.count == 0 {
        return Err(CliError::new(USAGE, "--count must be greater than zero"));
    }

    let transport =
        UnixDomainSocket::connect(&args.path).map_err(|err| transport_error("connect failed", err))?;
    let mut connection = ConnectionBuilder::new(
        transport,
        DemoCatalog,
        Endpoints::new(CLIENT_ENDPOINT, SERVER_ENDPOINT),
    )
    .with_observer(Arc::new(LoggingObserver { role: "client" }))
    .build()
    .map_err(|err| connection_error("connection setup failed", err))?;

    let watchdog = Watchdog::arm(Arc::clone(connection.transport()), timeout);
    let mut replies = Vec::new();

    for seq in 0..args.count {
        let started = Instant::now();
        connection
            .post_message(&DemoMessage::Echo {
                seq,
                text: args.text.clone(),
            })
            .map_err(|err| connection_error("send failed", err))?;

        let reply = match connection.wait_for_specific_endpoint_message(SERVER_ENDPOINT, ECHO_REPLY)
        {
            Some(DemoMessage::EchoReply { seq, text }) => ReplyRecord {
                seq,
                text,
                round_trip_ms: started.elapsed().as_secs_f64() * 1000.0,
            },
            Some(other) => {
                return Err(CliError::new(
                    DATA_INVALID,
                    format!("unexpected reply: {other:?}"),
                ))
            }
            None if watchdog.fired() => {
                return Err(CliError::new(
                    TIMEOUT,
                    format!("no reply within {}", args.timeout),
                ))
            }
            None => {
                return Err(CliError::new(
                    FAILURE,
                    "connection closed before the reply arrived",
                ))
            }
        };

        if reply.seq != seq {
            return Err(CliError::new(
                DATA_INVALID,
                format!("reply for request {} while waiting for {seq}", reply.seq),
            ));
        }
        replies.push(reply);
    }

    watchdog.disarm();
    print_replies(&replies, format);
    Ok(SUCCESS)
}

/// Closes the transport if the exchange outlives its deadline, which
/// releases a blocked wait.
struct Watchdog {
    done: mpsc::Sender<()>,
    fired: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl Watchdog {
    fn arm(transport: Arc<UnixTransport>, timeout: Duration) -> Self {
        let (done, finished) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let handle = thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = finished.recv_timeout(timeout) {
                flag.store(true, Ordering::SeqCst);
                transport.close();
            }
        });
        Self {
            done,
            fired,
            handle,
        }
    }

    fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    fn disarm(self) {
        let _ = self.done.send(());
        let _ = self.handle.join();
    }
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn watchdog_closes_transport_after_deadline() {
        let (client, _server) = UnixTransport::pair().unwrap();
        let client = Arc::new(client);
        let watchdog = Watchdog::arm(Arc::clone(&client), Duration::from_millis(20));

        thread::sleep(Duration::from_millis(200));
        assert!(watchdog.fired());
        assert!(!client.is_open());
        watchdog.disarm();
    }

    #[test]
    fn disarmed_watchdog_leaves_transport_open() {
        let (client, _server) = UnixTransport::pair().unwrap();
        let client = Arc::new(client);
        let watchdog = Watchdog::arm(Arc::clone(&client), Duration::from_secs(60));
        watchdog.disarm();
        assert!(client.is_open());
    }
}
