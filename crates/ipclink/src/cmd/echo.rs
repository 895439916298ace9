use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ipclink::demo::{DemoCatalog, EchoStub, CLIENT_ENDPOINT, SERVER_ENDPOINT};
use ipclink_connection::{ConnectionBuilder, Endpoints};
use ipclink_transport::UnixDomainSocket;

use crate::cmd::{EchoArgs, LoggingObserver};
use crate::exit::{connection_error, transport_error, CliError, CliResult, SUCCESS};
use crate::output::OutputFormat;

pub fn run(args: EchoArgs, _format: OutputFormat) -> CliResult<i32> {
    let listener =
        UnixDomainSocket::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;
    tracing::info!(path = %listener.path().display(), "echo server listening");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let observer = Arc::new(LoggingObserver { role: "server" });
    let mut served = 0usize;

    while running.load(Ordering::SeqCst) {
        if args.clients.is_some_and(|limit| served >= limit) {
            break;
        }

        let transport = listener
            .accept()
            .map_err(|err| transport_error("accept failed", err))?;

        let mut connection = ConnectionBuilder::new(
            transport,
            DemoCatalog,
            Endpoints::new(SERVER_ENDPOINT, CLIENT_ENDPOINT),
        )
        .with_stub(EchoStub::default())
        .with_observer(observer.clone())
        .build()
        .map_err(|err| connection_error("connection setup failed", err))?;

        tracing::info!(client = served + 1, "client connected");
        connection.run();

        let stats = connection.send_stats();
        tracing::info!(
            client = served + 1,
            transferred = stats.transferred,
            failed = stats.failed,
            "client disconnected"
        );
        served += 1;
    }

    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
