//! Connection handling for the command server.
//!
//! Every accepted connection runs on its own task, tracked by a
//! [`TaskTracker`] so shutdown can wait for in-flight requests. A connection
//! loops over read request, serve, write reply until the peer hangs up, a
//! framing error occurs, or shutdown is signalled between two requests.
//!
//! A panic while serving a connection is contained to that connection: it is
//! logged with the backtrace captured at the panic site, the peer gets a
//! best-effort `-ERROR` reply, and the socket is closed.

use crate::server::{
    resp::{error::ProtocolError, handler::ServeRequest, reply::Reply, request::read_request},
    telemetry::{decrement_connections_open, increment_connections_open},
};
use bytes::BytesMut;
use core::panic::AssertUnwindSafe;
use core::time::Duration;
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::Cell;
use std::panic;
use std::sync::{Arc, Once};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

thread_local! {
    static PANIC_BACKTRACE: Cell<Option<Backtrace>> = const { Cell::new(None) };
}

/// Chains a panic hook that records the backtrace of the latest panic on
/// the panicking thread. The previously installed hook still runs.
pub fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            PANIC_BACKTRACE.with(|slot| slot.set(Some(Backtrace::force_capture())));
            previous(info);
        }));
    });
}

// `catch_unwind` returns on the thread that panicked, so this must run before
// the task next yields.
fn take_panic_backtrace() -> Option<Backtrace> {
    PANIC_BACKTRACE.with(Cell::take)
}

/// Accepts connections until `shutdown` is cancelled, then waits up to
/// `drain_timeout` for open connections to finish.
pub async fn serve<H>(
    listener: TcpListener,
    handler: Arc<H>,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) where
    H: ServeRequest,
{
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _peer)) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("accepted connection from {_peer}");
                    let _ = stream.set_nodelay(true);
                    let handler = Arc::clone(&handler);
                    let shutdown = shutdown.clone();
                    tracker.spawn(serve_connection(stream, handler, shutdown));
                }
                Err(_e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    #[cfg(feature = "tracing")]
                    tracing::error!("accept failed: {_e}");
                    sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }

    drop(listener);
    tracker.close();

    #[cfg(feature = "tracing")]
    tracing::info!("Draining {} open connections", tracker.len());

    match timeout(drain_timeout, tracker.wait()).await {
        Ok(()) => {
            #[cfg(feature = "tracing")]
            tracing::debug!("All connections drained");
        }
        Err(_) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "Connection drain timed out ({} still open)",
                tracker.len()
            );
        }
    }
}

/// Serves one connection to completion, containing any panic.
pub async fn serve_connection<IO, H>(mut io: IO, handler: Arc<H>, shutdown: CancellationToken)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
    H: ServeRequest,
{
    install_panic_hook();
    increment_connections_open();

    let outcome = AssertUnwindSafe(run_connection(&mut io, &*handler, &shutdown))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(_e)) => {
            #[cfg(feature = "tracing")]
            tracing::debug!("closing connection: {_e}");
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            let _backtrace = take_panic_backtrace();
            #[cfg(feature = "tracing")]
            match &_backtrace {
                Some(backtrace) => tracing::error!(
                    panic = %message,
                    %backtrace,
                    "connection handler panicked"
                ),
                None => tracing::error!(panic = %message, "connection handler panicked"),
            }
            let _ = io.write_all(&Reply::error(message).to_bytes()).await;
        }
    }

    let _ = io.shutdown().await;
    decrement_connections_open();
}

async fn run_connection<IO, H>(
    io: &mut IO,
    handler: &H,
    shutdown: &CancellationToken,
) -> Result<(), ProtocolError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    H: ServeRequest,
{
    let mut stream = BufReader::new(io);
    let mut out = BytesMut::with_capacity(64);

    loop {
        let request = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            request = read_request(&mut stream) => request?,
        };
        let Some(request) = request else {
            return Ok(());
        };

        handler.serve(request).await.encode(&mut out);
        stream.write_all(&out).await?;
        out.clear();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "internal server error".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::resp::{handler::CommandHandler, request::Request};
    use segid::{Manager, ManagerConfig, MemoryStore};
    use tokio::io::{AsyncReadExt, duplex};
    use tokio::net::TcpStream;

    fn command_handler(batch: i64) -> Arc<CommandHandler<MemoryStore>> {
        let manager = Manager::new(
            Arc::new(MemoryStore::new()),
            ManagerConfig::default().with_batch_size(batch),
        );
        Arc::new(CommandHandler::new(Arc::new(manager)))
    }

    fn encode(argv: &[&str]) -> Vec<u8> {
        let mut wire = format!("*{}\r\n", argv.len()).into_bytes();
        for arg in argv {
            wire.extend_from_slice(format!("${}\r\n{arg}\r\n", arg.len()).as_bytes());
        }
        wire
    }

    async fn roundtrip(client: &mut TcpStream, argv: &[&str], expected: &str) {
        client.write_all(&encode(argv)).await.unwrap();
        let mut reply = vec![0; expected.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&reply), expected, "{argv:?}");
    }

    async fn start(
        batch: i64,
    ) -> (
        std::net::SocketAddr,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(
            listener,
            command_handler(batch),
            shutdown.clone(),
            Duration::from_secs(1),
        ));
        (addr, shutdown, task)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn end_to_end_scenarios() {
        let (addr, shutdown, task) = start(10).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        roundtrip(&mut client, &["SELECT", "0"], "+OK\r\n").await;
        roundtrip(&mut client, &["SET", "svc", "1", "false"], "+OK\r\n").await;
        roundtrip(&mut client, &["GET", "svc"], "$1\r\n2\r\n").await;
        roundtrip(&mut client, &["GET", "svc"], "$1\r\n3\r\n").await;

        roundtrip(&mut client, &["SET", "other", "50"], "+OK\r\n").await;
        roundtrip(&mut client, &["SET", "other", "100", "false"], "+OK\r\n").await;
        roundtrip(&mut client, &["GET", "other"], "$2\r\n51\r\n").await;
        roundtrip(&mut client, &["SET", "other", "100", "true"], "+OK\r\n").await;
        roundtrip(&mut client, &["GET", "other"], "$3\r\n101\r\n").await;

        roundtrip(&mut client, &["EXISTS", "missing"], ":0\r\n").await;
        roundtrip(
            &mut client,
            &["DEL", "missing"],
            "-ERROR service name not exists\r\n",
        )
        .await;

        roundtrip(&mut client, &["DEL", "svc"], ":1\r\n").await;
        roundtrip(&mut client, &["EXISTS", "svc"], ":0\r\n").await;
        roundtrip(&mut client, &["GET", "svc"], "$-1\r\n").await;
        roundtrip(
            &mut client,
            &["PING"],
            "-ERROR Method is not supported. allow: GET,SET,DEL,EXISTS,SELECT\r\n",
        )
        .await;

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_connections_share_the_allocator() {
        let (addr, shutdown, task) = start(10).await;
        let mut setup = TcpStream::connect(addr).await.unwrap();
        roundtrip(&mut setup, &["SET", "svc", "0"], "+OK\r\n").await;

        let clients: Vec<_> = (0..50)
            .map(|_| {
                tokio::spawn(async move {
                    let mut client = TcpStream::connect(addr).await.unwrap();
                    client.write_all(&encode(&["GET", "svc"])).await.unwrap();
                    client.shutdown().await.unwrap();
                    let mut reply = String::new();
                    client.read_to_string(&mut reply).await.unwrap();
                    reply.lines().nth(1).unwrap().parse::<i64>().unwrap()
                })
            })
            .collect();

        let mut ids = Vec::new();
        for client in clients {
            ids.push(client.await.unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=50).collect::<Vec<i64>>());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn framing_error_closes_without_reply() {
        let (mut client, server) = duplex(1024);
        let conn = tokio::spawn(serve_connection(
            server,
            command_handler(10),
            CancellationToken::new(),
        ));

        client.write_all(b"*1\r\n$3\r\nGETX\r\n").await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        conn.await.unwrap();
    }

    #[tokio::test]
    async fn pipelined_requests_get_ordered_replies() {
        let (mut client, server) = duplex(1024);
        let conn = tokio::spawn(serve_connection(
            server,
            command_handler(10),
            CancellationToken::new(),
        ));

        let mut wire = encode(&["SET", "svc", "7"]);
        wire.extend(encode(&["GET", "svc"]));
        wire.extend(encode(&["EXISTS", "svc"]));
        client.write_all(&wire).await.unwrap();
        client.shutdown().await.unwrap();

        let mut replies = String::new();
        client.read_to_string(&mut replies).await.unwrap();
        assert_eq!(replies, "+OK\r\n$1\r\n8\r\n:1\r\n");
        conn.await.unwrap();
    }

    struct Panicking;

    impl ServeRequest for Panicking {
        async fn serve(&self, request: Request) -> Reply {
            if request.command == "BOOM" {
                panic!("handler exploded");
            }
            crate::server::resp::reply::OK
        }
    }

    #[tokio::test]
    async fn panics_are_contained_to_the_connection() {
        let handler = Arc::new(Panicking);

        let (mut client, server) = duplex(1024);
        let conn = tokio::spawn(serve_connection(
            server,
            Arc::clone(&handler),
            CancellationToken::new(),
        ));
        let mut wire = encode(&["SELECT", "0"]);
        wire.extend(encode(&["BOOM"]));
        client.write_all(&wire).await.unwrap();

        let mut replies = String::new();
        client.read_to_string(&mut replies).await.unwrap();
        assert_eq!(replies, "+OK\r\n-ERROR handler exploded\r\n");
        conn.await.unwrap();
        // The current-thread runtime ran the connection here; logging took it.
        assert!(take_panic_backtrace().is_none());

        // Other connections keep working.
        let (mut client, server) = duplex(1024);
        let conn = tokio::spawn(serve_connection(server, handler, CancellationToken::new()));
        client.write_all(&encode(&["SELECT", "1"])).await.unwrap();
        client.shutdown().await.unwrap();
        let mut replies = String::new();
        client.read_to_string(&mut replies).await.unwrap();
        assert_eq!(replies, "+OK\r\n");
        conn.await.unwrap();
    }

    #[test]
    fn panic_hook_records_the_backtrace() {
        install_panic_hook();
        let result = panic::catch_unwind::<_, ()>(|| panic!("kaboom"));
        assert!(result.is_err());
        assert!(take_panic_backtrace().is_some());
        assert!(take_panic_backtrace().is_none());

        // Other threads keep their own slot.
        std::thread::spawn(|| assert!(take_panic_backtrace().is_none()))
            .join()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_idle_connections() {
        let (addr, shutdown, task) = start(10).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        roundtrip(&mut client, &["SELECT", "0"], "+OK\r\n").await;

        shutdown.cancel();
        task.await.unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
