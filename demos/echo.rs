//! Record-echo server demonstration.
//!
//! Listens for 12-byte packed `{len, id, age}` records, logs them, and
//! replies with a greeting. Runs the full stack: a listening socket, a
//! master dispatcher with two slave I/O loops, an adaptive thread pool
//! with the load monitor enabled, and the notification center driving a
//! user handler. All knobs (pool sizing, event batch, listen backlog) are
//! read through the `config` crate and can be overridden with `ECHO_*`
//! environment variables, e.g. `ECHO_LISTEN_BACKLOG=128`.
//!
//! Usage: `echo [port]` (defaults to 9090). Exercise it with e.g.
//! `printf '\x0c\x00\x00\x00\x07\x00\x00\x00\x18\x00\x00\x00' | nc 127.0.0.1 9090`.

use reactor_net::prelude::*;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

#[derive(Debug)]
struct Person {
    len: i32,
    id: i32,
    age: i32,
}

fn parse_person(bytes: &[u8]) -> Option<Person> {
    if bytes.len() < 12 {
        return None;
    }
    let field = |i: usize| i32::from_le_bytes(bytes[i..i + 4].try_into().unwrap());
    Some(Person {
        len: field(0),
        id: field(4),
        age: field(8),
    })
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let port = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(9090u16);

    let config = config::Config::builder()
        .set_default("pool.min_core_thread", 4)?
        .set_default("pool.max_thread", 8)?
        .set_default("pool.start_monitor_timer", true)?
        .add_source(config::Environment::with_prefix("ECHO").separator("__"))
        .build()?;
    let server_config = ServerConfig::from_config(&config, "");

    let mut server = TcpServer::new();
    server.init()?;
    server.reuse_address(true)?;
    server.bind(&Address::new("127.0.0.1", port))?;
    server.listen(server_config.listen_backlog)?;

    let pool = ThreadPool::new(ThreadPoolConfig::from_config(&config, "pool"))?;

    let dispatcher = Dispatcher::new_named(pool, &config, "")?;
    dispatcher.enable_slave(true);
    dispatcher.add_slave_dispatchers(2)?;
    dispatcher.set_master_fd(server.fd());

    // Process-wide traffic observers, mirroring what a deployment would
    // feed into its metrics.
    dispatcher.hooks().set_receive_observer(|count, _err, _bytes| {
        info!(count, "observer: receive drain");
    });
    dispatcher.hooks().set_send_observer(|count, _err, _bytes| {
        info!(count, "observer: sent");
    });
    dispatcher.hooks().set_closed_observer(|fd| {
        info!(fd, "observer: connection closed");
    });

    let center = NotificationCenter::new(Arc::clone(&dispatcher));

    let reactor = Arc::clone(&dispatcher);
    let reactor_thread = thread::spawn(move || reactor.dispatch());

    info!(port, "Echo server up");
    while !dispatcher.stopped() {
        let handles = center.handle_ready_data(|fd, bytes| {
            let person = parse_person(&bytes);
            (fd, bytes.len(), person)
        });
        for handle in handles {
            match handle.wait() {
                Ok((fd, len, Some(person))) => {
                    info!(fd, len, ?person, "Handled record");
                    center.notify_response_ready(fd, b"hello, client, thank you for your message.");
                }
                Ok((fd, len, None)) => {
                    warn!(fd, len, "Short or malformed record");
                    center.notify_response_ready(fd, b"malformed record");
                }
                Err(err) => warn!(?err, "Handler failed"),
            }
        }
    }

    let _ = reactor_thread.join();
    server.shutdown();
    Ok(())
}
