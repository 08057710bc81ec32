use std::net::IpAddr;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{LevelFilter, error, info};

use tcp_engine::link::{Collector, Link};
use tcp_engine::protocol::SocketAddr;
use tcp_engine::{Config, ConnectionId, Engine, Error, Result, Timeout};

const CLIENT_IP: [u8; 4] = [10, 0, 0, 1];
const SERVER_IP: [u8; 4] = [10, 0, 0, 2];

/// Message sent from the client to the server.
const GREETING: &[u8] = b"GET / HTTP/1.0\r\nHost: 10.0.0.2\r\n\r\n";

/// Message sent back by the server.
const RESPONSE: &[u8] = b"HTTP/1.0 200 OK\r\nContent-Length: 13\r\n\r\nHello, world!";

/// Upper bound on the time any step of the exchange may take.
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    if let Err(err) = tcp_engine::log::init(LevelFilter::Debug) {
        eprintln!("failed to install logger: {err}");
        process::exit(1);
    }

    if let Err(err) = run() {
        error!("{err}");
        process::exit(1);
    }
}

/// Runs a request/response exchange between two engines joined by an
/// in-memory link that shuffles and duplicates segments.
fn run() -> Result<()> {
    let link = Arc::new(Link::with_faults(0x5eed, 0.2, 0.1));

    let client_inbox = Arc::new(Collector::new());
    let server_inbox = Arc::new(Collector::new());

    let client = Arc::new(Engine::new(
        Config::default(),
        link.clone(),
        client_inbox.clone(),
    )?);
    let server = Arc::new(Engine::new(
        Config::default(),
        link.clone(),
        server_inbox.clone(),
    )?);

    let server_addr = SocketAddr::from((SERVER_IP, 80));
    server.listen(server_addr)?;

    let running = Arc::new(AtomicBool::new(true));

    let pump = {
        let (link, client, server, running) = (
            Arc::clone(&link),
            Arc::clone(&client),
            Arc::clone(&server),
            Arc::clone(&running),
        );

        thread::Builder::new()
            .name("link".into())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    link.pump(&[
                        (IpAddr::from(CLIENT_IP), &*client),
                        (IpAddr::from(SERVER_IP), &*server),
                    ]);
                    thread::sleep(Duration::from_millis(1));
                }
            })?
    };

    let a = client.connect(
        SocketAddr::from((CLIENT_IP, 49152)),
        server_addr,
        STEP_TIMEOUT,
    )?;
    let b = server
        .accept(server_addr, STEP_TIMEOUT)?
        .ok_or(Error::TimedOut(Timeout::Connect))?;

    info!(
        "connected {} ({:?}) <-> {} ({:?})",
        client.socket(a)?,
        client.state(a)?,
        server.socket(b)?,
        server.state(b)?,
    );

    write_all(&client, a, GREETING)?;
    let request = read_exact(&server, &server_inbox, b, GREETING.len())?;
    info!("server received {:?}", String::from_utf8_lossy(&request));

    write_all(&server, b, RESPONSE)?;
    let response = read_exact(&client, &client_inbox, a, RESPONSE.len())?;
    info!("client received {:?}", String::from_utf8_lossy(&response));

    client.close(a)?;
    server.close(b)?;

    // The client keeps its record through TIME_WAIT; only the server's end
    // is waited on.
    let deadline = Instant::now() + STEP_TIMEOUT;
    while server.connection_count() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }

    info!(
        "closed: server reason {:?}, client connections remaining {}",
        server_inbox.closed_reason(b),
        client.connection_count()
    );

    running.store(false, Ordering::Release);
    let _ = pump.join();

    Ok(())
}

/// Sends all of `data`, waiting for window space as needed.
fn write_all(engine: &Engine, id: ConnectionId, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        match engine.send(id, data) {
            Ok(n) => data = &data[n..],
            Err(err) if err.is_retryable() => {
                engine.wait_writable(id, STEP_TIMEOUT)?;
            }
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

/// Waits until `len` bytes have been delivered on `id`, then hands them back
/// to the application and reopens the receive window.
fn read_exact(
    engine: &Engine,
    inbox: &Collector,
    id: ConnectionId,
    len: usize,
) -> Result<Vec<u8>> {
    let deadline = Instant::now() + STEP_TIMEOUT;

    while inbox.len(id) < len {
        if Instant::now() >= deadline {
            return Err(Error::TimedOut(Timeout::Retransmission));
        }

        thread::sleep(Duration::from_millis(1));
    }

    let data = inbox.take(id);
    engine.consume(id, data.len())?;

    Ok(data)
}
