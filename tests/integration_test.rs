extern crate tcpdelay;

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver};
use tcpdelay::*;

static EXPECT_EVENT: &str = "Expected the proxy to report an event";

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn start_proxy(remote_port: u16, delay: Duration) -> (SocketAddr, Receiver<ProxyEvent>) {
    let mut config = ProxyConfig::new(0, "127.0.0.1", remote_port, delay);
    config.listen_host = "127.0.0.1".to_owned();
    let mut proxy = Proxy::bind(&config).unwrap();
    let addr = proxy.local_addr();
    let rx = proxy.subscribe();
    thread::spawn(move || {
        proxy.run().unwrap();
    });
    (addr, rx)
}

/// Returns a port on which nobody accepts connections.
fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Sends back everything it receives, and shuts down its output once the client has shut down its output.
fn start_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = stream.unwrap();
            thread::spawn(move || {
                let mut reader = stream.try_clone().unwrap();
                std::io::copy(&mut reader, &mut stream).unwrap();
                stream.shutdown(Shutdown::Write).unwrap();
            });
        }
    });
    port
}

/// Reads until end of stream, reports what it has received and then replies with "done".
fn start_sink_server() -> (u16, Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = unbounded::<Vec<u8>>();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = stream.unwrap();
            let tx = tx.clone();
            thread::spawn(move || {
                let mut received = Vec::new();
                stream.read_to_end(&mut received).unwrap();
                tx.send(received).unwrap();
                stream.write_all(b"done").unwrap();
            });
        }
    });
    (port, rx)
}

fn wait_until_event<F, R>(rx: &Receiver<ProxyEvent>, event_cmp: F) -> R where F: Fn(&ProxyEvent) -> Option<R> {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = rx.recv_timeout(remaining).expect(EXPECT_EVENT);
        if let Some(result) = event_cmp(&event) {
            return result;
        }
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(EVENT_TIMEOUT)).unwrap();
    stream
}

fn pattern(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

#[test]
fn ping_pong_delayed_in_both_directions() {
    // The remote answers PONG as soon as it has received PING. Both directions are delayed by the proxy.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let remote_port = listener.local_addr().unwrap().port();
    let (tx, rx_received_at) = unbounded::<(Vec<u8>, Instant)>();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        tx.send((buf.to_vec(), Instant::now())).unwrap();
        stream.write_all(b"PONG").unwrap();
    });
    let delay = Duration::from_millis(100);
    let (addr, rx) = start_proxy(remote_port, delay);

    let mut client = connect(addr);
    wait_until_event(&rx, |event| match event {
        ProxyEvent::Paired { .. } => Some(()),
        _ => None,
    });
    let sent_at = Instant::now();
    client.write_all(b"PING").unwrap();
    let (payload, received_at) = rx_received_at.recv_timeout(EVENT_TIMEOUT).unwrap();
    assert_eq!(payload, b"PING");
    assert!(received_at.duration_since(sent_at) >= delay);

    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).unwrap();
    let replied_at = Instant::now();
    assert_eq!(&reply, b"PONG");
    assert!(replied_at.duration_since(received_at) >= delay);
}

#[test]
fn no_artificial_wait_without_delay() {
    let (addr, _rx) = start_proxy(start_echo_server(), Duration::from_millis(0));
    let mut client = connect(addr);
    // warm up: the first round trip also includes establishing the connection to the remote.
    client.write_all(b"x").unwrap();
    let mut buf = [0u8; 1];
    client.read_exact(&mut buf).unwrap();

    let started = Instant::now();
    client.write_all(b"y").unwrap();
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"y");
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn remote_down_closes_client_and_keeps_accepting() {
    let (addr, rx) = start_proxy(unused_port(), Duration::from_millis(0));

    for _ in 0..2 {
        let mut client = connect(addr);
        wait_until_event(&rx, |event| match event {
            ProxyEvent::ConnectFailed(_) => Some(()),
            ProxyEvent::Paired { .. } => panic!("Expected no pairing when the remote is down"),
            _ => None,
        });
        let mut buf = [0u8; 16];
        match client.read(&mut buf) {
            Ok(0) => {},
            Ok(size) => panic!("Expected no data to be relayed, but received {} bytes", size),
            Err(e) => assert_eq!(e.kind(), ErrorKind::ConnectionReset),
        }
    }
}

#[test]
fn one_mebibyte_arrives_complete() {
    let (remote_port, rx_received) = start_sink_server();
    let (addr, _rx) = start_proxy(remote_port, Duration::from_millis(10));
    let payload = pattern(1024 * 1024);

    let mut client = connect(addr);
    client.write_all(&payload).unwrap();
    client.shutdown(Shutdown::Write).unwrap();
    let received = rx_received.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(received.len(), payload.len());
    assert!(received == payload, "Expected the relayed bytes to be identical to the bytes sent");
}

#[test]
fn half_close_keeps_other_direction_open() {
    // The client shuts down its output. The remote must first receive all data, then end of stream, and is still
    // able to send its reply to the client afterwards.
    let (remote_port, rx_received) = start_sink_server();
    let (addr, rx) = start_proxy(remote_port, Duration::from_millis(50));

    let mut client = connect(addr);
    client.write_all(b"first").unwrap();
    client.write_all(b"second").unwrap();
    client.shutdown(Shutdown::Write).unwrap();
    let received = rx_received.recv_timeout(EVENT_TIMEOUT).unwrap();
    assert_eq!(received, b"firstsecond");

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).unwrap();
    assert_eq!(reply, b"done");

    // both read directions end, so both output directions are shut down.
    let mut num_output_closed = 0;
    while num_output_closed < 2 {
        wait_until_event(&rx, |event| match event {
            ProxyEvent::OutputClosed(_) => Some(()),
            _ => None,
        });
        num_output_closed += 1;
    }
}

/// Reads until it encounters the marker byte, then reports the instant the marker has arrived.
fn start_marker_server(marker: u8) -> (u16, Receiver<Instant>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = unbounded::<Instant>();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let size = stream.read(&mut buf).unwrap();
            if size == 0 {
                return;
            }
            if buf[..size].contains(&marker) {
                tx.send(Instant::now()).unwrap();
                return;
            }
        }
    });
    (port, rx)
}

#[test]
fn data_read_during_busy_drain_still_delayed() {
    // The proxy is kept busy reading a continuous stream, so that the marker is read long after the proxy has woken
    // up. It must nevertheless spend the full delay in the proxy.
    const MARKER: u8 = 0xff;
    let delay = Duration::from_millis(300);
    let (remote_port, rx_marker) = start_marker_server(MARKER);
    let (addr, _rx) = start_proxy(remote_port, delay);

    let mut client = connect(addr);
    // pattern() never contains the marker.
    let block = pattern(4 * 1024 * 1024);
    let stop_at = Instant::now() + Duration::from_secs(2);
    while Instant::now() < stop_at {
        client.write_all(&block).unwrap();
    }
    let written_at = Instant::now();
    client.write_all(&[MARKER]).unwrap();
    let arrived_at = rx_marker.recv_timeout(Duration::from_secs(60)).unwrap();
    assert!(arrived_at.duration_since(written_at) >= delay,
            "Expected the marker to arrive no earlier than {:?} after it was written, but it arrived after {:?}",
            delay, arrived_at.duration_since(written_at));
}

#[test]
fn concurrent_connections_do_not_mix() {
    let (addr, _rx) = start_proxy(start_echo_server(), Duration::from_millis(20));
    let handles: Vec<_> = (0..8u8).map(|i| {
        thread::spawn(move || {
            let payload: Vec<u8> = pattern(64 * 1024).into_iter().map(|b| b.wrapping_add(i)).collect();
            let mut client = connect(addr);
            let mut writer = client.try_clone().unwrap();
            let expected = payload.clone();
            let write_handle = thread::spawn(move || {
                writer.write_all(&payload).unwrap();
                writer.shutdown(Shutdown::Write).unwrap();
            });
            let mut echoed = Vec::new();
            client.read_to_end(&mut echoed).unwrap();
            write_handle.join().unwrap();
            assert!(echoed == expected, "Expected connection {} to receive its own data only", i);
        })
    }).collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn bind_failure_is_reported() {
    let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = ProxyConfig::new(occupied.local_addr().unwrap().port(), "127.0.0.1", 1, Duration::from_millis(0));
    config.listen_host = "127.0.0.1".to_owned();
    match Proxy::bind(&config) {
        Err(ProxyError::Io(e)) => assert_eq!(e.kind(), ErrorKind::AddrInUse),
        Err(e) => panic!("Unexpected error: {}", e),
        Ok(_) => panic!("Expected binding an occupied port to fail"),
    }
}
