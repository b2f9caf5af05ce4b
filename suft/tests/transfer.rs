//! End-to-end transfers over localhost, with and without induced loss.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use suft::packet::{ConnId, Flags, Packet, TH_SIZE, parse_frame};
use suft::{Conn, Endpoint, Error, Params};
use tokio::net::UdpSocket;

fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn params(bandwidth: i64, is_serv: bool, fast_retransmit: bool, flat_traffic: bool) -> Params {
    Params {
        local_addr: "127.0.0.1:0".to_owned(),
        bandwidth,
        is_serv,
        fast_retransmit,
        flat_traffic,
        ..Default::default()
    }
}

async fn pair(
    bandwidth: i64,
    fast_retransmit: bool,
    flat_traffic: bool,
) -> (Endpoint, Endpoint, Conn, Conn) {
    let server = Endpoint::new(params(bandwidth, true, fast_retransmit, flat_traffic))
        .await
        .unwrap();
    let server_addr = server.local_addr().unwrap();
    let client = Endpoint::new(params(bandwidth, false, fast_retransmit, flat_traffic))
        .await
        .unwrap();

    let server_addr_str = server_addr.to_string();
    let (dialed, accepted) = tokio::join!(client.dial(&server_addr_str), server.accept());

    (client, server, dialed.unwrap(), accepted.unwrap())
}

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);

    data
}

async fn read_to_end(conn: &Conn) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        match conn.read(&mut buf).await? {
            0 => return Ok(out),
            n => out.extend_from_slice(&buf[..n]),
        }
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// A UDP forwarder that drops a seeded fraction of datagrams each way.
async fn lossy_proxy(upstream: SocketAddr, loss: f64, seed: u64) -> SocketAddr {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();

    tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut downstream: Option<SocketAddr> = None;
        let mut buf = [0u8; 2048];

        loop {
            let Ok((n, from)) = sock.recv_from(&mut buf).await else {
                return;
            };

            if rng.gen_bool(loss) {
                continue;
            }

            let target = if from == upstream {
                match downstream {
                    Some(addr) => addr,
                    None => continue,
                }
            } else {
                downstream = Some(from);
                upstream
            };

            let _ = sock.send_to(&buf[..n], target).await;
        }
    });

    addr
}

#[tokio::test]
async fn small_echo_round_trip() {
    setup_tracing();
    let (client_ep, server_ep, client, server) = pair(8, false, false).await;

    client.write(b"hello\n").await.unwrap();

    let mut buf = [0u8; 64];
    let mut got = 0;
    while got < 6 {
        let n = server.read(&mut buf[got..]).await.unwrap();
        assert!(n > 0);
        got += n;
    }
    server.write(&buf[..got]).await.unwrap();

    let mut echo = [0u8; 64];
    let mut back = 0;
    while back < 6 {
        let n = client.read(&mut echo[back..]).await.unwrap();
        assert!(n > 0);
        back += n;
    }
    assert_eq!(&echo[..back], b"hello\n");

    let (client_close, server_close) = tokio::join!(client.close(), server.close());
    client_close.unwrap();
    server_close.unwrap();

    assert_eq!(client_ep.active_connections(), 0);
    assert_eq!(server_ep.active_connections(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bulk_transfer_is_rate_limited_and_intact() {
    setup_tracing();
    let (_client_ep, _server_ep, client, server) = pair(8, false, true).await;

    let payload = random_bytes(1 << 20, 7);
    let want = sha256(&payload);
    let start = Instant::now();

    let writer = tokio::spawn({
        let client = client.clone();
        async move {
            client.write(&payload).await.unwrap();
            client.close().await
        }
    });

    let got = read_to_end(&server).await.unwrap();
    let elapsed = start.elapsed();

    server.close().await.unwrap();
    writer.await.unwrap().unwrap();

    assert_eq!(sha256(&got), want);
    // 1 MiB at a 8 mbps ceiling cannot beat the pacer.
    assert!(
        elapsed >= Duration::from_millis(900),
        "finished too fast for the configured rate: {elapsed:?}"
    );
    assert!(elapsed < Duration::from_secs(30), "stalled: {elapsed:?}");

    let stats = client.stats();
    assert!(
        stats.out_duplicate_ratio() < 0.05,
        "too many retransmits on a lossless path: {stats:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lossy_transfer_recovers_with_fast_retransmit() {
    setup_tracing();

    let server_ep = Endpoint::new(params(8, true, true, true)).await.unwrap();
    let proxy = lossy_proxy(server_ep.local_addr().unwrap(), 0.05, 42).await;
    let client_ep = Endpoint::new(params(8, false, true, true)).await.unwrap();

    let proxy_str = proxy.to_string();
    let (dialed, accepted) = tokio::join!(client_ep.dial(&proxy_str), server_ep.accept());
    let (client, server) = (dialed.unwrap(), accepted.unwrap());

    let payload = random_bytes(256 * 1024, 11);
    let want = sha256(&payload);

    let writer = tokio::spawn({
        let client = client.clone();
        let payload = payload.clone();
        async move {
            client.write(&payload).await.unwrap();
            let _ = client.close().await;
        }
    });

    let got = tokio::time::timeout(Duration::from_secs(120), read_to_end(&server))
        .await
        .expect("transfer stalled under loss")
        .unwrap();

    assert_eq!(sha256(&got), want);
    assert!(
        client.stats().fast_resends > 0,
        "expected duplicate-sack retransmits: {:?}",
        client.stats()
    );

    writer.await.unwrap();
    let _ = server.close().await;
}

#[tokio::test]
async fn duplicate_syn_creates_one_connection() {
    setup_tracing();
    let server = Endpoint::new(params(2, true, false, false)).await.unwrap();
    let addr = server.local_addr().unwrap();

    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut syn = Packet::control(0, 0, Flags::SYN);
    syn.scnt = 1;
    let frame = syn.encode(ConnId { lid: 77, rid: 0 });

    raw.send_to(&frame, addr).await.unwrap();
    syn.scnt = 2;
    let retransmit = syn.encode(ConnId { lid: 77, rid: 0 });
    raw.send_to(&retransmit, addr).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(server.active_connections(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn half_close_delivers_both_directions() {
    setup_tracing();
    let (_client_ep, _server_ep, client, server) = pair(16, false, false).await;

    let upload = random_bytes(256 * 1024, 3);
    let download = random_bytes(256 * 1024, 5);

    let server_task = tokio::spawn({
        let server = server.clone();
        let download = download.clone();
        async move {
            let got = read_to_end(&server).await.unwrap();
            server.write(&download).await.unwrap();
            server.close().await.unwrap();
            got
        }
    });

    let client_reader = tokio::spawn({
        let client = client.clone();
        async move { read_to_end(&client).await.unwrap() }
    });

    client.write(&upload).await.unwrap();
    client.close().await.unwrap();

    let got_upload = server_task.await.unwrap();
    let got_download = client_reader.await.unwrap();

    assert_eq!(sha256(&got_upload), sha256(&upload));
    assert_eq!(sha256(&got_download), sha256(&download));
    assert!(client.is_closed());
    assert!(server.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn endpoint_shutdown_surfaces_an_error() {
    setup_tracing();
    let (_client_ep, server_ep, client, _server) = pair(4, false, false).await;

    server_ep.close().unwrap();

    let chunk = vec![0u8; 16 * 1024];
    let gave_up = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if client.write(&chunk).await.is_err() {
                return;
            }
        }
    })
    .await;

    assert!(
        gave_up.is_ok(),
        "writes kept succeeding after the peer vanished"
    );
}

#[tokio::test]
async fn unknown_connection_gets_reset() {
    setup_tracing();
    let endpoint = Endpoint::new(params(2, false, false, false)).await.unwrap();
    let addr = endpoint.local_addr().unwrap();

    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let probe = Packet::control(9, 0, Flags::DATA);
    let frame = probe.encode(ConnId {
        lid: 4242,
        rid: 31337,
    });
    raw.send_to(&frame, addr).await.unwrap();

    let mut buf = [0u8; 256];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), raw.recv_from(&mut buf))
        .await
        .expect("no reset reply")
        .unwrap();

    let id = parse_frame(&buf[..n]).unwrap();
    assert_eq!(id.lid, 4242);

    let reply = Packet::decode(&buf[TH_SIZE..n]);
    assert!(reply.flags.contains(Flags::RESET));
    assert!(reply.flags.contains(Flags::FIN));
}

#[tokio::test]
async fn read_deadline_reports_a_temporary_timeout() {
    setup_tracing();
    let (_client_ep, _server_ep, client, _server) = pair(2, false, false).await;

    client.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));

    let mut buf = [0u8; 16];
    let err = client.read(&mut buf).await.unwrap_err();

    assert!(err.is_timeout());
    assert!(err.is_temporary());
}

#[tokio::test]
async fn close_twice_reports_the_same_result() {
    setup_tracing();
    let (_client_ep, _server_ep, client, server) = pair(8, false, false).await;

    let server_close = tokio::spawn(async move { server.close().await });

    client.close().await.unwrap();
    client.close().await.unwrap();

    server_close.await.unwrap().unwrap();
}

#[tokio::test]
async fn listen_timeout_expires_without_peers() {
    setup_tracing();
    let server = Endpoint::new(params(2, true, false, false)).await.unwrap();

    let waited = Instant::now();
    assert!(
        server
            .listen_timeout(Duration::from_millis(100))
            .await
            .is_none()
    );
    assert!(waited.elapsed() >= Duration::from_millis(100));
}
