use std::{
    io::{self, Write},
    net::SocketAddr,
    str,
    sync::{atomic::Ordering, Arc, Mutex},
    time::Duration,
};

use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;

use self::mock::{MemorySocket, MockEngine, Packet, Shared, MOCK_STREAM};
use crate::{
    AddressTokens, Client, ClientConfig, ClientError, ClientStreams, ConnectionHandle,
    DatagramOutcome, DropReason, Echo, Endpoint, EndpointConfig, TimeoutOutcome, TimerExpired,
    TokioRuntime,
    LOCAL_CONN_ID_LEN, STREAM_FINISHED,
};


const CLIENT_CID: &[u8] = b"client-scid";

fn client_addr() -> SocketAddr {
    "192.0.2.1:4433".parse().unwrap()
}

fn server_addr() -> SocketAddr {
    "198.51.100.1:1234".parse().unwrap()
}

struct Harness {
    endpoint: Endpoint<MockEngine, Echo>,
    socket: Arc<MemorySocket>,
    inbound: mpsc::UnboundedSender<io::Result<(Vec<u8>, SocketAddr)>>,
    state: Shared,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(EndpointConfig::default())
    }

    fn with_config(mut config: EndpointConfig) -> Self {
        config.rng_seed(Some(7));
        let state = mock::shared();
        let (socket, inbound) = MemorySocket::new(server_addr());
        let endpoint = Endpoint::new(
            MockEngine {
                state: state.clone(),
            },
            Echo,
            socket.clone(),
            Arc::new(TokioRuntime),
            config,
        )
        .unwrap();
        Self {
            endpoint,
            socket,
            inbound,
            state,
        }
    }

    fn datagram(&mut self, packet: Packet) -> DatagramOutcome {
        let mut buf = packet.encode();
        self.endpoint.handle_datagram(&mut buf, client_addr())
    }

    /// Complete the retry exchange for `odcid`, returning the new connection
    fn connect(&mut self, odcid: &[u8], payload: &[u8]) -> ConnectionHandle {
        let new_cid = match self.datagram(Packet::initial(odcid, CLIENT_CID, b"", b"")) {
            DatagramOutcome::Retry { new_cid } => new_cid,
            other => panic!("expected retry, got {other:?}"),
        };
        let token = AddressTokens::default().mint(odcid, client_addr());
        match self.datagram(Packet::initial(&new_cid, CLIENT_CID, &token, payload)) {
            DatagramOutcome::Accepted(handle) => handle,
            other => panic!("expected accept, got {other:?}"),
        }
    }

    /// Present a valid token with a destination connection ID of our choosing
    fn accept_as(&mut self, cid: &[u8], payload: &[u8]) -> ConnectionHandle {
        let token = AddressTokens::default().mint(b"odcid", client_addr());
        match self.datagram(Packet::initial(cid, CLIENT_CID, &token, payload)) {
            DatagramOutcome::Accepted(handle) => handle,
            other => panic!("expected accept, got {other:?}"),
        }
    }

    /// `(sequence, kind)` of every packet sent on behalf of connection `cid`
    fn sent_by(&self, cid: &[u8]) -> Vec<(u64, String)> {
        self.socket
            .sent()
            .iter()
            .filter(|sent| Packet::decode(&sent.data).is_some_and(|p| p.dcid == cid))
            .filter_map(|sent| mock::sequence(&sent.data))
            .collect()
    }
}

/// Let spawned send pipelines catch up without advancing time
async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn malformed_datagrams_are_dropped_silently() {
    let _guard = subscribe();
    let mut h = Harness::new();
    let mut rng = StdRng::seed_from_u64(42);
    let valid = Packet::initial(b"odcid", CLIENT_CID, b"", b"").encode();
    for i in 0..256 {
        let mut datagram = if i % 2 == 0 {
            let mut garbage = vec![0; rng.gen_range(0..64)];
            rng.fill_bytes(&mut garbage);
            if let Some(first) = garbage.first_mut() {
                *first = rng.gen_range(6..=255);
            }
            garbage
        } else {
            // Cut off before the destination connection ID is complete
            valid[..rng.gen_range(0..11)].to_vec()
        };
        assert_eq!(
            h.endpoint.handle_datagram(&mut datagram, client_addr()),
            DatagramOutcome::Dropped(DropReason::MalformedHeader)
        );
    }
    settle().await;
    assert!(h.socket.sent().is_empty());
    assert_eq!(h.endpoint.connection_count(), 0);
    let stats = h.endpoint.stats();
    assert_eq!(stats.received, 256);
    assert_eq!(stats.dropped(DropReason::MalformedHeader), 256);
}

#[tokio::test]
async fn unsupported_version_gets_version_negotiation() {
    let _guard = subscribe();
    let mut h = Harness::new();
    let mut packet = Packet::initial(b"odcid", CLIENT_CID, b"", b"");
    packet.version = 0x0000_0001;
    assert_eq!(h.datagram(packet), DatagramOutcome::VersionNegotiation);
    settle().await;

    let sent = h.socket.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, client_addr());
    let response = Packet::decode(&sent[0].data).unwrap();
    assert_eq!(response.ty, mock::VERSION_NEGOTIATION);
    assert_eq!(response.dcid, CLIENT_CID);
    assert_eq!(h.endpoint.connection_count(), 0);
    assert!(h.state.lock().unwrap().accepted.is_empty());
}

#[tokio::test]
async fn version_is_checked_before_token() {
    let _guard = subscribe();
    let mut h = Harness::new();
    let token = AddressTokens::default().mint(b"odcid", client_addr());
    let mut packet = Packet::initial(&[1; LOCAL_CONN_ID_LEN], CLIENT_CID, &token, b"");
    packet.version = 0x0000_0001;
    assert_eq!(h.datagram(packet), DatagramOutcome::VersionNegotiation);
    assert_eq!(h.endpoint.connection_count(), 0);
}

#[tokio::test]
async fn missing_token_gets_retry() {
    let _guard = subscribe();
    let mut h = Harness::new();
    let new_cid = match h.datagram(Packet::initial(b"original", CLIENT_CID, b"", b"")) {
        DatagramOutcome::Retry { new_cid } => new_cid,
        other => panic!("expected retry, got {other:?}"),
    };
    settle().await;

    let sent = h.socket.sent();
    assert_eq!(sent.len(), 1);
    let retry = Packet::decode(&sent[0].data).unwrap();
    assert_eq!(retry.ty, mock::RETRY);
    assert_eq!(retry.dcid, CLIENT_CID);
    assert_eq!(retry.scid, &new_cid[..]);
    assert_eq!(retry.scid.len(), LOCAL_CONN_ID_LEN);
    assert_eq!(
        AddressTokens::default().validate(&retry.token, client_addr()),
        Some(&b"original"[..])
    );
    assert_eq!(h.endpoint.connection_count(), 0);

    // Every retry picks a fresh connection ID
    match h.datagram(Packet::initial(b"original", CLIENT_CID, b"", b"")) {
        DatagramOutcome::Retry { new_cid: other } => assert_ne!(other, new_cid),
        other => panic!("expected retry, got {other:?}"),
    }
}

#[tokio::test]
async fn valid_token_creates_connection() {
    let _guard = subscribe();
    let mut h = Harness::new();
    let handle = h.connect(b"original", b"hello");

    assert_eq!(h.endpoint.connection_count(), 1);
    assert!(h.endpoint.contains(&handle.cid()));
    let state = h.state.lock().unwrap();
    assert_eq!(
        state.accepted,
        vec![(handle.cid().to_vec(), b"original".to_vec())]
    );
    // The accepting datagram is the connection's first receive
    assert_eq!(
        state.received,
        vec![(handle.cid().to_vec(), b"hello".to_vec())]
    );
    drop(state);
    assert_eq!(h.endpoint.stats().accepted, 1);
}

#[tokio::test]
async fn invalid_token_is_dropped() {
    let _guard = subscribe();
    let mut h = Harness::new();
    let elsewhere: SocketAddr = "192.0.2.1:4434".parse().unwrap();
    let foreign = AddressTokens::default().mint(b"odcid", elsewhere);
    let tokens: [&[u8]; 3] = [&foreign, b"quiche-but-not-really", b"\x00"];
    for token in tokens {
        assert_eq!(
            h.datagram(Packet::initial(&[1; LOCAL_CONN_ID_LEN], CLIENT_CID, token, b"")),
            DatagramOutcome::Dropped(DropReason::InvalidToken)
        );
    }
    settle().await;
    assert!(h.socket.sent().is_empty());
    assert_eq!(h.endpoint.connection_count(), 0);
    assert!(h.state.lock().unwrap().accepted.is_empty());
}

#[tokio::test]
async fn unexpected_connection_id_length_is_dropped() {
    let _guard = subscribe();
    let mut h = Harness::new();
    let token = AddressTokens::default().mint(b"odcid", client_addr());
    for len in [0, 8, 20] {
        assert_eq!(
            h.datagram(Packet::initial(&vec![1; len], CLIENT_CID, &token, b"")),
            DatagramOutcome::Dropped(DropReason::InvalidConnectionIdLength)
        );
    }
    assert_eq!(h.endpoint.connection_count(), 0);
}

#[tokio::test]
async fn accept_failure_is_dropped() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.state.lock().unwrap().fail_accept = true;
    let token = AddressTokens::default().mint(b"odcid", client_addr());
    assert_eq!(
        h.datagram(Packet::initial(&[1; LOCAL_CONN_ID_LEN], CLIENT_CID, &token, b"")),
        DatagramOutcome::Dropped(DropReason::AcceptFailed)
    );
    assert_eq!(h.endpoint.connection_count(), 0);
}

#[tokio::test]
async fn only_initial_packets_start_handshakes() {
    let _guard = subscribe();
    let mut h = Harness::new();
    for ty in [mock::HANDSHAKE, mock::ZERO_RTT] {
        let mut packet = Packet::initial(&[1; LOCAL_CONN_ID_LEN], CLIENT_CID, b"", b"");
        packet.ty = ty;
        assert_eq!(
            h.datagram(packet.clone()),
            DatagramOutcome::Dropped(DropReason::UnknownConnection)
        );
        // Version negotiation still answers any long header
        packet.version = 0x0000_0001;
        assert_eq!(h.datagram(packet), DatagramOutcome::VersionNegotiation);
    }
    settle().await;

    let types = h
        .socket
        .sent()
        .iter()
        .map(|sent| Packet::decode(&sent.data).unwrap().ty)
        .collect::<Vec<_>>();
    assert_eq!(types, [mock::VERSION_NEGOTIATION; 2]);
    assert_eq!(h.endpoint.stats().retries, 0);
    assert_eq!(h.endpoint.connection_count(), 0);
    assert!(h.state.lock().unwrap().accepted.is_empty());
}

#[tokio::test]
async fn short_header_for_unknown_connection_is_dropped() {
    let _guard = subscribe();
    let mut h = Harness::new();
    assert_eq!(
        h.datagram(Packet::short(&[1; LOCAL_CONN_ID_LEN], b"hello")),
        DatagramOutcome::Dropped(DropReason::UnknownConnection)
    );
    settle().await;
    assert!(h.socket.sent().is_empty());
}

#[tokio::test]
async fn datagrams_route_to_their_connection() {
    let _guard = subscribe();
    let mut h = Harness::new();
    let a = h.connect(b"first", b"a0");
    let b = h.connect(b"second", b"b0");
    assert_ne!(a.cid(), b.cid());
    for i in 1..4 {
        let payload = format!("a{i}");
        assert_eq!(
            h.datagram(Packet::short(&a.cid(), payload.as_bytes())),
            DatagramOutcome::Delivered(a)
        );
    }
    assert_eq!(
        h.datagram(Packet::short(&b.cid(), b"b1")),
        DatagramOutcome::Delivered(b)
    );

    let state = h.state.lock().unwrap();
    let for_a = state
        .received
        .iter()
        .filter(|(cid, _)| cid[..] == a.cid()[..])
        .map(|(_, payload)| payload.clone())
        .collect::<Vec<_>>();
    assert_eq!(for_a, vec![b"a0".to_vec(), b"a1".to_vec(), b"a2".to_vec(), b"a3".to_vec()]);
}

#[tokio::test]
async fn rejected_datagram_leaves_connection_intact() {
    let _guard = subscribe();
    let mut h = Harness::new();
    let handle = h.connect(b"odcid", b"hello");
    settle().await;
    h.socket.take_sent();

    assert_eq!(
        h.datagram(Packet::short(&handle.cid(), b"bad")),
        DatagramOutcome::Rejected(handle)
    );
    settle().await;
    assert!(h.socket.sent().is_empty());
    assert!(h.endpoint.contains(&handle.cid()));

    assert_eq!(
        h.datagram(Packet::short(&handle.cid(), b"good")),
        DatagramOutcome::Delivered(handle)
    );
    assert_eq!(h.endpoint.stats().rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_first_datagram_still_times_out() {
    let _guard = subscribe();
    let mut h = Harness::new();
    let cid = [10; LOCAL_CONN_ID_LEN];
    let token = AddressTokens::default().mint(b"odcid", client_addr());
    let handle = match h.datagram(Packet::initial(&cid, CLIENT_CID, &token, b"bad")) {
        DatagramOutcome::Rejected(handle) => handle,
        other => panic!("expected rejection, got {other:?}"),
    };
    assert_eq!(h.endpoint.stats().accepted, 1);
    assert!(h.endpoint.connection(handle).unwrap().timer_active());

    let expired = h.endpoint.next_expired().await;
    assert_eq!(expired.handle, handle);
    assert_eq!(h.endpoint.handle_timeout(expired), TimeoutOutcome::Closed);
    assert!(!h.endpoint.contains(&handle.cid()));
    assert_eq!(h.endpoint.connection_count(), 0);
}

#[tokio::test]
async fn stream_data_is_echoed() {
    let _guard = subscribe();
    let mut h = Harness::new();
    let cid = [6; LOCAL_CONN_ID_LEN];
    h.accept_as(&cid, b"fin:ping");
    settle().await;

    assert_eq!(
        h.state.lock().unwrap().stream_sent,
        vec![
            (MOCK_STREAM, b"ping".to_vec(), false),
            (MOCK_STREAM, STREAM_FINISHED.to_vec(), true),
        ]
    );
    let kinds = h
        .sent_by(&cid)
        .into_iter()
        .map(|(_, kind)| kind)
        .collect::<Vec<_>>();
    assert_eq!(kinds, ["ack", "stream", "stream"]);
}

#[tokio::test]
async fn streams_are_not_read_before_handshake_completes() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.state.lock().unwrap().handshake_datagrams = 2;
    let cid = [7; LOCAL_CONN_ID_LEN];
    let handle = h.accept_as(&cid, b"stream:early");
    assert!(!h.endpoint.connection(handle).unwrap().is_established());
    assert!(h.state.lock().unwrap().stream_sent.is_empty());

    h.datagram(Packet::short(&cid, b"handshake done"));
    assert!(h.endpoint.connection(handle).unwrap().is_established());
    assert_eq!(
        h.state.lock().unwrap().stream_sent,
        vec![(MOCK_STREAM, b"early".to_vec(), false)]
    );
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_removes_connection() {
    let _guard = subscribe();
    let mut h = Harness::new();
    let start = tokio::time::Instant::now();
    let handle = h.connect(b"odcid", b"hello");
    assert!(h.endpoint.connection(handle).unwrap().timer_active());

    let expired = h.endpoint.next_expired().await;
    assert_eq!(expired.handle, handle);
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert_eq!(h.endpoint.handle_timeout(expired), TimeoutOutcome::Closed);
    assert!(!h.endpoint.contains(&handle.cid()));
    assert_eq!(h.state.lock().unwrap().timeouts, vec![handle.cid().to_vec()]);
    assert_eq!(h.endpoint.stats().closed, 1);

    // The same expiry cannot act twice
    assert_eq!(h.endpoint.handle_timeout(expired), TimeoutOutcome::Stale);

    // A late datagram finds nothing and goes back through the handshake gate
    assert_eq!(
        h.datagram(Packet::short(&handle.cid(), b"late")),
        DatagramOutcome::Dropped(DropReason::UnknownConnection)
    );
    assert!(matches!(
        h.datagram(Packet::initial(&handle.cid(), CLIENT_CID, b"", b"")),
        DatagramOutcome::Retry { .. }
    ));
    assert_eq!(h.state.lock().unwrap().timeouts.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn superseded_and_departed_timers_are_ignored() {
    let _guard = subscribe();
    let mut h = Harness::new();
    let cid = [9; LOCAL_CONN_ID_LEN];
    let first = h.accept_as(&cid, b"one");

    // An earlier deadline replaces the armed 5 s timer
    h.state.lock().unwrap().timeout = Some(Duration::from_secs(1));
    assert_eq!(
        h.datagram(Packet::short(&cid, b"two")),
        DatagramOutcome::Delivered(first)
    );
    let expired = h.endpoint.next_expired().await;
    assert_eq!(h.endpoint.handle_timeout(expired), TimeoutOutcome::Closed);

    // Same connection ID, new incarnation, armed well past the old 5 s timer
    h.state.lock().unwrap().timeout = Some(Duration::from_secs(60));
    let second = h.accept_as(&cid, b"three");
    assert_ne!(first, second);
    assert_eq!(first.cid(), second.cid());

    // The old incarnation's timer went away with it, so its 5 s deadline never fires
    let quiet = tokio::time::timeout(Duration::from_secs(10), h.endpoint.next_expired()).await;
    assert!(quiet.is_err());

    // An expiry already in flight for the old incarnation is ignored
    let stale = TimerExpired {
        handle: first,
        epoch: expired.epoch,
    };
    assert_eq!(h.endpoint.handle_timeout(stale), TimeoutOutcome::Stale);
    assert!(h.endpoint.connection(second).is_some());
    assert_eq!(h.state.lock().unwrap().timeouts.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn packets_leave_in_production_order() {
    let _guard = subscribe();
    let mut h = Harness::new();
    {
        let mut state = h.state.lock().unwrap();
        state.pacing = Some(Duration::from_millis(50));
        state.timeout = Some(Duration::from_millis(10));
        state.close_on_timeout = false;
    }
    let start = tokio::time::Instant::now();
    let paced = [1; LOCAL_CONN_ID_LEN];
    let unpaced = [2; LOCAL_CONN_ID_LEN];

    // The first packet of `paced` is held back; everything it produces later queues behind it
    let handle = h.accept_as(&paced, b"first");
    h.state.lock().unwrap().pacing = None;
    assert_eq!(
        h.datagram(Packet::short(&paced, b"second")),
        DatagramOutcome::Delivered(handle)
    );
    h.accept_as(&unpaced, b"other");
    settle().await;
    assert!(h.sent_by(&paced).is_empty());
    assert_eq!(h.sent_by(&unpaced).len(), 1);

    // Timer-driven sends race the queued receive-driven ones
    for _ in 0..2 {
        let expired = h.endpoint.next_expired().await;
        assert_eq!(h.endpoint.handle_timeout(expired), TimeoutOutcome::Fired);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sent = h.sent_by(&paced);
    let kinds = sent.iter().map(|(_, kind)| kind.as_str()).collect::<Vec<_>>();
    assert_eq!(kinds, ["ack", "ack", "rtx"]);
    assert!(sent.windows(2).all(|w| w[0].0 < w[1].0));

    let first_paced = h
        .socket
        .sent()
        .into_iter()
        .find(|s| Packet::decode(&s.data).is_some_and(|p| p.dcid == paced))
        .unwrap();
    assert!(first_paced.at - start >= Duration::from_millis(50));
    let first_unpaced = h
        .socket
        .sent()
        .into_iter()
        .find(|s| Packet::decode(&s.data).is_some_and(|p| p.dcid == unpaced))
        .unwrap();
    assert!(first_unpaced.at - start < Duration::from_millis(50));
}

#[tokio::test]
async fn send_failure_does_not_stop_pipeline() {
    let _guard = subscribe();
    let mut h = Harness::new();
    let cid = [3; LOCAL_CONN_ID_LEN];
    h.socket.fail_sends.store(true, Ordering::Relaxed);
    let handle = h.accept_as(&cid, b"lost");
    settle().await;
    h.socket.fail_sends.store(false, Ordering::Relaxed);

    assert_eq!(
        h.datagram(Packet::short(&cid, b"again")),
        DatagramOutcome::Delivered(handle)
    );
    settle().await;
    let sent = h.sent_by(&cid);
    assert_eq!(sent, vec![(1, "ack".to_owned())]);
    let stats = h.endpoint.stats();
    assert_eq!(stats.send_failures, 1);
    assert_eq!(stats.datagrams_sent, 1);
    assert!(h.endpoint.contains(&handle.cid()));
}

#[tokio::test]
async fn sweep_removes_closed_connections() {
    let _guard = subscribe();
    let mut h = Harness::new();
    let a = h.accept_as(&[4; LOCAL_CONN_ID_LEN], b"a");
    let b = h.accept_as(&[5; LOCAL_CONN_ID_LEN], b"b");
    h.state
        .lock()
        .unwrap()
        .force_closed
        .insert(vec![4; LOCAL_CONN_ID_LEN]);

    assert_eq!(h.endpoint.sweep(), 1);
    assert!(!h.endpoint.contains(&a.cid()));
    assert!(h.endpoint.contains(&b.cid()));
    assert_eq!(h.endpoint.sweep(), 0);
    assert_eq!(h.endpoint.stats().closed, 1);
}

#[tokio::test]
async fn close_notifies_peers_and_stops_accepting() {
    let _guard = subscribe();
    let mut h = Harness::new();
    let cid = [8; LOCAL_CONN_ID_LEN];
    h.accept_as(&cid, b"hi");

    h.endpoint.close(0, b"bye");
    assert!(!h.endpoint.is_accepting());
    assert_eq!(h.endpoint.connection_count(), 0);
    settle().await;
    let kinds = h
        .sent_by(&cid)
        .into_iter()
        .map(|(_, kind)| kind)
        .collect::<Vec<_>>();
    assert_eq!(kinds, ["ack", "close"]);

    assert_eq!(
        h.datagram(Packet::initial(b"odcid", CLIENT_CID, b"", b"")),
        DatagramOutcome::Dropped(DropReason::NotAccepting)
    );
}

#[test]
fn shutdown_sends_close_before_returning() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let _guard = subscribe();
    let cid = [11; LOCAL_CONN_ID_LEN];
    let mut h = rt.block_on(async {
        let mut h = Harness::new();
        h.accept_as(&cid, b"hi");
        h
    });

    let stats = rt.block_on(h.endpoint.run_until(async {})).unwrap();
    // Anything still queued would be lost with the runtime
    drop(rt);

    let kinds = h
        .sent_by(&cid)
        .into_iter()
        .map(|(_, kind)| kind)
        .collect::<Vec<_>>();
    assert_eq!(kinds, ["ack", "close"]);
    assert_eq!(stats.closed, 1);
    assert_eq!(stats.datagrams_sent, 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_paced_packets() {
    let _guard = subscribe();
    let mut h = Harness::new();
    let cid = [12; LOCAL_CONN_ID_LEN];
    h.state.lock().unwrap().pacing = Some(Duration::from_millis(200));
    h.accept_as(&cid, b"hi");
    h.state.lock().unwrap().pacing = None;

    let start = tokio::time::Instant::now();
    h.endpoint.shutdown(0, b"bye").await;
    assert!(start.elapsed() >= Duration::from_millis(200));
    let kinds = h
        .sent_by(&cid)
        .into_iter()
        .map(|(_, kind)| kind)
        .collect::<Vec<_>>();
    assert_eq!(kinds, ["ack", "close"]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_gives_up_after_drain_timeout() {
    let _guard = subscribe();
    let mut config = EndpointConfig::default();
    config.drain_timeout(Duration::from_millis(100));
    let mut h = Harness::with_config(config);
    let cid = [13; LOCAL_CONN_ID_LEN];
    h.state.lock().unwrap().pacing = Some(Duration::from_secs(60));
    h.accept_as(&cid, b"hi");

    let start = tokio::time::Instant::now();
    h.endpoint.shutdown(0, b"bye").await;
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(100) && waited < Duration::from_secs(60));
    assert!(h.sent_by(&cid).is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_loop_serves_until_shutdown() {
    let _guard = subscribe();
    let mut config = EndpointConfig::default();
    config.recv_buffer_size(256);
    let mut h = Harness::with_config(config);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let inbound = h.inbound.clone();

    let driver = async move {
        let retry = Packet::initial(b"odcid", CLIENT_CID, b"", b"").encode();
        inbound.send(Ok((retry, client_addr()))).unwrap();
        inbound
            .send(Err(io::ErrorKind::ConnectionReset.into()))
            .unwrap();
        inbound.send(Ok((vec![0; 256], client_addr()))).unwrap();
        inbound.send(Ok((vec![0xff; 10], client_addr()))).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown_tx.send(()).unwrap();
    };
    let (result, ()) = tokio::join!(
        h.endpoint.run_until(async {
            let _ = shutdown_rx.await;
        }),
        driver
    );

    let stats = result.unwrap();
    assert_eq!(stats.received, 3);
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.dropped(DropReason::Truncated), 1);
    assert_eq!(stats.dropped(DropReason::MalformedHeader), 1);
    assert_eq!(stats.total_dropped(), 2);
    let sent = h.socket.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(Packet::decode(&sent[0].data).unwrap().ty, mock::RETRY);
}

#[tokio::test(start_paused = true)]
async fn run_loop_fails_on_socket_error() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.inbound
        .send(Err(io::ErrorKind::PermissionDenied.into()))
        .unwrap();
    assert!(h.endpoint.run().await.is_err());
}

fn client(state: &Shared) -> (Client<MockEngine>, ClientStreams, Arc<MemorySocket>, Injector) {
    let (socket, inbound) = MemorySocket::new(client_addr());
    let (client, streams) = Client::connect(
        MockEngine {
            state: state.clone(),
        },
        socket.clone(),
        Arc::new(TokioRuntime),
        server_addr(),
        ClientConfig::default(),
    )
    .unwrap();
    (client, streams, socket, inbound)
}

type Injector = mpsc::UnboundedSender<io::Result<(Vec<u8>, SocketAddr)>>;

#[tokio::test]
async fn client_sends_after_handshake_and_closes_on_fin() {
    let _guard = subscribe();
    let state = mock::shared();
    let (client, streams, socket, inbound) = client(&state);
    let ClientStreams { mut send, mut recv } = streams;
    send.write(&b"hello"[..]).unwrap();
    send.finish().unwrap();
    settle().await;

    // Only the first flight leaves before the server answers
    let sent = socket.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, server_addr());
    assert_eq!(mock::sequence(&sent[0].data).unwrap().1, "initial");
    assert!(state.lock().unwrap().stream_sent.is_empty());

    let cid = client.cid();
    let server = async {
        inbound
            .send(Ok((Packet::short(&cid, b"hi").encode(), server_addr())))
            .unwrap();
        while state.lock().unwrap().stream_sent.len() < 2 {
            tokio::task::yield_now().await;
        }
        inbound
            .send(Ok((Packet::short(&cid, b"fin:world").encode(), server_addr())))
            .unwrap();
    };
    let (result, ()) = tokio::join!(client.run(), server);
    let stats = result.unwrap();
    assert_eq!(stats.recv, 2);

    assert_eq!(
        state.lock().unwrap().stream_sent,
        vec![
            (MOCK_STREAM, b"hello".to_vec(), false),
            (MOCK_STREAM, Vec::new(), true),
        ]
    );
    assert_eq!(state.lock().unwrap().closed, vec![cid.to_vec()]);
    assert_eq!(&recv.read_to_end().await[..], b"world");
}

#[tokio::test(start_paused = true)]
async fn client_without_handshake_times_out() {
    let _guard = subscribe();
    let state = mock::shared();
    state.lock().unwrap().timeout = Some(Duration::from_millis(100));
    let (client, _streams, _socket, _inbound) = client(&state);
    assert!(matches!(client.run().await, Err(ClientError::TimedOut)));
    assert_eq!(state.lock().unwrap().timeouts.len(), 1);
}

#[tokio::test]
async fn malformed_drop_is_logged_at_debug() {
    let captured = Captured::default();
    let writer = captured.clone();
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(sub);
    let mut h = Harness::new();
    assert_eq!(
        h.endpoint.handle_datagram(&mut [0xff; 8], client_addr()),
        DatagramOutcome::Dropped(DropReason::MalformedHeader)
    );
    let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
    assert!(logs.contains("failed to parse header"), "{logs}");
}

#[derive(Debug, Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}
