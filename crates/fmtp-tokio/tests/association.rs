mod common;

use std::{
    io::{self, Cursor},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use common::{
    associated, config, connected, connected_with_buffer, deadline, fast_config, next_frame,
    send_signal,
};
use fmtp_core::{Deassociation, Error, FmtpPacket, FmtpType, SystemSignal};
use fmtp_tokio::{
    Client, ConnectionEvent, Message, Status, handler_fn,
    transport::{read_packet, send_packet},
};
use tokio::{
    io::{AsyncRead, AsyncWriteExt as _, ReadBuf},
    sync::mpsc::unbounded_channel,
    time::{Instant, sleep},
};

#[tokio::test(start_paused = true)]
async fn heartbeats_then_shutdown_on_silent_peer() {
    let (tx, mut events) = unbounded_channel();
    let client = Client::with_handler(fast_config("CLIENT"), tx);
    let (conn, mut peer) = connected(&client).await;
    associated(&conn, &mut peer).await;
    let start = Instant::now();

    let mut heartbeats = Vec::new();
    loop {
        let frame = next_frame(&mut peer).await;
        let elapsed = start.elapsed();
        match frame.data() {
            b"03" => heartbeats.push(elapsed),
            b"00" => {
                assert!(elapsed >= Duration::from_millis(495), "{elapsed:?}");
                assert!(elapsed <= Duration::from_millis(520), "{elapsed:?}");
                break;
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    assert!(heartbeats.len() >= 4, "{heartbeats:?}");
    for (i, at) in heartbeats.iter().take(4).enumerate() {
        let expected = Duration::from_millis(100) * (u32::try_from(i).unwrap() + 1);
        assert!(at.abs_diff(expected) <= Duration::from_millis(5), "{at:?}");
    }

    match events.recv().await {
        Some(ConnectionEvent::Shutdown { remote, reason }) => {
            assert_eq!(remote.to_string(), "SERVER");
            assert_eq!(reason, Deassociation::PeerSilent);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(conn.status(), Status::Established);
}

#[tokio::test(start_paused = true)]
async fn peer_heartbeats_keep_association_and_data_is_delivered() {
    let (tx, mut events) = unbounded_channel();
    let client = Client::with_handler(fast_config("CLIENT"), tx);
    let (conn, mut peer) = connected(&client).await;
    associated(&conn, &mut peer).await;

    let (mut peer_rx, mut peer_tx) = tokio::io::split(peer);
    let drain = tokio::spawn(async move {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = read_packet(&mut peer_rx).await {
            frames.push(frame.into_data());
        }
        frames
    });

    for _ in 0..5 {
        sleep(Duration::from_millis(300)).await;
        send_packet(
            &mut peer_tx,
            FmtpPacket::system(SystemSignal::Heartbeat),
            deadline(),
        )
        .await
        .unwrap();
    }
    assert_eq!(conn.status(), Status::Associated);

    send_packet(
        &mut peer_tx,
        FmtpPacket::new(FmtpType::Operational, "-TITLE IFPL").unwrap(),
        deadline(),
    )
    .await
    .unwrap();
    match events.recv().await {
        Some(ConnectionEvent::Data { remote, msg }) => {
            assert_eq!(remote.to_string(), "SERVER");
            assert_eq!(msg.typ(), FmtpType::Operational);
            assert_eq!(msg.data(), b"-TITLE IFPL");
        }
        other => panic!("unexpected event {other:?}"),
    }

    conn.disconnect(deadline()).await.unwrap();
    conn.closed().await;
    drop(peer_tx);
    let frames = drain.await.unwrap();
    assert_eq!(frames.last().map(Vec::as_slice), Some(&b"00"[..]));
    assert!(frames[..frames.len() - 1].iter().all(|f| f == b"03"));
}

#[tokio::test(start_paused = true)]
async fn associate_times_out_without_startup() {
    let client = Client::new(fast_config("CLIENT"));
    let (conn, mut peer) = connected(&client).await;

    let start = Instant::now();
    let result = conn.associate(deadline()).await;
    assert!(
        matches!(result, Err(Error::AssociationTimeoutExceeded)),
        "{result:?}"
    );
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(1005), "{elapsed:?}");
    assert_eq!(next_frame(&mut peer).await.data(), b"01");
    assert_eq!(conn.status(), Status::Established);
}

#[tokio::test(start_paused = true)]
async fn associate_refused_by_shutdown() {
    let client = Client::new(config("CLIENT"));
    let (conn, mut peer) = connected(&client).await;

    let (result, ()) = tokio::join!(conn.associate(deadline()), async {
        assert_eq!(next_frame(&mut peer).await.data(), b"01");
        send_signal(&mut peer, SystemSignal::Shutdown).await;
    });
    assert!(matches!(result, Err(Error::AssociationRefused)), "{result:?}");
    assert_eq!(conn.status(), Status::Established);
}

#[tokio::test(start_paused = true)]
async fn remote_startup_is_confirmed() {
    let client = Client::new(config("CLIENT"));
    let (conn, mut peer) = connected(&client).await;

    send_signal(&mut peer, SystemSignal::Startup).await;
    assert_eq!(next_frame(&mut peer).await.data(), b"01");
    conn.subscribe()
        .wait_for(|status| *status == Status::Associated)
        .await
        .unwrap();
    conn.associate(deadline()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn remote_shutdown_is_reported() {
    let (tx, mut events) = unbounded_channel();
    let client = Client::with_handler(config("CLIENT"), tx);
    let (conn, mut peer) = connected(&client).await;
    associated(&conn, &mut peer).await;

    send_signal(&mut peer, SystemSignal::Shutdown).await;
    match events.recv().await {
        Some(ConnectionEvent::Shutdown { reason, .. }) => {
            assert_eq!(reason, Deassociation::Remote);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(conn.status(), Status::Established);
}

#[tokio::test(start_paused = true)]
async fn data_before_association_closes_connection() {
    let (tx, mut events) = unbounded_channel();
    let client = Client::with_handler(config("CLIENT"), tx);
    let (conn, mut peer) = connected(&client).await;
    assert_eq!(client.remotes().await.len(), 1);

    send_packet(
        &mut peer,
        FmtpPacket::new(FmtpType::Operator, "too early").unwrap(),
        deadline(),
    )
    .await
    .unwrap();

    conn.closed().await;
    assert!(matches!(
        events.recv().await,
        Some(ConnectionEvent::Failed { .. })
    ));
    assert!(client.remotes().await.is_empty());
    assert!(matches!(
        conn.send(Message::operational("late"), deadline()).await,
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn send_associates_first() {
    let client = Client::new(config("CLIENT"));
    let (conn, mut peer) = connected(&client).await;

    let (result, ()) = tokio::join!(
        conn.send(Message::operator("hello"), deadline()),
        async {
            assert_eq!(next_frame(&mut peer).await.data(), b"01");
            send_signal(&mut peer, SystemSignal::Startup).await;
            let data = next_frame(&mut peer).await;
            assert_eq!(data.typ(), Some(FmtpType::Operator));
            assert_eq!(data.data(), b"hello");
        }
    );
    result.unwrap();
    assert_eq!(conn.status(), Status::Associated);
}

#[tokio::test(start_paused = true)]
async fn disconnect_aborts_pending_send() {
    let client = Client::new(config("CLIENT"));
    let (conn, mut peer) = connected(&client).await;

    let send = tokio::spawn({
        let conn = conn.clone();
        async move { conn.send(Message::operational("queued"), deadline()).await }
    });
    conn.subscribe()
        .wait_for(|status| *status == Status::AssociationPending)
        .await
        .unwrap();
    conn.disconnect(deadline()).await.unwrap();

    let result = send.await.unwrap();
    assert!(matches!(result, Err(Error::AssociationAborted)), "{result:?}");
    assert_eq!(next_frame(&mut peer).await.data(), b"01");
    assert_eq!(next_frame(&mut peer).await.data(), b"00");
    conn.closed().await;
    assert!(client.remotes().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn oversized_send_keeps_association() {
    let client = Client::new(config("CLIENT"));
    let (conn, mut peer) = connected(&client).await;
    associated(&conn, &mut peer).await;

    let result = conn
        .send(Message::operational(vec![b'x'; 32757]), deadline())
        .await;
    assert!(matches!(result, Err(Error::BodyTooLarge { .. })), "{result:?}");
    assert_eq!(conn.status(), Status::Associated);

    let (result, frame) = tokio::join!(
        conn.send(Message::operational(vec![b'x'; 32756]), deadline()),
        next_frame(&mut peer),
    );
    result.unwrap();
    assert_eq!(frame.frame_len(), 32761);
}

#[tokio::test(start_paused = true)]
async fn deassociate_keeps_connection() {
    let client = Client::new(config("CLIENT"));
    let (conn, mut peer) = connected(&client).await;

    conn.deassociate(deadline()).await.unwrap();
    associated(&conn, &mut peer).await;
    conn.deassociate(deadline()).await.unwrap();
    assert_eq!(next_frame(&mut peer).await.data(), b"00");
    assert_eq!(conn.status(), Status::Established);
    assert_eq!(client.remotes().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn operation_deadline_exceeded() {
    let client = Client::new(config("CLIENT"));
    let (conn, _peer) = connected(&client).await;

    let result = conn
        .associate(Instant::now() + Duration::from_millis(10))
        .await;
    assert!(matches!(result, Err(Error::DeadlineExceeded)), "{result:?}");
}

#[tokio::test(start_paused = true)]
async fn counters_include_handshake() {
    let client = Client::new(config("CLIENT"));
    let (conn, mut peer) = connected(&client).await;
    // "CLIENT-SERVER" + "ACCEPT", each behind a 5 byte header
    assert_eq!(conn.bytes_sent(), 29);
    let received = conn.bytes_received();
    assert_eq!(received, 29);

    associated(&conn, &mut peer).await;
    assert_eq!(conn.bytes_sent(), 36);
    assert_eq!(conn.bytes_received(), received + 7);
}

struct BrokenSource;

impl AsyncRead for BrokenSource {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }
}

#[tokio::test(start_paused = true)]
async fn failing_body_source_keeps_association() {
    let client = Client::new(config("CLIENT"));
    let (conn, mut peer) = connected(&client).await;
    associated(&conn, &mut peer).await;

    let short = Message::from_reader(FmtpType::Operational, Cursor::new(b"abc".to_vec()))
        .unwrap()
        .with_len(5);
    let result = conn.send(short, deadline()).await;
    assert!(
        matches!(result, Err(Error::TruncatedBody { expected: 5, got: 3 })),
        "{result:?}"
    );
    assert_eq!(conn.status(), Status::Associated);

    let broken = Message::from_reader(FmtpType::Operator, BrokenSource).unwrap();
    let result = conn.send(broken, deadline()).await;
    assert!(matches!(result, Err(Error::Io(_))), "{result:?}");
    assert_eq!(conn.status(), Status::Associated);
    assert_eq!(client.remotes().await.len(), 1);

    let (result, frame) = tokio::join!(
        conn.send(Message::operational("after"), deadline()),
        next_frame(&mut peer),
    );
    result.unwrap();
    assert_eq!(frame.data(), b"after");
}

#[tokio::test(start_paused = true)]
async fn malformed_frame_closes_connection() {
    let (tx, mut events) = unbounded_channel();
    let client = Client::with_handler(config("CLIENT"), tx);
    let (conn, mut peer) = connected(&client).await;
    associated(&conn, &mut peer).await;

    // length 4 is shorter than the header itself
    peer.write_all(&[2, 0, 0, 4, 1]).await.unwrap();

    conn.closed().await;
    match events.recv().await {
        Some(ConnectionEvent::Failed { remote, error }) => {
            assert_eq!(remote.to_string(), "SERVER");
            assert!(error.contains("malformed header"), "{error}");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(client.remotes().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stalled_heartbeat_closes_connection() {
    let (tx, mut events) = unbounded_channel();
    let client = Client::with_handler(fast_config("CLIENT"), tx);
    let (conn, mut peer) = connected_with_buffer(&client, 16).await;
    associated(&conn, &mut peer).await;
    let start = Instant::now();

    // the peer stops reading, the third heartbeat only fits partially
    conn.closed().await;
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
    match events.recv().await {
        Some(ConnectionEvent::Failed { error, .. }) => {
            assert!(error.contains("send interrupted"), "{error}");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(client.remotes().await.is_empty());
    drop(peer);
}

#[tokio::test(start_paused = true)]
async fn orders_are_served_while_peer_floods() {
    let client = Client::new(config("CLIENT"));
    let (conn, mut peer) = connected(&client).await;
    associated(&conn, &mut peer).await;

    let (mut peer_rx, mut peer_tx) = tokio::io::split(peer);
    let heartbeat = FmtpPacket::system(SystemSignal::Heartbeat).into_bytes();
    let flood = tokio::spawn(async move {
        for _ in 0..20_000 {
            peer_tx.write_all(&heartbeat).await.unwrap();
        }
    });

    conn.send(Message::operational("urgent"), deadline())
        .await
        .unwrap();
    assert!(!flood.is_finished());
    assert_eq!(next_frame(&mut peer_rx).await.data(), b"urgent");
    flood.abort();
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_frees_the_remote() {
    let client = Client::with_handler(
        config("CLIENT"),
        handler_fn(|_, _| panic!("handler failure")),
    );
    let (conn, mut peer) = connected(&client).await;
    associated(&conn, &mut peer).await;

    send_packet(
        &mut peer,
        FmtpPacket::new(FmtpType::Operational, "boom").unwrap(),
        deadline(),
    )
    .await
    .unwrap();
    conn.closed().await;
    assert_eq!(conn.status(), Status::Closed);
    assert!(client.remotes().await.is_empty());
    assert!(client.connection(conn.remote_id()).await.is_none());

    let (again, _peer) = connected(&client).await;
    assert_ne!(again.session_id(), conn.session_id());
    assert_eq!(client.remotes().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_returns_once_stream_is_closed() {
    let client = Client::new(config("CLIENT"));
    let (conn, mut peer) = connected(&client).await;
    associated(&conn, &mut peer).await;

    conn.disconnect(deadline()).await.unwrap();
    assert_eq!(conn.status(), Status::Closed);
    assert!(client.remotes().await.is_empty());

    assert_eq!(next_frame(&mut peer).await.data(), b"00");
    assert!(read_packet(&mut peer).await.unwrap().is_none());
}
