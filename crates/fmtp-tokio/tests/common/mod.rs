#![allow(dead_code, reason = "not every test binary uses every helper")]

use std::time::Duration;

use fmtp_core::{
    Config, FmtpIdentifier, FmtpPacket, IdRequest, IdResponse, Identification, SystemSignal,
    Timers,
};
use fmtp_tokio::{
    Client, Connection,
    transport::{receive, send_packet},
};
use tokio::{
    io::{AsyncRead, DuplexStream, duplex},
    time::Instant,
};

pub fn id(s: &str) -> FmtpIdentifier {
    FmtpIdentifier::new(s).unwrap()
}

pub fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(30)
}

pub fn config(local: &str) -> Config {
    Config::new(id(local))
}

pub fn fast_config(local: &str) -> Config {
    Config::new(id(local)).with_timers(
        Timers::new(
            Duration::from_secs(12),
            Duration::from_millis(100),
            Duration::from_millis(500),
        )
        .with_startup(Duration::from_secs(1)),
    )
}

/// Plays the responder side of the handshake by hand.
pub async fn peer_handshake(stream: &mut DuplexStream, local: &str, remote: &str) {
    let request = receive(stream, deadline()).await.unwrap();
    assert_eq!(request.data(), format!("{remote}-{local}").as_bytes());
    let own = IdRequest::new(id(local), id(remote));
    send_packet(
        stream,
        FmtpPacket::identification(&Identification::Request(own)),
        deadline(),
    )
    .await
    .unwrap();
    send_packet(
        stream,
        FmtpPacket::identification(&Identification::Response(IdResponse::Accept)),
        deadline(),
    )
    .await
    .unwrap();
    let response = receive(stream, deadline()).await.unwrap();
    assert_eq!(response.data(), b"ACCEPT");
}

/// A connection from `client` to a hand driven peer called SERVER.
pub async fn connected(client: &Client) -> (Connection, DuplexStream) {
    connected_with_buffer(client, 64 * 1024).await
}

/// As [`connected`], each direction buffering at most `size` bytes.
pub async fn connected_with_buffer(client: &Client, size: usize) -> (Connection, DuplexStream) {
    let (local, mut peer) = duplex(size);
    let local_id = client.config().local_id.to_string();
    let (conn, ()) = tokio::join!(
        client.connect_stream(local, id("SERVER"), deadline()),
        peer_handshake(&mut peer, "SERVER", &local_id),
    );
    (conn.unwrap(), peer)
}

pub async fn send_signal(peer: &mut DuplexStream, signal: SystemSignal) {
    send_packet(peer, FmtpPacket::system(signal), deadline())
        .await
        .unwrap();
}

pub async fn next_frame<R: AsyncRead + Unpin>(peer: &mut R) -> FmtpPacket {
    receive(peer, deadline()).await.unwrap()
}

/// Associates `conn`, the peer confirms the STARTUP.
pub async fn associated(conn: &Connection, peer: &mut DuplexStream) {
    let (result, ()) = tokio::join!(conn.associate(deadline()), async {
        assert_eq!(next_frame(peer).await.data(), b"01");
        send_signal(peer, SystemSignal::Startup).await;
    });
    result.unwrap();
}
