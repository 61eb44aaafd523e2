use std::time::Duration;

use fmtp_core::Config;
use fmtp_core::FmtpIdentifier;
use fmtp_tokio::Client;
use fmtp_tokio::ConnectionEvent;
use fmtp_tokio::Message;
use tokio::io::AsyncReadExt as _;
use tokio::io::stdin;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::ERROR.into())
                .with_env_var("FMTP_LOG")
                .from_env_lossy(),
        )
        .init();

    let (ev_tx, mut ev_rx) = unbounded_channel();
    let client = Client::with_handler(Config::new(FmtpIdentifier::new("CLIENT")?), ev_tx);

    tokio::spawn(async move {
        while let Some(ev) = ev_rx.recv().await {
            match ev {
                ConnectionEvent::Data { remote, msg } => {
                    info!("{remote}: message received: {msg}");
                }
                ConnectionEvent::Shutdown { remote, reason } => {
                    info!("{remote}: association ended: {reason:?}");
                }
                ConnectionEvent::Failed { remote, error } => {
                    info!("{remote}: connection failed: {error}");
                }
            }
        }
    });

    let conn = client
        .connect(
            "127.0.0.1:8500",
            FmtpIdentifier::new("SERVER")?,
            Instant::now() + DEADLINE,
        )
        .await?;
    info!("connected to {}", conn.remote_id());

    let mut stdin = stdin();
    let mut buf = [0; 1];
    while stdin.read(&mut buf).await? == 1 {
        let deadline = Instant::now() + DEADLINE;
        let result = match buf[0] {
            b'a' => {
                debug!("sending startup");
                conn.associate(deadline).await
            }
            b's' => {
                debug!("sending shutdown");
                conn.deassociate(deadline).await
            }
            b'd' => {
                debug!("sending disconnect");
                conn.disconnect(deadline).await?;
                break;
            }
            b'o' => {
                debug!("sending data");
                conn.send(Message::operational("test"), deadline).await
            }
            _ => continue,
        };
        if let Err(e) = result {
            info!("command failed: {e}");
        }
    }
    debug!("ending");

    Ok(())
}
