use fmtp_core::{Config, FmtpIdentifier};
use fmtp_tokio::{Connection, Server, handler_fn};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

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

    let config = Config::new(FmtpIdentifier::new("SERVER")?);

    let server = Server::new(
        config,
        handler_fn(|conn: &Connection, msg| {
            info!("{}: msg received, {msg}", conn.remote_id());
        }),
    )
    .on_tcp(|addr| info!("TCP connection from {addr}"))
    .on_connection(|conn| {
        info!(
            "FMTP connection with {} ({})",
            conn.remote_id(),
            conn.session_id()
        );
    });

    server.listen_and_serve("127.0.0.1:8500").await?;

    Ok(())
}
