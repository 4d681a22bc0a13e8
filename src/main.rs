use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use perch::lobby::directory::{InMemoryDirectory, Privilege};
use perch::lobby::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("perch — where players roost between games");

    // Bind address: configurable via PERCH_BIND, localhost by default.
    let bind_addr = std::env::var("PERCH_BIND").unwrap_or_else(|_| "127.0.0.1:7396".to_string());

    // Registered users come from a directory service in a full deployment;
    // PERCH_SUPERUSER=name:secret seeds one account for small setups.
    let mut directory = InMemoryDirectory::new();
    if let Ok(spec) = std::env::var("PERCH_SUPERUSER") {
        if let Some((name, secret)) = spec.split_once(':') {
            directory.add_user(name, secret, Privilege::Superuser);
            info!(name, "seeded superuser");
        }
    }

    let server = Server::new(Arc::new(directory));
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("perch listening on {bind_addr}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, addr) = accepted?;
                info!(%addr, "new connection");
                server.accept(socket);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                server.shutdown();
                server.wait_till_shutdown().await;
                return Ok(());
            }
        }
    }
}
