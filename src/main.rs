use rmcp::{ServiceExt, transport::stdio};

use warden::config::Config;
use warden::server::WardenServer;
use warden::service::Warden;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // MCP hosts start us with an arbitrary CWD: prefer a .env next to the binary.
    match std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(".env")))
    {
        Some(path) if path.exists() => {
            dotenvy::from_path(&path).ok();
        }
        _ => {
            dotenvy::dotenv().ok();
        }
    }

    tracing::info!("warden starting");

    let config = Config::load();
    let warden = Warden::new(config)?;
    let server = WardenServer::new(warden);

    let service = server
        .serve(stdio())
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    service.waiting().await?;

    tracing::info!("warden shutting down");
    Ok(())
}
