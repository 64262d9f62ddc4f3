use tiergate::config::Config;
use tiergate::server::GatewayServer;

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

    // Load .env from the binary's directory first, then the cargo project
    // root (target/release/../..), then dotenvy's default CWD search.
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let env_path = dir.join(".env");
        let project_root = dir.join("../../.env");
        if env_path.exists() {
            dotenvy::from_path(&env_path).ok();
        } else if project_root.exists() {
            dotenvy::from_path(&project_root).ok();
        } else {
            dotenvy::dotenv().ok();
        }
    } else {
        dotenvy::dotenv().ok();
    }

    tracing::info!("tiergate starting");

    let config = Config::load()?;
    let addr = config.listen_addr;
    let app = GatewayServer::new(config)?.router();

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    tracing::info!("tiergate shutting down");
    Ok(())
}
