use switchboard::sender::Sender;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard=info,tower_http=info".into()),
        )
        .init();

    let (state, router) = switchboard::create_app().await?;

    Sender::new(
        state.handler_context(),
        state.registry.clone(),
        state.config.sender.workers,
    )
    .start();

    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {addr}");
    axum::serve(listener, router).await?;
    Ok(())
}
