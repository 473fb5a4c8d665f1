use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("routerx=info")),
        )
        .init();

    let settings = routerx::config::Settings::from_env();
    if let Err(err) = routerx::server::serve(settings).await {
        tracing::error!("fatal: {err}");
        std::process::exit(1);
    }
}
