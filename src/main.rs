use clap::Parser;
use tracing::{error, info};
use vidtube::cli::{
    Args, build_config, init_logging, load_secrets, open_database, open_media_store,
};
use vidtube::{API_PREFIX, run_server};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_logging(&args.log_format);

    let Some(secrets) = load_secrets(&args) else {
        std::process::exit(1);
    };

    let Some(db) = open_database(&args.database).await else {
        std::process::exit(1);
    };

    let Some(media) = open_media_store(&args.media_dir, &args.media_base_url).await else {
        std::process::exit(1);
    };

    let config = build_config(&args, db, media, secrets);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            error!(address = %addr, error = %e, "Failed to bind");
            std::process::exit(1);
        });

    let local_addr = listener.local_addr().unwrap_or_else(|e| {
        error!(error = %e, "Failed to get local address");
        std::process::exit(1);
    });

    info!(address = %local_addr, prefix = API_PREFIX, "Listening");

    if let Err(e) = run_server(config, listener).await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
