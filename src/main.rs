use bili_cohost::app::{working_dir, App};
use bili_cohost::config::AppConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let start_dir = working_dir();

    let config = match AppConfig::load(&start_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            eprintln!("place a user.json (or user.example.json) next to the binary");
            std::process::exit(1);
        }
    };

    let default_level = if config.env.is_dev() { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("bili_cohost={default_level},info"))),
        )
        .init();

    tracing::info!(
        mode = ?config.env.mode,
        llm_mock = config.env.llm_mock_enabled,
        use_llm = config.user.use_llm_replay,
        "bili-cohost starting"
    );

    if let Err(e) = App::new(config, start_dir).run().await {
        tracing::error!(error = %format!("{e:#}"), "fatal error");
        std::process::exit(1);
    }
}
