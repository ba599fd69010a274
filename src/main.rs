use drawbridge::{config, observability, run};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| String::from("config.yaml"));
    let config = match config::load_config(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    observability::init_tracing(config.features.log_level.as_deref());

    if let Err(err) = run(config).await {
        tracing::error!("server error: {err}");
        std::process::exit(1);
    }
}
