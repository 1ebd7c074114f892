use clap::Parser;
use toolbus::error::EXIT_CONFIG;
use toolbus::{Coordinator, RuntimeConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Runtime agent bridging MCP clients to workspace tool servers over a
/// message bus. Configuration is environment-driven; the credential
/// variables decide the operational mode.
#[derive(Parser)]
#[command(name = "toolbus", version, about)]
struct Cli {}

#[tokio::main]
async fn main() {
    let _cli = Cli::parse();

    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            // The bus is never touched on a bad environment.
            eprintln!("{e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    init_tracing(&config);
    info!(mode = %config.mode, "starting runtime agent");

    let code = Coordinator::new(config).run().await;
    std::process::exit(code);
}

/// `RUST_LOG` wins when set; otherwise the filter is assembled from
/// `LOG_LEVEL` and the per-component `LOG_LEVELS` pairs. Logs go to stderr
/// unconditionally — stdout belongs to MCP in stdio mode.
fn init_tracing(config: &RuntimeConfig) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let mut spec = vec![config.log_level.clone().unwrap_or_else(|| "info".to_string())];
        spec.push("rmcp=warn".to_string());
        for (target, level) in &config.log_levels {
            spec.push(format!("{target}={level}"));
        }
        EnvFilter::new(spec.join(","))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
