use clap::Parser;
use fabric_modules::registry::server::RegistryServer;

/// Standalone registry process for a co-simulation domain: accepts
/// participant announcements and brokers the initial peer roster.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on for participant connections.
    #[clap(short, long, default_value_t = 8500)]
    port: u16,

    /// Verbosity
    #[clap(flatten)]
    verbosity: clap_verbosity_flag::Verbosity,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut logger = env_logger::Builder::new();
    logger.filter_level(args.verbosity.log_level_filter());
    logger.parse_env("RUST_LOG");
    logger.try_init().expect("Failed to initialize logger");

    let registry = RegistryServer::new();
    log::info!("Started listening on port {}", args.port);
    registry.run(args.port).await?;
    Ok(())
}
