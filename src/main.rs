use clap::Parser;
use imp_mesh::config::Config;
use imp_mesh::logging::{setup_logging, short_hostname};
use imp_mesh::network::server::RendezvousServer;
use imp_mesh::shutdown::ShutdownManager;

#[derive(Parser, Debug)]
#[command(name = "imp-rendezvous")]
#[command(about = "Rendezvous and relay server for the imp peer mesh", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Overrides rendezvous.listen_address (and $PORT)
    #[arg(long)]
    listen_addr: Option<String>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.generate_config {
        match Config::default().save_to_file(&args.config) {
            Ok(()) => {
                println!("✅ Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let config = match Config::load_or_create(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    setup_logging(&config.logging, args.verbose);

    let listen_addr = match args.listen_addr {
        Some(addr) => addr,
        None => match config.rendezvous.effective_listen_address() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!("❌ {}", e);
                std::process::exit(1);
            }
        },
    };

    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    tracing::info!(
        "🚀 imp-rendezvous v{} ({}) on {}",
        version,
        git_hash,
        short_hostname()
    );

    let server = match RendezvousServer::bind(&listen_addr, config.rendezvous.command_buffer).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("❌ Failed to bind {}: {}", listen_addr, e);
            std::process::exit(1);
        }
    };

    let mut shutdown_manager = ShutdownManager::new();
    let token = shutdown_manager.token();
    shutdown_manager.register_task(tokio::spawn(async move {
        if let Err(e) = server.run(token.clone()).await {
            tracing::error!("❌ Rendezvous server failed: {}", e);
            token.cancel();
        }
    }));

    shutdown_manager.wait_for_shutdown().await;
}
