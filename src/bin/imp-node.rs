//! Interactive mesh node. Reads commands from stdin and prints mesh events.
//!
//!   /dm <id> <text>                 direct message
//!   /group create <name> <a,b,...>  create a group and announce it
//!   /g <group> <text>               group message (by id or name)
//!   /groups /peers /links           local state
//!   /connect <id>                   open a peer link manually
//!   /profile <display name>         update the display name
//!   /quit

use clap::Parser;
use imp_mesh::config::{self, Config};
use imp_mesh::logging::setup_logging;
use imp_mesh::shutdown::ShutdownManager;
use imp_mesh::{Identity, MeshEvent, MeshNode, Route};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "imp-node")]
#[command(about = "Interactive node on the imp peer mesh", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Alias to join as; defaults to the identity stored by the last run
    #[arg(short, long)]
    alias: Option<String>,

    #[arg(long)]
    avatar: Option<String>,

    /// Overrides node.rendezvous_address
    #[arg(long)]
    rendezvous: Option<String>,

    /// Overrides node.listen_address
    #[arg(long)]
    listen_addr: Option<String>,

    /// Where the chosen identity is stored
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match Config::load_or_create(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(addr) = args.rendezvous {
        config.node.rendezvous_address = addr;
    }
    if let Some(addr) = args.listen_addr {
        config.node.listen_address = addr;
    }

    setup_logging(&config.logging, args.verbose);

    let data_dir = args.data_dir.unwrap_or_else(config::get_data_dir);
    let identity = match (args.alias, config::load_identity(&data_dir)) {
        (Some(alias), _) => Identity::new(&alias, args.avatar.unwrap_or_default()),
        (None, Ok(Some(stored))) => stored,
        (None, Ok(None)) => {
            eprintln!("❌ No stored identity in {}; pass --alias", data_dir.display());
            std::process::exit(1);
        }
        (None, Err(e)) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let node = Arc::new(MeshNode::new(config.node.clone()));
    let mut events = node.subscribe();

    let address = match node.join(identity.clone()).await {
        Ok(address) => address,
        Err(e) => {
            eprintln!("❌ Failed to join: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config::save_identity(&data_dir, &identity) {
        tracing::warn!("Could not store identity: {}", e);
    }
    println!("✅ Joined as {} ({})", identity.id, address);
    print_peers(&node);

    let mut shutdown_manager = ShutdownManager::new();
    let token = shutdown_manager.token();

    let printer_token = token.clone();
    shutdown_manager.register_task(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = printer_token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        let lost = matches!(event, MeshEvent::RendezvousLost);
                        print_event(&event);
                        if lost {
                            printer_token.cancel();
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        println!("⚠️  {} event(s) dropped", n);
                    }
                    Err(_) => break,
                },
            }
        }
    }));

    let input_node = node.clone();
    let input_token = token.clone();
    shutdown_manager.register_task(tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = input_token.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    if !run_command(&input_node, line.trim()).await {
                        input_token.cancel();
                        break;
                    }
                }
                Ok(None) | Err(_) => {
                    input_token.cancel();
                    break;
                }
            }
        }
    }));

    shutdown_manager.wait_for_signal().await;
    if let Err(e) = node.leave().await {
        tracing::debug!("Leave: {}", e);
    }
    shutdown_manager.shutdown().await;
    // The stdin reader sits on a blocking thread the runtime would wait for
    std::process::exit(0);
}

/// Returns false when the node should exit.
async fn run_command(node: &MeshNode, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match command {
        "/quit" | "/exit" => return false,
        "/dm" => match rest.split_once(' ') {
            Some((to, text)) => match node.send_direct(to, text.trim()).await {
                Ok(receipt) => {
                    let lock = if receipt.encrypted { "🔒" } else { "⚠️ unencrypted" };
                    println!("→ {} {} via {}", to, lock, route_name(receipt.route));
                }
                Err(e) => println!("❌ {}", e),
            },
            None => println!("usage: /dm <id> <text>"),
        },
        "/group" => {
            let mut parts = rest.splitn(3, ' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("create"), Some(name), Some(members)) => {
                    let members = members.split(',').map(|m| m.trim().to_string());
                    match node.create_group(name, members).await {
                        Ok(group) => println!("👥 Created {} ({})", group.name, group.id),
                        Err(e) => println!("❌ {}", e),
                    }
                }
                _ => println!("usage: /group create <name> <a,b,...>"),
            }
        }
        "/g" => match rest.split_once(' ') {
            Some((target, text)) => {
                let group_id = node
                    .groups()
                    .into_iter()
                    .find(|g| g.id == target || g.name == target)
                    .map(|g| g.id)
                    .unwrap_or_else(|| target.to_string());
                match node.send_group(&group_id, text.trim()).await {
                    Ok(receipt) => println!("→ {} via {}", group_id, route_name(receipt.route)),
                    Err(e) => println!("❌ {}", e),
                }
            }
            None => println!("usage: /g <group> <text>"),
        },
        "/groups" => {
            for group in node.groups() {
                let members: Vec<&str> = group.members.iter().map(|m| m.as_str()).collect();
                println!("  {} {} [{}]", group.id, group.name, members.join(", "));
            }
        }
        "/peers" => print_peers(node),
        "/links" => {
            for address in node.open_connections() {
                println!("  🔗 {}", address);
            }
        }
        "/connect" => match node.connect_to(rest).await {
            Ok(()) => println!("🔗 Connected to {}", rest),
            Err(e) => println!("❌ {}", e),
        },
        "/profile" => {
            let avatar = node.identity().map(|i| i.avatar_ref).unwrap_or_default();
            match node.update_profile(rest, &avatar).await {
                Ok(identity) => println!("✅ Display name is now {}", identity.display_name),
                Err(e) => println!("❌ {}", e),
            }
        }
        _ => println!("unknown command {}", command),
    }
    true
}

fn print_peers(node: &MeshNode) {
    let roster = node.roster();
    if roster.is_empty() {
        println!("  (nobody else online)");
    }
    for entry in roster {
        let key = if entry.identity.public_key.is_some() { "🔑" } else { "  " };
        println!(
            "  {} {} \"{}\" {}",
            key, entry.identity.id, entry.identity.display_name, entry.address
        );
    }
}

fn print_event(event: &MeshEvent) {
    match event {
        MeshEvent::Message(msg) => {
            let scope = match &msg.group_id {
                Some(group) => format!("[{}] ", group),
                None => String::new(),
            };
            let lock = if msg.encrypted { "🔒 " } else { "" };
            println!("{}{}{}: {}", scope, lock, msg.sender_id, msg.text);
        }
        MeshEvent::PeerJoined(entry) => println!("👋 {} joined", entry.identity.id),
        MeshEvent::PeerUpdated(entry) => {
            println!("🔄 {} is now \"{}\"", entry.identity.id, entry.identity.display_name)
        }
        MeshEvent::PeerLeft { id, .. } => println!("👋 {} left", id),
        MeshEvent::PeerConnected { id, .. } => println!("🔗 link to {} open", id),
        MeshEvent::PeerDisconnected { address } => println!("🔌 link to {} closed", address),
        MeshEvent::GroupJoined(group) => println!("👥 added to {} ({})", group.name, group.id),
        MeshEvent::DeliveryPending { recipient, .. } => {
            println!("⏳ {} is not reachable right now", recipient)
        }
        MeshEvent::RendezvousLost => println!("❌ lost the rendezvous server; restart to re-join"),
    }
}

fn route_name(route: Route) -> &'static str {
    match route {
        Route::Direct => "direct link",
        Route::Relayed => "relay",
        Route::Pending => "nowhere (pending)",
    }
}
