//! sluice
//!
//! Tunnel TCP over an HTTP relay that pairs same-path POST and GET
//! requests. The client host listens on a local port and forwards accepted
//! connections through the relay; the server host forwards relay traffic
//! into a local TCP service. Neither end can reach the other directly; both
//! only ever talk HTTP(S) to the relay.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dialoguer::Password;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sluice::config::{FileConfig, Role, TunnelConfig};
use sluice::crypto::CipherKind;
use sluice::relay::{
    build_http_client, generate_paths, parse_header_strings, url_join, HeaderEntry, PathPair,
};
use sluice::tunnel::TunnelManager;

#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(author, version, about = "Tunnel TCP over an HTTP relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Relay server base URL
    #[arg(short = 's', long, global = true, env = "SLUICE_RELAY")]
    relay: Option<String>,

    /// Extra header sent on every relay request, as "Key: Value" (repeatable)
    #[arg(short = 'H', long = "header", global = true)]
    headers: Vec<String>,

    /// Accept invalid TLS certificates from the relay
    #[arg(long, global = true)]
    insecure: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the client host: listen locally, forward through the relay
    Client(ClientArgs),

    /// Run the server host: forward relay traffic into a local service
    Server(ServerArgs),
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Local TCP port to listen on (0 = ephemeral)
    #[arg(short = 'p', long, default_value = "0")]
    port: u16,

    /// Local address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[command(flatten)]
    tunnel: TunnelArgs,

    /// Relay paths: none (random pair), one base, or the two explicit paths
    #[arg(num_args = 0..=2)]
    paths: Vec<String>,
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// TCP port of the local service to forward to
    #[arg(short = 'p', long)]
    port: u16,

    /// Host of the local service to forward to
    #[arg(long, default_value = "localhost")]
    host: String,

    #[command(flatten)]
    tunnel: TunnelArgs,

    /// Relay paths: none (random pair), one base, or the two explicit paths
    #[arg(num_args = 0..=2)]
    paths: Vec<String>,
}

/// Flags shared by both roles. The two ends must agree on --mux, --symmetric
/// and --cipher for the tunnel to carry bytes.
#[derive(Args, Debug)]
struct TunnelArgs {
    /// Copy-loop buffer size in bytes for the non-multiplexed channel
    #[arg(long, default_value = "16")]
    buf_size: usize,

    /// Multiplex many connections over the one relay channel
    #[arg(long)]
    mux: bool,

    /// Copy-loop buffer size in bytes for each multiplexed stream
    #[arg(long, default_value = "4096")]
    mux_buf_size: usize,

    /// Encrypt the tunnel symmetrically with a passphrase
    #[arg(short = 'c', long)]
    symmetric: bool,

    /// Passphrase for encryption (prompted for when omitted)
    #[arg(long)]
    passphrase: Option<String>,

    /// Cipher: aes-ctr or aes-gcm
    #[arg(long, default_value = "aes-ctr")]
    cipher: CipherKind,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let file = FileConfig::load().unwrap_or_default();
    let relay = cli.relay.or(file.relay.server).with_context(|| {
        format!(
            "relay server required: use --relay, SLUICE_RELAY, or set relay.server in {}",
            FileConfig::config_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "the config file".to_string())
        )
    })?;

    let mut header_strings = file.relay.headers;
    header_strings.extend(cli.headers);
    let headers = parse_header_strings(&header_strings)?;

    let http = build_http_client(cli.insecure)?;

    match cli.command {
        Commands::Client(args) => run_client(&relay, headers, http, args).await,
        Commands::Server(args) => run_server(&relay, headers, http, args).await,
    }
}

async fn run_client(
    relay: &str,
    headers: Vec<HeaderEntry>,
    http: reqwest::Client,
    args: ClientArgs,
) -> Result<()> {
    let paths = generate_paths(&args.paths)?;
    print_peer_hint(relay, "server", &args.tunnel, &paths);

    let passphrase = resolve_passphrase(&args.tunnel)?;
    let config = TunnelConfig {
        role: Role::Client,
        host: args.host,
        port: args.port,
        upload_url: url_join(relay, &paths.client_to_server)?,
        download_url: url_join(relay, &paths.server_to_client)?,
        headers,
        buf_size: args.tunnel.buf_size,
        multiplex: args.tunnel.mux,
        mux_buf_size: args.tunnel.mux_buf_size,
        encrypt: args.tunnel.symmetric,
        passphrase,
        cipher: args.tunnel.cipher,
    };

    TunnelManager::new(config, http).run().await
}

async fn run_server(
    relay: &str,
    headers: Vec<HeaderEntry>,
    http: reqwest::Client,
    args: ServerArgs,
) -> Result<()> {
    let paths = generate_paths(&args.paths)?;
    print_peer_hint(relay, "client", &args.tunnel, &paths);

    let passphrase = resolve_passphrase(&args.tunnel)?;
    let config = TunnelConfig {
        role: Role::Server,
        host: args.host,
        port: args.port,
        // The mirror image of the client: upload on the server-to-client
        // path, download on the client-to-server path.
        upload_url: url_join(relay, &paths.server_to_client)?,
        download_url: url_join(relay, &paths.client_to_server)?,
        headers,
        buf_size: args.tunnel.buf_size,
        multiplex: args.tunnel.mux,
        mux_buf_size: args.tunnel.mux_buf_size,
        encrypt: args.tunnel.symmetric,
        passphrase,
        cipher: args.tunnel.cipher,
    };

    TunnelManager::new(config, http).run().await
}

/// Print the command line the peer host should run.
fn print_peer_hint(relay: &str, peer_role: &str, tunnel: &TunnelArgs, paths: &PathPair) {
    let mut flags = String::new();
    if tunnel.mux {
        flags.push_str("--mux ");
    }
    if tunnel.symmetric {
        flags.push_str("-c ");
    }

    println!("Hint: run on the {} host:", peer_role);
    println!(
        "  sluice -s {} {} -p <YOUR PORT> {}{} {}",
        relay, peer_role, flags, paths.client_to_server, paths.server_to_client
    );
}

/// Prompt for the passphrase when encryption is on and none was given.
fn resolve_passphrase(tunnel: &TunnelArgs) -> Result<Option<String>> {
    if !tunnel.symmetric {
        return Ok(None);
    }
    match &tunnel.passphrase {
        Some(p) if !p.is_empty() => Ok(Some(p.clone())),
        _ => {
            let entered = Password::new()
                .with_prompt("Passphrase")
                .interact()
                .context("failed to read passphrase")?;
            Ok(Some(entered))
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
