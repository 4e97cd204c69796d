//! gRPC bridge command-line front end.
//!
//! Issues one call through the bridge and prints every event as a JSON line.
//!
//! ```text
//!   grpc-bridge --host localhost:50051 --insecure pkg.Svc/Method --data AQI=
//!   grpc-bridge -c bridge.toml pkg.Svc/Watch --mode server-streaming --data AQI=
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use grpc_bridge::{Bridge, CallEvent, CallId, Config, ConnectionId, Metadata};
use std::path::PathBuf;
use std::sync::Arc;

const CONNECTION_ID: ConnectionId = 1;
const CALL_ID: CallId = 1;

#[derive(Parser, Debug)]
#[command(name = "grpc-bridge")]
#[command(about = "Issue a gRPC call through the bridge and print its events")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Target host[:port], overriding the configuration file
    #[arg(long)]
    host: Option<String>,

    /// Use plaintext HTTP/2
    #[arg(long)]
    insecure: bool,

    /// Method path (e.g., "pkg.Service/Method")
    #[arg(required_unless_present = "print_config")]
    path: Option<String>,

    /// Call shape
    #[arg(long, default_value = "unary")]
    mode: Mode,

    /// Base64 request message; repeat for client streaming
    #[arg(long)]
    data: Vec<String>,

    /// Request header as key=value
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
enum Mode {
    #[default]
    Unary,
    ServerStreaming,
    ClientStreaming,
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Some(host) = &args.host {
        config.connection.host = Some(host.clone());
    }
    if args.insecure {
        config.connection.insecure = Some(true);
    }

    grpc_bridge::logging::init(&config.logging);

    match run(&args, &config) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            tracing::error!(error = %e, "call failed to start");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Run the call to completion. Returns whether it closed with an OK status.
fn run(args: &Args, config: &Config) -> Result<bool, Box<dyn std::error::Error>> {
    let path = args.path.as_deref().unwrap_or_default();
    let headers: Metadata = args.headers.iter().cloned().collect();
    let mut payloads = args
        .data
        .iter()
        .map(|data| STANDARD.decode(data).map(Bytes::from))
        .collect::<Result<Vec<_>, _>>()?;

    let (tx, rx) = crossbeam_channel::unbounded::<CallEvent>();
    let bridge = Arc::new(Bridge::new(tx)?);
    bridge.configure_connection(CONNECTION_ID, &config.connection)?;

    let cancel = bridge.clone();
    ctrlc::set_handler(move || {
        cancel.cancel(CALL_ID);
    })?;

    match args.mode {
        Mode::Unary | Mode::ServerStreaming => {
            if payloads.len() > 1 {
                tracing::warn!(count = payloads.len(), "only the first message is sent");
            }
            let payload = if payloads.is_empty() {
                Bytes::new()
            } else {
                payloads.swap_remove(0)
            };

            if args.mode == Mode::Unary {
                bridge.start_unary(CALL_ID, CONNECTION_ID, path, payload, &headers)?;
            } else {
                bridge.start_server_streaming(CALL_ID, CONNECTION_ID, path, payload, &headers)?;
            }
        }
        Mode::ClientStreaming => {
            if payloads.is_empty() {
                return Err("client streaming needs at least one --data message".into());
            }
            for payload in payloads {
                bridge.send_client_streaming(CALL_ID, CONNECTION_ID, path, payload, &headers)?;
            }
            bridge.finish_client_streaming(CALL_ID);
        }
    }

    let mut ok = true;
    for event in rx.iter() {
        println!("{}", serde_json::to_string(&event)?);
        if matches!(event, CallEvent::Error { .. }) {
            ok = false;
        }
        if event.is_terminal() {
            break;
        }
    }

    Ok(ok)
}

fn print_default_config() {
    let config = r#"# gRPC Bridge Configuration

[connection]
# Target host[:port] (required, or pass --host)
host = "localhost:50051"

# Plaintext HTTP/2 instead of TLS
insecure = false

# Maximum response message size in bytes (0 = unlimited)
# responseSizeLimit = 4194304

# HTTP/2 keepalive pings
keepalive = true

# Keepalive ping interval in seconds (unset = no pings)
# keepaliveInterval = 30

# Keepalive ping timeout in seconds
keepaliveTimeout = 20

# Message encoding: "gzip", "zstd" or "identity"
# compressionName = "gzip"

# Compress request messages with compressionName
compression = false

# Per-call deadline in milliseconds (unset = none)
# requestTimeout = 5000

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
level = "warn"

# Log format: "pretty", "json", or "compact"
format = "compact"
"#;
    print!("{}", config);
}
