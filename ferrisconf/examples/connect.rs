//! Basic example: Connect to a NETCONF device and read its configuration
//!
//! This example brings a session up, prints the negotiated capabilities and
//! schema, runs `<get-config>` and keeps the session open for a while so
//! reconnects and notifications can be observed in the log.
//!
//! # Prerequisites
//!
//! - A NETCONF server reachable over SSH (port 830)
//! - Valid credentials (username/password or SSH key)
//! - A directory of `.yang` files for the device's modules
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=debug cargo run --example connect -- --host 192.168.1.1 --user admin --password secret --models ./yang
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ferrisconf::schema::{DirectoryRepository, SchemaCache};
use ferrisconf::session::SessionSnapshot;
use ferrisconf::{
    DeviceBuilder, DeviceHandler, DeviceId, HostKeyVerification, SessionConfig, Target,
};

struct PrintingHandler;

impl DeviceHandler for PrintingHandler {
    fn on_device_connected(&self, device: &DeviceId, snapshot: &Arc<SessionSnapshot>) {
        println!(
            "[{}] up, {} modules in schema context",
            device,
            snapshot.context().sources().len()
        );
    }

    fn on_device_disconnected(&self, device: &DeviceId) {
        println!("[{}] down", device);
    }

    fn on_device_failed(&self, device: &DeviceId, error: &ferrisconf::error::SessionError) {
        println!("[{}] failed: {}", device, error);
    }

    fn on_notification(&self, device: &DeviceId, notification: &str) {
        println!("[{}] notification:\n{}", device, notification);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (set RUST_LOG=debug for verbose output)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let models = Arc::new(SchemaCache::new(Arc::new(DirectoryRepository::new(
        &args.models,
    ))));

    let mut builder = DeviceBuilder::new(&args.host)
        .port(args.port)
        .username(&args.user)
        .host_key_verification(HostKeyVerification::AcceptNew)
        .timeout(Duration::from_secs(args.timeout))
        .session_config(SessionConfig {
            concurrent_rpc_limit: 4,
            ..Default::default()
        })
        .source_repository(models)
        .handler(Arc::new(PrintingHandler));

    if let Some(password) = &args.password {
        builder = builder.password(password);
    } else if let Some(key_path) = &args.key {
        builder = builder.private_key(key_path);
    } else {
        eprintln!("Error: Must provide either --password or --key");
        std::process::exit(1);
    }

    let device = builder.build()?;

    println!("Connecting to {}:{}...", args.host, args.port);
    let snapshot = device.connect().await?;
    println!("Connected! Session id {:?}", snapshot.session_id);
    println!("{}", snapshot.preferences);
    for unresolved in &snapshot.schema.unresolved {
        println!(
            "  not in schema: {} ({:?})",
            unresolved.source, unresolved.reason
        );
    }

    println!("\nExecuting: get-config running");
    println!("{}", "-".repeat(50));
    let reply = device.get_config(Target::Running, None).await?;
    println!("{}", reply.data().unwrap_or_default());
    println!("{}", "-".repeat(50));
    println!("Completed in {:?}", reply.elapsed);

    if args.hold > 0 {
        println!("\nHolding the session for {}s...", args.hold);
        tokio::time::sleep(Duration::from_secs(args.hold)).await;
    }

    println!("\nDisconnecting...");
    device.disconnect().await?;
    println!("Done!");

    Ok(())
}

/// Simple argument parser (avoiding external dependencies)
struct Args {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    key: Option<PathBuf>,
    models: PathBuf,
    timeout: u64,
    hold: u64,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut host = "localhost".to_string();
        let mut port = 830u16;
        let mut user = env::var("USER").unwrap_or_else(|_| "admin".to_string());
        let mut password = None;
        let mut key = None;
        let mut models = PathBuf::from("yang");
        let mut timeout = 30u64;
        let mut hold = 0u64;

        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1).cloned();
            match args[i].as_str() {
                "--host" | "-h" => host = value.unwrap_or(host),
                "--port" | "-p" => port = value.and_then(|v| v.parse().ok()).unwrap_or(830),
                "--user" | "-u" => user = value.unwrap_or(user),
                "--password" | "-P" => password = value,
                "--key" | "-k" => key = value.map(PathBuf::from),
                "--models" | "-m" => models = value.map(PathBuf::from).unwrap_or(models),
                "--timeout" | "-t" => timeout = value.and_then(|v| v.parse().ok()).unwrap_or(30),
                "--hold" => hold = value.and_then(|v| v.parse().ok()).unwrap_or(0),
                "--help" => {
                    Self::print_help();
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {}", other);
                    i += 1;
                    continue;
                }
            }
            i += 2;
        }

        Self {
            host,
            port,
            user,
            password,
            key,
            models,
            timeout,
            hold,
        }
    }

    fn print_help() {
        println!(
            r#"ferrisconf connect example

USAGE:
    cargo run --example connect -- [OPTIONS]

OPTIONS:
    -h, --host <HOST>        Target host [default: localhost]
    -p, --port <PORT>        NETCONF port [default: 830]
    -u, --user <USER>        Username [default: $USER]
    -P, --password <PASS>    Password for authentication
    -k, --key <PATH>         Path to SSH private key
    -m, --models <DIR>       Directory of .yang files [default: ./yang]
    -t, --timeout <SECS>     Connection timeout [default: 30]
    --hold <SECS>            Keep the session open before disconnecting [default: 0]
    --help                   Print this help message
"#
        );
    }
}
