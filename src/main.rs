//! Burrow - expose services behind NAT through a relay
//!
//! `burrow relay` accepts device tunnels and routes public connections into
//! them by servername or port. `burrow connect` runs on the device and serves
//! the streams the relay sends it.

mod config;
mod device;
mod relay;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use burrow_relay::{Grants, JwtAuthorizer};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{merge_list, parse_all, parse_bind_addr, ConfigError, FileConfig, Local, PortForward};
use crate::device::{ConnectOptions, TokenSource};
use crate::relay::RelayOptions;

const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;

/// Burrow - reverse tunnels for services behind NAT
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// YAML config file; command-line and environment values take precedence
    #[arg(long, global = true, env = "BURROW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept device tunnels and route public traffic through them
    #[command(long_about = r#"
Accept tunnels from devices and route public connections to them by TLS
servername, HTTP Host header, or port.

EXAMPLES:
  burrow relay --listen :80,:443 --secret $SECRET --api-hostname relay.example.com

ENVIRONMENT VARIABLES:
  BURROW_LISTEN          Bind addresses
  BURROW_SECRET          Token signing secret
  BURROW_API_HOSTNAME    Hostname serving the tunnel and admin API
  BURROW_PORT_FORWARDS   Raw port forwards (from:to)
    "#)]
    Relay(RelayArgs),

    /// Connect to a relay and serve local services through it
    #[command(long_about = CONNECT_ABOUT)]
    Connect(ConnectArgs),

    /// Sign an access token for a device
    Token(TokenArgs),
}

#[derive(clap::Args, Debug)]
struct RelayArgs {
    /// Addresses to listen on (port, :port or host:port)
    #[arg(long, env = "BURROW_LISTEN", value_delimiter = ',')]
    listen: Vec<String>,

    /// Secret used to verify access tokens
    #[arg(long, env = "BURROW_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Hostname that serves device tunnels and the admin API
    #[arg(long, env = "BURROW_API_HOSTNAME")]
    api_hostname: Option<String>,

    /// Raw TCP forwards on the relay itself (from:to)
    #[arg(long = "port-forward", env = "BURROW_PORT_FORWARDS", value_delimiter = ',')]
    port_forwards: Vec<String>,

    #[command(flatten)]
    tls: TlsArgs,

    /// Idle timeout for forwarded connections, in seconds
    #[arg(long, env = "BURROW_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,
}

const CONNECT_ABOUT: &str = r#"
Connect to a relay and serve the streams it sends to local services.
Reconnects automatically when the tunnel drops.

EXAMPLES:
  burrow connect --relay wss://relay.example.com/ws --token $TOKEN \
    --locals http:app.example.com:3000,ssh.example.com:22 \
    --port-forward 5432:5432

ENVIRONMENT VARIABLES:
  BURROW_RELAY           Relay WebSocket URL
  BURROW_TOKEN           Access token
  BURROW_SECRET          Secret to sign a token with instead of --token
  BURROW_LOCALS          Local services ([scheme:]domain:port)
  BURROW_PORT_FORWARDS   Raw port forwards (from:to)
    "#;

#[derive(clap::Args, Debug)]
struct ConnectArgs {
    /// Relay WebSocket URL (e.g., wss://relay.example.com/ws)
    #[arg(long, env = "BURROW_RELAY")]
    relay: Option<String>,

    /// Access token
    #[arg(long, env = "BURROW_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Sign a token with this secret instead of passing --token
    #[arg(long, env = "BURROW_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Subject for self-signed tokens (defaults to the first domain's label)
    #[arg(long, env = "BURROW_SUBJECT")]
    subject: Option<String>,

    /// Local services as [scheme:]domain:port; http and https are reverse proxied
    #[arg(long, env = "BURROW_LOCALS", value_delimiter = ',')]
    locals: Vec<String>,

    /// Raw TCP forwards (from:to)
    #[arg(long = "port-forward", env = "BURROW_PORT_FORWARDS", value_delimiter = ',')]
    port_forwards: Vec<String>,

    #[command(flatten)]
    tls: TlsArgs,

    /// Idle timeout for forwarded connections, in seconds
    #[arg(long, env = "BURROW_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,

    /// Initial reconnection delay in seconds
    #[arg(long, default_value = "1")]
    reconnect_delay: u64,

    /// Maximum reconnection delay in seconds
    #[arg(long, default_value = "60")]
    max_reconnect_delay: u64,
}

#[derive(clap::Args, Debug)]
struct TokenArgs {
    /// Secret shared with the relay
    #[arg(long, env = "BURROW_SECRET", hide_env_values = true)]
    secret: String,

    /// Subject (device name, or `*` for an admin API token)
    #[arg(long)]
    subject: String,

    /// Domains the device may serve (repeatable, wildcards allowed)
    #[arg(long = "domain")]
    domains: Vec<String>,

    /// Raw ports the device may serve (repeatable)
    #[arg(long = "port")]
    ports: Vec<u16>,

    /// Token validity in hours
    #[arg(long, default_value = "24")]
    hours: i64,
}

#[derive(clap::Args, Debug)]
struct TlsArgs {
    /// PEM certificate chain for terminating TLS (self-signed when omitted)
    #[arg(long, env = "BURROW_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for --tls-cert
    #[arg(long, env = "BURROW_TLS_KEY")]
    tls_key: Option<PathBuf>,
}

/// Setup logging; RUST_LOG overrides the default level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_file_config(path: Option<&PathBuf>) -> Result<FileConfig> {
    match path {
        Some(path) => {
            info!("Loading config from {}", path.display());
            Ok(FileConfig::load(path)?)
        }
        None => Ok(FileConfig::default()),
    }
}

fn relay_options(args: RelayArgs, file: FileConfig) -> Result<RelayOptions, ConfigError> {
    let RelayArgs {
        listen,
        secret,
        api_hostname,
        port_forwards,
        tls,
        idle_timeout,
    } = args;
    let file = file.relay;

    let listen = merge_list(listen, file.listen);
    let port_forwards = merge_list(port_forwards, file.port_forwards);
    let idle = idle_timeout.or(file.idle_timeout).unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);

    Ok(RelayOptions {
        listen: parse_all(&listen, parse_bind_addr)?,
        secret: secret.or(file.secret).ok_or(ConfigError::Missing("--secret"))?,
        api_hostname: api_hostname.or(file.api_hostname).map(|h| h.to_ascii_lowercase()),
        port_forwards: parse_all(&port_forwards, PortForward::parse)?,
        tls_cert: tls.tls_cert.or(file.tls_cert),
        tls_key: tls.tls_key.or(file.tls_key),
        idle_timeout: Duration::from_secs(idle),
    })
}

fn connect_options(args: ConnectArgs, file: FileConfig) -> Result<ConnectOptions, ConfigError> {
    let ConnectArgs {
        relay,
        token,
        secret,
        subject,
        locals,
        port_forwards,
        tls,
        idle_timeout,
        reconnect_delay,
        max_reconnect_delay,
    } = args;
    let file = file.connect;

    let locals = parse_all(&merge_list(locals, file.locals), Local::parse)?;
    let port_forwards = parse_all(&merge_list(port_forwards, file.port_forwards), PortForward::parse)?;

    let token = match (token.or(file.token), secret.or(file.secret)) {
        (Some(token), _) => TokenSource::Static(token),
        (None, Some(secret)) => TokenSource::Secret {
            secret,
            grants: device::grants_for(subject.or(file.subject), &locals, &port_forwards),
        },
        (None, None) => return Err(ConfigError::Missing("--token or --secret")),
    };
    let idle = idle_timeout.or(file.idle_timeout).unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);

    Ok(ConnectOptions {
        relay: relay.or(file.relay).ok_or(ConfigError::Missing("--relay"))?,
        token,
        locals,
        port_forwards,
        tls_cert: tls.tls_cert.or(file.tls_cert),
        tls_key: tls.tls_key.or(file.tls_key),
        idle_timeout: Duration::from_secs(idle),
        initial_delay: Duration::from_secs(reconnect_delay),
        max_delay: Duration::from_secs(max_reconnect_delay),
    })
}

fn generate_token(args: TokenArgs) -> Result<()> {
    let grants = Grants::new(args.subject)
        .with_domains(args.domains)
        .with_ports(args.ports);
    let token = JwtAuthorizer::issue(
        args.secret.as_bytes(),
        &grants,
        chrono::Duration::hours(args.hours),
    )
    .context("Failed to sign token")?;
    println!("{}", token);
    Ok(())
}

/// Run `task` until it finishes or Ctrl+C is pressed
async fn run_until_ctrl_c<F>(task: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    tokio::select! {
        result = task => {
            if let Err(e) = &result {
                error!("{:#}", e);
            }
            result
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    burrow_router::ensure_crypto_provider();

    match cli.command {
        Commands::Token(args) => generate_token(args),
        Commands::Relay(args) => {
            let file = load_file_config(cli.config.as_ref())?;
            let options = relay_options(args, file)?;
            info!("Burrow relay {} starting", env!("GIT_TAG"));
            run_until_ctrl_c(relay::run(options)).await
        }
        Commands::Connect(args) => {
            let file = load_file_config(cli.config.as_ref())?;
            let options = connect_options(args, file)?;
            info!("Burrow {} connecting to {}", env!("GIT_TAG"), options.relay);
            run_until_ctrl_c(device::run(options)).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_args(args: &[&str]) -> RelayArgs {
        match Cli::try_parse_from(args).unwrap().command {
            Commands::Relay(args) => args,
            other => panic!("expected relay command, got {:?}", other),
        }
    }

    fn connect_args(args: &[&str]) -> ConnectArgs {
        match Cli::try_parse_from(args).unwrap().command {
            Commands::Connect(args) => args,
            other => panic!("expected connect command, got {:?}", other),
        }
    }

    #[test]
    fn test_relay_flags_override_file() {
        let file = FileConfig::parse(
            "relay:\n  listen: [\"8080\"]\n  secret: from-file\n  api-hostname: API.example.com\n  idle-timeout: 30\n",
        )
        .unwrap();
        let command = relay_args(&["burrow", "relay", "--listen", ":443,localhost:80", "--port-forward", "2222:22"]);

        let options = relay_options(command, file).unwrap();
        assert_eq!(options.listen, vec!["0.0.0.0:443", "localhost:80"]);
        assert_eq!(options.secret, "from-file");
        assert_eq!(options.api_hostname.as_deref(), Some("api.example.com"));
        assert_eq!(options.port_forwards, vec![PortForward { from: 2222, to: 22 }]);
        assert_eq!(options.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_relay_requires_secret() {
        let command = relay_args(&["burrow", "relay", "--listen", "443"]);
        assert!(matches!(
            relay_options(command, FileConfig::default()),
            Err(ConfigError::Missing(_))
        ));
    }

    #[test]
    fn test_connect_signs_token_from_secret() {
        let command = connect_args(&[
            "burrow",
            "connect",
            "--relay",
            "wss://relay.example.com/ws",
            "--secret",
            "s3cret",
            "--locals",
            "http:app.example.com:3000,*:8080",
        ]);
        let options = connect_options(command, FileConfig::default()).unwrap();
        assert_eq!(options.locals.len(), 2);
        assert_eq!(options.idle_timeout, Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS));

        let token = options.token.token().unwrap();
        let grants = JwtAuthorizer::new(b"s3cret").verify(&token).unwrap();
        assert_eq!(grants.sub, "app");
        assert_eq!(grants.domains, vec!["app.example.com"]);
    }

    #[test]
    fn test_connect_rejects_bad_locals() {
        let command = connect_args(&[
            "burrow",
            "connect",
            "--relay",
            "wss://relay.example.com/ws",
            "--token",
            "t",
            "--locals",
            "not-a-local",
        ]);
        assert!(matches!(
            connect_options(command, FileConfig::default()),
            Err(ConfigError::InvalidLocal(_))
        ));
    }
}
