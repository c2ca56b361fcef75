//! dVPN Node
//!
//! Runs either side of a p2p channel: `listen` as a provider answering
//! config exchanges, `dial` as a consumer opening a channel to a provider.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dvpn_crypto::{Identity, IdentityKey, IdentityVerifier, Keyring, SignedVerifier};
use dvpn_network::stun::STUN_RESPONSE_LIMIT;
use dvpn_network::{
    multi_server_stun, FixedRangePool, HttpResolver, IgdPortMapper, IpResolver, NatProxy,
    NoopPortMapper, Pinger, PortMapper, StaticResolver,
};
use dvpn_p2p::{
    connect_with_retry, BrokerConnector, Context as HandlerContext, Dialer, HttpConnector,
    Listener, NatsConnector,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod config;

use config::{BrokerKind, NodeConfig};

/// Topic the provider answers with `pong`
const PING_TOPIC: &str = "ping";

/// dVPN node
#[derive(Parser)]
#[command(name = "dvpn-node")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "~/.dvpn/config.toml")]
    config: PathBuf,

    /// Log level, overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an identity and a default config
    Init {
        /// Force overwrite existing identity
        #[arg(short, long)]
        force: bool,
    },

    /// Accept channels as a provider
    Listen {
        /// Service type, defaults to the configured one
        #[arg(short, long)]
        service: Option<String>,
    },

    /// Open a channel to a provider and ping it
    Dial {
        /// Provider identity address
        provider: String,

        /// Service type, defaults to the configured one
        #[arg(short, long)]
        service: Option<String>,

        /// Pings to send over the channel
        #[arg(short, long, default_value = "3")]
        count: u32,
    },

    /// Classify the NAT in front of a local port
    Stun {
        /// Local port to probe
        #[arg(default_value = "0")]
        port: u16,
    },

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_path(&cli.config)?;

    // Config may not exist yet on init
    let configured_level = match &cli.command {
        Commands::Init { .. } => None,
        _ => NodeConfig::load(&config_path)
            .await
            .ok()
            .map(|config| config.logging.level),
    };
    let level = cli
        .log_level
        .clone()
        .or(configured_level)
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level)?;

    match cli.command {
        Commands::Init { force } => cmd_init(&config_path, force).await,
        Commands::Listen { service } => cmd_listen(&config_path, service).await,
        Commands::Dial {
            provider,
            service,
            count,
        } => cmd_dial(&config_path, &provider, service, count).await,
        Commands::Stun { port } => cmd_stun(&config_path, port).await,
        Commands::Config => cmd_config(&config_path).await,
    }
}

fn init_logging(level: &str) -> Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

async fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {:?}. Use --force to overwrite.",
            config_path
        );
    }

    let config = NodeConfig::default();
    config.save(config_path).await?;
    info!("Config saved to {:?}", config_path);

    let key = IdentityKey::generate()?;
    let identity_path = config.identity_path(config_path);
    tokio::fs::write(&identity_path, key.to_bytes()).await?;
    info!("Identity saved to {:?}", identity_path);

    let mut keyring = Keyring::new();
    let identity = keyring.insert(key);

    println!("\ndVPN node initialized successfully!");
    println!("Identity: {}", identity);
    println!("\nStart a provider with: dvpn-node listen");
    Ok(())
}

/// Load the config and the node identity
async fn load_node(config_path: &Path) -> Result<(NodeConfig, Keyring, Identity)> {
    let config = NodeConfig::load(config_path).await?;
    config.validate()?;

    let identity_path = config.identity_path(config_path);
    let seed = tokio::fs::read(&identity_path)
        .await
        .with_context(|| format!("Failed to read identity {:?}, run init first", identity_path))?;
    let key = IdentityKey::try_from_slice(&seed)?;

    let mut keyring = Keyring::new();
    let identity = keyring.insert(key);
    Ok((config, keyring, identity))
}

fn broker_connector(config: &NodeConfig) -> Arc<dyn BrokerConnector> {
    match config.broker.kind {
        BrokerKind::Nats => Arc::new(NatsConnector::default()),
        BrokerKind::Http => Arc::new(HttpConnector::default()),
    }
}

async fn ip_resolver(config: &NodeConfig) -> Result<Arc<dyn IpResolver>> {
    match &config.network.public_ip {
        Some(public) => {
            let public: IpAddr = public.parse()?;
            let outbound = dvpn_network::ip::outbound_ip().await?;
            Ok(Arc::new(StaticResolver::new(public, outbound)))
        }
        None => Ok(Arc::new(HttpResolver::new(
            config.network.ip_echo_url.clone(),
            Duration::from_secs(10),
        )?)),
    }
}

async fn cmd_listen(config_path: &Path, service: Option<String>) -> Result<()> {
    let (config, keyring, identity) = load_node(config_path).await?;
    let service_type = service.unwrap_or_else(|| config.node.service_type.clone());
    info!("Starting provider {} for {}", identity, service_type);

    let broker = connect_with_retry(
        broker_connector(&config).as_ref(),
        &config.broker.addresses,
        config.p2p.broker_connect_attempts,
        config.p2p.broker_connect_retry,
    )
    .await?;

    let mapper: Arc<dyn PortMapper> = if config.network.upnp {
        Arc::new(IgdPortMapper::default())
    } else {
        Arc::new(NoopPortMapper)
    };
    let pinger = Arc::new(Pinger::new(config.ping.clone()));
    let ports = Arc::new(FixedRangePool::new(
        config.network.port_range_start,
        config.network.port_range_end,
    )?);

    let mut listener = Listener::new(
        broker.clone(),
        Arc::new(keyring),
        Arc::new(SignedVerifier),
        ip_resolver(&config).await?,
        pinger.clone(),
        ports,
        mapper,
    )
    .with_config(config.p2p.clone());

    let nat_proxy = Arc::new(NatProxy::new());
    if let Some(port) = config.network.service_port {
        nat_proxy.register_service_port(&service_type, port).await;
        listener = listener.with_nat_proxy(nat_proxy.clone());
    }

    let handle = listener
        .listen(identity, &service_type, |channel| {
            info!("Consumer connected from {}", channel.peer_addr());
            channel.handle(PING_TOPIC, |ctx: HandlerContext| async move {
                ctx.ok_with_reply(b"pong".to_vec())
            });
        })
        .await?;

    let contact = serde_json::to_string(&listener.contact())?;
    println!("Contact: {}", contact);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    handle.stop();
    pinger.stop();
    nat_proxy.close();
    broker.close().await;
    Ok(())
}

async fn cmd_dial(
    config_path: &Path,
    provider: &str,
    service: Option<String>,
    count: u32,
) -> Result<()> {
    let (config, keyring, identity) = load_node(config_path).await?;
    let service_type = service.unwrap_or_else(|| config.node.service_type.clone());
    let provider = Identity::from_address(provider)?;

    let pinger = Arc::new(Pinger::new(config.ping.clone()));
    let dialer = Dialer::new(
        broker_connector(&config),
        Arc::new(keyring),
        Arc::new(IdentityVerifier::new([provider.clone()])),
        ip_resolver(&config).await?,
        pinger.clone(),
        Arc::new(FixedRangePool::new(
            config.network.port_range_start,
            config.network.port_range_end,
        )?),
    )
    .with_config(config.p2p.clone())
    .with_broker_addresses(config.broker.addresses.clone());

    println!("Dialing {} for {}...\n", provider, service_type);
    let started = Instant::now();
    let channel = dialer
        .dial(&identity, &provider, &service_type, config.exchange_timeout())
        .await?;
    println!(
        "Channel established to {} in {}ms ({:?} wire format)",
        channel.peer_addr(),
        started.elapsed().as_millis(),
        channel.wire_format()
    );

    for seq in 0..count {
        let started = Instant::now();
        match channel.send(PING_TOPIC, b"ping".to_vec()).await {
            Ok(reply) if reply == b"pong" => {
                println!("  reply {} in {}ms", seq, started.elapsed().as_millis())
            }
            Ok(reply) => warn!("Unexpected reply {:?}", String::from_utf8_lossy(&reply)),
            Err(e) => println!("  ping {} failed: {}", seq, e),
        }
    }

    channel.close();
    pinger.stop();
    Ok(())
}

async fn cmd_stun(config_path: &Path, port: u16) -> Result<()> {
    let config = NodeConfig::load(config_path).await?;
    let probe = multi_server_stun(&config.p2p.stun_servers, port, STUN_RESPONSE_LIMIT).await?;

    println!("Local port: {}", probe.local_port);
    println!("Mapped ports: {:?}", probe.mapped_ports);
    println!("NAT type: {}", probe.symmetry);
    println!("Advertised port: {}", probe.advertised_port());
    Ok(())
}

async fn cmd_config(config_path: &Path) -> Result<()> {
    let config = NodeConfig::load(config_path).await?;
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let path_str = path.to_string_lossy();
    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = directories::BaseDirs::new()
            .context("Failed to get home directory")?
            .home_dir()
            .to_path_buf();
        Ok(home.join(rest))
    } else {
        Ok(path.to_path_buf())
    }
}
