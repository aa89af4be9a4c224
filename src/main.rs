//! EdgeMQ broker binary.
//!
//! Usage:
//!   edgemq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>        Configuration file path (TOML)
//!   -b, --bind <ADDR:PORT>     Override the listening address
//!   -l, --log-level <LEVEL>   Override the configured log level
//!   -h, --help                 Print help
//!   -V, --version               Print version

use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use edgemq::auth::{AllowAllAuthProvider, AuthProvider, DictionaryAuthProvider, RoleAclAuthProvider};
use edgemq::config::Config;
use edgemq::{Broker, CompositeHooks};

#[derive(Parser, Debug)]
#[command(name = "edgemq")]
#[command(author, version, about = "Native MQTT 3.1.1 broker for constrained, single-node deployments")]
struct Args {
    /// Configuration file path (TOML format); defaults apply when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `server.bind_addr`/`server.port` from the config file.
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Override `log.level` from the config file.
    #[arg(short, long)]
    log_level: Option<String>,
}

fn main() -> std::io::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).unwrap_or_else(|e| {
            eprintln!("edgemq: failed to load config {}: {}", path.display(), e);
            std::process::exit(1);
        }),
        None => Config::default(),
    };

    if let Some(bind) = args.bind {
        config.server.bind_addr = bind.ip();
        config.server.port = bind.port();
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }

    init_tracing(&config.log.level);

    let auth: Rc<dyn AuthProvider> = build_auth_provider(&config);
    let hooks = Rc::new(CompositeHooks::new());
    let broker = Broker::new(config, auth).with_hooks(hooks);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        tokio::task::spawn_local(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received ctrl-c, shutting down");
                let _ = shutdown_tx.send(true);
            }
        });

        if let Err(e) = broker.run(shutdown_rx).await {
            error!(error = %e, "broker exited with error");
        }
    });

    Ok(())
}

/// Builds the auth collaborator chain per the loaded config: a plain
/// allow-all provider when `auth.enabled=false`, otherwise a
/// [`DictionaryAuthProvider`] optionally wrapped in a
/// [`RoleAclAuthProvider`] when `acl.enabled=true`. `CallbackAuthProvider`
/// is exposed for embedders but has no CLI-driven configuration surface.
fn build_auth_provider(config: &Config) -> Rc<dyn AuthProvider> {
    if !config.auth.enabled {
        return Rc::new(AllowAllAuthProvider);
    }

    let dictionary = Rc::new(DictionaryAuthProvider::new(&config.auth, config.mqtt.allow_anonymous));
    if config.acl.enabled {
        Rc::new(RoleAclAuthProvider::new(&config.acl, dictionary))
    } else {
        dictionary
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
