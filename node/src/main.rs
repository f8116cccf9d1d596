use anyhow::{anyhow, Context, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use fidoreg_crypto::{IntegritySigner, Keyring, SigningService};
use fidoreg_lifecycle::{CredentialRegistrar, DirectoryService, KeyStateMachine, MemoryDirectory};
use fidoreg_replication::{
    ChannelTransport, HttpTransport, OutboxJournal, ReplicaApplier, ReplicationMode,
    ReplicationPublisher, ReplicationTransport, SledJournal,
};
use fidoreg_rpc::{start_peer_server, start_server, AppState};
use fidoreg_storage::{CredentialStore, SledStorage};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

mod config;
mod version;

use config::{ensure_data_dir, AppConfig};
use version::{git_commit_hash, FIDOREG_VERSION};

fn cli() -> Command {
    Command::new("fidoreg-node")
        .version(FIDOREG_VERSION)
        .about("FIDO credential registration and lifecycle service")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory"),
        )
        .arg(
            Arg::new("bind")
                .long("bind")
                .value_name("ADDR")
                .help("RPC listen address"),
        )
        .arg(
            Arg::new("server-id")
                .long("server-id")
                .value_name("ID")
                .value_parser(value_parser!(u16).range(1..))
                .help("Identifier of this node in credential handles"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_parser(["pretty", "json"])
                .help("Log output format"),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .action(ArgAction::SetTrue)
                .help("Validate configuration and exit"),
        )
}

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<AppConfig> {
    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path)?;
    apply_overrides(matches, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut AppConfig) {
    if let Some(data_dir) = matches.get_one::<String>("data-dir") {
        config.data_dir = PathBuf::from(data_dir);
    }
    if let Some(bind) = matches.get_one::<String>("bind") {
        config.rpc.bind = bind.clone();
    }
    if let Some(server_id) = matches.get_one::<u16>("server-id") {
        config.server_id = *server_id;
    }
    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log.level = log_level.clone();
    }
    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log.format = log_format.clone();
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(log_layer(&config.log.format, std::io::stdout))
        .try_init()?;

    Ok(())
}

/// `json` emits one JSON object per event; anything else is human-readable.
fn log_layer<S, W>(format: &str, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer().with_writer(writer);
    if format == "json" {
        layer.json().boxed()
    } else {
        layer.pretty().boxed()
    }
}

fn build_signer(config: &AppConfig) -> Result<Option<IntegritySigner>> {
    if !config.signing.enabled {
        return Ok(None);
    }
    let keyring = Keyring::from_domains(&config.domains).context("failed to load signing keys")?;
    for domain in &config.domains {
        if let Some(public_key) = keyring.public_key_hex(domain.id) {
            info!(domain_id = domain.id, public_key = %public_key, "row signing key loaded");
        }
    }
    let service: Arc<dyn SigningService> = Arc::new(keyring);
    Ok(Some(IntegritySigner::new(
        service,
        config.signing.clone(),
        &config.domains,
    )))
}

fn build_publisher(
    config: &AppConfig,
    journal: Arc<dyn OutboxJournal>,
) -> Result<Option<Arc<ReplicationPublisher>>> {
    let replication = &config.replication;
    if replication.mode == ReplicationMode::Disabled {
        return Ok(None);
    }
    let transport: Arc<dyn ReplicationTransport> = if replication.peers.is_empty() {
        Arc::new(ChannelTransport::new())
    } else {
        Arc::new(
            HttpTransport::new(
                replication.peers.clone(),
                replication.ack_timeout(),
                replication.peer_token.clone(),
            )
            .context("failed to build replication HTTP client")?,
        )
    };
    info!(
        mode = ?replication.mode,
        peers = replication.peers.len(),
        "replication enabled"
    );
    let publisher = ReplicationPublisher::spawn_with_journal(
        config.server_id,
        replication.clone(),
        transport,
        journal,
    )
    .context("failed to read the replication outbox")?;
    Ok(Some(publisher))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config = load_config_with_overrides(&matches)?;

    if matches.get_flag("check") {
        println!("configuration OK (server_id={})", config.server_id);
        return Ok(());
    }

    init_logging(&config)?;
    info!(
        version = FIDOREG_VERSION,
        commit = git_commit_hash(),
        server_id = config.server_id,
        node_id = %config.node_id,
        "starting fidoreg node"
    );

    ensure_data_dir(&config.data_dir)?;
    let _lock = DataDirLock::acquire(&config.data_dir, "fidoreg-node")?;

    let store = Arc::new(
        SledStorage::new(config.db_path())
            .with_context(|| format!("failed to open store at {}", config.db_path().display()))?,
    );
    info!(credentials = store.len(), "credential store opened");

    let journal = Arc::new(
        SledJournal::open(store.database()).context("failed to open replication journal")?,
    );

    let lifecycle = config.lifecycle();
    let mut registrar = CredentialRegistrar::new(lifecycle, store.clone(), store.clone());
    let mut state_machine = KeyStateMachine::new(lifecycle, store.clone());

    let signer = build_signer(&config)?;
    if let Some(signer) = &signer {
        registrar = registrar.with_signer(signer.clone());
        state_machine = state_machine.with_signer(signer.clone());
    }
    if let Some(publisher) = build_publisher(&config, journal.clone())? {
        registrar = registrar.with_replication(publisher.clone());
        state_machine = state_machine.with_replication(publisher);
    }
    if config.directory.sync {
        let directory: Arc<dyn DirectoryService> = Arc::new(MemoryDirectory::new());
        state_machine = state_machine.with_directory(directory);
    }

    let replicating = config.replication.mode != ReplicationMode::Disabled;
    let mut state = AppState::new(
        config.node_id.clone(),
        Arc::new(registrar),
        Arc::new(state_machine),
    );
    if replicating {
        let mut replica = ReplicaApplier::new(store.clone()).with_watermarks(journal);
        if let Some(signer) = signer {
            replica = replica.with_verifier(signer);
        }
        state = state.with_replica(Arc::new(replica));
    }
    let state = Arc::new(state);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });
    let stopped = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|stop| *stop).await;
    };

    let client = start_server(state.clone(), &config.rpc.bind, stopped(stop_rx.clone()));
    if replicating {
        let peer_token = config.replication.peer_token.clone().unwrap_or_default();
        let peer = start_peer_server(
            state,
            &config.rpc.peer_bind,
            &peer_token,
            stopped(stop_rx),
        );
        tokio::try_join!(client, peer)?;
    } else {
        client.await?;
    }

    store.flush().context("failed to flush credential store")?;
    info!("fidoreg node stopped");
    Ok(())
}

struct DataDirLock {
    path: PathBuf,
    file: File,
}

impl DataDirLock {
    fn acquire<P: AsRef<Path>>(data_dir: P, purpose: &str) -> Result<Self> {
        let dir = data_dir.as_ref();
        let lock_path = dir.join(".fidoreg.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)?;

        if let Err(err) = file.try_lock_exclusive() {
            return Err(anyhow!(
                "Data directory {} is locked by another process ({}). \
                 Stop the running node or remove {} if you are sure it is stale.",
                dir.display(),
                err,
                lock_path.display()
            ));
        }

        file.set_len(0)?;
        writeln!(
            &file,
            "pid={};purpose={};started={}",
            std::process::id(),
            purpose,
            chrono::Utc::now().to_rfc3339()
        )?;

        Ok(Self {
            path: lock_path,
            file,
        })
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}
