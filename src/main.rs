use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::task::TaskTracker;

use keyward::admin::{self, EditKeyArgs};
use keyward::config::{ServerConfig, DEFAULT_CONFIG_PATH};
use keyward::mailer::Mailer;
use keyward::service::KeyService;
use keyward::sysconfig::Sysconfig;
use keyward::{memlock, transport};
use keyward_proto::DEFAULT_SOCKET_PATH;

#[derive(Parser, Debug)]
#[command(name = "keyward", version, about = "Network custodian of disk-encryption keys")]
struct Cli {
    /// Server sysconfig file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "KEYWARD_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the key service daemon (TLS and Unix socket listeners)
    Daemon {
        /// Admin Unix socket path
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,
    },
    /// List all key records, most recently used first
    ListKeys,
    /// Show one key record in detail (never the key itself)
    ShowKey { uuid: String },
    /// Edit policy fields of one key record
    EditKey {
        uuid: String,
        #[arg(long)]
        mount_point: Option<String>,
        /// Comma-separated mount options
        #[arg(long)]
        mount_options: Option<String>,
        #[arg(long)]
        max_active: Option<u32>,
        #[arg(long)]
        alive_interval_sec: Option<i64>,
        #[arg(long)]
        alive_count: Option<u32>,
        /// Server access password
        #[arg(long, env = "KEYWARD_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,
    },
    /// Queue a mount/umount command for one holder IP
    SendCommand {
        #[arg(long)]
        uuid: String,
        /// IP of the computer that should execute the command
        #[arg(long)]
        ip: String,
        /// mount or umount
        #[arg(long, default_value = "umount")]
        command: String,
        /// Minutes until the command (and its result) expire
        #[arg(long, default_value_t = 10)]
        expire_min: i64,
        #[arg(long, env = "KEYWARD_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,
    },
    /// Drop every queued command on one key record
    ClearCommands {
        uuid: String,
        #[arg(long, env = "KEYWARD_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,
    },
    /// Generate a self-signed TLS certificate and key
    GenCert {
        #[arg(long)]
        common_name: String,
        #[arg(long, default_value = "/etc/keyward/servertls")]
        out_dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Command::Daemon { socket } => run_daemon(&cli.config, &socket),
        Command::ListKeys => admin::list_keys(&cli.config),
        Command::ShowKey { uuid } => admin::show_key(&cli.config, &uuid),
        Command::EditKey {
            uuid,
            mount_point,
            mount_options,
            max_active,
            alive_interval_sec,
            alive_count,
            password,
            socket,
        } => admin::edit_key(
            &cli.config,
            &socket,
            &uuid,
            &password,
            EditKeyArgs {
                mount_point,
                mount_options,
                max_active,
                alive_interval_sec,
                alive_count,
            },
        ),
        Command::SendCommand {
            uuid,
            ip,
            command,
            expire_min,
            password,
            socket,
        } => admin::send_command(&cli.config, &socket, &uuid, &ip, &command, expire_min, &password),
        Command::ClearCommands {
            uuid,
            password,
            socket,
        } => admin::clear_commands(&cli.config, &socket, &uuid, &password),
        Command::GenCert {
            common_name,
            out_dir,
        } => admin::gen_cert(&common_name, &out_dir),
    }
}

fn run_daemon(config_path: &PathBuf, socket: &PathBuf) -> anyhow::Result<()> {
    let sysconf = Sysconfig::load(config_path)
        .with_context(|| format!("reading {}", config_path.display()))?;
    let config = ServerConfig::from_sysconfig(&sysconf)?;

    // keep key material out of swap; continue without the lock when the
    // capability is missing
    if let Err(e) = memlock::lock_process_memory() {
        tracing::warn!(error = %e, "cannot lock process memory");
    }

    let mailer = Mailer::from_sysconfig(&sysconf);
    match mailer.validate() {
        Ok(()) => tracing::info!("email notifications {}", mailer.agent_description()),
        Err(reason) => tracing::info!(%reason, "email notifications disabled"),
    }
    if config.auth.is_none() {
        tracing::warn!("no access password configured; serving in restricted mode");
    }

    let service = KeyService::new(config.clone(), mailer)?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(service, config, socket))?;
    let _ = std::fs::remove_file(socket);
    tracing::info!("daemon exited cleanly");
    Ok(())
}

async fn serve(
    service: Arc<KeyService>,
    config: ServerConfig,
    socket: &PathBuf,
) -> anyhow::Result<()> {
    let acceptor = transport::tls::make_acceptor(&service)?;
    let tcp = TcpListener::bind((config.listen_addr.as_str(), config.listen_port))
        .await
        .with_context(|| format!("binding {}:{}", config.listen_addr, config.listen_port))?;
    let unix_listener = transport::unix::bind(socket)?;

    let tracker = TaskTracker::new();
    let cancel = service.cancel_token();

    let ctrl_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            ctrl_cancel.cancel();
        }
    });

    let tls_loop = tokio::spawn(transport::tls::serve(
        service.clone(),
        tcp,
        acceptor,
        tracker.clone(),
        cancel.clone(),
    ));
    let unix_loop = tokio::spawn(transport::unix::serve(
        service.clone(),
        unix_listener,
        tracker.clone(),
        cancel.clone(),
    ));
    let _ = tls_loop.await;
    let _ = unix_loop.await;

    // listeners are closed; let in-flight handlers finish
    tracker.close();
    tracker.wait().await;
    Ok(())
}
