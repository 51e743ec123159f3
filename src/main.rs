/// myreplicator 명령행 도구
///
/// 마스터 상태 조회, binlog 이벤트 출력, binlog 백업, 로컬 binlog 파일 해석을 제공합니다.
use clap::{Args, Parser, Subcommand};
use myreplicator::binlog::BinlogParser;
use myreplicator::{
    BinlogSyncer, Flavor, GtidSet, MySqlConnection, ReplicationCursor, ReplicationError,
    SyncerConfig,
};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "myreplicator")]
#[command(about = "MySQL/MariaDB binlog replication client")]
#[command(long_about = None)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Commands,
}

/// 접속 옵션. 지정한 값만 설정 파일 위에 덮어씀
#[derive(Args)]
struct ConnectionArgs {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "MYREPL_HOST")]
    host: Option<String>,

    #[arg(long, global = true, env = "MYREPL_PORT")]
    port: Option<u16>,

    #[arg(long, global = true, env = "MYREPL_USER")]
    user: Option<String>,

    #[arg(long, global = true, env = "MYREPL_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Server id used when registering as a replica
    #[arg(long, global = true, env = "MYREPL_SERVER_ID")]
    server_id: Option<u32>,

    /// mysql or mariadb
    #[arg(long, global = true, env = "MYREPL_FLAVOR")]
    flavor: Option<Flavor>,

    /// Acknowledge events to a semi-sync master
    #[arg(long, global = true)]
    semi_sync: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the master's current binlog position and executed GTID set
    Status,

    /// Stream binlog events and print one JSON line per event
    Tail {
        /// Start position, e.g. "mysql-bin.000003;4"
        #[arg(long, conflicts_with = "gtid")]
        cursor: Option<ReplicationCursor>,

        /// Start from a GTID set
        #[arg(long)]
        gtid: Option<String>,

        /// Keep only structural events and raw bytes
        #[arg(long)]
        raw: bool,
    },

    /// Mirror binlog files from the master into a local directory
    Backup {
        #[arg(long)]
        dir: PathBuf,

        /// Start position; defaults to the master's current position
        #[arg(long)]
        cursor: Option<ReplicationCursor>,

        /// Stop after this many seconds without an event (0 = no limit)
        #[arg(long, default_value_t = 0)]
        timeout_secs: u64,
    },

    /// Print the event headers of a local binlog file
    Parse {
        path: PathBuf,

        /// Byte offset of the first event to print
        #[arg(long, default_value_t = 4)]
        offset: u64,
    },
}

#[derive(Serialize)]
struct StatusOutput {
    file: String,
    position: u64,
    executed_gtid_set: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let config = build_config(&cli.connection)?;
            let mut conn = MySqlConnection::connect(&config).await?;
            let status = conn.master_status().await?;
            conn.close().await?;

            let output = StatusOutput {
                file: status.cursor.file().to_string(),
                position: status.cursor.position(),
                executed_gtid_set: status.executed_gtid_set,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Tail { cursor, gtid, raw } => {
            let mut config = build_config(&cli.connection)?;
            config.raw_mode = raw;
            tail(config, cursor, gtid).await?;
        }
        Commands::Backup {
            dir,
            cursor,
            timeout_secs,
        } => {
            let config = build_config(&cli.connection)?;
            let cursor = match cursor {
                Some(cursor) => cursor,
                None => current_position(&config).await?,
            };

            let mut syncer = BinlogSyncer::new(config)?;
            let result = syncer
                .start_backup(&dir, cursor, Duration::from_secs(timeout_secs))
                .await;
            syncer.close().await?;

            let summary = result?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Commands::Parse { path, offset } => {
            let mut parser = BinlogParser::new();
            parser.parse_file(&path, offset, |event| {
                let line = serde_json::to_string(&event.header)
                    .map_err(|e| ReplicationError::BinlogParseError(e.to_string()))?;
                println!("{}", line);
                Ok(())
            })?;
        }
    }

    Ok(())
}

async fn tail(
    config: SyncerConfig,
    cursor: Option<ReplicationCursor>,
    gtid: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let flavor = config.flavor;
    let mut syncer = BinlogSyncer::new(config)?;
    let mut streamer = match (cursor, gtid) {
        (Some(cursor), _) => syncer.start_sync(cursor).await?,
        (None, Some(text)) => syncer.start_sync_gtid(GtidSet::parse(flavor, &text)?).await?,
        (None, None) => {
            let cursor = current_position(syncer.config()).await?;
            syncer.start_sync(cursor).await?
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let result = loop {
        match streamer.get_event_with_cancel(&cancel).await {
            Ok(event) => println!("{}", serde_json::to_string(&event)?),
            Err(ReplicationError::Cancelled) => {
                info!("Interrupted at {}", syncer.position());
                break Ok(());
            }
            Err(e) => break Err(e),
        }
    };

    if let Some(gtid_set) = syncer.gtid_set() {
        info!("Executed GTID set: {}", gtid_set);
    }
    if let Err(e) = syncer.close().await {
        warn!("Failed to close syncer: {}", e);
    }
    Ok(result?)
}

async fn current_position(config: &SyncerConfig) -> Result<ReplicationCursor, ReplicationError> {
    let mut conn = MySqlConnection::connect(config).await?;
    let status = conn.master_status().await?;
    conn.close().await?;
    info!("Master is at {}", status.cursor);
    Ok(status.cursor)
}

fn build_config(args: &ConnectionArgs) -> Result<SyncerConfig, ReplicationError> {
    let mut config = match &args.config {
        Some(path) => SyncerConfig::from_toml_file(path)?,
        None => SyncerConfig::default(),
    };

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(user) = &args.user {
        config.user = user.clone();
    }
    if let Some(password) = &args.password {
        config.password = password.clone();
    }
    if let Some(server_id) = args.server_id {
        config.server_id = server_id;
    }
    if let Some(flavor) = args.flavor {
        config.flavor = flavor;
    }
    if args.semi_sync {
        config.semi_sync_enabled = true;
    }

    config.validate()?;
    Ok(config)
}
