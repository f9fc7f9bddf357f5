use anyhow::{Context, Result};
use sqlx::postgres::PgConnectOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::EnvFilter;

use plc_pg_bridge::config::{Config, ConnectionMode};
use plc_pg_bridge::db::{PgSink, TableTarget};
use plc_pg_bridge::poller::{PollJob, PollLoop};
use plc_pg_bridge::session::{EndpointAddress, RobustSession, Session, TransientSession};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;

    let endpoint = EndpointAddress::resolve(
        &config.modbus_address,
        config.unit_id,
        config.register_offset,
    )
    .with_context(|| format!("cannot resolve {}", config.modbus_address))?;

    let session = match config.modbus_connection {
        ConnectionMode::PerCall => Session::PerCall(TransientSession::new(config.modbus_timeout)),
        ConnectionMode::Pooled => Session::Pooled(RobustSession::new(config.modbus_timeout)),
    };

    let db_options: PgConnectOptions = config
        .database_url
        .parse()
        .context("invalid DATABASE_URL")?;
    let target = TableTarget {
        table: config.db_table.clone(),
        columns: config.db_columns,
    };
    let sink = match config.db_connection {
        ConnectionMode::PerCall => PgSink::per_call(db_options, target, config.db_timeout),
        ConnectionMode::Pooled => PgSink::pooled(
            db_options,
            config.db_max_connections,
            target,
            config.db_timeout,
        ),
    };

    let target = sink.target();
    if config.layout.value_count() != target.columns {
        warn!(
            "each reading holds {} values but {} expects {} columns; inserts will be rejected",
            config.layout.value_count(),
            target.table,
            target.columns
        );
    }

    let job = PollJob {
        endpoint,
        register_kind: config.register_kind,
        count: config.register_count,
        layout: config.layout,
        interval: config.poll_interval,
    };
    let mut poll = PollLoop::new(job, session, sink);

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("Received shutdown signal");
        shutdown.cancel();
    });

    poll.run(token).await;

    if let Session::Pooled(session) = poll.session_mut() {
        session.disconnect().await;
    }
    poll.sink().close().await;
    info!("Closing...");

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoUtc::rfc_3339())
        .init();
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                None
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                match term_signal {
                    Some(mut sig) => { sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
