use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use skywatch::config;
use skywatch::db;
use skywatch::dispatcher::BackfillRequest;
use skywatch::main_stream::MainStream;
use skywatch::resolver::HandleResolver;
use skywatch::status::{StatusBroadcaster, StatusSources};
use skywatch::temp_streams::{StartOutcome, TempStreamManager};
use skywatch::types::SkywatchError;
use skywatch::SHUTDOWN;

#[derive(Debug, Parser)]
#[command(name = "skywatch")]
#[command(about = "track handle and profile changes across monitored follow graphs")]
struct Args {
    #[clap(long, env = "DATABASE_URL")]
    database_url: String,

    #[clap(
        long,
        env = "JETSTREAM_HOSTS",
        value_delimiter = ',',
        default_value = "jetstream1.us-east.bsky.network,jetstream2.us-east.bsky.network,jetstream1.us-west.bsky.network,jetstream2.us-west.bsky.network"
    )]
    jetstream_hosts: Vec<String>,

    /// DID allowed to invoke admin operations; enforced by the API
    /// layer, recorded here for startup diagnostics.
    #[clap(long, env = "ADMIN_DID")]
    admin_did: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), SkywatchError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.jetstream_hosts.is_empty() {
        return Err(SkywatchError::Config("no jetstream hosts configured".to_string()));
    }

    info!("starting skywatch");
    info!("jetstream hosts: {:?}", args.jetstream_hosts);
    if let Some(ref admin_did) = args.admin_did {
        info!("admin DID: {admin_did}");
    }

    let pool = db::create_pool(&args.database_url)?;
    db::run_migrations(&pool).await?;

    let resolver = Arc::new(HandleResolver::from_env()?);
    let status = Arc::new(StatusBroadcaster::new());

    let (reconcile_tx, mut reconcile_rx) = mpsc::unbounded_channel::<String>();
    let (backfill_tx, mut backfill_rx) = mpsc::unbounded_channel::<BackfillRequest>();

    let main_stream = Arc::new(MainStream::new(
        pool.clone(),
        Arc::clone(&resolver),
        Arc::clone(&status),
        args.jetstream_hosts.clone(),
        config::APPVIEW_URL.clone(),
        reconcile_tx.clone(),
        backfill_tx.clone(),
    )?);

    let temp_streams = Arc::new(TempStreamManager::new(
        pool.clone(),
        Arc::clone(&resolver),
        Arc::clone(&status),
        Arc::clone(&main_stream),
        args.jetstream_hosts.clone(),
        reconcile_tx.clone(),
        backfill_tx.clone(),
    ));

    status.register_sources(StatusSources {
        main: Arc::clone(&main_stream),
        temps: Arc::clone(&temp_streams),
        pool: pool.clone(),
    });

    // reconcile requests from the follow reactor (and the API layer)
    {
        let stream = Arc::clone(&main_stream);
        tokio::spawn(async move {
            while let Some(source) = reconcile_rx.recv().await {
                stream.reload_dids_now(&source).await;
            }
        });
    }

    // temp backfill requests from the follow reactor
    {
        let temps = Arc::clone(&temp_streams);
        tokio::spawn(async move {
            while let Some(request) = backfill_rx.recv().await {
                match temps.start_for_user(&request.user_did, request.follow_dids) {
                    Ok(StartOutcome::Started) => {}
                    Ok(StartOutcome::Queued { position }) => {
                        info!("backfill for {} queued at position {position}", request.user_did)
                    }
                    Err(e) => debug!("backfill request for {} skipped: {e}", request.user_did),
                }
            }
        });
    }

    // log status transitions; the UI fan-out subscribes the same way
    {
        let mut updates = status.subscribe_status();
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(snapshot) => debug!(
                        "status: main running={} dids={} cursor_ok={} | temp {}/{} queued={}",
                        snapshot.main_stream.running,
                        snapshot.main_stream.monitored_dids,
                        snapshot.main_stream.has_valid_cursor,
                        snapshot.temp_pool.active,
                        snapshot.temp_pool.max,
                        snapshot.temp_pool.queue_length,
                    ),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("status subscriber lagged, skipped {skipped} snapshots")
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let start_cursor = MainStream::recommended_start_cursor(&pool).await?;
    match start_cursor {
        Some(cursor) => info!("resuming from stored cursor {cursor}"),
        None => info!("no usable stored cursor, starting live"),
    }
    main_stream.start(start_cursor).await?;

    // restart any backfills interrupted by the previous shutdown
    {
        let temps = Arc::clone(&temp_streams);
        tokio::spawn(async move {
            temps.resume_incomplete().await;
        });
    }

    wait_for_shutdown().await;

    info!("shutting down");
    SHUTDOWN.store(true, Ordering::Relaxed);
    main_stream.stop().await;
    temp_streams.abort_all();
    pool.close();

    Ok(())
}

async fn wait_for_shutdown() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("ctrl-c handler failed: {e}");
            }
        }
        _ = term.recv() => {}
    }
}
