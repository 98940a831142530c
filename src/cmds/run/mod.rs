// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2022 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::clock::RealClocks;
use base::{bail, err, Error};
use bpaf::Bpaf;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use self::config::{ConfigFile, ObjectStoreConfig};
use crate::agent_protocol;
use crate::codec::CodecCache;
use crate::object_store::{NullObjectStore, ObjectStore, S3ObjectStore};
use crate::recording_manager::RecordingManager;
use crate::scheduler::Scheduler;
use crate::stream_manager::StreamManager;
use crate::web;

mod config;

/// Starts the capture/recording/archival service (C1-C9): the HTTP surface,
/// the schedule trigger loop, and the cloud-sync/retention maintenance jobs.
#[derive(Bpaf, Debug)]
#[bpaf(options("run"))]
pub struct Args {
    #[bpaf(short, long, argument("PATH"), fallback("/etc/moonfire-nvr.json".into()))]
    config: PathBuf,
}

fn read_config(path: &std::path::Path) -> Result<ConfigFile, Error> {
    let config = std::fs::read(path).map_err(|e| err!(NotFound, msg("reading {}", path.display()), source(e)))?;
    serde_json::from_slice(&config).map_err(|e| err!(InvalidArgument, msg("parsing {}", path.display()), source(e)))
}

async fn build_object_store(config: &ObjectStoreConfig) -> Arc<dyn ObjectStore> {
    match config {
        ObjectStoreConfig::None => Arc::new(NullObjectStore),
        ObjectStoreConfig::S3 { bucket, endpoint, public_base_url } => Arc::new(
            S3ObjectStore::from_env(bucket.clone(), endpoint.clone(), public_base_url.clone()).await,
        ),
    }
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = read_config(&args.config)?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = config.worker_threads {
        builder.worker_threads(worker_threads);
    }
    let rt = builder.build().map_err(|e| err!(Internal, msg("building tokio runtime"), source(e)))?;
    let r = rt.block_on(async_run(config));

    // tokio normally waits for all spawned tasks to complete, but:
    // * in the graceful shutdown path, we wait for specific tasks with logging.
    // * in the immediate shutdown path, we don't want to wait.
    rt.shutdown_background();

    r
}

async fn async_run(config: ConfigFile) -> Result<i32, Error> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    let mut int = signal(SignalKind::interrupt()).map_err(|e| err!(Internal, msg("installing SIGINT handler"), source(e)))?;
    let mut term = signal(SignalKind::terminate()).map_err(|e| err!(Internal, msg("installing SIGTERM handler"), source(e)))?;

    tokio::pin! {
        let inner = inner(&config, shutdown_rx);
    }

    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        result = &mut inner => return result,
    }

    tokio::select! {
        _ = int.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGINT)")),
        _ = term.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGTERM)")),
        result = &mut inner => result,
    }
}

async fn inner(config: &ConfigFile, shutdown_rx: base::shutdown::Receiver) -> Result<i32, Error> {
    base::time::init_zone(jiff::tz::TimeZone::system);
    let clocks = RealClocks {};
    let conn = super::open_conn(&config.db_dir, true)?;
    let db = Arc::new(db::Database::open(conn, clocks)?);
    info!("database is loaded");

    std::fs::create_dir_all(&config.media_root)
        .map_err(|e| err!(Internal, msg("creating media root {}", config.media_root.display()), source(e)))?;

    let object_store = build_object_store(&config.object_store).await;
    let codec_cache = Arc::new(CodecCache::new());
    let streams = Arc::new(StreamManager::new(db.clone(), clocks));
    let recordings = Arc::new(RecordingManager::new(
        db.clone(),
        config.media_root.clone(),
        codec_cache,
        object_store.clone(),
        config.cleanup_local_after_upload,
    ));
    let scheduler = Arc::new(Scheduler::new(
        db.clone(),
        recordings.clone(),
        object_store.clone(),
        config.cleanup_local_after_upload,
    ));

    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown_rx.clone()));

    let svc = Arc::new(web::Service::new(web::Config {
        db: db.clone(),
        streams,
        recordings,
        object_store,
        media_root: config.media_root.clone(),
    }));
    let agent_svc = Arc::new(agent_protocol::Service::new(agent_protocol::Config { db: db.clone() }));

    let listener = TcpListener::bind(config.bind)
        .await
        .map_err(|e| err!(Unavailable, msg("binding to {}", config.bind), source(e)))?;
    info!(addr = %config.bind, "ready to serve HTTP requests");

    let graceful = GracefulShutdown::new();
    let server = hyper::server::conn::http1::Builder::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(err = %e, "accept failed");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let svc = svc.clone();
                let agent_svc = agent_svc.clone();
                let conn = server.serve_connection(io, hyper::service::service_fn(move |req| {
                    let svc = svc.clone();
                    let agent_svc = agent_svc.clone();
                    async move {
                        if agent_protocol::is_agent_path(req.uri().path()) {
                            agent_svc.serve(req).await
                        } else {
                            svc.serve(req).await
                        }
                    }
                }));
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        warn!(err = %e, %peer, "connection error");
                    }
                });
            }
            _ = shutdown_rx.as_future() => {
                info!("shutting down HTTP listener");
                break;
            }
        }
    }

    tokio::select! {
        _ = graceful.shutdown() => info!("all connections finished gracefully"),
        _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => {
            warn!("timed out waiting for in-flight connections; exiting anyway");
        }
    }

    if let Err(e) = scheduler_task.await {
        warn!(err = %e, "scheduler task panicked");
    }

    info!("exiting");
    Ok(0)
}
