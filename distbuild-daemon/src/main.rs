//! `distbuildd` — the controller binary. Binds the initiator and helper
//! listeners, spawns the two singleton actors, and dials (or accepts)
//! worker connections (`spec.md` §2).

use clap::Parser;
use distbuild_core::Message;
use distbuild_daemon::config::Args;
use distbuild_daemon::connection_machine::run_with_reconnect;
use distbuild_daemon::helper_router::HelperRouter;
use distbuild_daemon::initiator::{run_initiator_connection, InitiatorConnectionConfig};
use distbuild_daemon::worker::WorkerBuildQueuer;
use distbuild_daemon::worker_connection::{run_worker_connection, WorkerConnectionConfig};
use distbuild_net::JsonConnection;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let file_config = args.load_file_config()?;

    let helper_router = HelperRouter::spawn();
    let worker_queuer = WorkerBuildQueuer::spawn();

    let initiator_listener = TcpListener::bind(&args.initiator_listen).await?;
    info!(addr = %args.initiator_listen, "accepting initiator connections");
    let helper_listener = TcpListener::bind(&args.helper_listen).await?;
    info!(addr = %args.helper_listen, "accepting helper connections");

    let mut tasks = Vec::new();
    // Kept alive for the process lifetime: dropping a stop sender would
    // immediately fire its ConnectionMachine's stop signal. There is no
    // graceful-shutdown path yet (see `SPEC_FULL.md` §7).
    let mut stop_senders = Vec::new();

    for addr in file_config.workers {
        let queuer = worker_queuer.clone();
        let router = helper_router.clone();
        let worker_config = WorkerConnectionConfig {
            cache_server_base: args.cache_server.clone(),
            writeable_cache_base: args.writeable_cache_server.clone(),
        };
        let reconnect_interval = args.reconnect_interval();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        stop_senders.push(stop_tx);
        tasks.push(tokio::spawn(async move {
            run_with_reconnect(addr.clone(), reconnect_interval, stop_rx, move |stream| {
                let queuer = queuer.clone();
                let router = router.clone();
                let worker_name = addr.clone();
                let config = WorkerConnectionConfig {
                    cache_server_base: worker_config.cache_server_base.clone(),
                    writeable_cache_base: worker_config.writeable_cache_base.clone(),
                };
                async move {
                    run_worker_connection(stream, worker_name, queuer, router, config).await;
                }
            })
            .await;
        }));
    }

    tasks.push(tokio::spawn(accept_helpers(helper_listener, helper_router.clone())));
    tasks.push(tokio::spawn(accept_initiators(
        initiator_listener,
        helper_router,
        worker_queuer,
        args.cache_server.clone(),
    )));

    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}

async fn accept_initiators(
    listener: TcpListener,
    helper_router: distbuild_daemon::helper_router::HelperRouterHandle,
    worker_queuer: distbuild_daemon::worker::WorkerBuildQueuerHandle,
    cache_server_base: String,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(%peer, "initiator connected");
                let helper_router = helper_router.clone();
                let worker_queuer = worker_queuer.clone();
                let config = InitiatorConnectionConfig {
                    cache_server_base: cache_server_base.clone(),
                };
                tokio::spawn(async move {
                    run_initiator_connection(stream, helper_router, worker_queuer, config).await;
                });
            }
            Err(err) => {
                warn!(error = %err, "failed to accept initiator connection");
            }
        }
    }
}

async fn accept_helpers(listener: TcpListener, helper_router: distbuild_daemon::helper_router::HelperRouterHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(%peer, "helper connected");
                let helper_router = helper_router.clone();
                tokio::spawn(async move {
                    run_helper_connection(stream, helper_router).await;
                });
            }
            Err(err) => {
                warn!(error = %err, "failed to accept helper connection");
            }
        }
    }
}

async fn run_helper_connection(
    stream: tokio::net::TcpStream,
    helper_router: distbuild_daemon::helper_router::HelperRouterHandle,
) {
    let conn = JsonConnection::new(stream);
    let (mut sender, mut receiver) = conn.split();

    let (to_helper_tx, mut to_helper_rx) = tokio::sync::mpsc::unbounded_channel();
    let helper_id = helper_router.register_helper(to_helper_tx).await;

    loop {
        tokio::select! {
            outgoing = to_helper_rx.recv() => {
                let Some(message) = outgoing else { break };
                if sender.send(message).await.is_err() {
                    break;
                }
            }
            incoming = receiver.recv() => {
                match incoming {
                    None | Some(Err(_)) => break,
                    Some(Ok(message @ (Message::HelperReady { .. } | Message::ExecOutput { .. } | Message::ExecResponse { .. } | Message::HttpResponse { .. }))) => {
                        helper_router.message_from_helper(helper_id, message);
                    }
                    Some(Ok(other)) => {
                        warn!(type_name = other.type_name(), "unexpected message from helper, ignoring");
                    }
                }
            }
        }
    }

    helper_router.helper_disconnected(helper_id);
}
