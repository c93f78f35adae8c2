//! Drives one worker socket through `idle -> building -> caching -> idle`
//! (`spec.md` §4.8). Each accepted or outbound-connected worker socket
//! gets its own task; this is the "one task per connection" half of the
//! concurrency model chosen in `SPEC_FULL.md` §2.

use distbuild_core::Message;
use distbuild_net::JsonConnection;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::helper_router::{HelperRequest, HelperRouterHandle};
use crate::worker::{
    caching_suffixes, JobHandle, WorkerBuildQueuerHandle, WorkerCommand, WorkerReport,
};

pub struct WorkerConnectionConfig {
    pub cache_server_base: String,
    pub writeable_cache_base: String,
}

/// Runs for the lifetime of one worker socket. `stream` is already
/// connected (either accepted on the worker listener, or produced by a
/// `ConnectionMachine` retrying an outbound worker address).
pub async fn run_worker_connection(
    stream: tokio::net::TcpStream,
    worker_name: String,
    queuer: WorkerBuildQueuerHandle,
    helper_router: HelperRouterHandle,
    config: WorkerConnectionConfig,
) {
    let conn = JsonConnection::new(stream);
    let (mut sender, mut receiver) = conn.split();

    let (to_worker_tx, mut to_worker_rx) = mpsc::unbounded_channel();
    let worker_id = queuer.register_worker(worker_name.clone(), to_worker_tx).await;
    queuer.need_job(worker_id);

    loop {
        tokio::select! {
            command = to_worker_rx.recv() => {
                let Some(WorkerCommand::HaveAJob(job)) = command else { break };
                if run_job(&mut sender, &mut receiver, &job, &worker_name, &queuer, &helper_router, &config).await.is_err() {
                    break;
                }
                queuer.need_job(worker_id);
            }
            msg = receiver.recv() => {
                match msg {
                    None | Some(Err(_)) => break,
                    Some(Ok(_unexpected)) => {
                        // A worker only speaks when spoken to between jobs.
                        warn!(worker = %worker_name, "unexpected message from idle worker, ignoring");
                    }
                }
            }
        }
    }

    info!(worker = %worker_name, "worker connection closed");
    queuer.worker_disconnected(worker_id);
}

async fn run_job(
    sender: &mut distbuild_net::JsonSender,
    receiver: &mut distbuild_net::JsonReceiver,
    job: &JobHandle,
    worker_name: &str,
    queuer: &WorkerBuildQueuerHandle,
    helper_router: &HelperRouterHandle,
    config: &WorkerConnectionConfig,
) -> Result<(), ()> {
    let exec_id = format!("exec-{}", job.basename);
    let request = Message::ExecRequest {
        id: exec_id.clone(),
        argv: vec![
            "morph".to_string(),
            "worker-build".to_string(),
            job.artifact_name.clone(),
        ],
        stdin_contents: job.stdin_contents.clone(),
    };
    if sender.send(request).await.is_err() {
        return Err(());
    }
    queuer.report(WorkerReport::StepStarted {
        basename: job.basename.clone(),
        worker_name: worker_name.to_string(),
    });

    let (exit, stdout, stderr) = loop {
        match receiver.recv().await {
            Some(Ok(Message::ExecOutput { stdout, stderr, .. })) => {
                queuer.report(WorkerReport::Output {
                    basename: job.basename.clone(),
                    stdout,
                    stderr,
                });
            }
            Some(Ok(Message::ExecResponse { exit, stdout, stderr, .. })) => {
                break (exit, stdout, stderr);
            }
            Some(Ok(other)) => {
                warn!(type_name = other.type_name(), "unexpected message while building, ignoring");
            }
            None | Some(Err(_)) => return Err(()),
        }
    };

    if exit != 0 {
        queuer.report(WorkerReport::Failed {
            basename: job.basename.clone(),
            reason: format!("building failed for {} (exit {exit}): {stderr}", job.artifact_name),
        });
        return Ok(());
    }
    debug!(stdout_len = stdout.len(), "exec-response succeeded, starting cache fetch");

    let fetch_url = build_fetch_url(config, worker_name, job);
    let (result_tx, result_rx) = oneshot::channel();
    queuer.report(WorkerReport::Caching { basename: job.basename.clone() });
    helper_router.submit(HelperRequest {
        message: Message::HttpRequest {
            id: String::new(),
            url: fetch_url,
            method: "GET".to_string(),
            headers: None,
            body: None,
        },
        output_tx: None,
        result_tx,
    });

    match result_rx.await {
        Ok(Message::HttpResponse { status, .. }) if status == 200 => {
            queuer.report(WorkerReport::Finished { basename: job.basename.clone() });
        }
        Ok(Message::HttpResponse { status, body, .. }) => {
            queuer.report(WorkerReport::Failed {
                basename: job.basename.clone(),
                reason: format!("cache fetch failed with status {status}: {body}"),
            });
        }
        _ => {
            queuer.report(WorkerReport::Failed {
                basename: job.basename.clone(),
                reason: "cache fetch request was lost".to_string(),
            });
        }
    }
    Ok(())
}

fn build_fetch_url(config: &WorkerConnectionConfig, worker_name: &str, job: &JobHandle) -> String {
    let suffixes = caching_suffixes(job.kind, &job.sibling_names);
    let joined = suffixes
        .iter()
        .map(|s| utf8_percent_encode(s, NON_ALPHANUMERIC).to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "{}/1.0/fetch?host={}&cacheid={}&artifacts={}",
        config.writeable_cache_base,
        utf8_percent_encode(worker_name, NON_ALPHANUMERIC),
        utf8_percent_encode(&job.cache_key, NON_ALPHANUMERIC),
        joined,
    )
}

