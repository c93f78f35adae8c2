//! Per-build-request state machine (`spec.md` §4.6): drives one
//! `build-request` through `graphing -> building -> terminal`.
//!
//! Grounded on `build_controller.py`. Where the original has a
//! documented-as-buggy corner (crashing on an artifact not found in its
//! own graph, queuing a class object instead of an instance when
//! notifying of initiator disconnect, a redundant cache-size
//! computation) this implementation takes the behavior `spec.md` itself
//! documents rather than reproducing the bug; see `DESIGN.md`.

use distbuild_core::{ArtifactGraph, ArtifactKind, ArtifactState, Message, NodeId};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::helper_router::{HelperRequest, HelperRouterHandle};
use crate::worker::{WorkerBuildQueuerHandle, WorkerBuildRequest, WorkerEvent};

#[derive(Debug, Clone)]
pub struct BuildRequestData {
    pub repo: String,
    pub ref_: String,
    pub morphology: String,
    pub component_names: Vec<String>,
    pub allow_detach: bool,
}

#[derive(Debug)]
pub struct BuildStepInfo {
    pub name: String,
    pub build_depends: Vec<String>,
}

/// Emitted toward the owning `InitiatorConnection`, which is the only
/// component that knows how to rewrite this request's internal id back
/// into the initiator's own namespace before putting it on the wire.
#[derive(Debug)]
pub enum ControllerEvent {
    Progress(String),
    Steps(Vec<BuildStepInfo>),
    StepStarted { step_name: String, worker_name: String },
    StepAlreadyStarted { step_name: String, worker_name: String },
    Output { step_name: String, stdout: String, stderr: String },
    StepFinished { step_name: String },
    StepFailed { step_name: String },
    Finished { urls: Vec<String> },
    Failed { reason: String },
    /// A cancel completed; per `spec.md` §8 scenario 5 this is distinct
    /// from `Failed` and produces no `build-failed` message.
    Cancelled,
}

pub enum ControllerCommand {
    Cancel,
    InitiatorDisconnect,
}

pub struct BuildControllerConfig {
    pub cache_server_base: String,
}

pub async fn run_build_controller(
    request_id: String,
    request: BuildRequestData,
    helper_router: HelperRouterHandle,
    worker_queuer: WorkerBuildQueuerHandle,
    config: BuildControllerConfig,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
    mut commands_rx: mpsc::UnboundedReceiver<ControllerCommand>,
) {
    let graph = match run_graphing(&request_id, &request, &helper_router, &mut commands_rx, &events_tx).await {
        GraphingOutcome::Graph(graph) => graph,
        GraphingOutcome::Terminated => return,
    };

    let send_steps = {
        let mut steps = Vec::new();
        for id in graph.walk() {
            let node = graph.node(id);
            let build_depends = node
                .dependencies
                .iter()
                .map(|&d| graph.node(d).name.clone())
                .collect();
            steps.push(BuildStepInfo {
                name: node.name.clone(),
                build_depends,
            });
        }
        steps
    };
    let _ = events_tx.send(ControllerEvent::Steps(send_steps));

    run_building(&request_id, &request, graph, &helper_router, &worker_queuer, &config, &mut commands_rx, &events_tx).await;
}

enum GraphingOutcome {
    Graph(ArtifactGraph),
    Terminated,
}

async fn run_graphing(
    request_id: &str,
    request: &BuildRequestData,
    helper_router: &HelperRouterHandle,
    commands_rx: &mut mpsc::UnboundedReceiver<ControllerCommand>,
    events_tx: &mpsc::UnboundedSender<ControllerEvent>,
) -> GraphingOutcome {
    let _ = events_tx.send(ControllerEvent::Progress(format!(
        "calculating build graph for {} {}",
        request.repo, request.morphology
    )));

    let (output_tx, mut output_rx) = mpsc::unbounded_channel();
    let (result_tx, result_rx) = oneshot::channel();
    helper_router.submit(HelperRequest {
        message: Message::ExecRequest {
            id: request_id.to_string(),
            argv: vec![
                "morph".to_string(),
                "calculate-build-graph".to_string(),
                request.repo.clone(),
                request.ref_.clone(),
                request.morphology.clone(),
            ],
            stdin_contents: String::new(),
        },
        output_tx: Some(output_tx),
        result_tx,
    });

    // Drain streamed output purely for logging; graphing only cares
    // about the final exec-response.
    tokio::spawn(async move { while output_rx.recv().await.is_some() {} });

    tokio::select! {
        command = commands_rx.recv() => {
            handle_cancel_during_graphing(command, events_tx);
            GraphingOutcome::Terminated
        }
        result = result_rx => {
            match result {
                Ok(Message::ExecResponse { exit, stdout, stderr, .. }) => {
                    if exit != 0 || !stderr.is_empty() {
                        let _ = events_tx.send(ControllerEvent::Failed {
                            reason: format!("graphing failed (exit {exit}): {stderr}"),
                        });
                        return GraphingOutcome::Terminated;
                    }
                    match ArtifactGraph::from_json_str(&stdout) {
                        Ok(graph) => GraphingOutcome::Graph(graph),
                        Err(err) => {
                            let _ = events_tx.send(ControllerEvent::Failed {
                                reason: format!("build graph from helper was malformed: {err}"),
                            });
                            GraphingOutcome::Terminated
                        }
                    }
                }
                Ok(other) => {
                    warn!(type_name = other.type_name(), "unexpected reply for graphing request");
                    let _ = events_tx.send(ControllerEvent::Failed {
                        reason: "internal error: unexpected helper reply during graphing".into(),
                    });
                    GraphingOutcome::Terminated
                }
                Err(_) => {
                    let _ = events_tx.send(ControllerEvent::Failed {
                        reason: "helper connection was lost while graphing".into(),
                    });
                    GraphingOutcome::Terminated
                }
            }
        }
    }
}

fn handle_cancel_during_graphing(
    command: Option<ControllerCommand>,
    events_tx: &mpsc::UnboundedSender<ControllerEvent>,
) {
    match command {
        Some(ControllerCommand::Cancel) | Some(ControllerCommand::InitiatorDisconnect) | None => {
            let _ = events_tx.send(ControllerEvent::Cancelled);
        }
    }
}

async fn run_building(
    request_id: &str,
    request: &BuildRequestData,
    graph: ArtifactGraph,
    helper_router: &HelperRouterHandle,
    worker_queuer: &WorkerBuildQueuerHandle,
    config: &BuildControllerConfig,
    commands_rx: &mut mpsc::UnboundedReceiver<ControllerCommand>,
    events_tx: &mpsc::UnboundedSender<ControllerEvent>,
) {
    let (worker_event_tx, mut worker_event_rx) = mpsc::unbounded_channel();

    if !query_cache_and_dispatch(&graph, helper_router, worker_queuer, request_id, config, &worker_event_tx, events_tx)
        .await
    {
        return;
    }
    if check_completion(&graph, request, config, events_tx) {
        return;
    }

    loop {
        tokio::select! {
            command = commands_rx.recv() => {
                worker_queuer.cancel_pending(request_id.to_string());
                match command {
                    Some(ControllerCommand::Cancel) => {
                        let _ = events_tx.send(ControllerEvent::Cancelled);
                    }
                    Some(ControllerCommand::InitiatorDisconnect) => {
                        if !request.allow_detach {
                            let _ = events_tx.send(ControllerEvent::Cancelled);
                        } else {
                            debug!(request_id, "initiator detached, build continues in the background");
                            continue;
                        }
                    }
                    None => {
                        let _ = events_tx.send(ControllerEvent::Cancelled);
                    }
                }
                return;
            }
            event = worker_event_rx.recv() => {
                let Some(event) = event else { return };
                if handle_worker_event(event, &graph, request_id, worker_queuer, &worker_event_tx, events_tx).await {
                    worker_queuer.cancel_pending(request_id.to_string());
                    return;
                }
                if check_completion(&graph, request, config, events_tx) {
                    return;
                }
            }
        }
    }
}

/// Returns `true` on worker failure (caller should terminate the request).
async fn handle_worker_event(
    event: WorkerEvent,
    graph: &ArtifactGraph,
    request_id: &str,
    worker_queuer: &WorkerBuildQueuerHandle,
    worker_event_tx: &mpsc::UnboundedSender<WorkerEvent>,
    events_tx: &mpsc::UnboundedSender<ControllerEvent>,
) -> bool {
    match event {
        WorkerEvent::StepStarted { step_name, worker_name } => {
            let _ = events_tx.send(ControllerEvent::StepStarted { step_name, worker_name });
            false
        }
        WorkerEvent::StepAlreadyStarted { step_name, worker_name } => {
            let _ = events_tx.send(ControllerEvent::StepAlreadyStarted { step_name, worker_name });
            false
        }
        WorkerEvent::Waiting { step_name } => {
            let _ = events_tx.send(ControllerEvent::Progress(format!(
                "waiting for a worker to build {step_name}"
            )));
            false
        }
        WorkerEvent::Output { step_name, stdout, stderr } => {
            let _ = events_tx.send(ControllerEvent::Output { step_name, stdout, stderr });
            false
        }
        WorkerEvent::Caching { step_name } => {
            let _ = events_tx.send(ControllerEvent::Progress(format!("caching {step_name}")));
            false
        }
        WorkerEvent::Finished { step_name, cache_key } => {
            if find_node(graph, &cache_key, &step_name).is_none() {
                warn!(step_name, cache_key, "finished artifact not found in our graph");
                let _ = events_tx.send(ControllerEvent::Failed {
                    reason: "internal error: finished artifact missing from build graph".into(),
                });
                return true;
            };
            // One worker invocation produces every artifact sharing this
            // cache_key (spec.md §4's chunk coalescing); all of them
            // become `Built` together, not just the one named in the
            // report.
            for id in graph.nodes_with_cache_key(&cache_key) {
                graph.mark(id, ArtifactState::Built);
            }
            let _ = events_tx.send(ControllerEvent::StepFinished { step_name });
            dispatch_ready(graph, worker_queuer, request_id, worker_event_tx, events_tx);
            false
        }
        WorkerEvent::Failed { step_name, reason, .. } => {
            let _ = events_tx.send(ControllerEvent::StepFailed { step_name: step_name.clone() });
            let _ = events_tx.send(ControllerEvent::Failed {
                reason: format!("building failed for {step_name}: {reason}"),
            });
            true
        }
    }
}

fn find_node(graph: &ArtifactGraph, cache_key: &str, name: &str) -> Option<NodeId> {
    graph
        .walk()
        .into_iter()
        .find(|&id| graph.node(id).cache_key == cache_key && graph.node(id).name == name)
}

/// Queries the cache server for every artifact still unbuilt, marks
/// confirmed ones `Built`, then dispatches whatever becomes ready.
/// Returns `false` if the request was failed outright (fatal HTTP
/// error).
async fn query_cache_and_dispatch(
    graph: &ArtifactGraph,
    helper_router: &HelperRouterHandle,
    worker_queuer: &WorkerBuildQueuerHandle,
    request_id: &str,
    config: &BuildControllerConfig,
    worker_event_tx: &mpsc::UnboundedSender<WorkerEvent>,
    events_tx: &mpsc::UnboundedSender<ControllerEvent>,
) -> bool {
    let unbuilt: Vec<String> = graph
        .walk()
        .into_iter()
        .filter(|&id| !graph.is_built(id))
        .map(|id| graph.node(id).basename())
        .collect();

    if unbuilt.is_empty() {
        dispatch_ready(graph, worker_queuer, request_id, worker_event_tx, events_tx);
        return true;
    }

    let body = serde_json::to_string(&unbuilt).unwrap_or_else(|_| "[]".to_string());
    let (result_tx, result_rx) = oneshot::channel();
    helper_router.submit(HelperRequest {
        message: Message::HttpRequest {
            id: String::new(),
            url: format!("{}/1.0/artifacts", config.cache_server_base),
            method: "POST".to_string(),
            headers: None,
            body: Some(body),
        },
        output_tx: None,
        result_tx,
    });

    match result_rx.await {
        Ok(Message::HttpResponse { status, body, .. }) if status == 200 => {
            match serde_json::from_str::<std::collections::HashMap<String, bool>>(&body) {
                Ok(map) => {
                    for (basename, built) in map {
                        if built {
                            if let Some(id) = graph.find_by_basename(&basename) {
                                graph.mark(id, ArtifactState::Built);
                            } else {
                                warn!(basename, "cache reported an artifact we don't know about");
                            }
                        }
                    }
                }
                Err(err) => {
                    let _ = events_tx.send(ControllerEvent::Failed {
                        reason: format!("cache status response was malformed: {err}"),
                    });
                    return false;
                }
            }
            dispatch_ready(graph, worker_queuer, request_id, worker_event_tx, events_tx);
            true
        }
        Ok(Message::HttpResponse { status, .. }) => {
            let _ = events_tx.send(ControllerEvent::Failed {
                reason: format!("cache query failed with status {status}"),
            });
            false
        }
        _ => {
            let _ = events_tx.send(ControllerEvent::Failed {
                reason: "cache query request was lost".into(),
            });
            false
        }
    }
}

fn dispatch_ready(
    graph: &ArtifactGraph,
    worker_queuer: &WorkerBuildQueuerHandle,
    request_id: &str,
    worker_event_tx: &mpsc::UnboundedSender<WorkerEvent>,
    events_tx: &mpsc::UnboundedSender<ControllerEvent>,
) {
    for id in graph.walk() {
        if graph.is_ready_to_build(id) {
            let node = graph.node(id);
            // Every other artifact sharing this cache_key is produced by
            // the same worker invocation (spec.md §4's chunk coalescing):
            // mark them all `Building` here so only `id` gets dispatched
            // — when the loop reaches a sibling it is no longer `Unbuilt`
            // and `is_ready_to_build` skips it.
            let siblings = graph.nodes_with_cache_key(&node.cache_key);
            let sibling_names: Vec<String> = siblings.iter().map(|&sid| graph.node(sid).name.clone()).collect();
            for &sid in &siblings {
                graph.mark(sid, ArtifactState::Building);
            }

            let stdin_contents = match graph.serialize_subtree(id) {
                Ok(s) => s,
                Err(err) => {
                    let _ = events_tx.send(ControllerEvent::Failed {
                        reason: format!("failed to serialize artifact for worker: {err}"),
                    });
                    continue;
                }
            };
            worker_queuer.build_request(WorkerBuildRequest {
                initiator_id: request_id.to_string(),
                basename: node.basename(),
                artifact_name: node.name.clone(),
                cache_key: node.cache_key.clone(),
                kind: node.kind,
                sibling_names,
                stdin_contents,
                reply_tx: worker_event_tx.clone(),
            });
        }
    }
}

fn check_completion(
    graph: &ArtifactGraph,
    request: &BuildRequestData,
    config: &BuildControllerConfig,
    events_tx: &mpsc::UnboundedSender<ControllerEvent>,
) -> bool {
    let targets: Vec<NodeId> = if request.component_names.is_empty() {
        vec![graph.root()]
    } else {
        request
            .component_names
            .iter()
            .filter_map(|name| resolve_component(graph, name))
            .collect()
    };

    if targets.is_empty() || !targets.iter().all(|&id| graph.is_built(id)) {
        return false;
    }

    let urls = targets
        .iter()
        .map(|&id| {
            let node = graph.node(id);
            format!(
                "{}/1.0/artifacts?filename={}.{}.{}",
                config.cache_server_base,
                node.cache_key,
                kind_str(node.kind),
                utf8_percent_encode(&node.name, NON_ALPHANUMERIC),
            )
        })
        .collect();
    let _ = events_tx.send(ControllerEvent::Finished { urls });
    true
}

fn resolve_component(graph: &ArtifactGraph, name: &str) -> Option<NodeId> {
    graph
        .find_by_basename(name)
        .or_else(|| graph.walk().into_iter().find(|&id| graph.node(id).name == name))
}

fn kind_str(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::Chunk => "chunk",
        ArtifactKind::Stratum => "stratum",
        ArtifactKind::System => "system",
    }
}
