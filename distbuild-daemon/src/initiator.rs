//! Drives one initiator socket (`spec.md` §4.4's "instance" side):
//! accepts `build-request`s, mints an internal id for each, spawns a
//! `BuildController` to own it, and relays that controller's events back
//! onto the wire with the id rewritten into the initiator's own
//! namespace.
//!
//! Grounded on `initiator_connection.py`'s one-send-method-per-message
//! pattern. `RouteMap`/`IdGen` (`distbuild-core`) still do the id
//! bookkeeping described in `spec.md` §4.4, even though the controller
//! itself is reached over a direct channel rather than re-dispatch.

use std::collections::HashMap;

use distbuild_core::{BuildStep, IdGen, Message, RouteMap};
use distbuild_net::JsonConnection;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::build_controller::{
    run_build_controller, BuildControllerConfig, BuildRequestData, BuildStepInfo, ControllerCommand,
    ControllerEvent,
};
use crate::helper_router::HelperRouterHandle;
use crate::worker::WorkerBuildQueuerHandle;

pub struct InitiatorConnectionConfig {
    pub cache_server_base: String,
}

/// Runs for the lifetime of one initiator socket. Every `build-request`
/// it accepts gets its own `BuildController` task; disconnecting here
/// synthesizes a cancel (or lets the build detach) for each of them.
pub async fn run_initiator_connection(
    stream: tokio::net::TcpStream,
    helper_router: HelperRouterHandle,
    worker_queuer: WorkerBuildQueuerHandle,
    config: InitiatorConnectionConfig,
) {
    let conn = JsonConnection::new(stream);
    let (mut sender, mut receiver) = conn.split();

    let idgen = IdGen::new("request");
    let mut route_map = RouteMap::new();
    let mut controllers: HashMap<String, (mpsc::UnboundedSender<ControllerCommand>, bool)> = HashMap::new();

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<(String, ControllerEvent)>();

    loop {
        tokio::select! {
            incoming = receiver.recv() => {
                match incoming {
                    None | Some(Err(_)) => break,
                    Some(Ok(Message::BuildRequest {
                        id: wire_id,
                        repo,
                        ref_,
                        morphology,
                        component_names,
                        allow_detach,
                        ..
                    })) => {
                        let internal_id = idgen.next();
                        if let Err(err) = route_map.add(wire_id.clone(), internal_id.clone()) {
                            warn!(error = %err, "could not record route for build-request");
                            continue;
                        }

                        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                        controllers.insert(internal_id.clone(), (cmd_tx, allow_detach));

                        let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel();
                        let forward_to = event_tx.clone();
                        let forward_id = internal_id.clone();
                        tokio::spawn(async move {
                            while let Some(event) = ctrl_rx.recv().await {
                                if forward_to.send((forward_id.clone(), event)).is_err() {
                                    break;
                                }
                            }
                        });

                        let request = BuildRequestData {
                            repo,
                            ref_,
                            morphology,
                            component_names,
                            allow_detach,
                        };
                        let controller_config = BuildControllerConfig {
                            cache_server_base: config.cache_server_base.clone(),
                        };
                        tokio::spawn(run_build_controller(
                            internal_id,
                            request,
                            helper_router.clone(),
                            worker_queuer.clone(),
                            controller_config,
                            ctrl_tx,
                            cmd_rx,
                        ));
                    }
                    Some(Ok(Message::CancelRequest { id: wire_id })) => {
                        for out_id in route_map.get_outgoing(&wire_id) {
                            if let Some((cmd_tx, _)) = controllers.get(out_id) {
                                let _ = cmd_tx.send(ControllerCommand::Cancel);
                            }
                        }
                    }
                    Some(Ok(other)) => {
                        warn!(type_name = other.type_name(), "unexpected message from initiator, ignoring");
                    }
                }
            }
            event = event_rx.recv() => {
                let Some((internal_id, event)) = event else { continue };
                let Ok(wire_id) = route_map.get_incoming(&internal_id).map(str::to_string) else {
                    continue;
                };
                let terminal = matches!(
                    event,
                    ControllerEvent::Finished { .. } | ControllerEvent::Failed { .. } | ControllerEvent::Cancelled
                );
                if let Some(message) = to_wire_message(wire_id.clone(), event) {
                    if sender.send(message).await.is_err() {
                        break;
                    }
                }
                if terminal {
                    let _ = route_map.remove(&internal_id);
                    controllers.remove(&internal_id);
                }
            }
        }
    }

    for (internal_id, (cmd_tx, allow_detach)) in controllers {
        if allow_detach {
            info!(internal_id, "initiator disconnected, build continues detached");
        } else {
            let _ = cmd_tx.send(ControllerCommand::InitiatorDisconnect);
        }
    }
}

fn to_wire_message(id: String, event: ControllerEvent) -> Option<Message> {
    Some(match event {
        ControllerEvent::Progress(message) => Message::BuildProgress { id, message },
        ControllerEvent::Steps(steps) => Message::BuildSteps {
            id,
            steps: steps.into_iter().map(to_wire_step).collect(),
        },
        ControllerEvent::StepStarted { step_name, worker_name } => {
            Message::StepStarted { id, step_name, worker_name }
        }
        ControllerEvent::StepAlreadyStarted { step_name, worker_name } => {
            Message::StepAlreadyStarted { id, step_name, worker_name }
        }
        ControllerEvent::Output { step_name, stdout, stderr } => {
            Message::StepOutput { id, step_name, stdout, stderr }
        }
        ControllerEvent::StepFinished { step_name } => Message::StepFinished { id, step_name },
        ControllerEvent::StepFailed { step_name } => Message::StepFailed { id, step_name },
        ControllerEvent::Finished { urls } => Message::BuildFinished { id, urls },
        ControllerEvent::Failed { reason } => Message::BuildFailed { id, reason },
        ControllerEvent::Cancelled => Message::BuildCancel { id },
    })
}

fn to_wire_step(step: BuildStepInfo) -> BuildStep {
    BuildStep {
        name: step.name,
        build_depends: step.build_depends,
    }
}
