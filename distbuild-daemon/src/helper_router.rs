//! The helper routing singleton (`spec.md` §4.5): matches pending
//! `exec-request`/`http-request` work against a pool of idle helper
//! connections and re-queues in-flight work if its helper disappears.
//!
//! Grounded on `helper_router.py`'s `_pending_requests`/`_running_
//! requests`/`_pending_helpers` tables. Unlike the original, a caller
//! does not learn its answer through a class-wide broadcast filtered by
//! id — it hands the router a reply channel up front and the router
//! replies on it directly. That is a direct consequence of moving from
//! a single dispatch loop to one task per component (`spec.md` §9): Rust
//! gives us real addressability where the original had none, so the
//! `RouteMap`/id-rewrite machinery is only needed for the wire hop to
//! the helper process itself, not for the internal reply.

use std::collections::{HashMap, VecDeque};

use distbuild_core::{IdGen, Message};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub type HelperId = u64;

/// A caller's request to run one `exec-request` or `http-request` on
/// whichever helper becomes available first.
pub struct HelperRequest {
    /// The exec/http request, with `id` left as the caller wants it; the
    /// router mints its own id for the wire hop and never touches this
    /// copy.
    pub message: Message,
    /// Incremental `exec-output` chunks, forwarded verbatim. `None` for
    /// `http-request`, which has no streaming phase.
    pub output_tx: Option<mpsc::UnboundedSender<Message>>,
    /// The terminal `exec-response`/`http-response`.
    pub result_tx: oneshot::Sender<Message>,
}

pub enum RouterMsg {
    Submit(HelperRequest),
    HelperConnected {
        outgoing: mpsc::UnboundedSender<Message>,
        reply: oneshot::Sender<HelperId>,
    },
    HelperDisconnected(HelperId),
    FromHelper {
        helper_id: HelperId,
        message: Message,
    },
}

struct Running {
    helper_id: HelperId,
    wire_message: Message,
    output_tx: Option<mpsc::UnboundedSender<Message>>,
    result_tx: oneshot::Sender<Message>,
}

struct Pending {
    wire_message: Message,
    output_tx: Option<mpsc::UnboundedSender<Message>>,
    result_tx: oneshot::Sender<Message>,
}

pub struct HelperRouter {
    rx: mpsc::UnboundedReceiver<RouterMsg>,
    idgen: IdGen,
    next_helper_id: HelperId,
    idle_helpers: VecDeque<HelperId>,
    helper_outgoing: HashMap<HelperId, mpsc::UnboundedSender<Message>>,
    pending: VecDeque<Pending>,
    running: HashMap<String, Running>,
}

#[derive(Clone)]
pub struct HelperRouterHandle {
    tx: mpsc::UnboundedSender<RouterMsg>,
}

impl HelperRouterHandle {
    pub fn submit(&self, request: HelperRequest) {
        let _ = self.tx.send(RouterMsg::Submit(request));
    }

    pub async fn register_helper(&self, outgoing: mpsc::UnboundedSender<Message>) -> HelperId {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RouterMsg::HelperConnected { outgoing, reply });
        rx.await.expect("helper router task is alive")
    }

    pub fn helper_disconnected(&self, helper_id: HelperId) {
        let _ = self.tx.send(RouterMsg::HelperDisconnected(helper_id));
    }

    pub fn message_from_helper(&self, helper_id: HelperId, message: Message) {
        let _ = self.tx.send(RouterMsg::FromHelper { helper_id, message });
    }
}

impl HelperRouter {
    pub fn spawn() -> HelperRouterHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = HelperRouter {
            rx,
            idgen: IdGen::new("helper-req"),
            next_helper_id: 1,
            idle_helpers: VecDeque::new(),
            helper_outgoing: HashMap::new(),
            pending: VecDeque::new(),
            running: HashMap::new(),
        };
        tokio::spawn(router.run());
        HelperRouterHandle { tx }
    }

    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                RouterMsg::Submit(request) => self.handle_submit(request),
                RouterMsg::HelperConnected { outgoing, reply } => {
                    let id = self.next_helper_id;
                    self.next_helper_id += 1;
                    self.helper_outgoing.insert(id, outgoing);
                    self.idle_helpers.push_back(id);
                    info!(helper_id = id, "helper connected");
                    let _ = reply.send(id);
                    self.dispatch();
                }
                RouterMsg::HelperDisconnected(helper_id) => self.handle_disconnect(helper_id),
                RouterMsg::FromHelper { helper_id, message } => {
                    self.handle_from_helper(helper_id, message)
                }
            }
        }
    }

    fn handle_submit(&mut self, request: HelperRequest) {
        let internal_id = self.idgen.next();
        let wire_message = request.message.with_id(internal_id.clone());
        debug!(internal_id = %internal_id, type_name = wire_message.type_name(), "queued helper request");
        self.pending.push_back(Pending {
            wire_message,
            output_tx: request.output_tx,
            result_tx: request.result_tx,
        });
        self.dispatch();
    }

    fn dispatch(&mut self) {
        while let Some(helper_id) = self.idle_helpers.pop_front() {
            let Some(pending) = self.pending.pop_front() else {
                self.idle_helpers.push_front(helper_id);
                break;
            };
            let Some(outgoing) = self.helper_outgoing.get(&helper_id) else {
                // Helper vanished between being marked idle and being
                // picked; put the work back and try the next helper.
                self.pending.push_front(pending);
                continue;
            };
            if outgoing.send(pending.wire_message.clone()).is_err() {
                // Helper's socket task is gone; requeue and move on.
                self.pending.push_front(pending);
                continue;
            }
            let internal_id = pending.wire_message.id().to_string();
            self.running.insert(
                internal_id,
                Running {
                    helper_id,
                    wire_message: pending.wire_message,
                    output_tx: pending.output_tx,
                    result_tx: pending.result_tx,
                },
            );
        }
    }

    fn handle_disconnect(&mut self, helper_id: HelperId) {
        self.helper_outgoing.remove(&helper_id);
        self.idle_helpers.retain(|&h| h != helper_id);
        warn!(helper_id, "helper disconnected");

        let stale: Vec<String> = self
            .running
            .iter()
            .filter(|(_, r)| r.helper_id == helper_id)
            .map(|(id, _)| id.clone())
            .collect();
        for internal_id in stale {
            if let Some(running) = self.running.remove(&internal_id) {
                debug!(internal_id = %internal_id, "requeueing request whose helper disconnected");
                self.pending.push_back(Pending {
                    wire_message: running.wire_message,
                    output_tx: running.output_tx,
                    result_tx: running.result_tx,
                });
            }
        }
        self.dispatch();
    }

    fn handle_from_helper(&mut self, helper_id: HelperId, message: Message) {
        match message {
            Message::HelperReady { .. } => {
                self.idle_helpers.push_back(helper_id);
                self.dispatch();
            }
            Message::ExecOutput { ref id, .. } => {
                if let Some(running) = self.running.get(id.as_str()) {
                    if let Some(tx) = &running.output_tx {
                        let _ = tx.send(message);
                    }
                }
            }
            Message::ExecResponse { ref id, .. } | Message::HttpResponse { ref id, .. } => {
                if let Some(running) = self.running.remove(id.as_str()) {
                    let _ = running.result_tx.send(message);
                }
            }
            other => {
                warn!(type_name = other.type_name(), "unexpected message from helper");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_request(id: &str) -> Message {
        Message::ExecRequest {
            id: id.to_string(),
            argv: vec!["morph".into(), "worker-build".into()],
            stdin_contents: String::new(),
        }
    }

    #[tokio::test]
    async fn request_waits_for_a_helper_then_is_dispatched() {
        let router = HelperRouter::spawn();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let helper_id = router.register_helper(out_tx).await;

        let (result_tx, result_rx) = oneshot::channel();
        router.submit(HelperRequest {
            message: exec_request("caller-1"),
            output_tx: None,
            result_tx,
        });

        let dispatched = out_rx.recv().await.unwrap();
        let internal_id = dispatched.id().to_string();
        assert_ne!(internal_id, "caller-1");

        router.message_from_helper(
            helper_id,
            Message::ExecResponse {
                id: internal_id,
                exit: 0,
                stdout: "ok".into(),
                stderr: String::new(),
            },
        );

        let response = result_rx.await.unwrap();
        assert_matches::assert_matches!(response, Message::ExecResponse { exit: 0, .. });
    }

    #[tokio::test]
    async fn helper_disconnect_requeues_the_running_request() {
        let router = HelperRouter::spawn();
        let (out_tx_1, mut out_rx_1) = mpsc::unbounded_channel();
        let helper_1 = router.register_helper(out_tx_1).await;

        let (result_tx, result_rx) = oneshot::channel();
        router.submit(HelperRequest {
            message: exec_request("caller-1"),
            output_tx: None,
            result_tx,
        });
        out_rx_1.recv().await.unwrap();

        router.helper_disconnected(helper_1);

        let (out_tx_2, mut out_rx_2) = mpsc::unbounded_channel();
        let helper_2 = router.register_helper(out_tx_2).await;
        let redispatched = out_rx_2.recv().await.unwrap();
        let internal_id = redispatched.id().to_string();

        router.message_from_helper(
            helper_2,
            Message::ExecResponse {
                id: internal_id,
                exit: 0,
                stdout: String::new(),
                stderr: String::new(),
            },
        );
        let response = result_rx.await.unwrap();
        assert_matches::assert_matches!(response, Message::ExecResponse { exit: 0, .. });
    }

    #[tokio::test]
    async fn helper_must_announce_ready_before_receiving_a_second_job() {
        let router = HelperRouter::spawn();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let helper_id = router.register_helper(out_tx).await;

        let (result_tx_1, result_rx_1) = oneshot::channel();
        router.submit(HelperRequest {
            message: exec_request("caller-1"),
            output_tx: None,
            result_tx: result_tx_1,
        });
        let first = out_rx.recv().await.unwrap();

        let (result_tx_2, _result_rx_2) = oneshot::channel();
        router.submit(HelperRequest {
            message: exec_request("caller-2"),
            output_tx: None,
            result_tx: result_tx_2,
        });

        // The helper is still busy with the first request: the second
        // stays pending until a fresh helper-ready arrives.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(out_rx.try_recv().is_err());

        router.message_from_helper(
            helper_id,
            Message::ExecResponse {
                id: first.id().to_string(),
                exit: 0,
                stdout: String::new(),
                stderr: String::new(),
            },
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(out_rx.try_recv().is_err());

        router.message_from_helper(helper_id, Message::HelperReady { id: String::new() });
        let second = out_rx.recv().await.unwrap();
        assert_ne!(second.id(), first.id());
        let _ = result_rx_1;
    }
}
