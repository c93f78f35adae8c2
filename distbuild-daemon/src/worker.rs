//! Worker scheduling (`spec.md` §4.7/§4.8): the `WorkerBuildQueuer`
//! singleton deduplicates concurrent requests for the same artifact and
//! hands jobs to idle workers; each `WorkerConnection` drives one worker
//! socket through `idle -> building -> caching -> idle`.
//!
//! Grounded on `worker_build_scheduler.py`'s `Jobs`/`WorkerBuildQueuer`/
//! `WorkerConnection` classes. As with the helper router, progress events
//! that the original broadcasts to the `BuildController` class and
//! filters by id are instead delivered straight to the interested
//! `BuildController` tasks over channels the queuer holds per job.

use std::collections::{HashMap, VecDeque};

use distbuild_core::{ArtifactKind, IdGen};
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type WorkerId = u64;

/// What a `BuildController` asked the queuer to build, and where it wants
/// to hear back.
pub struct WorkerBuildRequest {
    pub initiator_id: String,
    pub basename: String,
    pub artifact_name: String,
    pub cache_key: String,
    pub kind: ArtifactKind,
    /// Every artifact name sharing `cache_key` in the requester's graph —
    /// the chunk-coalescing case of `spec.md` §4, where one worker
    /// invocation produces several named outputs that must all be
    /// confirmed cached together. Always includes `artifact_name` itself.
    pub sibling_names: Vec<String>,
    pub stdin_contents: String,
    pub reply_tx: mpsc::UnboundedSender<WorkerEvent>,
}

/// Events relayed back to a `BuildController` for one artifact it cares
/// about. `step_name` is always the artifact's own name, matching the
/// original's `build_step_name`.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    StepAlreadyStarted { step_name: String, worker_name: String },
    Waiting { step_name: String },
    StepStarted { step_name: String, worker_name: String },
    Output { step_name: String, stdout: String, stderr: String },
    Caching { step_name: String },
    Finished { step_name: String, cache_key: String },
    Failed { step_name: String, cache_key: String, reason: String },
}

/// Sent from a `WorkerConnection` task to the queuer as it drives a job
/// through its lifecycle.
pub enum WorkerReport {
    StepStarted { basename: String, worker_name: String },
    Output { basename: String, stdout: String, stderr: String },
    Caching { basename: String },
    Finished { basename: String },
    Failed { basename: String, reason: String },
}

pub enum QueuerMsg {
    BuildRequest(WorkerBuildRequest),
    CancelPending { initiator_id: String },
    WorkerConnected {
        worker_name: String,
        to_worker: mpsc::UnboundedSender<WorkerCommand>,
        reply: tokio::sync::oneshot::Sender<WorkerId>,
    },
    WorkerDisconnected(WorkerId),
    NeedJob(WorkerId),
    Report(WorkerReport),
}

/// Everything a `WorkerConnection` needs to actually run a job, with the
/// artifact's serialized subtree already produced by the owning
/// `BuildController` (`spec.md` §6, "Serialized artifact").
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub basename: String,
    pub artifact_name: String,
    pub cache_key: String,
    pub kind: ArtifactKind,
    pub sibling_names: Vec<String>,
    pub stdin_contents: String,
}

pub enum WorkerCommand {
    HaveAJob(JobHandle),
}

struct Job {
    artifact_name: String,
    cache_key: String,
    kind: ArtifactKind,
    sibling_names: Vec<String>,
    stdin_contents: String,
    assigned_worker: Option<WorkerId>,
    initiators: IndexMap<String, mpsc::UnboundedSender<WorkerEvent>>,
}

struct WorkerSlot {
    worker_name: String,
    to_worker: mpsc::UnboundedSender<WorkerCommand>,
    current_job: Option<String>,
}

pub struct WorkerBuildQueuer {
    rx: mpsc::UnboundedReceiver<QueuerMsg>,
    idgen: IdGen,
    jobs: IndexMap<String, Job>,
    workers: HashMap<WorkerId, WorkerSlot>,
    available_workers: VecDeque<WorkerId>,
    next_worker_id: WorkerId,
}

#[derive(Clone)]
pub struct WorkerBuildQueuerHandle {
    tx: mpsc::UnboundedSender<QueuerMsg>,
}

impl WorkerBuildQueuerHandle {
    pub fn build_request(&self, request: WorkerBuildRequest) {
        let _ = self.tx.send(QueuerMsg::BuildRequest(request));
    }

    /// Reserved per `spec.md` §4.7: current semantics treat this as a
    /// no-op on the queue itself.
    pub fn cancel_pending(&self, initiator_id: String) {
        let _ = self.tx.send(QueuerMsg::CancelPending { initiator_id });
    }

    pub async fn register_worker(
        &self,
        worker_name: String,
        to_worker: mpsc::UnboundedSender<WorkerCommand>,
    ) -> WorkerId {
        let (reply, rx) = tokio::sync::oneshot::channel();
        let _ = self.tx.send(QueuerMsg::WorkerConnected {
            worker_name,
            to_worker,
            reply,
        });
        rx.await.expect("queuer task is alive")
    }

    pub fn worker_disconnected(&self, worker_id: WorkerId) {
        let _ = self.tx.send(QueuerMsg::WorkerDisconnected(worker_id));
    }

    pub fn need_job(&self, worker_id: WorkerId) {
        let _ = self.tx.send(QueuerMsg::NeedJob(worker_id));
    }

    pub fn report(&self, report: WorkerReport) {
        let _ = self.tx.send(QueuerMsg::Report(report));
    }
}

impl WorkerBuildQueuer {
    pub fn spawn() -> WorkerBuildQueuerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let queuer = WorkerBuildQueuer {
            rx,
            idgen: IdGen::new("job"),
            jobs: IndexMap::new(),
            workers: HashMap::new(),
            available_workers: VecDeque::new(),
            next_worker_id: 1,
        };
        tokio::spawn(queuer.run());
        WorkerBuildQueuerHandle { tx }
    }

    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                QueuerMsg::BuildRequest(req) => self.handle_build_request(req),
                QueuerMsg::CancelPending { initiator_id } => {
                    debug!(initiator_id = %initiator_id, "cancel-pending is a no-op on the queue");
                }
                QueuerMsg::WorkerConnected {
                    worker_name,
                    to_worker,
                    reply,
                } => {
                    let id = self.next_worker_id;
                    self.next_worker_id += 1;
                    info!(worker_id = id, worker_name = %worker_name, "worker connected");
                    self.workers.insert(
                        id,
                        WorkerSlot {
                            worker_name,
                            to_worker,
                            current_job: None,
                        },
                    );
                    let _ = reply.send(id);
                }
                QueuerMsg::WorkerDisconnected(worker_id) => self.handle_worker_disconnected(worker_id),
                QueuerMsg::NeedJob(worker_id) => self.handle_need_job(worker_id),
                QueuerMsg::Report(report) => self.handle_report(report),
            }
        }
    }

    fn handle_build_request(&mut self, req: WorkerBuildRequest) {
        if let Some(job) = self.jobs.get_mut(&req.basename) {
            job.initiators.insert(req.initiator_id, req.reply_tx.clone());
            let event = if let Some(worker_id) = job.assigned_worker {
                let worker_name = self
                    .workers
                    .get(&worker_id)
                    .map(|w| w.worker_name.clone())
                    .unwrap_or_default();
                WorkerEvent::StepAlreadyStarted {
                    step_name: job.artifact_name.clone(),
                    worker_name,
                }
            } else {
                WorkerEvent::Waiting {
                    step_name: job.artifact_name.clone(),
                }
            };
            let _ = req.reply_tx.send(event);
            return;
        }

        let job_id = self.idgen.next();
        debug!(job_id = %job_id, basename = %req.basename, "created job");
        let mut initiators = IndexMap::new();
        initiators.insert(req.initiator_id, req.reply_tx.clone());
        let mut job = Job {
            artifact_name: req.artifact_name,
            cache_key: req.cache_key,
            kind: req.kind,
            sibling_names: req.sibling_names,
            stdin_contents: req.stdin_contents,
            assigned_worker: None,
            initiators,
        };

        if let Some(worker_id) = self.available_workers.pop_front() {
            Self::assign(&mut self.workers, &req.basename, &mut job, worker_id);
        } else {
            let _ = req.reply_tx.send(WorkerEvent::Waiting {
                step_name: job.artifact_name.clone(),
            });
        }
        self.jobs.insert(req.basename, job);
    }

    fn assign(
        workers: &mut HashMap<WorkerId, WorkerSlot>,
        basename: &str,
        job: &mut Job,
        worker_id: WorkerId,
    ) {
        job.assigned_worker = Some(worker_id);
        if let Some(slot) = workers.get_mut(&worker_id) {
            slot.current_job = Some(basename.to_string());
            let handle = JobHandle {
                basename: basename.to_string(),
                artifact_name: job.artifact_name.clone(),
                cache_key: job.cache_key.clone(),
                kind: job.kind,
                sibling_names: job.sibling_names.clone(),
                stdin_contents: job.stdin_contents.clone(),
            };
            let _ = slot.to_worker.send(WorkerCommand::HaveAJob(handle));
        }
    }

    fn try_assign_next(&mut self) {
        while let Some(worker_id) = self.available_workers.pop_front() {
            let Some((basename, job)) = self
                .jobs
                .iter_mut()
                .find(|(_, j)| j.assigned_worker.is_none())
            else {
                self.available_workers.push_front(worker_id);
                break;
            };
            let basename = basename.clone();
            Self::assign(&mut self.workers, &basename, job, worker_id);
        }
    }

    fn handle_need_job(&mut self, worker_id: WorkerId) {
        if let Some(slot) = self.workers.get_mut(&worker_id) {
            if let Some(basename) = slot.current_job.take() {
                self.jobs.shift_remove(&basename);
            }
        }
        self.available_workers.push_back(worker_id);
        self.try_assign_next();
    }

    fn handle_worker_disconnected(&mut self, worker_id: WorkerId) {
        self.available_workers.retain(|&w| w != worker_id);
        if let Some(slot) = self.workers.remove(&worker_id) {
            if let Some(basename) = slot.current_job {
                if let Some(job) = self.jobs.get_mut(&basename) {
                    warn!(worker_id, basename = %basename, "worker disconnected mid-build, job returns to the pool");
                    job.assigned_worker = None;
                }
            }
        }
        self.try_assign_next();
    }

    fn fan_out(&self, basename: &str, make_event: impl Fn(&Job) -> WorkerEvent) {
        if let Some(job) = self.jobs.get(basename) {
            let event = make_event(job);
            for tx in job.initiators.values() {
                let _ = tx.send(event.clone());
            }
        }
    }

    fn handle_report(&mut self, report: WorkerReport) {
        match report {
            WorkerReport::StepStarted { basename, worker_name } => {
                self.fan_out(&basename, |job| WorkerEvent::StepStarted {
                    step_name: job.artifact_name.clone(),
                    worker_name: worker_name.clone(),
                });
            }
            WorkerReport::Output { basename, stdout, stderr } => {
                self.fan_out(&basename, |job| WorkerEvent::Output {
                    step_name: job.artifact_name.clone(),
                    stdout: stdout.clone(),
                    stderr: stderr.clone(),
                });
            }
            WorkerReport::Caching { basename } => {
                self.fan_out(&basename, |job| WorkerEvent::Caching {
                    step_name: job.artifact_name.clone(),
                });
            }
            WorkerReport::Finished { basename } => {
                self.fan_out(&basename, |job| WorkerEvent::Finished {
                    step_name: job.artifact_name.clone(),
                    cache_key: job.cache_key.clone(),
                });
            }
            WorkerReport::Failed { basename, reason } => {
                self.fan_out(&basename, |job| WorkerEvent::Failed {
                    step_name: job.artifact_name.clone(),
                    cache_key: job.cache_key.clone(),
                    reason: reason.clone(),
                });
            }
        }
    }
}

/// The URL-suffix rule of `spec.md` §4.8's caching step, covering every
/// artifact name the dispatched job's `cache_key` produced together
/// (`spec.md` §4's chunk coalescing — one worker invocation can yield
/// several named outputs, all of which need cache-fetch confirmation in
/// the same request). For each name this is `<name>` for a chunk, plus
/// the stratum metadata suffix and the system rootfs/kernel pairing.
pub fn caching_suffixes(kind: ArtifactKind, names: &[String]) -> Vec<String> {
    names.iter().flat_map(|name| caching_suffixes_for_name(kind, name)).collect()
}

fn caching_suffixes_for_name(kind: ArtifactKind, name: &str) -> Vec<String> {
    match kind {
        ArtifactKind::Chunk => vec![name.to_string()],
        ArtifactKind::Stratum => vec![name.to_string(), format!("{name}.meta")],
        ArtifactKind::System => {
            let mut suffixes = vec![name.to_string()];
            if let Some(prefix) = name.strip_suffix("-rootfs") {
                suffixes.push(format!("{prefix}-kernel"));
            }
            suffixes
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(basename: &str, tx: mpsc::UnboundedSender<WorkerEvent>) -> WorkerBuildRequest {
        WorkerBuildRequest {
            initiator_id: "r1".into(),
            basename: basename.into(),
            artifact_name: "c".into(),
            cache_key: "k1".into(),
            kind: ArtifactKind::Chunk,
            sibling_names: vec!["c".into()],
            stdin_contents: "{}".into(),
            reply_tx: tx,
        }
    }

    #[tokio::test]
    async fn zero_workers_keeps_job_waiting_until_needjob() {
        let queuer = WorkerBuildQueuer::spawn();
        let (tx, mut rx) = mpsc::unbounded_channel();
        queuer.build_request(request("k1.chunk.c", tx));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, WorkerEvent::Waiting { .. }));

        let (to_worker, mut from_queuer) = mpsc::unbounded_channel();
        let worker_id = queuer.register_worker("worker-1".into(), to_worker).await;
        queuer.need_job(worker_id);

        let cmd = from_queuer.recv().await.unwrap();
        assert!(matches!(cmd, WorkerCommand::HaveAJob(_)));
    }

    #[tokio::test]
    async fn second_request_for_same_basename_deduplicates() {
        let queuer = WorkerBuildQueuer::spawn();
        let (to_worker, mut from_queuer) = mpsc::unbounded_channel();
        let worker_id = queuer.register_worker("worker-1".into(), to_worker).await;
        queuer.need_job(worker_id);

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        queuer.build_request(request("k1.chunk.c", tx1));
        let cmd = from_queuer.recv().await.unwrap();
        assert!(matches!(cmd, WorkerCommand::HaveAJob(_)));

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let mut second = request("k1.chunk.c", tx2);
        second.initiator_id = "r2".into();
        queuer.build_request(second);
        let event = rx2.recv().await.unwrap();
        assert!(matches!(event, WorkerEvent::StepAlreadyStarted { .. }));

        queuer.report(WorkerReport::StepStarted {
            basename: "k1.chunk.c".into(),
            worker_name: "worker-1".into(),
        });
        let e1 = rx1.recv().await.unwrap();
        assert!(matches!(e1, WorkerEvent::StepStarted { .. }));
    }

    #[test]
    fn caching_suffixes_special_case_rootfs_kernel_pair() {
        let suffixes = caching_suffixes(ArtifactKind::System, &["my-system-rootfs".to_string()]);
        assert_eq!(suffixes, vec!["my-system-rootfs", "my-system-kernel"]);
    }

    #[test]
    fn caching_suffixes_stratum_includes_metadata() {
        let suffixes = caching_suffixes(ArtifactKind::Stratum, &["core".to_string()]);
        assert_eq!(suffixes, vec!["core", "core.meta"]);
    }

    #[test]
    fn caching_suffixes_enumerates_every_coalesced_sibling_name() {
        let names = vec!["bin".to_string(), "doc".to_string()];
        let suffixes = caching_suffixes(ArtifactKind::Chunk, &names);
        assert_eq!(suffixes, vec!["bin", "doc"]);
    }
}
