//! `distbuild-helper` — connects out to a controller's helper port and
//! executes `exec-request`/`http-request` messages on its behalf
//! (`spec.md` §4.5, §6). A freshly accepted connection is already
//! treated as idle by the controller; this binary only has to announce
//! `helper-ready` again once it finishes a job.

mod http;
mod process;

use std::sync::Arc;

use clap::Parser;
use distbuild_core::Message;
use distbuild_net::JsonConnection;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

/// Subprocess exec and HTTP fetch helper for a distbuildd controller.
#[derive(Parser, Debug)]
#[command(name = "distbuild-helper")]
struct Args {
    /// Controller helper-port address, e.g. 127.0.0.1:3333.
    #[arg(long)]
    controller: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let stream = TcpStream::connect(&args.controller).await?;
    info!(controller = %args.controller, "connected");

    let conn = JsonConnection::new(stream);
    let (sender, mut receiver) = conn.split();
    let sender = Arc::new(Mutex::new(sender));

    // The controller treats a freshly accepted helper connection as idle
    // immediately; `helper-ready` only needs to be sent again after each
    // completed job, never on connect.
    let http_client = reqwest::Client::new();

    loop {
        let Some(result) = receiver.recv().await else {
            info!("controller closed the connection");
            break;
        };
        let msg = match result {
            Ok(msg) => msg,
            Err(err) => {
                warn!(error = %err, "framing error from controller, disconnecting");
                break;
            }
        };

        match msg {
            Message::ExecRequest {
                id,
                argv,
                stdin_contents,
            } => {
                let sender = Arc::clone(&sender);
                tokio::spawn(async move {
                    handle_exec_request(sender, id, argv, stdin_contents).await;
                });
            }
            Message::HttpRequest {
                id,
                url,
                method,
                headers,
                body,
            } => {
                let sender = Arc::clone(&sender);
                let client = http_client.clone();
                tokio::spawn(async move {
                    let response = http::run_http_request(&client, id, url, method, headers, body).await;
                    let mut sender = sender.lock().await;
                    if let Err(err) = sender.send(response).await {
                        warn!(error = %err, "failed to send http-response");
                        return;
                    }
                    if let Err(err) = sender.send(Message::HelperReady { id: String::new() }).await {
                        warn!(error = %err, "failed to send helper-ready");
                    }
                });
            }
            other => {
                warn!(type_name = other.type_name(), "unexpected message from controller, ignoring");
            }
        }
    }

    Ok(())
}

async fn handle_exec_request(
    sender: Arc<Mutex<distbuild_net::JsonSender>>,
    id: String,
    argv: Vec<String>,
    stdin_contents: String,
) {
    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<process::OutputChunk>();
    let forward_id = id.clone();
    let forward_sender = Arc::clone(&sender);
    let forwarder = tokio::spawn(async move {
        while let Some(chunk) = chunk_rx.recv().await {
            let stdout = String::from_utf8_lossy(&chunk.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&chunk.stderr).into_owned();
            if stdout.is_empty() && stderr.is_empty() {
                continue;
            }
            let msg = Message::ExecOutput {
                id: forward_id.clone(),
                stdout,
                stderr,
            };
            if forward_sender.lock().await.send(msg).await.is_err() {
                break;
            }
        }
    });

    let outcome = process::run_exec_request(&argv, stdin_contents.as_bytes(), chunk_tx).await;
    let _ = forwarder.await;

    let response = match outcome {
        Ok(outcome) => Message::ExecResponse {
            id,
            exit: outcome.exit,
            stdout: String::from_utf8_lossy(&outcome.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&outcome.stderr).into_owned(),
        },
        Err(err) => Message::ExecResponse {
            id,
            exit: -1,
            stdout: String::new(),
            stderr: format!("helper: failed to run command: {err}"),
        },
    };

    let mut sender = sender.lock().await;
    if let Err(err) = sender.send(response).await {
        warn!(error = %err, "failed to send exec-response");
        return;
    }
    if let Err(err) = sender.send(Message::HelperReady { id: String::new() }).await {
        warn!(error = %err, "failed to send helper-ready");
    }
}
