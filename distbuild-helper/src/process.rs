//! Subprocess execution for `exec-request` messages.
//!
//! Adapted from the teacher's forkserver command runner: spawn with
//! stdout/stderr piped and placed in their own process group, stream
//! output as it arrives rather than buffering until exit, and kill by
//! signalling the whole process group so grandchildren don't outlive a
//! cancelled build step.

use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::Stdio;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;

const CHUNK_SIZE: usize = 64 * 1024;

/// One increment of output observed while a command is running, relayed
/// to the controller as `exec-output` before the final `exec-response`.
#[derive(Debug, Clone, Default)]
pub struct OutputChunk {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug)]
pub struct ExecOutcome {
    pub exit: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

fn prepare_command(argv: &[String]) -> std::io::Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // SAFETY: process_group(0) only affects the child after fork, before
    // exec; no shared state is touched from the parent here.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    Ok(cmd)
}

/// Spawns `argv`, writes `stdin_contents` to its stdin then closes it,
/// streams stdout/stderr chunks to `output_tx` as they arrive, and
/// returns the aggregate output plus exit code once the child exits.
pub async fn run_exec_request(
    argv: &[String],
    stdin_contents: &[u8],
    output_tx: UnboundedSender<OutputChunk>,
) -> std::io::Result<ExecOutcome> {
    let mut cmd = prepare_command(argv)?;
    let mut child: Child = cmd.spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        let payload = stdin_contents.to_vec();
        tokio::spawn(async move {
            let _ = stdin.write_all(&payload).await;
            // Dropping `stdin` here closes the write half.
        });
    }

    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");

    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();
    let mut out_chunk = vec![0u8; CHUNK_SIZE];
    let mut err_chunk = vec![0u8; CHUNK_SIZE];
    let mut out_open = true;
    let mut err_open = true;

    loop {
        if !out_open && !err_open {
            break;
        }
        tokio::select! {
            n = stdout.read(&mut out_chunk), if out_open => {
                match n {
                    Ok(0) => out_open = false,
                    Ok(n) => {
                        out_buf.extend_from_slice(&out_chunk[..n]);
                        let _ = output_tx.send(OutputChunk { stdout: out_chunk[..n].to_vec(), stderr: Vec::new() });
                    }
                    Err(_) => out_open = false,
                }
            }
            n = stderr.read(&mut err_chunk), if err_open => {
                match n {
                    Ok(0) => err_open = false,
                    Ok(n) => {
                        err_buf.extend_from_slice(&err_chunk[..n]);
                        let _ = output_tx.send(OutputChunk { stdout: Vec::new(), stderr: err_chunk[..n].to_vec() });
                    }
                    Err(_) => err_open = false,
                }
            }
        }
    }

    let status = child.wait().await?;
    let exit = status.code().unwrap_or_else(|| status.signal().map(|s| 128 + s).unwrap_or(-1));

    Ok(ExecOutcome {
        exit,
        stdout: out_buf,
        stderr: err_buf,
    })
}

/// Kills the whole process group rooted at `pid`. Used to implement the
/// `exec-cancel` extension point (`spec.md` §9's open question on
/// cancellation completeness) rather than only killing the immediate
/// child and leaking its descendants.
pub fn kill_process_group(pid: u32) -> std::io::Result<()> {
    signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}
