//! Runs the real binary in process mode and kills its workers.

use std::{
    collections::BTreeSet,
    fs,
    net::TcpListener,
    process::Stdio,
    time::{Duration, Instant},
};

use markdownd::{config::ListenAddress, infra::client};
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use tempfile::TempDir;
use tokio::{
    process::{Child, Command},
    time::{sleep, timeout},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// Live (non-zombie) children of `parent`, read from `/proc`.
fn children_of(parent: u32) -> BTreeSet<i32> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return BTreeSet::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| {
            let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
                return false;
            };
            // `pid (comm) state ppid ...`; comm may contain spaces.
            let Some(rest) = stat.rfind(')').map(|at| &stat[at + 1..]) else {
                return false;
            };
            let mut fields = rest.split_whitespace();
            let state = fields.next();
            let ppid = fields.next().and_then(|field| field.parse::<u32>().ok());
            state != Some("Z") && ppid == Some(parent)
        })
        .collect()
}

fn is_running(pid: i32) -> bool {
    fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| {
        stat.rfind(')')
            .and_then(|at| stat[at + 1..].split_whitespace().next())
            .is_some_and(|state| state != "Z")
    })
}

async fn wait_for_workers(parent: u32, count: usize, gone: &[i32]) -> BTreeSet<i32> {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        let children = children_of(parent);
        if children.len() == count && gone.iter().all(|pid| !children.contains(pid)) {
            return children;
        }
        assert!(
            Instant::now() < deadline,
            "workers never settled: have {children:?}, waiting out {gone:?}"
        );
        sleep(Duration::from_millis(50)).await;
    }
}

async fn render(address: &ListenAddress) -> String {
    let reply = client::request(address, b"# Still here\n", REQUEST_TIMEOUT)
        .await
        .expect("daemon reply");
    String::from_utf8(reply).expect("utf-8 reply")
}

fn spawn_daemon(port: u16, dir: &TempDir) -> Child {
    Command::new(env!("CARGO_BIN_EXE_markdownd"))
        .args(["--port", &port.to_string(), "--workers", "2"])
        .args(["--respawn-initial-backoff-ms", "10", "--respawn-max-backoff-ms", "50"])
        .env("MARKDOWND__LOGGING__LEVEL", "warn")
        .env("MARKDOWND__RENDER__MERMAID_CACHE_DIR", dir.path().join("mermaid"))
        .env_remove("MARKDOWN_SOCKET")
        .env_remove("MARKDOWN_PORT")
        .current_dir(dir.path())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("spawn markdownd")
}

#[tokio::test]
async fn killed_worker_processes_are_replaced() {
    let dir = TempDir::new().expect("temp dir");
    let port = free_port();
    let address = ListenAddress::Tcp(format!("127.0.0.1:{port}").parse().expect("addr"));

    let mut daemon = spawn_daemon(port, &dir);
    let supervisor = daemon.id().expect("supervisor pid");

    let originals: Vec<i32> = wait_for_workers(supervisor, 2, &[]).await.into_iter().collect();
    assert!(render(&address).await.contains("Still here"));

    kill(Pid::from_raw(originals[0]), Signal::SIGKILL).expect("kill first worker");
    let replaced = wait_for_workers(supervisor, 2, &originals[..1]).await;
    assert!(replaced.contains(&originals[1]));
    assert!(render(&address).await.contains("Still here"));

    // With both originals gone, only respawned workers can answer.
    kill(Pid::from_raw(originals[1]), Signal::SIGKILL).expect("kill second worker");
    let respawned = wait_for_workers(supervisor, 2, &originals).await;
    assert!(render(&address).await.contains("<h1"));

    let supervisor_pid = Pid::from_raw(i32::try_from(supervisor).expect("pid fits"));
    kill(supervisor_pid, Signal::SIGTERM).expect("stop supervisor");
    let status = timeout(SETTLE_TIMEOUT, daemon.wait())
        .await
        .expect("supervisor exits after SIGTERM")
        .expect("wait for supervisor");
    assert!(status.success(), "supervisor exited with {status}");

    let deadline = Instant::now() + SETTLE_TIMEOUT;
    while respawned.iter().any(|pid| is_running(*pid)) {
        assert!(Instant::now() < deadline, "workers outlived the supervisor");
        sleep(Duration::from_millis(50)).await;
    }
}
