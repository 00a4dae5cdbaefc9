//! Integration tests that spawn real `netsqlite-server` processes.
//!
//! Every test builds its own candidate list from OS-assigned ports, so tests
//! can run in parallel and never touch the well-known port range.

use netsqlite_core::{BackoffConfig, ClientConfig, Connection, NetSqliteError, ProcessLauncher};
use serde_json::json;
use std::net::SocketAddr;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const SERVER_BIN: &str = env!("CARGO_BIN_EXE_netsqlite-server");

fn free_addrs(count: usize) -> Vec<SocketAddr> {
    let listeners: Vec<_> = (0..count)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners.iter().map(|l| l.local_addr().unwrap()).collect()
}

fn process_config(candidates: Vec<SocketAddr>) -> ClientConfig {
    ClientConfig::new()
        .with_candidates(candidates)
        .with_launcher(Arc::new(ProcessLauncher::new(SERVER_BIN)))
        .with_backoff(BackoffConfig::default().with_timeout(Duration::from_secs(20)))
}

fn temp_db(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

/// Wait until nothing accepts connections at `addr` any more.
async fn wait_until_unreachable(addr: SocketAddr) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if tokio::net::TcpStream::connect(addr).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} still accepting connections", addr);
}

#[tokio::test]
async fn test_memory_database_scenario() {
    let addrs = free_addrs(1);
    let conn = Connection::open(":memory:", None, process_config(addrs.clone()))
        .await
        .unwrap();

    assert!(conn.owns_server().await);
    assert!(conn.server_pid().await.is_some());
    assert_eq!(conn.server_addr().await, addrs[0]);

    conn.execute("CREATE TABLE t(x int)", &[]).await.unwrap();
    conn.execute("INSERT INTO t VALUES(1)", &[]).await.unwrap();
    assert_eq!(
        conn.execute("SELECT * FROM t", &[]).await.unwrap(),
        vec![vec![json!(1)]]
    );

    conn.close().await.unwrap();
    wait_until_unreachable(addrs[0]).await;
}

#[tokio::test]
async fn test_connections_share_one_server_process() {
    let temp_dir = TempDir::new().unwrap();
    let database = temp_db(&temp_dir, "shared.db");
    let config = process_config(free_addrs(2));

    let first = Connection::open(&database, None, config.clone()).await.unwrap();
    let second = Connection::open(&database, None, config).await.unwrap();

    assert_eq!(first.server_addr().await, second.server_addr().await);
    assert!(first.owns_server().await);
    assert!(!second.owns_server().await);

    first
        .execute("CREATE TABLE test(id INTEGER PRIMARY KEY, name TEXT)", &[])
        .await
        .unwrap();
    first
        .execute("INSERT INTO test VALUES(?, ?)", &[json!(1), json!("Alice")])
        .await
        .unwrap();

    assert_eq!(
        second
            .execute("SELECT * FROM test WHERE id = ?", &[json!(1)])
            .await
            .unwrap(),
        vec![vec![json!(1), json!("Alice")]]
    );
}

#[tokio::test]
async fn test_databases_get_separate_servers() {
    let temp_dir = TempDir::new().unwrap();
    let addrs = free_addrs(3);

    let a = Connection::open(temp_db(&temp_dir, "a.db"), None, process_config(addrs.clone()))
        .await
        .unwrap();
    let b = Connection::open(temp_db(&temp_dir, "b.db"), None, process_config(addrs.clone()))
        .await
        .unwrap();

    assert_eq!(a.server_addr().await, addrs[0]);
    assert_eq!(b.server_addr().await, addrs[1]);
    assert_ne!(a.server_pid().await, b.server_pid().await);
}

#[tokio::test]
async fn test_authentication_with_spawned_server() {
    let temp_dir = TempDir::new().unwrap();
    let database = temp_db(&temp_dir, "guarded.db");
    let addrs = free_addrs(2);
    let owner = Connection::open(&database, Some("abc"), process_config(addrs.clone()))
        .await
        .unwrap();
    owner.execute("SELECT 1", &[]).await.unwrap();

    match Connection::open(&database, Some("xyz"), process_config(addrs.clone())).await {
        Err(NetSqliteError::AuthenticationFailed { message }) => {
            assert!(message.contains("Invalid authentication token"))
        }
        other => panic!("Expected AuthenticationFailed, got: {:?}", other),
    }

    assert!(matches!(
        Connection::open(&database, None, process_config(addrs.clone())).await,
        Err(NetSqliteError::AuthenticationRequired { .. })
    ));

    let member = Connection::open(&database, Some("abc"), process_config(addrs.clone()))
        .await
        .unwrap();
    assert_eq!(member.server_addr().await, addrs[0]);
    assert!(member.is_alive().await);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_token_not_visible_in_process_arguments() {
    let conn = Connection::open(":memory:", Some("top-secret-token"), process_config(free_addrs(1)))
        .await
        .unwrap();
    let pid = conn.server_pid().await.unwrap();

    let cmdline = std::fs::read(format!("/proc/{}/cmdline", pid)).unwrap();
    let cmdline = String::from_utf8_lossy(&cmdline);
    assert!(cmdline.contains(":memory:"));
    assert!(!cmdline.contains("top-secret-token"));
}

#[tokio::test]
async fn test_server_without_secret_accepts_any_token() {
    let addrs = free_addrs(1);
    let _owner = Connection::open(":memory:", None, process_config(addrs.clone()))
        .await
        .unwrap();

    let guest = Connection::open(":memory:", Some("whatever"), process_config(addrs))
        .await
        .unwrap();
    assert_eq!(guest.execute("SELECT 2", &[]).await.unwrap(), vec![vec![json!(2)]]);
}

#[cfg(unix)]
#[tokio::test]
async fn test_killed_server_is_replaced_transparently() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let temp_dir = TempDir::new().unwrap();
    let database = temp_db(&temp_dir, "survive.db");
    let addrs = free_addrs(1);

    let conn = Connection::open(&database, None, process_config(addrs.clone()))
        .await
        .unwrap();
    conn.execute("CREATE TABLE t(x int)", &[]).await.unwrap();
    conn.execute("INSERT INTO t VALUES(42)", &[]).await.unwrap();

    let old_pid = conn.server_pid().await.unwrap();
    kill(Pid::from_raw(old_pid as i32), Signal::SIGKILL).unwrap();
    wait_until_unreachable(addrs[0]).await;

    assert_eq!(
        conn.execute("SELECT * FROM t", &[]).await.unwrap(),
        vec![vec![json!(42)]]
    );

    let new_pid = conn.server_pid().await.unwrap();
    assert_ne!(new_pid, old_pid);
    assert_eq!(conn.server_addr().await, addrs[0]);

    conn.close().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_killed_server_without_liveness_check() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let temp_dir = TempDir::new().unwrap();
    let database = temp_db(&temp_dir, "retry.db");
    let addrs = free_addrs(1);
    let config = process_config(addrs.clone()).with_liveness_check(false);

    let conn = Connection::open(&database, None, config).await.unwrap();
    conn.execute("CREATE TABLE t(x int)", &[]).await.unwrap();

    let pid = conn.server_pid().await.unwrap();
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    wait_until_unreachable(addrs[0]).await;

    // The request itself fails, triggering one reconnect and retry
    conn.execute("INSERT INTO t VALUES(7)", &[]).await.unwrap();
    assert_eq!(
        conn.execute("SELECT * FROM t", &[]).await.unwrap(),
        vec![vec![json!(7)]]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_through_one_server() {
    let temp_dir = TempDir::new().unwrap();
    let database = temp_db(&temp_dir, "writers.db");
    let config = process_config(free_addrs(2));

    let owner = Connection::open(&database, None, config.clone()).await.unwrap();
    owner
        .execute("CREATE TABLE t(id INTEGER PRIMARY KEY AUTOINCREMENT, worker INTEGER)", &[])
        .await
        .unwrap();

    let writers = (0..5).map(|worker| {
        let database = database.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let conn = Connection::open(&database, None, config).await.unwrap();
            for _ in 0..20 {
                conn.execute("INSERT INTO t(worker) VALUES(?)", &[json!(worker)])
                    .await
                    .unwrap();
            }
        })
    });
    for result in futures::future::join_all(writers).await {
        result.unwrap();
    }

    assert_eq!(
        owner.execute("SELECT COUNT(*), COUNT(DISTINCT id) FROM t", &[]).await.unwrap(),
        vec![vec![json!(100), json!(100)]]
    );
}

#[tokio::test]
async fn test_dropping_owner_stops_server() {
    let addrs = free_addrs(1);
    {
        let conn = Connection::open(":memory:", None, process_config(addrs.clone()))
            .await
            .unwrap();
        assert!(conn.is_alive().await);
    }
    wait_until_unreachable(addrs[0]).await;
}

#[test]
fn test_unopenable_database_exits_with_error() {
    let temp_dir = TempDir::new().unwrap();
    let bad = temp_dir.path().join("missing/dir/db.sqlite");
    let addr = free_addrs(1)[0];

    let status = Command::new(SERVER_BIN)
        .arg("--database")
        .arg(&bad)
        .arg("--port")
        .arg(addr.port().to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();

    assert!(!status.success());
}

#[test]
fn test_taken_port_exits_with_error() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let status = Command::new(SERVER_BIN)
        .args(["--database", ":memory:", "--port", &port.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();

    assert!(!status.success());
}

#[cfg(unix)]
#[tokio::test]
async fn test_sigterm_stops_server_cleanly() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let addr = free_addrs(1)[0];
    let mut child = Command::new(SERVER_BIN)
        .args(["--database", ":memory:", "--port", &addr.port().to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(20);
    while tokio::net::TcpStream::connect(addr).await.is_err() {
        assert!(Instant::now() < deadline, "server never started listening");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();
    let status = child.wait().unwrap();
    assert!(status.success(), "exit status: {}", status);
}
