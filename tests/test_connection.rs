use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mockito::{Matcher, Server, ServerGuard};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use splunk_search_mcp::config::{Config, LoggingConfig, QuerySettings, SplunkConfig};
use splunk_search_mcp::error::SplunkMcpError;
use splunk_search_mcp::machine::MachineIdentity;
use splunk_search_mcp::session::SessionManager;
use splunk_search_mcp::vault::CredentialVault;

fn test_config(server: &ServerGuard, retry_backoff_ms: u64) -> Arc<Config> {
    let host_with_port = server.host_with_port();
    let (host, port) = host_with_port.rsplit_once(':').unwrap();

    let mut indexes = BTreeMap::new();
    indexes.insert("uat".to_string(), "index_app_uat".to_string());
    indexes.insert("prod".to_string(), "index_app_prod".to_string());

    Arc::new(Config {
        splunk: SplunkConfig {
            host: host.to_string(),
            port: port.parse().unwrap(),
            username: "svc_search".to_string(),
            scheme: "http".to_string(),
            password: Some("test-password".to_string()),
            password_encrypted: None,
            password_salt: None,
            machine_hash: None,
            timeout: 5,
            verify_ssl: false,
            retry_count: 3,
            retry_backoff_ms,
        },
        indexes,
        query_settings: QuerySettings::default(),
        logging: LoggingConfig::default(),
    })
}

fn manager(config: Arc<Config>) -> SessionManager {
    let vault = CredentialVault::with_identity(MachineIdentity::from_digest("a".repeat(64)));
    SessionManager::new(config, vault)
}

async fn mock_login_ok(server: &mut ServerGuard, hits: usize) -> mockito::Mock {
    server
        .mock("POST", "/services/auth/login")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("{\"sessionKey\": \"KEY123\"}")
        .expect(hits)
        .create_async()
        .await
}

async fn mock_apps_ok(server: &mut ServerGuard, hits: usize) -> mockito::Mock {
    server
        .mock("GET", "/services/apps/local")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body("{\"entry\": []}")
        .expect(hits)
        .create_async()
        .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cached_session_is_reused_without_reauthentication() {
    let mut server = Server::new_async().await;
    let login = mock_login_ok(&mut server, 1).await;
    // 一次建立后的探活 + 一次复用前的探活
    let apps = mock_apps_ok(&mut server, 2).await;

    let mgr = manager(test_config(&server, 10));
    let first = mgr.connect(false).await.unwrap();
    let second = mgr.connect(false).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    login.assert_async().await;
    apps.assert_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_probe_triggers_reconnect() {
    let mut server = Server::new_async().await;
    let login = mock_login_ok(&mut server, 2).await;
    let probe_ok = mock_apps_ok(&mut server, 1).await;
    let probe_dead = server
        .mock("GET", "/services/apps/local")
        .match_query(Matcher::Any)
        .with_status(503)
        .with_body("restarting")
        .expect(1)
        .create_async()
        .await;
    let probe_ok_again = mock_apps_ok(&mut server, 1).await;

    let mgr = manager(test_config(&server, 10));
    let first = mgr.connect(false).await.unwrap();
    let second = mgr.connect(false).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));

    login.assert_async().await;
    probe_ok.assert_async().await;
    probe_dead.assert_async().await;
    probe_ok_again.assert_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_failures_back_off_exponentially_until_success() {
    let mut server = Server::new_async().await;
    let failures = server
        .mock("POST", "/services/auth/login")
        .with_status(503)
        .with_body("Service Unavailable")
        .expect(2)
        .create_async()
        .await;
    let success = mock_login_ok(&mut server, 1).await;
    let apps = mock_apps_ok(&mut server, 1).await;

    let mgr = manager(test_config(&server, 50));
    let started = Instant::now();
    mgr.connect(false).await.unwrap();
    let elapsed = started.elapsed();

    // 两次失败之间的退避: 50ms, 100ms; 成功之后没有额外等待。
    assert!(elapsed >= Duration::from_millis(150), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");

    failures.assert_async().await;
    success.assert_async().await;
    apps.assert_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_limit_exhaustion_reports_last_error() {
    let mut server = Server::new_async().await;
    let failures = server
        .mock("POST", "/services/auth/login")
        .with_status(503)
        .with_body("Service Unavailable")
        .expect(3)
        .create_async()
        .await;

    let mgr = manager(test_config(&server, 10));
    let err = mgr.connect(false).await.err().expect("connect should fail");
    match err {
        SplunkMcpError::ConnectFailed { attempts, last_error } => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("503"), "last_error: {last_error}");
        }
        e => panic!("unexpected error: {e:?}"),
    }

    failures.assert_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auth_rejection_is_terminal_after_one_attempt() {
    let mut server = Server::new_async().await;
    let login = server
        .mock("POST", "/services/auth/login")
        .with_status(401)
        .with_body("{\"messages\":[{\"type\":\"WARN\",\"text\":\"Login failed\"}]}")
        .expect(1)
        .create_async()
        .await;

    let mgr = manager(test_config(&server, 1000));
    let started = Instant::now();
    let err = mgr.connect(false).await.err().expect("connect should fail");
    assert!(matches!(err, SplunkMcpError::AuthFailed(_)));
    // 没有退避说明没有进入重试分支。
    assert!(started.elapsed() < Duration::from_millis(900));

    login.assert_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forced_refresh_replaces_healthy_session() {
    let mut server = Server::new_async().await;
    let login = mock_login_ok(&mut server, 2).await;
    let apps = mock_apps_ok(&mut server, 2).await;

    let mgr = manager(test_config(&server, 10));
    let first = mgr.connect(false).await.unwrap();
    let second = mgr.connect(true).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));

    login.assert_async().await;
    apps.assert_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_logs_out_cached_session() {
    let mut server = Server::new_async().await;
    let _login = mock_login_ok(&mut server, 1).await;
    let _apps = mock_apps_ok(&mut server, 1).await;
    let logout = server
        .mock("DELETE", "/services/authentication/httpauth-tokens/KEY123")
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let mgr = manager(test_config(&server, 10));
    mgr.connect(false).await.unwrap();
    mgr.close_all().await;
    // 再次关闭是个空操作, 不应再发请求。
    mgr.close_all().await;

    logout.assert_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_process_logs_out_on_stdin_close() {
    let mut server = Server::new_async().await;
    let _login = mock_login_ok(&mut server, 1).await;
    let _apps = mock_apps_ok(&mut server, 1).await;
    let _info = server
        .mock("GET", "/services/server/info")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            "{\"entry\":[{\"content\":{\"version\":\"9.2.1\",\"build\":\"f7a3c2\",\
             \"serverName\":\"splunk-uat-01\"}}]}",
        )
        .create_async()
        .await;
    let _indexes = server
        .mock("GET", "/services/data/indexes")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body("{\"entry\":[{\"name\":\"main\"}]}")
        .create_async()
        .await;
    let logout = server
        .mock("DELETE", "/services/authentication/httpauth-tokens/KEY123")
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let host_with_port = server.host_with_port();
    let (host, port) = host_with_port.rsplit_once(':').unwrap();
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.yml");
    std::fs::write(
        &config_path,
        format!(
            r#"
splunk:
  host: {host}
  port: {port}
  username: svc_search
  scheme: http
  password: test-password
  timeout: 5
  retry_count: 1
  retry_backoff_ms: 10
indexes:
  uat: index_app_uat
  prod: index_app_prod
logging:
  level: warn
"#
        ),
    )
    .unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_splunk-search-mcp"))
        .arg(&config_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("spawn server binary");
    let mut stdin = child.stdin.take().expect("child stdin");
    let mut lines = BufReader::new(child.stdout.take().expect("child stdout")).lines();

    stdin
        .write_all(
            b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/call\",\
              \"params\":{\"name\":\"check_connection\",\"arguments\":{}}}\n",
        )
        .await
        .unwrap();
    let reply = lines.next_line().await.unwrap().expect("one response line");
    assert!(reply.contains("connected"), "reply: {reply}");

    // 客户端断开 (stdin EOF) 后, 服务端必须先注销会话再退出。
    drop(stdin);
    let status = child.wait().await.unwrap();
    assert!(status.success());

    logout.assert_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn check_connection_reports_server_and_indexes() {
    let mut server = Server::new_async().await;
    let _login = mock_login_ok(&mut server, 1).await;
    let _apps = mock_apps_ok(&mut server, 1).await;
    let _info = server
        .mock("GET", "/services/server/info")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            "{\"entry\":[{\"content\":{\"version\":\"9.2.1\",\"build\":\"f7a3c2\",\
             \"serverName\":\"splunk-uat-01\"}}]}",
        )
        .create_async()
        .await;
    let _indexes = server
        .mock("GET", "/services/data/indexes")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            "{\"entry\":[{\"name\":\"main\"},{\"name\":\"index_app_uat\"},\
             {\"name\":\"index_app_prod\"}]}",
        )
        .create_async()
        .await;

    let mgr = manager(test_config(&server, 10));
    let status = mgr.check_connection().await;
    assert_eq!(status.status, "connected");
    let info = status.server_info.expect("server info");
    assert_eq!(info.version, "9.2.1");
    assert_eq!(info.server_name, "splunk-uat-01");
    assert_eq!(
        status.available_indexes.expect("indexes"),
        vec!["main", "index_app_uat", "index_app_prod"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn check_connection_folds_failures_into_status() {
    let mut server = Server::new_async().await;
    let _login = server
        .mock("POST", "/services/auth/login")
        .with_status(401)
        .with_body("denied")
        .create_async()
        .await;

    let mgr = manager(test_config(&server, 10));
    let status = mgr.check_connection().await;
    assert_eq!(status.status, "error");
    assert!(status.error.expect("error message").contains("rejected credentials"));
    assert!(status.server_info.is_none());
}
