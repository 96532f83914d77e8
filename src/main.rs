use std::env;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use splunk_search_mcp::config::Config;
use splunk_search_mcp::error::{Result, SplunkMcpError};
use splunk_search_mcp::mcp::{run_stdio, McpServer};
use splunk_search_mcp::session::SessionManager;
use splunk_search_mcp::vault::CredentialVault;

#[tokio::main]
async fn main() -> Result<()> {
    // 配置路径可以作为唯一参数传入, 省略时找当前目录的 config.yml。
    let args: Vec<String> = env::args().collect();
    let cfg_path = match args.get(1) {
        Some(path) => Path::new(path).to_path_buf(),
        None => Path::new("config.yml").to_path_buf(),
    };

    let config = match Config::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(SplunkMcpError::ConfigMissing(path)) => {
            eprintln!("[ERROR] Configuration file not found: {path}");
            eprintln!("[INFO] Please ensure config.yml exists, or pass a path:");
            eprintln!("[INFO]   {} /path/to/config.yml", args[0]);
            eprintln!("[INFO] Then run: cargo run --bin encrypt_password");
            eprintln!("       to securely encrypt your password");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("[ERROR] Failed to start server: {e}");
            std::process::exit(1);
        }
    };

    // 日志必须走 stderr, stdout 是 MCP 协议流。
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting Splunk MCP Server...");
    tracing::info!(
        environments = %config.list_environments().join(", "),
        "configured environments"
    );

    let config = Arc::new(config);
    let vault = CredentialVault::new();
    let sessions = Arc::new(SessionManager::new(config.clone(), vault));
    let server = Arc::new(McpServer::new(config, sessions.clone()));

    // stdio 循环出错也要先注销服务端会话再退出。
    let result = run_stdio(server).await;

    tracing::info!("Shutting down Splunk MCP Server...");
    sessions.close_all().await;

    result
}
