//! session.rs - Splunk 会话生命周期管理
//!
//! 进程内最多缓存一个活跃会话。复用前先探活, 探活失败或显式 force 时走
//! 重建路径: 解析主机名(失败不致命)、取凭据、带指数退避的有限次重连。
//! 认证失败绝不重试。

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::client::SplunkApi;
use crate::config::Config;
use crate::error::{Result, SplunkMcpError};
use crate::model::ConnectionStatus;
use crate::vault::CredentialVault;

pub struct Session {
    pub api: SplunkApi,
    pub created_at: DateTime<Utc>,
}

pub struct SessionManager {
    config: Arc<Config>,
    vault: CredentialVault,
    current: RwLock<Option<Arc<Session>>>,
}

impl SessionManager {
    pub fn new(config: Arc<Config>, vault: CredentialVault) -> Self {
        Self {
            config,
            vault,
            current: RwLock::new(None),
        }
    }

    /// 获取可用会话。并发重建时后写的覆盖先写的, 旧会话随 Arc 引用自然回收。
    pub async fn connect(&self, force: bool) -> Result<Arc<Session>> {
        if !force {
            let cached = self.current.read().unwrap().clone();
            if let Some(session) = cached {
                if session.api.is_alive().await {
                    debug!("reusing cached splunk session");
                    return Ok(session);
                }
                info!("cached session failed liveness probe, reconnecting");
            }
        }

        let fresh = Arc::new(self.establish().await?);
        *self.current.write().unwrap() = Some(fresh.clone());
        Ok(fresh)
    }

    async fn establish(&self) -> Result<Session> {
        let splunk = &self.config.splunk;
        let creds = self.vault.get_credentials(splunk)?;
        let host = resolve_host(&splunk.host, splunk.port).await;
        let base_url = splunk.base_url(&host);
        let timeout = Duration::from_secs(splunk.timeout);
        let retries = splunk.retry_count.max(1);

        let mut last_error = String::new();
        for attempt in 0..retries {
            info!(attempt = attempt + 1, retries, host = %splunk.host, "connecting to splunkd");
            match SplunkApi::login(
                &base_url,
                &creds.username,
                &creds.password,
                timeout,
                splunk.verify_ssl,
            )
            .await
            {
                Ok(api) => {
                    if api.is_alive().await {
                        info!("splunk session established");
                        return Ok(Session { api, created_at: Utc::now() });
                    }
                    last_error = "post-login liveness check failed".to_string();
                    warn!(attempt = attempt + 1, "post-login liveness check failed");
                }
                Err(e) if e.is_auth() => {
                    // 重试错误凭据只会把账号锁死, 立即放弃。
                    return Err(e);
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(attempt = attempt + 1, error = %last_error, "connection attempt failed");
                }
            }
            if attempt + 1 < retries {
                let backoff =
                    Duration::from_millis(splunk.retry_backoff_ms.saturating_mul(1u64 << attempt));
                debug!(backoff_ms = backoff.as_millis() as u64, "backing off before retry");
                tokio::time::sleep(backoff).await;
            }
        }

        Err(SplunkMcpError::ConnectFailed {
            attempts: retries,
            last_error,
        })
    }

    /// 连通性诊断。所有错误折叠进返回值, 不向上抛。
    pub async fn check_connection(&self) -> ConnectionStatus {
        match self.connection_details().await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "connection check failed");
                ConnectionStatus::failed(&e)
            }
        }
    }

    async fn connection_details(&self) -> Result<ConnectionStatus> {
        let session = self.connect(false).await?;
        let server_info = session.api.server_info().await?;
        let mut indexes = session.api.list_indexes().await?;
        indexes.truncate(10);
        Ok(ConnectionStatus::connected(server_info, indexes))
    }

    /// 关闭缓存的会话并注销服务端令牌, 失败只记日志。
    pub async fn close_all(&self) {
        let session = self.current.write().unwrap().take();
        if let Some(session) = session {
            match session.api.logout().await {
                Ok(()) => info!("splunk session closed"),
                Err(e) => warn!(error = %e, "logout failed during shutdown"),
            }
        }
    }
}

/// 主机名解析失败从不致命, 退回配置里的原始名字交给连接层报错。
/// 双栈主机优先取 IPv4; 只有 IPv6 时加方括号, 否则拼不出合法 URL。
async fn resolve_host(host: &str, port: u16) -> String {
    match tokio::net::lookup_host((host, port)).await {
        Ok(addrs) => {
            let addrs: Vec<_> = addrs.collect();
            let resolved = addrs
                .iter()
                .find(|addr| addr.is_ipv4())
                .map(|addr| addr.ip().to_string())
                .or_else(|| addrs.first().map(|addr| format!("[{}]", addr.ip())));
            match resolved {
                Some(ip) => {
                    if ip != host {
                        debug!(host, ip = %ip, "resolved splunk host");
                    }
                    ip
                }
                None => host.to_string(),
            }
        }
        Err(e) => {
            warn!(host, error = %e, "hostname resolution failed, using configured name");
            host.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SplunkConfig;

    #[tokio::test]
    async fn ip_literals_pass_through_resolution() {
        assert_eq!(resolve_host("127.0.0.1", 8089).await, "127.0.0.1");
    }

    #[tokio::test]
    async fn unresolvable_host_falls_back_to_literal() {
        let host = "no-such-host.invalid";
        assert_eq!(resolve_host(host, 8089).await, host);
    }

    #[tokio::test]
    async fn ipv6_literals_are_bracketed_for_urls() {
        assert_eq!(resolve_host("::1", 8089).await, "[::1]");
    }

    #[tokio::test]
    async fn dual_stack_resolution_prefers_ipv4() {
        // localhost 在 /etc/hosts 里同时有 A 和 AAAA 记录。
        assert_eq!(resolve_host("localhost", 8089).await, "127.0.0.1");
    }

    #[tokio::test]
    async fn resolved_hosts_always_form_valid_base_urls() {
        let splunk = SplunkConfig {
            host: "unused".to_string(),
            port: 8089,
            username: "svc".to_string(),
            scheme: "https".to_string(),
            password: None,
            password_encrypted: None,
            password_salt: None,
            machine_hash: None,
            timeout: 5,
            verify_ssl: false,
            retry_count: 1,
            retry_backoff_ms: 10,
        };
        for host in ["127.0.0.1", "::1"] {
            let resolved = resolve_host(host, 8089).await;
            let url = splunk.base_url(&resolved);
            assert!(reqwest::Url::parse(&url).is_ok(), "invalid url: {url}");
        }
    }
}
