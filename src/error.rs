use thiserror::Error;

pub type Result<T> = std::result::Result<T, SplunkMcpError>;

#[derive(Debug, Error)]
pub enum SplunkMcpError {
    #[error("配置文件不存在: {0}")]
    ConfigMissing(String),

    #[error("配置错误: {0}")]
    ConfigInvalid(String),

    #[error("凭据与当前机器不匹配: {0}")]
    MachineMismatch(String),

    #[error("凭据解密失败: {0}")]
    DecryptFailed(String),

    #[error("认证失败: {0}")]
    AuthFailed(String),

    #[error("连接失败, 重试 {attempts} 次后放弃: {last_error}")]
    ConnectFailed { attempts: u32, last_error: String },

    #[error("查询超过 {0}s 执行时限")]
    QueryTimeout(u64),

    #[error("splunkd 返回 HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("无效请求: {0}")]
    InvalidRequest(String),

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("HTTP 传输错误: {0}")]
    Http(#[from] reqwest::Error),

    #[error("响应解析失败: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SplunkMcpError {
    /// 连接层的错误在会话重建时可以重试，认证失败不行。
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            SplunkMcpError::AuthFailed(_)
                | SplunkMcpError::HttpStatus { status: 401, .. }
                | SplunkMcpError::HttpStatus { status: 403, .. }
        )
    }
}
