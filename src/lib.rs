//! Splunk 搜索 MCP 服务核心库
//! 机器绑定凭据、会话管理、查询执行、结果摘要各自成模块，协议层只做转发。

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod machine;
pub mod mcp;
pub mod model;
pub mod session;
pub mod summary;
pub mod vault;
