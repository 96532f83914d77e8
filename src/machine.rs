//! machine.rs - 机器指纹
//!
//! 加密凭据和当前主机绑定。指纹 = SHA-256(硬件地址 + 用户名 + home 目录 + 平台标识),
//! 任何一项取不到都退回固定占位串, 保证同一台机器上的结果永远稳定可算。

use sha2::{Digest, Sha256};

/// Short tag stored alongside encrypted credentials so a foreign blob can be
/// rejected before any key derivation happens.
pub const IDENTITY_TAG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineIdentity {
    digest: String,
    tag: String,
}

impl MachineIdentity {
    /// Fingerprint of the machine this process is running on.
    pub fn current() -> Self {
        let mut hasher = Sha256::new();
        hasher.update(hardware_address().as_bytes());
        hasher.update(username().as_bytes());
        hasher.update(home_dir().as_bytes());
        hasher.update(platform().as_bytes());
        Self::from_digest(hex::encode(hasher.finalize()))
    }

    /// Rebuild an identity from a known digest string. Used when a caller
    /// needs to reason about a machine other than the current one.
    pub fn from_digest(digest: String) -> Self {
        let rehashed = Sha256::digest(digest.as_bytes());
        let tag = hex::encode(rehashed)[..IDENTITY_TAG_LEN].to_string();
        Self { digest, tag }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

#[cfg(not(target_os = "windows"))]
fn hardware_address() -> String {
    if let Some(mac) = first_interface_address() {
        return mac;
    }
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(id) = std::fs::read_to_string(path) {
            let id = id.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }
    "unknown-hw".to_string()
}

#[cfg(target_os = "windows")]
fn hardware_address() -> String {
    use std::process::Command;

    Command::new("reg")
        .args([
            "query",
            r"HKEY_LOCAL_MACHINE\SOFTWARE\Microsoft\Cryptography",
            "/v",
            "MachineGuid",
        ])
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .and_then(|text| text.split_whitespace().last().map(str::to_string))
        .unwrap_or_else(|| "unknown-hw".to_string())
}

/// 按接口名排序取第一个非回环网卡的 MAC, 排序是为了多网卡机器上结果稳定。
#[cfg(not(target_os = "windows"))]
fn first_interface_address() -> Option<String> {
    let mut names: Vec<String> = std::fs::read_dir("/sys/class/net")
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .collect();
    names.sort();
    for name in names {
        if let Ok(addr) = std::fs::read_to_string(format!("/sys/class/net/{name}/address")) {
            let addr = addr.trim();
            if !addr.is_empty() && addr != "00:00:00:00:00:00" {
                return Some(addr.to_string());
            }
        }
    }
    None
}

fn username() -> String {
    let candidates = [std::env::var("USER").ok(), std::env::var("USERNAME").ok()];
    first_nonempty(&candidates).unwrap_or_else(|| "default".to_string())
}

fn first_nonempty(candidates: &[Option<String>]) -> Option<String> {
    candidates
        .iter()
        .flatten()
        .find(|value| !value.trim().is_empty())
        .cloned()
}

fn home_dir() -> String {
    dirs::home_dir()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "unknown-home".to_string())
}

fn platform() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}
