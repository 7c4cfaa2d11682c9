use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::transfer::{
    DEFAULT_CHUNK_SIZE, DEFAULT_HASH_THRESHOLD, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE, TransferOptions,
};

pub(crate) trait StorageObject {
    fn pretty_json(&self) -> String;
    fn save_to<P: AsRef<Path>>(&self, path: P)
    where
        Self: Serialize;
    fn read_from<T: Default + DeserializeOwned + Serialize, P: AsRef<Path>>(path: P) -> T;
}

impl<T: Serialize> StorageObject for T {
    fn pretty_json(&self) -> String {
        match serde_json::to_string_pretty(self) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("⚠️ 序列化失败: {}，使用空对象作为回退", e);
                "{}".to_string()
            }
        }
    }
    fn save_to<P: AsRef<Path>>(&self, path: P) {
        if let Err(e) = std::fs::write(path, self.pretty_json()) {
            eprintln!("⚠️ 写入文件失败: {}", e);
        }
    }
    fn read_from<R: Default + DeserializeOwned + Serialize, P: AsRef<Path>>(path: P) -> R {
        let v = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(_) => return R::default(),
        };
        match serde_json::from_str::<R>(&v) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("⚠️ 解析 JSON 失败: {}，返回默认值", e);
                R::default()
            }
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_true() -> bool {
    true
}
fn default_hash_threshold() -> u64 {
    DEFAULT_HASH_THRESHOLD
}
fn default_mtime_tolerance() -> u64 {
    2
}
fn default_file_retry_attempts() -> usize {
    3
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub version: Option<u32>,
    // 空路径表示使用配置目录下的默认位置
    #[serde(default)]
    pub trust_store_path: PathBuf,
    #[serde(default)]
    pub log_dir: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_true")]
    pub resume: bool,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default = "default_hash_threshold")]
    pub hash_threshold_bytes: u64,
    #[serde(default = "default_mtime_tolerance")]
    pub mtime_tolerance_secs: u64,
    #[serde(default = "default_file_retry_attempts")]
    pub file_retry_attempts: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: Some(1),
            trust_store_path: PathBuf::new(),
            log_dir: PathBuf::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            resume: true,
            verify: true,
            hash_threshold_bytes: DEFAULT_HASH_THRESHOLD,
            mtime_tolerance_secs: 2,
            file_retry_attempts: 3,
        }
    }
}

impl Config {
    /// Load `~/.skiff/config.json`, creating the directory and a default file
    /// on first run.
    pub fn init() -> Result<Self> {
        let home = dirs::home_dir().context("cannot find user's home dir")?;
        let storage_dir = home.join(".".to_owned() + env!("CARGO_PKG_NAME"));
        Self::load_from_dir(&storage_dir)
    }

    pub fn load_from_dir(storage_dir: &Path) -> Result<Self> {
        let config_path = storage_dir.join("config.json");
        if !storage_dir.exists() {
            std::fs::create_dir_all(storage_dir)
                .with_context(|| format!("cannot create {}", storage_dir.display()))?;
        }
        if !config_path.exists() {
            let config = Config {
                trust_store_path: storage_dir.join("known_hosts.db"),
                log_dir: storage_dir.join("logs"),
                ..Config::default()
            };
            config.save_to(&config_path);
        }
        let mut config: Config = Config::read_from(&config_path);
        // 旧文件或解析失败回退时补全路径
        if config.trust_store_path.as_os_str().is_empty() {
            config.trust_store_path = storage_dir.join("known_hosts.db");
        }
        if config.log_dir.as_os_str().is_empty() {
            config.log_dir = storage_dir.join("logs");
        }
        Ok(config)
    }

    pub fn failures_log_path(&self) -> PathBuf {
        self.log_dir.join("failures.jsonl")
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            chunk_size: self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE),
            resume: self.resume,
            verify: self.verify,
            hash_threshold_bytes: self.hash_threshold_bytes,
            mtime_tolerance_secs: self.mtime_tolerance_secs,
            file_retry_attempts: self.file_retry_attempts.max(1),
            preserve_mtime: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join(".skiff");
        let c = Config::load_from_dir(&storage).unwrap();
        assert!(storage.join("config.json").exists());
        assert_eq!(c.trust_store_path, storage.join("known_hosts.db"));
        assert_eq!(c.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(c.verify && c.resume);
    }

    #[test]
    fn partial_file_gets_defaults_and_clamps() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"version":1,"chunk_size":10}"#).unwrap();
        let c = Config::load_from_dir(dir.path()).unwrap();
        assert_eq!(c.hash_threshold_bytes, DEFAULT_HASH_THRESHOLD);
        assert_eq!(c.log_dir, dir.path().join("logs"));
        assert_eq!(c.transfer_options().chunk_size, MIN_CHUNK_SIZE);
    }

    #[test]
    fn corrupt_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{not json").unwrap();
        let c = Config::load_from_dir(dir.path()).unwrap();
        assert_eq!(c.file_retry_attempts, 3);
        assert_eq!(c.trust_store_path, dir.path().join("known_hosts.db"));
    }
}
