//! 복제 세션 설정

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// 서버 종류. 등록/덤프 명령 인코딩과 GTID 표현이 달라짐
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    #[default]
    Mysql,
    Mariadb,
}

impl Flavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flavor::Mysql => "mysql",
            Flavor::Mariadb => "mariadb",
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flavor {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" => Ok(Flavor::Mysql),
            "mariadb" => Ok(Flavor::Mariadb),
            other => Err(ReplicationError::ConfigError(format!(
                "unknown flavor {:?}, expected mysql or mariadb",
                other
            ))),
        }
    }
}

/// BinlogSyncer 설정
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncerConfig {
    /// 복제 클라이언트의 server id. 마스터 및 다른 복제본과 겹치면 안 됨
    pub server_id: u32,
    pub flavor: Flavor,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub semi_sync_enabled: bool,
    /// COM_REGISTER_SLAVE 에 보고할 호스트/포트
    pub report_host: Option<String>,
    pub report_port: u16,
    #[serde(rename = "heartbeat_period_secs", deserialize_with = "optional_secs")]
    pub heartbeat_period: Option<Duration>,
    #[serde(rename = "read_timeout_secs", deserialize_with = "optional_secs")]
    pub read_timeout: Option<Duration>,
    #[serde(rename = "connect_timeout_secs", deserialize_with = "secs")]
    pub connect_timeout: Duration,
    #[serde(rename = "semi_sync_ack_timeout_secs", deserialize_with = "secs")]
    pub semi_sync_ack_timeout: Duration,
    pub event_queue_capacity: usize,
    /// raw 모드: 헤더와 구조 이벤트만 해석하고 나머지는 원본 바이트만 유지
    pub raw_mode: bool,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        SyncerConfig {
            server_id: 1001,
            flavor: Flavor::Mysql,
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            semi_sync_enabled: false,
            report_host: None,
            report_port: 0,
            heartbeat_period: None,
            read_timeout: None,
            connect_timeout: Duration::from_secs(10),
            semi_sync_ack_timeout: Duration::from_secs(1),
            event_queue_capacity: 10240,
            raw_mode: false,
        }
    }
}

impl SyncerConfig {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        SyncerConfig {
            host: host.into(),
            port,
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SyncerConfig =
            toml::from_str(text).map_err(|e| ReplicationError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_id == 0 {
            return Err(ReplicationError::ConfigError(
                "server_id must be non-zero".to_string(),
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(ReplicationError::ConfigError(
                "event_queue_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Duration::from_secs(u64::deserialize(deserializer)?))
}

fn optional_secs<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs))
}
