//! MySQL / MariaDB binlog 복제 클라이언트
//!
//! 복제본(slave)으로 마스터에 등록하여 바이너리 로그 이벤트를 받아옵니다.
//! 주요 기능:
//! - 파일/위치 또는 GTID 집합 기반 덤프 요청
//! - Binlog 이벤트 파싱 (네트워크 스트림, 로컬 파일)
//! - 이벤트 큐(streamer)를 통한 생산자/소비자 분리
//! - semi-sync ACK 응답
//! - 수신한 binlog 를 원본 그대로 파일로 백업

pub mod auth;
pub mod backup;
pub mod binlog;
pub mod column;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod events;
pub mod gtid;
pub mod protocol;
pub mod streamer;
pub mod syncer;

#[cfg(test)]
mod test_util;

pub use backup::{BackupSummary, BackupWriter};
pub use binlog::BinlogParser;
pub use config::{Flavor, SyncerConfig};
pub use connection::{MasterStatus, MySqlConnection};
pub use cursor::ReplicationCursor;
pub use error::{ReplicationError, Result};
pub use events::{BinlogEvent, BinlogEventData, EventType};
pub use gtid::GtidSet;
pub use streamer::{BinlogStreamer, StreamerHandle};
pub use syncer::BinlogSyncer;
