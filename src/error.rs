//! 복제 클라이언트 에러 타입
//!
//! 스트리머가 마지막 에러를 보관했다가 다시 돌려줘야 하므로
//! 모든 메시지는 `String`으로 저장하고 `Clone`을 유지합니다.

use std::io;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("서버 에러 {code} ({state}): {message}")]
    ServerError {
        code: u16,
        state: String,
        message: String,
    },

    #[error("Binlog 파싱 에러: {0}")]
    BinlogParseError(String),

    #[error("GTID 처리 에러: {0}")]
    GtidError(String),

    #[error("잘못된 형식의 커서: {0}")]
    MalformedCursor(String),

    #[error("유효하지 않은 커서: {0}")]
    InvalidCursor(String),

    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("동기화가 이미 실행 중입니다. 먼저 close 해야 합니다")]
    SyncRunning,

    #[error("이미 닫힌 스트림입니다")]
    AlreadyClosed,

    /// 새 동기화를 시작하면 성공할 수도 있는 에러
    #[error("일시적 에러, 새 동기화로 재시도하세요: {0}")]
    Temporary(Box<ReplicationError>),

    #[error("Timeout 에러")]
    Timeout,

    #[error("작업이 취소되었습니다")]
    Cancelled,

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("백업 에러: {0}")]
    BackupError(String),
}

impl ReplicationError {
    pub fn is_temporary(&self) -> bool {
        matches!(self, ReplicationError::Temporary(_))
    }

    /// 단일 호출의 타임아웃/취소 여부. 스트림 자체의 실패가 아님
    pub fn is_context(&self) -> bool {
        matches!(self, ReplicationError::Timeout | ReplicationError::Cancelled)
    }

    pub fn is_already_closed(&self) -> bool {
        match self {
            ReplicationError::AlreadyClosed => true,
            ReplicationError::Temporary(inner) => inner.is_already_closed(),
            _ => false,
        }
    }
}

impl From<io::Error> for ReplicationError {
    fn from(err: io::Error) -> Self {
        ReplicationError::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReplicationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let closed = ReplicationError::Temporary(Box::new(ReplicationError::AlreadyClosed));
        assert!(closed.is_temporary());
        assert!(closed.is_already_closed());
        assert!(!closed.is_context());

        assert!(ReplicationError::Timeout.is_context());
        assert!(ReplicationError::Cancelled.is_context());
        assert!(!ReplicationError::ConnectionError("x".into()).is_already_closed());
    }

    #[test]
    fn test_from_io_error() {
        let err: ReplicationError = io::Error::new(io::ErrorKind::WriteZero, "short write").into();
        assert!(matches!(err, ReplicationError::IoError(msg) if msg.contains("short write")));
    }
}
