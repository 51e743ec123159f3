//! Binlog 복제 위치 (파일명 + 바이트 위치)
//!
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치는 `mysql-bin.000003;4097` 로 직렬화됩니다.

use crate::error::{ReplicationError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// 직렬화 구분자
pub const CURSOR_DELIMITER: char = ';';

/// binlog 파일은 4 바이트 매직 넘버 다음부터 이벤트가 시작됨
pub const FIRST_EVENT_POSITION: u64 = 4;

fn binlog_file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^\s;/\\]+\.[0-9]+$").expect("valid binlog file regex"))
}

/// 불변 복제 커서
///
/// 필드 순서가 곧 정렬 순서입니다: 파일명 사전순, 그 다음 위치 숫자순.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicationCursor {
    file: String,
    position: u64,
}

impl ReplicationCursor {
    /// 파일명을 검증하여 커서 생성. 빈 파일명은 "GTID/미지정 시작"을 의미
    pub fn new(file: impl Into<String>, position: u64) -> Result<Self> {
        let file = file.into();
        if !file.is_empty() && !binlog_file_pattern().is_match(&file) {
            return Err(ReplicationError::InvalidCursor(format!(
                "not a binlog file name: {:?}",
                file
            )));
        }
        Ok(ReplicationCursor { file, position })
    }

    /// 파일의 첫 이벤트 위치를 가리키는 커서
    pub fn start_of(file: impl Into<String>) -> Result<Self> {
        Self::new(file, FIRST_EVENT_POSITION)
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_unspecified(&self) -> bool {
        self.file.is_empty()
    }

    pub fn with_position(&self, position: u64) -> Self {
        ReplicationCursor {
            file: self.file.clone(),
            position,
        }
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.file.rsplit('.').next().and_then(|s| s.parse().ok())
    }

    pub fn compare(&self, other: &ReplicationCursor) -> Ordering {
        self.cmp(other)
    }
}

impl fmt::Display for ReplicationCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.file, CURSOR_DELIMITER, self.position)
    }
}

impl FromStr for ReplicationCursor {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        let (file, position) = s
            .split_once(CURSOR_DELIMITER)
            .ok_or_else(|| ReplicationError::MalformedCursor(format!("missing ';' in {:?}", s)))?;

        let position = position.parse::<u64>().map_err(|e| {
            ReplicationError::InvalidCursor(format!("bad position {:?}: {}", position, e))
        })?;

        ReplicationCursor::new(file, position)
    }
}
