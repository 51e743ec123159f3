//! 마스터 상태 조회용 일반 MySQL 연결
//!
//! 복제 시작점(현재 binlog 위치, 실행된 GTID 집합)을 얻는 데만 사용합니다.

use crate::config::{Flavor, SyncerConfig};
use crate::cursor::ReplicationCursor;
use crate::error::{ReplicationError, Result};
use crate::gtid::GtidSet;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Row};
use serde::Serialize;
use tracing::debug;

/// 마스터 상태 (`SHOW BINARY LOG STATUS` / `SHOW MASTER STATUS`)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MasterStatus {
    pub cursor: ReplicationCursor,
    pub executed_gtid_set: Option<String>,
}

impl MasterStatus {
    /// 실행된 GTID 집합을 flavor 에 맞게 파싱
    pub fn gtid_set(&self, flavor: Flavor) -> Result<Option<GtidSet>> {
        match self.executed_gtid_set.as_deref() {
            Some(text) if !text.trim().is_empty() => GtidSet::parse(flavor, text).map(Some),
            _ => Ok(None),
        }
    }
}

/// MySQL 연결 래퍼
pub struct MySqlConnection {
    conn: Conn,
    flavor: Flavor,
}

impl MySqlConnection {
    pub async fn connect(config: &SyncerConfig) -> Result<Self> {
        let conn = Conn::new(build_opts(config)).await.map_err(|e| {
            ReplicationError::ConnectionError(format!("Failed to connect to MySQL: {}", e))
        })?;
        debug!("Status connection opened to {}", config.address());

        Ok(MySqlConnection {
            conn,
            flavor: config.flavor,
        })
    }

    /// 현재 binlog 위치와 실행된 GTID 집합
    pub async fn master_status(&mut self) -> Result<MasterStatus> {
        // 8.2 이후는 SHOW BINARY LOG STATUS, 그 이전과 MariaDB 는 SHOW MASTER STATUS
        let rows = match self.query_rows("SHOW BINARY LOG STATUS").await {
            Ok(rows) => rows,
            Err(_) => self.query_rows("SHOW MASTER STATUS").await?,
        };
        let row = rows.into_iter().next().ok_or_else(|| {
            ReplicationError::QueryError("binary logging is not enabled on the master".to_string())
        })?;

        let file: String = column(&row, 0)?.unwrap_or_default();
        let position = column::<String>(&row, 1)?
            .unwrap_or_default()
            .parse::<u64>()
            .map_err(|e| ReplicationError::QueryError(format!("invalid binlog position: {}", e)))?;

        let executed_gtid_set = match self.flavor {
            Flavor::Mysql if row.len() > 4 => column::<String>(&row, 4)?,
            Flavor::Mysql => None,
            Flavor::Mariadb => self.get_variable_value("SELECT @@GLOBAL.gtid_current_pos").await?,
        };

        Ok(MasterStatus {
            cursor: ReplicationCursor::new(file, position)?,
            executed_gtid_set: executed_gtid_set.map(|set| set.replace('\n', "")),
        })
    }

    /// 전역 변수 조회
    pub async fn get_variable(&mut self, name: &str) -> Result<Option<String>> {
        let rows = self
            .query_rows(&format!("SHOW GLOBAL VARIABLES LIKE '{}'", name))
            .await?;
        match rows.first() {
            Some(row) => column(row, 1),
            None => Ok(None),
        }
    }

    /// Binlog 형식 확인 (ROW, STATEMENT, MIXED)
    pub async fn get_binlog_format(&mut self) -> Result<String> {
        self.get_variable("binlog_format")
            .await?
            .ok_or_else(|| ReplicationError::QueryError("Binlog format not found".to_string()))
    }

    pub async fn close(self) -> Result<()> {
        self.conn
            .disconnect()
            .await
            .map_err(|e| ReplicationError::ConnectionError(format!("Failed to disconnect: {}", e)))
    }

    async fn get_variable_value(&mut self, query: &str) -> Result<Option<String>> {
        let rows = self.query_rows(query).await?;
        match rows.first() {
            Some(row) => column(row, 0),
            None => Ok(None),
        }
    }

    async fn query_rows(&mut self, query: &str) -> Result<Vec<Row>> {
        self.conn
            .query::<Row, _>(query)
            .await
            .map_err(|e| ReplicationError::QueryError(format!("{} failed: {}", query, e)))
    }
}

fn build_opts(config: &SyncerConfig) -> Opts {
    OptsBuilder::default()
        .ip_or_hostname(config.host.clone())
        .tcp_port(config.port)
        .user(Some(config.user.clone()))
        .pass(Some(config.password.clone()))
        .into()
}

/// 텍스트 프로토콜 값을 문자열로. NULL 이면 None
fn column<T: FromValue>(row: &Row, index: usize) -> Result<Option<T>> {
    match row.get_opt::<Option<T>, _>(index) {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(ReplicationError::QueryError(format!(
            "cannot convert column {}: {}",
            index, e
        ))),
        None => Ok(None),
    }
}
