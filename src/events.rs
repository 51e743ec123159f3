//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 이벤트 헤더 크기 (v4)
pub const EVENT_HEADER_SIZE: usize = 19;

/// MySQL/MariaDB Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트
    Unknown = 0,
    StartV3 = 1,
    /// 쿼리 이벤트 (DDL, BEGIN, statement 기반 DML)
    Query = 2,
    Stop = 3,
    /// 로테이션 이벤트 (다음 binlog 파일)
    Rotate = 4,
    Intvar = 5,
    Rand = 13,
    UserVar = 14,
    /// 모든 binlog 파일의 첫 이벤트
    FormatDescription = 15,
    /// 트랜잭션 커밋
    Xid = 16,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMap = 19,
    WriteRowsV1 = 23,
    UpdateRowsV1 = 24,
    DeleteRowsV1 = 25,
    Incident = 26,
    /// 마스터가 유휴 상태일 때 보내는 heartbeat
    Heartbeat = 27,
    Ignorable = 28,
    /// Rows Query 이벤트 (원본 쿼리)
    RowsQuery = 29,
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRows = 30,
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRows = 31,
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRows = 32,
    /// GTID 이벤트 (Global Transaction ID)
    Gtid = 33,
    /// 익명 GTID 이벤트
    AnonymousGtid = 34,
    PreviousGtids = 35,
    TransactionContext = 36,
    ViewChange = 37,
    XaPrepare = 38,
    PartialUpdateRows = 39,
    /// 트랜잭션 페이로드 이벤트 (압축)
    TransactionPayload = 40,
    HeartbeatV2 = 41,
    MariadbAnnotateRows = 160,
    MariadbBinlogCheckpoint = 161,
    MariadbGtid = 162,
    MariadbGtidList = 163,
    MariadbStartEncryption = 164,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => EventType::StartV3,
            2 => EventType::Query,
            3 => EventType::Stop,
            4 => EventType::Rotate,
            5 => EventType::Intvar,
            13 => EventType::Rand,
            14 => EventType::UserVar,
            15 => EventType::FormatDescription,
            16 => EventType::Xid,
            19 => EventType::TableMap,
            23 => EventType::WriteRowsV1,
            24 => EventType::UpdateRowsV1,
            25 => EventType::DeleteRowsV1,
            26 => EventType::Incident,
            27 => EventType::Heartbeat,
            28 => EventType::Ignorable,
            29 => EventType::RowsQuery,
            30 => EventType::WriteRows,
            31 => EventType::UpdateRows,
            32 => EventType::DeleteRows,
            33 => EventType::Gtid,
            34 => EventType::AnonymousGtid,
            35 => EventType::PreviousGtids,
            36 => EventType::TransactionContext,
            37 => EventType::ViewChange,
            38 => EventType::XaPrepare,
            39 => EventType::PartialUpdateRows,
            40 => EventType::TransactionPayload,
            41 => EventType::HeartbeatV2,
            160 => EventType::MariadbAnnotateRows,
            161 => EventType::MariadbBinlogCheckpoint,
            162 => EventType::MariadbGtid,
            163 => EventType::MariadbGtidList,
            164 => EventType::MariadbStartEncryption,
            _ => EventType::Unknown,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_rows_event(self) -> bool {
        matches!(
            self,
            EventType::WriteRowsV1
                | EventType::UpdateRowsV1
                | EventType::DeleteRowsV1
                | EventType::WriteRows
                | EventType::UpdateRows
                | EventType::DeleteRows
        )
    }
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    /// 이벤트 타입
    pub event_type: EventType,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 헤더를 포함한 이벤트 전체 크기 (바이트)
    pub event_size: u32,
    /// 이 이벤트가 끝나는 위치 (다음 이벤트 위치)
    pub log_pos: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

/// binlog 체크섬 알고리즘
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    #[default]
    Off,
    Crc32,
    /// 5.6.1 이전 서버: 체크섬 개념 없음
    Undefined,
}

impl ChecksumAlgorithm {
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => ChecksumAlgorithm::Off,
            1 => ChecksumAlgorithm::Crc32,
            _ => ChecksumAlgorithm::Undefined,
        }
    }

    /// 이벤트 끝에 붙는 체크섬 길이
    pub fn trailer_len(self) -> usize {
        match self {
            ChecksumAlgorithm::Crc32 => 4,
            _ => 0,
        }
    }
}

/// 포맷 설명 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptionData {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub event_header_length: u8,
    pub checksum_algorithm: ChecksumAlgorithm,
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryEventData {
    /// 스레드 ID
    pub thread_id: u32,
    /// 실행 시간 (초)
    pub exec_time: u32,
    pub error_code: u16,
    /// 데이터베이스명
    pub database: String,
    /// 쿼리 문자열
    pub query: String,
}

/// 컬럼 메타데이터 (테이블 맵에서 타입별로 해석된 값)
pub type ColumnMeta = u16;

/// 테이블 맵 정보 (컬럼 메타데이터)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapData {
    /// 테이블 ID
    pub table_id: u64,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    /// 컬럼 타입들
    pub column_types: Vec<u8>,
    /// 컬럼 메타데이터
    pub column_meta: Vec<ColumnMeta>,
    /// nullable 비트맵
    pub nullable_bitmap: Vec<u8>,
}

/// 셀 값 (다양한 MySQL 타입 지원)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt16(u16),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    /// `YYYY-MM-DD HH:MM:SS[.ffffff]` (0000-00-00 같은 값도 보존)
    DateTime(String),
    Date(String),
    Time(String),
    Year(u16),
    Decimal(String),
}

impl CellValue {
    pub fn as_string(&self) -> Option<String> {
        match self {
            CellValue::String(s)
            | CellValue::DateTime(s)
            | CellValue::Date(s)
            | CellValue::Time(s)
            | CellValue::Decimal(s) => Some(s.clone()),
            CellValue::Int8(i) => Some(i.to_string()),
            CellValue::Int16(i) => Some(i.to_string()),
            CellValue::Int32(i) => Some(i.to_string()),
            CellValue::Int64(i) => Some(i.to_string()),
            CellValue::UInt16(u) => Some(u.to_string()),
            CellValue::UInt64(u) => Some(u.to_string()),
            CellValue::Year(y) => Some(y.to_string()),
            CellValue::Double(d) => Some(d.to_string()),
            CellValue::Float(d) => Some(d.to_string()),
            CellValue::Timestamp(dt) => Some(dt.to_rfc3339()),
            CellValue::Null => Some("NULL".to_string()),
            CellValue::Bytes(_) => None,
        }
    }
}

pub type Row = Vec<CellValue>;

/// WRITE_ROWS 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRowsData {
    /// 테이블 ID
    pub table_id: u64,
    /// 플래그
    pub flags: u16,
    /// 컬럼 개수
    pub column_count: u64,
    /// 사용된 컬럼 비트맵
    pub columns_present: Vec<u8>,
    /// 행 데이터들
    pub rows: Vec<Row>,
}

/// UPDATE_ROWS 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRowsData {
    pub table_id: u64,
    pub flags: u16,
    pub column_count: u64,
    /// 변경 전 이미지에 사용된 컬럼 비트맵
    pub columns_present: Vec<u8>,
    /// 변경 후 이미지에 사용된 컬럼 비트맵
    pub columns_changed: Vec<u8>,
    /// 변경 전후 데이터 쌍들
    pub rows: Vec<(Row, Row)>,
}

/// DELETE_ROWS 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRowsData {
    pub table_id: u64,
    pub flags: u16,
    pub column_count: u64,
    pub columns_present: Vec<u8>,
    pub rows: Vec<Row>,
}

/// MySQL GTID 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidEventData {
    /// GTID 문자열 (format: uuid:sequence-number). 익명 GTID 는 None
    pub gtid: Option<String>,
    /// commit flag (statement 기반 복제 없이 커밋 가능 여부)
    pub committed: bool,
    pub last_committed: Option<i64>,
    pub sequence_number: Option<i64>,
}

/// MariaDB GTID 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MariadbGtidEventData {
    /// domain-server-sequence
    pub gtid: String,
    pub flags: u8,
    /// 단독 트랜잭션(standalone) 여부. 이 경우 XID 없이 쿼리 이벤트로 끝남
    pub standalone: bool,
}

/// Heartbeat 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatData {
    /// 마스터가 현재 쓰고 있는 binlog 파일명
    pub log_ident: String,
}

/// 모든 Binlog 이벤트 페이로드를 포함하는 열거형
///
/// 해석하지 않는 이벤트는 `Raw` 로 남고, 원본 바이트는 `BinlogEvent::raw` 에 있음.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BinlogEventData {
    FormatDescription(FormatDescriptionData),
    Rotate(RotateEventData),
    Query(QueryEventData),
    Xid(u64),
    TableMap(TableMapData),
    WriteRows(WriteRowsData),
    UpdateRows(UpdateRowsData),
    DeleteRows(DeleteRowsData),
    Gtid(GtidEventData),
    MariadbGtid(MariadbGtidEventData),
    RowsQuery(String),
    Heartbeat(HeartbeatData),
    Raw,
}

/// 완성된 Binlog 이벤트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinlogEvent {
    /// 이벤트 헤더
    pub header: EventHeader,
    /// 이벤트 데이터
    pub data: BinlogEventData,
    /// 수신한 그대로의 이벤트 바이트 (헤더 + 본문 + 체크섬)
    #[serde(skip)]
    pub raw: Bytes,
}

impl BinlogEvent {
    pub fn event_type(&self) -> EventType {
        self.header.event_type
    }

    /// 현재 파일만 알려주는 가짜 회전 이벤트 여부
    ///
    /// 덤프 시작 시 마스터가 보내는 회전 이벤트는 타임스탬프와 위치가 0 입니다.
    pub fn is_fake_rotate(&self) -> bool {
        // 둘 중 하나만 0 이어도 가짜로 취급. MariaDB 는 타임스탬프가 0 이 아닌 가짜 회전을 보내기도 함
        matches!(self.data, BinlogEventData::Rotate(_))
            && (self.header.timestamp == 0 || self.header.log_pos == 0)
    }

    pub fn as_rotate(&self) -> Option<&RotateEventData> {
        match &self.data {
            BinlogEventData::Rotate(rotate) => Some(rotate),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_round_trip() {
        for code in [2u8, 4, 15, 16, 19, 27, 30, 31, 32, 33, 162] {
            assert_eq!(EventType::from_u8(code).as_u8(), code);
        }
        assert_eq!(EventType::from_u8(200), EventType::Unknown);
        assert!(EventType::UpdateRowsV1.is_rows_event());
        assert!(!EventType::TableMap.is_rows_event());
    }

    #[test]
    fn test_fake_rotate() {
        let header = EventHeader {
            timestamp: 0,
            event_type: EventType::Rotate,
            server_id: 1,
            event_size: 44,
            log_pos: 0,
            flags: 0x20,
        };
        let event = BinlogEvent {
            header: header.clone(),
            data: BinlogEventData::Rotate(RotateEventData {
                next_binlog_name: "mysql-bin.000001".to_string(),
                position: 4,
            }),
            raw: Bytes::new(),
        };
        assert!(event.is_fake_rotate());

        let real = BinlogEvent {
            header: EventHeader {
                timestamp: 1_700_000_000,
                log_pos: 200,
                ..header
            },
            ..event
        };
        assert!(!real.is_fake_rotate());

        // 타임스탬프가 있어도 위치가 0 이면 가짜 회전
        let stamped = BinlogEvent {
            header: EventHeader {
                timestamp: 1_700_000_000,
                log_pos: 0,
                ..real.header.clone()
            },
            ..real.clone()
        };
        assert!(stamped.is_fake_rotate());
    }

    #[test]
    fn test_cell_value_as_string() {
        assert_eq!(CellValue::Int32(-5).as_string().as_deref(), Some("-5"));
        assert_eq!(CellValue::Decimal("1.50".into()).as_string().as_deref(), Some("1.50"));
        assert_eq!(CellValue::Bytes(vec![1]).as_string(), None);
    }
}
