//! MySQL Binlog 이벤트 파서
//!
//! Binlog 파일의 바이너리 형식:
//! 헤더: 4 바이트 매직 넘버 (0xfe 0x62 0x69 0x6e)
//! 각 이벤트:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable)
//!   - Checksum (CRC32 사용 시 4 bytes)
//!
//! 네트워크 스트림과 저장된 파일 모두 같은 디코딩 경로를 사용합니다.

use crate::column::{self, read_bytes, read_lenenc_int, truncated, ByteCursor};
use crate::error::{ReplicationError, Result};
use crate::events::*;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Cursor, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, trace};
use uuid::Uuid;

pub const BINLOG_MAGIC: &[u8] = &[0xfe, 0x62, 0x69, 0x6e]; // ".bin" in ASCII

/// 체크섬 알고리즘 바이트를 포함하는 최초 서버 버전
const CHECKSUM_VERSION: (u32, u32, u32) = (5, 6, 1);

/// 너무 큰 이벤트 길이는 손상된 데이터로 간주 (max_allowed_packet 상한 1GB)
const MAX_EVENT_SIZE: usize = 1 << 30;

/// Binlog 이벤트 파서
///
/// 포맷 설명 이벤트(체크섬 설정)와 테이블 맵을 기억하는 상태 기계입니다.
/// 한 스트림/파일 당 하나의 파서를 사용하고, 재시작은 새 파서로 합니다.
#[derive(Debug, Default)]
pub struct BinlogParser {
    raw_mode: bool,
    format: Option<FormatDescriptionData>,
    checksum: ChecksumAlgorithm,
    tables: HashMap<u64, TableMapData>,
}

impl BinlogParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// raw 모드: 헤더와 Rotate/FormatDescription 만 해석
    pub fn with_raw_mode(raw_mode: bool) -> Self {
        BinlogParser {
            raw_mode,
            ..Self::default()
        }
    }

    pub fn set_raw_mode(&mut self, raw_mode: bool) {
        self.raw_mode = raw_mode;
    }

    pub fn raw_mode(&self) -> bool {
        self.raw_mode
    }

    /// 첫 포맷 설명 이벤트 이전에 사용할 체크섬 알고리즘 지정
    pub fn set_checksum_algorithm(&mut self, checksum: ChecksumAlgorithm) {
        self.checksum = checksum;
    }

    pub fn checksum_algorithm(&self) -> ChecksumAlgorithm {
        self.checksum
    }

    pub fn format_description(&self) -> Option<&FormatDescriptionData> {
        self.format.as_ref()
    }

    pub fn reset(&mut self) {
        self.format = None;
        self.checksum = ChecksumAlgorithm::Off;
        self.tables.clear();
    }

    /// Binlog 파일 헤더 검증
    pub fn verify_magic(data: &[u8]) -> Result<()> {
        if data.len() < BINLOG_MAGIC.len() {
            return Err(ReplicationError::BinlogParseError(
                "Invalid binlog: too short".to_string(),
            ));
        }

        if data[0..4] == BINLOG_MAGIC[..] {
            Ok(())
        } else {
            Err(ReplicationError::BinlogParseError(
                "Invalid binlog magic number".to_string(),
            ))
        }
    }

    /// 이벤트 헤더 파싱
    pub fn parse_header(data: &[u8]) -> Result<EventHeader> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(ReplicationError::BinlogParseError(format!(
                "Invalid event header: {} bytes, need {}",
                data.len(),
                EVENT_HEADER_SIZE
            )));
        }

        let mut cursor = Cursor::new(data);
        let err = truncated("event header");

        Ok(EventHeader {
            timestamp: cursor.read_u32::<LittleEndian>().map_err(&err)?,
            event_type: EventType::from_u8(cursor.read_u8().map_err(&err)?),
            server_id: cursor.read_u32::<LittleEndian>().map_err(&err)?,
            event_size: cursor.read_u32::<LittleEndian>().map_err(&err)?,
            log_pos: cursor.read_u32::<LittleEndian>().map_err(&err)?,
            flags: cursor.read_u16::<LittleEndian>().map_err(&err)?,
        })
    }

    /// 이벤트 하나 (헤더 + 본문 + 체크섬) 파싱
    ///
    /// 프레임 길이와 헤더의 이벤트 크기가 다르면 부분 이벤트를 만들지 않고 실패합니다.
    pub fn parse(&mut self, raw: Bytes) -> Result<BinlogEvent> {
        let header = Self::parse_header(&raw)?;
        if header.event_size as usize != raw.len() {
            return Err(ReplicationError::BinlogParseError(format!(
                "event size mismatch for {:?}: header says {}, frame has {}",
                header.event_type,
                header.event_size,
                raw.len()
            )));
        }

        let data = if header.event_type == EventType::FormatDescription {
            let format = Self::parse_format_description(&raw[EVENT_HEADER_SIZE..])?;
            debug!(
                "Format description: server={}, binlog_version={}, checksum={:?}",
                format.server_version, format.binlog_version, format.checksum_algorithm
            );
            self.checksum = format.checksum_algorithm;
            self.format = Some(format.clone());
            // 새 파일이 시작되면 table id 는 다시 할당됨
            self.tables.clear();
            BinlogEventData::FormatDescription(format)
        } else {
            let trailer = self.checksum.trailer_len();
            if raw.len() < EVENT_HEADER_SIZE + trailer {
                return Err(ReplicationError::BinlogParseError(format!(
                    "event {:?} too short for checksum",
                    header.event_type
                )));
            }
            let body = &raw[EVENT_HEADER_SIZE..raw.len() - trailer];
            self.parse_body(&header, body)?
        };

        trace!(
            "Parsed event type={:?} size={} pos={}",
            header.event_type,
            header.event_size,
            header.log_pos
        );

        Ok(BinlogEvent { header, data, raw })
    }

    fn parse_body(&mut self, header: &EventHeader, body: &[u8]) -> Result<BinlogEventData> {
        // 파일 경계 관리에 필요한 이벤트는 raw 모드에서도 해석
        match header.event_type {
            EventType::Rotate => return Self::parse_rotate_event(body).map(BinlogEventData::Rotate),
            EventType::Heartbeat => {
                return Ok(BinlogEventData::Heartbeat(HeartbeatData {
                    log_ident: String::from_utf8_lossy(body).to_string(),
                }))
            }
            _ if self.raw_mode => return Ok(BinlogEventData::Raw),
            _ => {}
        }

        let data = match header.event_type {
            EventType::Query => BinlogEventData::Query(Self::parse_query_event(body)?),
            EventType::Xid => {
                let mut cursor = Cursor::new(body);
                BinlogEventData::Xid(
                    cursor
                        .read_u64::<LittleEndian>()
                        .map_err(truncated("xid event"))?,
                )
            }
            EventType::TableMap => {
                let table = Self::parse_table_map_event(body)?;
                self.tables.insert(table.table_id, table.clone());
                BinlogEventData::TableMap(table)
            }
            t if t.is_rows_event() => self.parse_rows_event(t, body)?,
            EventType::Gtid | EventType::AnonymousGtid => {
                BinlogEventData::Gtid(Self::parse_gtid_event(header.event_type, body)?)
            }
            EventType::MariadbGtid => {
                BinlogEventData::MariadbGtid(Self::parse_mariadb_gtid_event(header.server_id, body)?)
            }
            EventType::RowsQuery => {
                // 첫 바이트는 길이 (255 에서 잘림), 실제 쿼리는 나머지 전체
                let query = body.get(1..).unwrap_or_default();
                BinlogEventData::RowsQuery(String::from_utf8_lossy(query).to_string())
            }
            EventType::MariadbAnnotateRows => {
                BinlogEventData::RowsQuery(String::from_utf8_lossy(body).to_string())
            }
            _ => BinlogEventData::Raw,
        };

        Ok(data)
    }

    /// FORMAT_DESCRIPTION 이벤트 파싱 (15)
    pub fn parse_format_description(body: &[u8]) -> Result<FormatDescriptionData> {
        let mut cursor = Cursor::new(body);
        let err = truncated("format description event");

        let binlog_version = cursor.read_u16::<LittleEndian>().map_err(&err)?;
        let version_bytes = read_bytes(&mut cursor, 50, "server version")?;
        let server_version = String::from_utf8_lossy(&version_bytes)
            .trim_end_matches('\0')
            .to_string();
        let create_timestamp = cursor.read_u32::<LittleEndian>().map_err(&err)?;
        let event_header_length = cursor.read_u8().map_err(&err)?;

        let checksum_algorithm = if version_at_least(&server_version, CHECKSUM_VERSION) {
            // 본문 끝: 알고리즘 1 byte + 체크섬 4 bytes
            if body.len() < 57 + 5 {
                return Err(ReplicationError::BinlogParseError(
                    "format description event too short for checksum algorithm".to_string(),
                ));
            }
            ChecksumAlgorithm::from_u8(body[body.len() - 5])
        } else {
            ChecksumAlgorithm::Undefined
        };

        Ok(FormatDescriptionData {
            binlog_version,
            server_version,
            create_timestamp,
            event_header_length,
            checksum_algorithm,
        })
    }

    /// ROTATE 이벤트 파싱 (4)
    pub fn parse_rotate_event(data: &[u8]) -> Result<RotateEventData> {
        if data.len() < 8 {
            return Err(ReplicationError::BinlogParseError(
                "Invalid rotate event".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);
        let position = cursor
            .read_u64::<LittleEndian>()
            .map_err(truncated("rotate event"))?;
        let filename = String::from_utf8_lossy(&data[8..]).to_string();

        Ok(RotateEventData {
            next_binlog_name: filename,
            position,
        })
    }

    /// QUERY 이벤트 파싱 (2)
    pub fn parse_query_event(data: &[u8]) -> Result<QueryEventData> {
        if data.len() < 13 {
            return Err(ReplicationError::BinlogParseError(
                "Invalid query event".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);
        let err = truncated("query event");

        let thread_id = cursor.read_u32::<LittleEndian>().map_err(&err)?;
        let exec_time = cursor.read_u32::<LittleEndian>().map_err(&err)?;
        let db_len = cursor.read_u8().map_err(&err)? as usize;
        let error_code = cursor.read_u16::<LittleEndian>().map_err(&err)?;
        let status_len = cursor.read_u16::<LittleEndian>().map_err(&err)? as usize;

        // Status variables skip
        read_bytes(&mut cursor, status_len, "query status variables")?;

        let database = String::from_utf8_lossy(&read_bytes(&mut cursor, db_len, "query database")?)
            .to_string();

        // null terminator skip
        read_bytes(&mut cursor, 1, "query database terminator")?;

        let query = String::from_utf8_lossy(&data[cursor.position() as usize..]).to_string();

        Ok(QueryEventData {
            thread_id,
            exec_time,
            error_code,
            database,
            query,
        })
    }

    /// 테이블 맵 이벤트 파싱 (19)
    pub fn parse_table_map_event(data: &[u8]) -> Result<TableMapData> {
        let mut cursor = Cursor::new(data);
        let err = truncated("table map event");

        let table_id = cursor.read_u48::<LittleEndian>().map_err(&err)?;
        let _flags = cursor.read_u16::<LittleEndian>().map_err(&err)?;

        // 데이터베이스명 (길이 + 이름 + NUL)
        let db_len = cursor.read_u8().map_err(&err)? as usize;
        let database = String::from_utf8_lossy(&read_bytes(&mut cursor, db_len, "schema name")?)
            .to_string();
        read_bytes(&mut cursor, 1, "schema name terminator")?;

        // 테이블명
        let tbl_len = cursor.read_u8().map_err(&err)? as usize;
        let table = String::from_utf8_lossy(&read_bytes(&mut cursor, tbl_len, "table name")?)
            .to_string();
        read_bytes(&mut cursor, 1, "table name terminator")?;

        // 컬럼 개수 + 타입
        let column_count = read_lenenc_int(&mut cursor)? as usize;
        let column_types = read_bytes(&mut cursor, column_count, "column types")?;

        // Metadata
        let metadata_length = read_lenenc_int(&mut cursor)? as usize;
        let metadata = read_bytes(&mut cursor, metadata_length, "column metadata")?;
        let column_meta = column::parse_column_meta(&column_types, &metadata)?;

        // nullable bitmap
        let nullable_bitmap = read_bytes(&mut cursor, (column_count + 7) / 8, "nullable bitmap")?;

        // 이후의 optional metadata (MySQL 8) 는 사용하지 않음
        Ok(TableMapData {
            table_id,
            database,
            table,
            column_types,
            column_meta,
            nullable_bitmap,
        })
    }

    /// WRITE/UPDATE/DELETE_ROWS 이벤트 파싱 (v1: 23-25, v2: 30-32)
    fn parse_rows_event(&self, event_type: EventType, data: &[u8]) -> Result<BinlogEventData> {
        let mut cursor = Cursor::new(data);
        let err = truncated("rows event");

        let table_id = cursor.read_u48::<LittleEndian>().map_err(&err)?;
        let flags = cursor.read_u16::<LittleEndian>().map_err(&err)?;

        let is_v2 = matches!(
            event_type,
            EventType::WriteRows | EventType::UpdateRows | EventType::DeleteRows
        );
        if is_v2 {
            // extra data 길이는 길이 필드 자신(2 bytes)을 포함
            let extra_len = cursor.read_u16::<LittleEndian>().map_err(&err)? as usize;
            read_bytes(&mut cursor, extra_len.saturating_sub(2), "rows extra data")?;
        }

        let column_count = read_lenenc_int(&mut cursor)?;
        let bitmap_len = (column_count as usize + 7) / 8;
        let columns_present = read_bytes(&mut cursor, bitmap_len, "columns present bitmap")?;

        let is_update = matches!(event_type, EventType::UpdateRows | EventType::UpdateRowsV1);
        let columns_changed = if is_update {
            read_bytes(&mut cursor, bitmap_len, "columns changed bitmap")?
        } else {
            Vec::new()
        };

        let Some(table) = self.tables.get(&table_id) else {
            debug!("Rows event for unknown table id {}, keeping raw payload", table_id);
            return Ok(BinlogEventData::Raw);
        };
        if table.column_types.len() as u64 != column_count {
            return Err(ReplicationError::BinlogParseError(format!(
                "rows event column count {} does not match table map {}.{} ({})",
                column_count,
                table.database,
                table.table,
                table.column_types.len()
            )));
        }

        let data = match event_type {
            EventType::WriteRows | EventType::WriteRowsV1 => {
                BinlogEventData::WriteRows(WriteRowsData {
                    table_id,
                    flags,
                    column_count,
                    rows: Self::parse_images(&mut cursor, table, &columns_present)?,
                    columns_present,
                })
            }
            EventType::DeleteRows | EventType::DeleteRowsV1 => {
                BinlogEventData::DeleteRows(DeleteRowsData {
                    table_id,
                    flags,
                    column_count,
                    rows: Self::parse_images(&mut cursor, table, &columns_present)?,
                    columns_present,
                })
            }
            _ => {
                let mut rows = Vec::new();
                while !is_exhausted(&cursor) {
                    let before = column::decode_row(&mut cursor, table, &columns_present)?;
                    let after = column::decode_row(&mut cursor, table, &columns_changed)?;
                    rows.push((before, after));
                }
                BinlogEventData::UpdateRows(UpdateRowsData {
                    table_id,
                    flags,
                    column_count,
                    columns_present,
                    columns_changed,
                    rows,
                })
            }
        };

        Ok(data)
    }

    fn parse_images(cursor: &mut ByteCursor<'_>, table: &TableMapData, present: &[u8]) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while !is_exhausted(cursor) {
            rows.push(column::decode_row(cursor, table, present)?);
        }
        Ok(rows)
    }

    /// GTID 이벤트 파싱 (33, 34)
    pub fn parse_gtid_event(event_type: EventType, data: &[u8]) -> Result<GtidEventData> {
        let mut cursor = Cursor::new(data);
        let err = truncated("GTID event");

        let flags = cursor.read_u8().map_err(&err)?;
        let mut sid = [0u8; 16];
        cursor.read_exact(&mut sid).map_err(&err)?;
        let gno = cursor.read_i64::<LittleEndian>().map_err(&err)?;

        // logical clock (5.7+): type(1) + last_committed(8) + sequence_number(8)
        let (last_committed, sequence_number) = if data.len() >= 42 {
            let _lt_type = cursor.read_u8().map_err(&err)?;
            (
                Some(cursor.read_i64::<LittleEndian>().map_err(&err)?),
                Some(cursor.read_i64::<LittleEndian>().map_err(&err)?),
            )
        } else {
            (None, None)
        };

        let gtid = if event_type == EventType::AnonymousGtid {
            None
        } else {
            Some(format!("{}:{}", Uuid::from_bytes(sid), gno))
        };

        Ok(GtidEventData {
            gtid,
            committed: flags & 0x01 != 0,
            last_committed,
            sequence_number,
        })
    }

    /// MariaDB GTID 이벤트 파싱 (162)
    pub fn parse_mariadb_gtid_event(server_id: u32, data: &[u8]) -> Result<MariadbGtidEventData> {
        let mut cursor = Cursor::new(data);
        let err = truncated("MariaDB GTID event");

        let sequence = cursor.read_u64::<LittleEndian>().map_err(&err)?;
        let domain_id = cursor.read_u32::<LittleEndian>().map_err(&err)?;
        let flags = cursor.read_u8().map_err(&err)?;

        Ok(MariadbGtidEventData {
            gtid: format!("{}-{}-{}", domain_id, server_id, sequence),
            flags,
            standalone: flags & 0x01 != 0,
        })
    }

    /// magic 을 검증한 뒤 reader 의 이벤트를 순서대로 callback 에 전달
    pub fn parse_reader<R, F>(&mut self, mut reader: R, mut on_event: F) -> Result<()>
    where
        R: Read,
        F: FnMut(BinlogEvent) -> Result<()>,
    {
        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|e| ReplicationError::BinlogParseError(format!("cannot read magic: {}", e)))?;
        Self::verify_magic(&magic)?;

        while let Some(raw) = read_event_frame(&mut reader)? {
            on_event(self.parse(raw)?)?;
        }
        Ok(())
    }

    /// 저장된 binlog 파일을 `offset` 부터 재생
    ///
    /// 체크섬 설정을 알기 위해 파일 첫 이벤트(포맷 설명)는 항상 먼저 읽으며,
    /// `offset` 이 그보다 뒤면 포맷 설명 이벤트는 callback 에 전달하지 않습니다.
    pub fn parse_file<P, F>(&mut self, path: P, offset: u64, mut on_event: F) -> Result<()>
    where
        P: AsRef<Path>,
        F: FnMut(BinlogEvent) -> Result<()>,
    {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| ReplicationError::IoError(format!("cannot open {}: {}", path.display(), e)))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|e| ReplicationError::BinlogParseError(format!("cannot read magic: {}", e)))?;
        Self::verify_magic(&magic)?;

        let offset = offset.max(BINLOG_MAGIC.len() as u64);
        let mut position = BINLOG_MAGIC.len() as u64;

        if offset > position {
            if let Some(raw) = read_event_frame(&mut reader)? {
                position += raw.len() as u64;
                let event = self.parse(raw)?;
                if position > offset || event.event_type() != EventType::FormatDescription {
                    return Err(ReplicationError::BinlogParseError(format!(
                        "offset {} is not after the format description event of {}",
                        offset,
                        path.display()
                    )));
                }
            }
            reader.seek(SeekFrom::Start(offset))?;
        }

        while let Some(raw) = read_event_frame(&mut reader)? {
            on_event(self.parse(raw)?)?;
        }
        Ok(())
    }
}

fn is_exhausted(cursor: &ByteCursor<'_>) -> bool {
    cursor.position() as usize >= cursor.get_ref().len()
}

/// 헤더의 이벤트 크기만큼 프레임 하나 읽기. 깨끗한 EOF 면 None
fn read_event_frame<R: Read>(reader: &mut R) -> Result<Option<Bytes>> {
    let mut header = [0u8; EVENT_HEADER_SIZE];
    let mut filled = 0;
    while filled < EVENT_HEADER_SIZE {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(ReplicationError::BinlogParseError(format!(
                    "truncated event header: {} of {} bytes",
                    filled, EVENT_HEADER_SIZE
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let event_size = u32::from_le_bytes([header[9], header[10], header[11], header[12]]) as usize;
    if !(EVENT_HEADER_SIZE..=MAX_EVENT_SIZE).contains(&event_size) {
        return Err(ReplicationError::BinlogParseError(format!(
            "invalid event size {}",
            event_size
        )));
    }

    let mut frame = vec![0u8; event_size];
    frame[..EVENT_HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut frame[EVENT_HEADER_SIZE..]).map_err(|e| {
        ReplicationError::BinlogParseError(format!("truncated event body: {}", e))
    })?;

    Ok(Some(Bytes::from(frame)))
}

/// "5.7.44-log", "10.6.12-MariaDB" 같은 버전 문자열 비교
fn version_at_least(version: &str, minimum: (u32, u32, u32)) -> bool {
    let mut parts = version.split(|c: char| !c.is_ascii_digit()).filter(|s| !s.is_empty());
    let mut next = || parts.next().and_then(|s| s.parse::<u32>().ok()).unwrap_or(0);
    (next(), next(), next()) >= minimum
}
