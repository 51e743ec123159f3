//! 테스트 전용 도구: binlog 이벤트 빌더와 메모리 내 mock 마스터

use crate::binlog::BinlogParser;
use crate::events::{BinlogEvent, EventType, EVENT_HEADER_SIZE};
use crate::protocol::{self, PacketChannel, COM_QUERY, COM_QUIT};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use uuid::Uuid;

const COM_REGISTER_SLAVE: u8 = 0x15;
const COM_BINLOG_DUMP: u8 = 0x12;
const COM_BINLOG_DUMP_GTID: u8 = 0x1e;

/// 헤더/체크섬을 붙여 이벤트 바이트를 만드는 빌더
#[derive(Debug, Clone)]
pub struct EventBuilder {
    server_id: u32,
    checksum: bool,
}

impl EventBuilder {
    pub fn new(server_id: u32) -> Self {
        EventBuilder {
            server_id,
            checksum: false,
        }
    }

    pub fn with_checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    fn frame(&self, event_type: EventType, timestamp: u32, log_pos: u32, body: &[u8]) -> Bytes {
        let trailer = if self.checksum { 4 } else { 0 };
        let size = EVENT_HEADER_SIZE + body.len() + trailer;

        let mut raw = Vec::with_capacity(size);
        raw.extend_from_slice(&timestamp.to_le_bytes());
        raw.push(event_type.as_u8());
        raw.extend_from_slice(&self.server_id.to_le_bytes());
        raw.extend_from_slice(&(size as u32).to_le_bytes());
        raw.extend_from_slice(&log_pos.to_le_bytes());
        raw.extend_from_slice(&0u16.to_le_bytes());
        raw.extend_from_slice(body);
        // 파서는 CRC 값을 검증하지 않음
        raw.extend(std::iter::repeat(0xcc).take(trailer));
        Bytes::from(raw)
    }

    pub fn format_description(&self, timestamp: u32, log_pos: u32) -> Bytes {
        let mut body = Vec::new();
        body.extend_from_slice(&4u16.to_le_bytes());
        let mut version = b"8.0.34".to_vec();
        version.resize(50, 0);
        body.extend_from_slice(&version);
        body.extend_from_slice(&timestamp.to_le_bytes());
        body.push(EVENT_HEADER_SIZE as u8);
        body.extend_from_slice(&[0u8; 40]);
        body.push(u8::from(self.checksum));

        // 알고리즘 바이트 뒤의 체크섬 자리는 항상 존재
        let mut fde = EventBuilder::new(self.server_id)
            .frame(EventType::FormatDescription, timestamp, log_pos, &body)
            .to_vec();
        fde.extend_from_slice(&[0u8; 4]);
        let size = fde.len() as u32;
        fde[9..13].copy_from_slice(&size.to_le_bytes());
        Bytes::from(fde)
    }

    pub fn rotate(&self, timestamp: u32, log_pos: u32, next_file: &str, position: u64) -> Bytes {
        let mut body = position.to_le_bytes().to_vec();
        body.extend_from_slice(next_file.as_bytes());
        self.frame(EventType::Rotate, timestamp, log_pos, &body)
    }

    pub fn query(&self, timestamp: u32, log_pos: u32, database: &str, sql: &str) -> Bytes {
        let mut body = Vec::new();
        body.extend_from_slice(&9u32.to_le_bytes()); // thread id
        body.extend_from_slice(&0u32.to_le_bytes()); // exec time
        body.push(database.len() as u8);
        body.extend_from_slice(&0u16.to_le_bytes()); // error code
        body.extend_from_slice(&0u16.to_le_bytes()); // status vars
        body.extend_from_slice(database.as_bytes());
        body.push(0);
        body.extend_from_slice(sql.as_bytes());
        self.frame(EventType::Query, timestamp, log_pos, &body)
    }

    pub fn xid(&self, timestamp: u32, log_pos: u32, xid: u64) -> Bytes {
        self.frame(EventType::Xid, timestamp, log_pos, &xid.to_le_bytes())
    }

    /// `meta` 는 table map 에 들어갈 메타데이터 바이트 그대로
    #[allow(clippy::too_many_arguments)]
    pub fn table_map(
        &self,
        timestamp: u32,
        log_pos: u32,
        table_id: u64,
        database: &str,
        table: &str,
        column_types: &[u8],
        meta: &[u8],
    ) -> Bytes {
        let mut body = Vec::new();
        body.extend_from_slice(&table_id.to_le_bytes()[..6]);
        body.extend_from_slice(&1u16.to_le_bytes());
        body.push(database.len() as u8);
        body.extend_from_slice(database.as_bytes());
        body.push(0);
        body.push(table.len() as u8);
        body.extend_from_slice(table.as_bytes());
        body.push(0);
        protocol::write_lenenc_int(&mut body, column_types.len() as u64);
        body.extend_from_slice(column_types);
        protocol::write_lenenc_int(&mut body, meta.len() as u64);
        body.extend_from_slice(meta);
        body.extend(std::iter::repeat(0xff).take((column_types.len() + 7) / 8));
        self.frame(EventType::TableMap, timestamp, log_pos, &body)
    }

    /// v2 rows 이벤트. 모든 컬럼이 present, `images` 는 null bitmap 을 포함한 행 이미지
    pub fn rows(
        &self,
        event_type: EventType,
        timestamp: u32,
        log_pos: u32,
        table_id: u64,
        column_count: usize,
        images: &[Vec<u8>],
    ) -> Bytes {
        let bitmap_len = (column_count + 7) / 8;
        let mut body = Vec::new();
        body.extend_from_slice(&table_id.to_le_bytes()[..6]);
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&2u16.to_le_bytes());
        protocol::write_lenenc_int(&mut body, column_count as u64);
        body.extend(std::iter::repeat(0xff).take(bitmap_len));
        if matches!(event_type, EventType::UpdateRows | EventType::UpdateRowsV1) {
            body.extend(std::iter::repeat(0xff).take(bitmap_len));
        }
        for image in images {
            body.extend_from_slice(image);
        }
        self.frame(event_type, timestamp, log_pos, &body)
    }

    pub fn gtid(&self, timestamp: u32, log_pos: u32, sid: Uuid, gno: i64) -> Bytes {
        let mut body = vec![0x01];
        body.extend_from_slice(sid.as_bytes());
        body.extend_from_slice(&gno.to_le_bytes());
        body.push(2); // logical timestamp type
        body.extend_from_slice(&0i64.to_le_bytes());
        body.extend_from_slice(&1i64.to_le_bytes());
        self.frame(EventType::Gtid, timestamp, log_pos, &body)
    }

    pub fn mariadb_gtid(&self, timestamp: u32, log_pos: u32, domain_id: u32, sequence: u64) -> Bytes {
        let mut body = sequence.to_le_bytes().to_vec();
        body.extend_from_slice(&domain_id.to_le_bytes());
        body.push(0x00);
        body.extend_from_slice(&[0u8; 6]);
        self.frame(EventType::MariadbGtid, timestamp, log_pos, &body)
    }
}

/// 스트리머 테스트용 Xid 이벤트
pub fn sample_event(log_pos: u32) -> BinlogEvent {
    let raw = EventBuilder::new(1).xid(1_700_000_000, log_pos, log_pos as u64);
    BinlogParser::new()
        .parse(raw)
        .expect("sample event must parse")
}

/// 파일 위치를 이어 붙이며 한 binlog 파일 분량의 이벤트를 만드는 도우미
pub struct BinlogFileBuilder {
    builder: EventBuilder,
    position: u32,
    events: Vec<Bytes>,
}

impl BinlogFileBuilder {
    pub fn new(builder: EventBuilder) -> Self {
        BinlogFileBuilder {
            builder,
            position: 4,
            events: Vec::new(),
        }
    }

    /// 덤프 시작 시의 가짜 회전 이벤트. 파일 위치를 차지하지 않음
    pub fn announce(&mut self, file: &str) -> &mut Self {
        // 포맷 설명 이전이므로 체크섬 없이 전송됨
        let plain = EventBuilder {
            checksum: false,
            ..self.builder.clone()
        };
        self.events.push(plain.rotate(0, 0, file, 4));
        self
    }

    /// 다음 이벤트의 끝 위치를 받아 이벤트를 만들고 추가
    pub fn push(&mut self, make: impl Fn(&EventBuilder, u32) -> Bytes) -> &mut Self {
        let probe = make(&self.builder, 0).len() as u32;
        let end = self.position + probe;
        let raw = make(&self.builder, end);
        self.position = end;
        self.events.push(raw);
        self
    }

    pub fn events(&self) -> Vec<Bytes> {
        self.events.clone()
    }
}

/// mock 마스터의 동작 설정
#[derive(Debug, Clone)]
pub struct MockScript {
    pub events: Vec<Bytes>,
    pub semi_sync: bool,
    /// false 면 semi-sync ACK 를 읽지 않음
    pub read_acks: bool,
    pub checksum: &'static str,
    pub ending: MockEnding,
}

#[derive(Debug, Clone)]
pub enum MockEnding {
    /// 클라이언트가 끊을 때까지 연결 유지
    Silent,
    Eof,
    Error(u16, &'static str),
}

impl MockScript {
    pub fn new(events: Vec<Bytes>) -> Self {
        MockScript {
            events,
            semi_sync: false,
            read_acks: true,
            checksum: "NONE",
            ending: MockEnding::Silent,
        }
    }
}

/// mock 마스터가 받은 내용
#[derive(Debug, Default)]
pub struct MockRecord {
    pub queries: Vec<String>,
    pub commands: Vec<Vec<u8>>,
    pub acks: Vec<Vec<u8>>,
    pub connections: usize,
}

/// TcpListener 위에서 핸드셰이크/등록/덤프에 응답하는 mock 마스터
pub struct MockMaster {
    address: String,
    record: Arc<Mutex<MockRecord>>,
    task: JoinHandle<()>,
}

impl MockMaster {
    pub async fn start(script: MockScript) -> MockMaster {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let record = Arc::new(Mutex::new(MockRecord::default()));

        let shared = record.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.lock().connections += 1;
                let script = script.clone();
                let record = shared.clone();
                tokio::spawn(async move {
                    let mut channel = PacketChannel::from_stream(stream);
                    let _ = serve(&mut channel, &script, &record).await;
                });
            }
        });

        MockMaster {
            address,
            record,
            task,
        }
    }

    pub fn host(&self) -> String {
        self.address.rsplit_once(':').map(|(h, _)| h.to_string()).unwrap()
    }

    pub fn port(&self) -> u16 {
        self.address.rsplit_once(':').unwrap().1.parse().unwrap()
    }

    pub fn queries(&self) -> Vec<String> {
        self.record.lock().queries.clone()
    }

    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.record.lock().commands.clone()
    }

    pub fn acks(&self) -> Vec<Vec<u8>> {
        self.record.lock().acks.clone()
    }

    pub fn connections(&self) -> usize {
        self.record.lock().connections
    }
}

impl Drop for MockMaster {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    channel: &mut PacketChannel,
    script: &MockScript,
    record: &Mutex<MockRecord>,
) -> crate::error::Result<()> {
    channel.write_packet(&greeting_packet()).await?;
    let _handshake = channel.read_packet().await?;
    write_ok(channel).await;

    loop {
        channel.reset_sequence();
        let command = channel.read_packet().await?;
        match command.first().copied() {
            Some(COM_QUERY) => {
                let sql = String::from_utf8_lossy(&command[1..]).to_string();
                record.lock().queries.push(sql.clone());
                if sql.contains("BINLOG_CHECKSUM") {
                    write_resultset(channel, &["Variable_name", "Value"], &[vec![
                        Some("binlog_checksum"),
                        Some(script.checksum),
                    ]])
                    .await;
                } else if sql.contains("rpl_semi_sync_master_enabled") {
                    let rows = if script.semi_sync {
                        vec![vec![Some("rpl_semi_sync_master_enabled"), Some("ON")]]
                    } else {
                        Vec::new()
                    };
                    write_resultset(channel, &["Variable_name", "Value"], &rows).await;
                } else {
                    write_ok(channel).await;
                }
            }
            Some(COM_REGISTER_SLAVE) => {
                record.lock().commands.push(command);
                write_ok(channel).await;
            }
            Some(COM_BINLOG_DUMP) | Some(COM_BINLOG_DUMP_GTID) => {
                record.lock().commands.push(command);
                return stream_events(channel, script, record).await;
            }
            Some(COM_QUIT) | None => return Ok(()),
            Some(_) => write_ok(channel).await,
        }
    }
}

async fn stream_events(
    channel: &mut PacketChannel,
    script: &MockScript,
    record: &Mutex<MockRecord>,
) -> crate::error::Result<()> {
    for raw in &script.events {
        let mut packet = vec![0x00];
        if script.semi_sync {
            packet.extend_from_slice(&[0xef, 0x01]);
        }
        packet.extend_from_slice(raw);
        channel.write_packet(&packet).await?;

        if script.semi_sync && script.read_acks {
            channel.reset_sequence();
            let ack = channel.read_packet().await?;
            record.lock().acks.push(ack);
        }
    }

    match script.ending {
        MockEnding::Silent if script.semi_sync && !script.read_acks => {
            // 쌓인 ACK 를 읽지 않고 연결만 유지
            std::future::pending::<()>().await;
            Ok(())
        }
        MockEnding::Silent => {
            // 클라이언트가 연결을 닫을 때까지 대기
            let _ = channel.read_packet().await;
            Ok(())
        }
        MockEnding::Eof => {
            channel.write_packet(&[0xfe, 0, 0, 2, 0]).await?;
            Ok(())
        }
        MockEnding::Error(code, message) => {
            let mut packet = vec![0xff];
            packet.extend_from_slice(&code.to_le_bytes());
            packet.extend_from_slice(b"#HY000");
            packet.extend_from_slice(message.as_bytes());
            channel.write_packet(&packet).await?;
            Ok(())
        }
    }
}

pub fn greeting_packet() -> Vec<u8> {
    let mut packet = vec![10];
    packet.extend_from_slice(b"8.0.34-mock\0");
    packet.extend_from_slice(&7u32.to_le_bytes());
    packet.extend_from_slice(b"abcdefgh");
    packet.push(0);
    packet.extend_from_slice(&0xf7ffu16.to_le_bytes());
    packet.push(45);
    packet.extend_from_slice(&2u16.to_le_bytes());
    packet.extend_from_slice(&0x81bfu16.to_le_bytes());
    packet.push(21);
    packet.extend_from_slice(&[0u8; 10]);
    packet.extend_from_slice(b"ijklmnopqrst\0");
    packet.extend_from_slice(b"mysql_native_password\0");
    packet
}

pub async fn write_ok(channel: &mut PacketChannel) {
    channel
        .write_packet(&[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00])
        .await
        .unwrap();
}

pub async fn write_resultset(
    channel: &mut PacketChannel,
    columns: &[&str],
    rows: &[Vec<Option<&str>>],
) {
    let mut count = Vec::new();
    protocol::write_lenenc_int(&mut count, columns.len() as u64);
    channel.write_packet(&count).await.unwrap();

    for name in columns {
        let mut definition = Vec::new();
        for part in ["def", "", "", "", name, name] {
            protocol::write_lenenc_string(&mut definition, part);
        }
        definition.push(0x0c);
        definition.extend_from_slice(&45u16.to_le_bytes());
        definition.extend_from_slice(&1024u32.to_le_bytes());
        definition.push(0xfd);
        definition.extend_from_slice(&0u16.to_le_bytes());
        definition.push(0);
        definition.extend_from_slice(&[0, 0]);
        channel.write_packet(&definition).await.unwrap();
    }
    channel.write_packet(&[0xfe, 0, 0, 2, 0]).await.unwrap();

    for row in rows {
        let mut packet = Vec::new();
        for cell in row {
            match cell {
                Some(value) => protocol::write_lenenc_string(&mut packet, value),
                None => packet.push(0xfb),
            }
        }
        channel.write_packet(&packet).await.unwrap();
    }
    channel.write_packet(&[0xfe, 0, 0, 2, 0]).await.unwrap();
}
