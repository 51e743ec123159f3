//! MySQL 프로토콜 패킷 처리
//!
//! 패킷 = 3 bytes 길이 (LE) + 1 byte 시퀀스 + 본문.
//! 0xFFFFFF 길이의 패킷은 다음 패킷과 이어 붙여 하나의 payload 가 됩니다.

use crate::error::{ReplicationError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, ErrorKind, Read};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

pub const MAX_PACKET_SIZE: usize = 0xFF_FFFF;

pub const OK_HEADER: u8 = 0x00;
pub const ERR_HEADER: u8 = 0xFF;
pub const EOF_HEADER: u8 = 0xFE;
pub const LOCAL_INFILE_HEADER: u8 = 0xFB;

/// Command 코드
pub const COM_QUIT: u8 = 0x01;
pub const COM_QUERY: u8 = 0x03;
pub const COM_PING: u8 = 0x0e;

/// MySQL 패킷 채널
pub struct PacketChannel {
    stream: BufReader<TcpStream>,
    sequence: u8,
}

impl PacketChannel {
    /// 새 패킷 채널 생성 (TCP 연결)
    pub async fn connect(address: &str, connect_timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                ReplicationError::ConnectionError(format!(
                    "Timed out connecting to {} after {:?}",
                    address, connect_timeout
                ))
            })?
            .map_err(|e| {
                ReplicationError::ConnectionError(format!("Failed to connect to {}: {}", address, e))
            })?;
        stream.set_nodelay(true)?;

        debug!("Connected to MySQL at {}", address);

        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        PacketChannel {
            stream: BufReader::with_capacity(64 * 1024, stream),
            sequence: 0,
        }
    }

    /// 새 command 를 보내기 전에 호출
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// 패킷 읽기 (여러 물리 패킷으로 나뉜 payload 는 합쳐서 반환)
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let length = self.read_frame(&mut payload).await?;
            if length < MAX_PACKET_SIZE {
                return Ok(payload);
            }
        }
    }

    async fn read_frame(&mut self, payload: &mut Vec<u8>) -> Result<usize> {
        // 모듈 범위의 byteorder::ReadBytesExt 와 Cursor 에서 겹치지 않도록 여기서만 가져옴
        use tokio::io::AsyncReadExt;

        // 패킷 헤더 읽기 (3 bytes length + 1 byte sequence)
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await.map_err(|e| {
            ReplicationError::ConnectionError(format!("Failed to read packet header: {}", e))
        })?;
        let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let sequence = header[3];

        // semi-sync ACK 이후 서버 시퀀스가 이어지지 않을 수 있어 받은 값을 따름
        if sequence != self.sequence {
            trace!("packet sequence {} (expected {})", sequence, self.sequence);
        }
        self.sequence = sequence.wrapping_add(1);

        // 패킷 본문 읽기
        let start = payload.len();
        payload.resize(start + length, 0);
        self.stream
            .read_exact(&mut payload[start..])
            .await
            .map_err(|e| {
                ReplicationError::ConnectionError(format!("Failed to read packet body: {}", e))
            })?;

        trace!("read packet seq={} len={}", sequence, length);
        Ok(length)
    }

    /// 패킷 쓰기. 현재 시퀀스 번호를 이어서 사용
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let buffer = self.frame(data);

        let stream = self.stream.get_mut();
        stream.write_all(&buffer).await.map_err(|e| {
            ReplicationError::ConnectionError(format!("Failed to write packet: {}", e))
        })?;
        stream
            .flush()
            .await
            .map_err(|e| ReplicationError::ConnectionError(format!("Failed to flush: {}", e)))?;

        Ok(())
    }

    /// 제한 시간 안에 패킷 쓰기
    ///
    /// 실패하면 그때까지 쓴 바이트 수를 함께 돌려줍니다. 0 이면 패킷 경계가
    /// 그대로라 연결을 계속 쓸 수 있고, 0 보다 크면 프레임이 중간에 끊긴 것입니다.
    pub async fn write_packet_within(
        &mut self,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<(), WriteFailure> {
        let buffer = self.frame(data);
        let deadline = Instant::now() + timeout;
        let stream = self.stream.get_mut();

        let mut written = 0;
        while written < buffer.len() {
            match tokio::time::timeout_at(deadline, stream.writable()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(WriteFailure::new(written, format!("socket not writable: {}", e)))
                }
                Err(_) => {
                    return Err(WriteFailure {
                        written,
                        error: ReplicationError::Timeout,
                    })
                }
            }

            match stream.try_write(&buffer[written..]) {
                Ok(0) => return Err(WriteFailure::new(written, "connection wrote zero bytes".into())),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => {
                    return Err(WriteFailure::new(written, format!("Failed to write packet: {}", e)))
                }
            }
        }

        trace!("wrote packet len={} within {:?}", data.len(), timeout);
        Ok(())
    }

    // 헤더를 붙여 최대 길이 단위로 나눔. 정확히 최대 길이로 끝나면 빈 패킷으로 마무리
    fn frame(&mut self, data: &[u8]) -> Vec<u8> {
        let mut chunks = data.chunks(MAX_PACKET_SIZE);
        let mut buffer = Vec::with_capacity(data.len() + 4);
        loop {
            let chunk = chunks.next().unwrap_or_default();
            let length = chunk.len() as u32;
            buffer.extend_from_slice(&length.to_le_bytes()[..3]);
            buffer.push(self.sequence);
            buffer.extend_from_slice(chunk);
            self.sequence = self.sequence.wrapping_add(1);
            if chunk.len() < MAX_PACKET_SIZE {
                break;
            }
        }
        buffer
    }

    /// command 패킷 전송 (시퀀스 0 부터)
    pub async fn write_command(&mut self, command: u8, arguments: &[u8]) -> Result<()> {
        let mut data = Vec::with_capacity(arguments.len() + 1);
        data.push(command);
        data.extend_from_slice(arguments);
        self.reset_sequence();
        self.write_packet(&data).await
    }

    /// OK 를 기대하는 응답 읽기
    pub async fn read_ok(&mut self) -> Result<()> {
        let packet = self.read_packet().await?;
        match packet.first() {
            Some(&OK_HEADER) => Ok(()),
            Some(&ERR_HEADER) => Err(parse_error_packet(&packet)),
            _ => Err(ReplicationError::ProtocolError(format!(
                "expected OK packet, got header {:?}",
                packet.first()
            ))),
        }
    }

    /// COM_QUERY 텍스트 프로토콜 실행
    pub async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        debug!("query: {}", sql);
        self.write_command(COM_QUERY, sql.as_bytes()).await?;

        let packet = self.read_packet().await?;
        match packet.first() {
            Some(&OK_HEADER) => return Ok(QueryResult::default()),
            Some(&ERR_HEADER) => return Err(parse_error_packet(&packet)),
            Some(&LOCAL_INFILE_HEADER) | None => {
                return Err(ReplicationError::ProtocolError(
                    "unexpected query response".to_string(),
                ))
            }
            _ => {}
        }

        let column_count = read_lenenc_int(&mut Cursor::new(&packet[..]))? as usize;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let definition = self.read_packet().await?;
            columns.push(parse_column_name(&definition)?);
        }
        self.read_eof().await?;

        let mut rows = Vec::new();
        loop {
            let packet = self.read_packet().await?;
            if is_eof_packet(&packet) {
                break;
            }
            if is_error_packet(&packet) {
                return Err(parse_error_packet(&packet));
            }
            let mut cursor = Cursor::new(&packet[..]);
            let mut row = Vec::with_capacity(column_count);
            for _ in 0..column_count {
                row.push(read_lenenc_string(&mut cursor)?);
            }
            rows.push(row);
        }

        Ok(QueryResult { columns, rows })
    }

    /// 결과를 사용하지 않는 문장 실행 (SET 등)
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        self.query(sql).await.map(|_| ())
    }

    async fn read_eof(&mut self) -> Result<()> {
        let packet = self.read_packet().await?;
        if is_eof_packet(&packet) {
            Ok(())
        } else if is_error_packet(&packet) {
            Err(parse_error_packet(&packet))
        } else {
            Err(ReplicationError::ProtocolError(
                "expected EOF packet after column definitions".to_string(),
            ))
        }
    }

    pub async fn shutdown(&mut self) {
        let stream = self.stream.get_mut();
        let _ = stream.shutdown().await;
    }
}

/// `write_packet_within` 실패
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailure {
    /// 실패 전까지 소켓에 넘어간 바이트 수
    pub written: usize,
    pub error: ReplicationError,
}

impl WriteFailure {
    fn new(written: usize, message: String) -> Self {
        WriteFailure {
            written,
            error: ReplicationError::ConnectionError(message),
        }
    }

    /// 프레임 일부만 전송되어 더 이상 패킷 경계를 믿을 수 없음
    pub fn is_torn(&self) -> bool {
        self.written > 0
    }
}

/// 텍스트 결과셋. 셀은 NULL 이면 None
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    /// 첫 행의 지정 컬럼 값
    pub fn first_value(&self, column: usize) -> Option<&str> {
        self.rows.first()?.get(column)?.as_deref()
    }
}

/// Greeting 패킷 파싱
#[derive(Debug, Clone)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin_name: String,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if is_error_packet(data) {
            return Err(parse_error_packet(data));
        }

        let mut cursor = Cursor::new(data);
        let err = |what: &'static str| {
            move |e: std::io::Error| {
                ReplicationError::ProtocolError(format!("Failed to read {}: {}", what, e))
            }
        };

        let protocol_version = cursor.read_u8().map_err(err("protocol version"))?;
        if protocol_version != 10 {
            return Err(ReplicationError::ProtocolError(format!(
                "unsupported protocol version {}",
                protocol_version
            )));
        }

        let server_version = read_null_terminated_string(&mut cursor)?;
        let thread_id = cursor.read_u32::<LittleEndian>().map_err(err("thread ID"))?;

        // Auth plugin data part 1 (8 bytes)
        let mut scramble = vec![0u8; 8];
        cursor.read_exact(&mut scramble).map_err(err("scramble part 1"))?;

        // Filler (1 byte, always 0x00)
        cursor.read_u8().map_err(err("filler"))?;

        let capabilities_lower = cursor.read_u16::<LittleEndian>().map_err(err("capabilities"))?;
        let server_collation = cursor.read_u8().map_err(err("collation"))?;
        let server_status = cursor.read_u16::<LittleEndian>().map_err(err("status"))?;
        let capabilities_upper = cursor
            .read_u16::<LittleEndian>()
            .map_err(err("capabilities upper"))?;
        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        let auth_data_len = cursor.read_u8().map_err(err("auth data length"))?;

        // Reserved (10 bytes)
        let mut reserved = [0u8; 10];
        cursor.read_exact(&mut reserved).map_err(err("reserved"))?;

        // Auth plugin data part 2 (최소 13 bytes, 마지막 NUL 제외)
        let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut part2 = vec![0u8; part2_len];
        cursor.read_exact(&mut part2).map_err(err("scramble part 2"))?;
        scramble.extend_from_slice(&part2[..part2_len - 1]);

        let auth_plugin_name = if (cursor.position() as usize) < data.len() {
            read_null_terminated_string(&mut cursor)?
        } else {
            "mysql_native_password".to_string()
        };

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin_name,
        })
    }
}

/// ERR 패킷 → ServerError
pub fn parse_error_packet(data: &[u8]) -> ReplicationError {
    if data.len() < 3 {
        return ReplicationError::ProtocolError("truncated ERR packet".to_string());
    }
    let code = u16::from_le_bytes([data[1], data[2]]);
    let (state, message) = if data.len() >= 9 && data[3] == b'#' {
        (
            String::from_utf8_lossy(&data[4..9]).to_string(),
            String::from_utf8_lossy(&data[9..]).to_string(),
        )
    } else {
        (String::new(), String::from_utf8_lossy(&data[3..]).to_string())
    };

    ReplicationError::ServerError {
        code,
        state,
        message,
    }
}

/// 컬럼 정의 패킷에서 이름만 추출
fn parse_column_name(data: &[u8]) -> Result<String> {
    let mut cursor = Cursor::new(data);
    // catalog, schema, table, org_table, name
    for _ in 0..4 {
        read_lenenc_string(&mut cursor)?;
    }
    Ok(read_lenenc_string(&mut cursor)?.unwrap_or_default())
}

pub fn read_lenenc_int(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let err = |e: std::io::Error| {
        ReplicationError::ProtocolError(format!("truncated length-encoded integer: {}", e))
    };
    let first = cursor.read_u8().map_err(err)?;
    match first {
        0xfc => cursor.read_u16::<LittleEndian>().map(u64::from).map_err(err),
        0xfd => cursor.read_u24::<LittleEndian>().map(u64::from).map_err(err),
        0xfe => cursor.read_u64::<LittleEndian>().map_err(err),
        0xfb | 0xff => Err(ReplicationError::ProtocolError(format!(
            "unexpected length-encoded integer prefix 0x{:02x}",
            first
        ))),
        n => Ok(n as u64),
    }
}

/// 길이 인코딩 문자열. 0xFB 는 NULL
pub fn read_lenenc_string(cursor: &mut Cursor<&[u8]>) -> Result<Option<String>> {
    let data = *cursor.get_ref();
    let position = cursor.position() as usize;
    if data.get(position) == Some(&0xfb) {
        cursor.set_position(position as u64 + 1);
        return Ok(None);
    }

    let len = read_lenenc_int(cursor)? as usize;
    let start = cursor.position() as usize;
    let bytes = data.get(start..start + len).ok_or_else(|| {
        ReplicationError::ProtocolError("truncated length-encoded string".to_string())
    })?;
    cursor.set_position((start + len) as u64);
    Ok(Some(String::from_utf8_lossy(bytes).to_string()))
}

pub fn write_lenenc_int(buffer: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfa => buffer.push(value as u8),
        0xfb..=0xffff => {
            buffer.push(0xfc);
            buffer.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xff_ffff => {
            buffer.push(0xfd);
            buffer.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
        }
        _ => {
            buffer.push(0xfe);
            buffer.extend_from_slice(&value.to_le_bytes());
        }
    }
}

pub fn write_lenenc_string(buffer: &mut Vec<u8>, value: &str) {
    write_lenenc_int(buffer, value.len() as u64);
    buffer.extend_from_slice(value.as_bytes());
}

/// null로 끝나는 문자열 읽기
fn read_null_terminated_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = cursor.read_u8().map_err(|e| {
            ReplicationError::ProtocolError(format!("Failed to read string byte: {}", e))
        })?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes)
        .map_err(|e| ReplicationError::ProtocolError(format!("Invalid UTF-8 in string: {}", e)))
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == ERR_HEADER
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == OK_HEADER
}

/// EOF 패킷 확인. 0xFE 로 시작하는 긴 패킷은 데이터임
pub fn is_eof_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == EOF_HEADER && data.len() < 9
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_is_error_packet() {
        assert!(is_error_packet(&[0xFF, 0x01, 0x02]));
        assert!(!is_error_packet(&[0x00, 0x01, 0x02]));
    }

    #[test]
    fn test_is_ok_packet() {
        assert!(is_ok_packet(&[0x00, 0x01, 0x02]));
        assert!(!is_ok_packet(&[0xFF, 0x01, 0x02]));
    }

    #[test]
    fn test_is_eof_packet() {
        assert!(is_eof_packet(&[0xFE, 0, 0, 2, 0]));
        assert!(!is_eof_packet(&[0xFE, 0, 0, 0, 0, 0, 0, 0, 0, 0]));
    }

    #[test]
    fn test_parse_error_packet() {
        let mut packet = vec![0xFF];
        packet.extend_from_slice(&1236u16.to_le_bytes());
        packet.extend_from_slice(b"#HY000Could not find first log file name");

        assert_eq!(
            parse_error_packet(&packet),
            ReplicationError::ServerError {
                code: 1236,
                state: "HY000".to_string(),
                message: "Could not find first log file name".to_string(),
            }
        );
    }

    #[test]
    fn test_lenenc_roundtrip_boundaries() {
        for value in [0u64, 250, 251, 65_535, 65_536, 16_777_215, 16_777_216] {
            let mut buffer = Vec::new();
            write_lenenc_int(&mut buffer, value);
            assert_eq!(read_lenenc_int(&mut Cursor::new(&buffer[..])).unwrap(), value);
        }
    }

    #[test]
    fn test_read_lenenc_string_null() {
        let data = [0xfb, 3, b'a', b'b', b'c'];
        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(read_lenenc_string(&mut cursor).unwrap(), None);
        assert_eq!(read_lenenc_string(&mut cursor).unwrap(), Some("abc".to_string()));
    }

    #[test]
    fn test_parse_greeting() {
        let greeting = crate::test_util::greeting_packet();
        let parsed = GreetingPacket::parse(&greeting).unwrap();
        assert_eq!(parsed.protocol_version, 10);
        assert_eq!(parsed.server_version, "8.0.34-mock");
        assert_eq!(parsed.scramble.len(), 20);
        assert_eq!(parsed.auth_plugin_name, "mysql_native_password");
    }

    #[tokio::test]
    async fn test_query_text_resultset() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = PacketChannel::from_stream(stream);
            let command = channel.read_packet().await.unwrap();
            assert_eq!(command[0], COM_QUERY);
            crate::test_util::write_resultset(
                &mut channel,
                &["Variable_name", "Value"],
                &[vec![Some("binlog_checksum"), Some("CRC32")]],
            )
            .await;
        });

        let mut channel = PacketChannel::connect(&address, Duration::from_secs(1))
            .await
            .unwrap();
        let result = channel
            .query("SHOW GLOBAL VARIABLES LIKE 'BINLOG_CHECKSUM'")
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["Variable_name", "Value"]);
        assert_eq!(result.first_value(1), Some("CRC32"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_within_timeout_leaves_frame_untouched() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let mut channel = PacketChannel::connect(&address, Duration::from_secs(1))
            .await
            .unwrap();
        // 상대가 읽지 않으므로 송신 버퍼를 가득 채울 수 있음
        let (_peer, _) = listener.accept().await.unwrap();
        let filler = vec![0u8; 64 * 1024];
        loop {
            match channel.stream.get_mut().try_write(&filler) {
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("unexpected write error: {}", e),
            }
        }

        let failure = channel
            .write_packet_within(&[0xef, 4, 0, 0, 0, 0, 0, 0, 0], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(failure.error, ReplicationError::Timeout);
        assert_eq!(failure.written, 0);
        assert!(!failure.is_torn());
    }

    #[tokio::test]
    async fn test_write_within_delivers_packet() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = PacketChannel::from_stream(stream);
            channel.read_packet().await.unwrap()
        });

        let mut channel = PacketChannel::connect(&address, Duration::from_secs(1))
            .await
            .unwrap();
        channel
            .write_packet_within(b"\xefhello", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(server.await.unwrap(), b"\xefhello".to_vec());
    }
}
