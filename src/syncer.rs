//! MySQL Binlog 동기화 클라이언트
//!
//! 복제본으로 마스터에 접속해 등록(COM_REGISTER_SLAVE)한 뒤 덤프 요청을 보내고,
//! 백그라운드 task 하나가 소켓에서 이벤트를 읽어 파싱한 결과를
//! `BinlogStreamer` 로 전달합니다.

use crate::auth;
use crate::backup::{BackupSummary, BackupWriter};
use crate::binlog::BinlogParser;
use crate::config::{Flavor, SyncerConfig};
use crate::cursor::{ReplicationCursor, FIRST_EVENT_POSITION};
use crate::error::{ReplicationError, Result};
use crate::events::{BinlogEvent, BinlogEventData};
use crate::gtid::GtidSet;
use crate::protocol::{self, GreetingPacket, PacketChannel, EOF_HEADER, ERR_HEADER, OK_HEADER};
use crate::streamer::{BinlogStreamer, StreamerHandle};
use byteorder::{LittleEndian, WriteBytesExt};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// COM_REGISTER_SLAVE 명령어 코드
const COM_REGISTER_SLAVE: u8 = 0x15;

/// COM_BINLOG_DUMP 명령어 코드
const COM_BINLOG_DUMP: u8 = 0x12;

/// COM_BINLOG_DUMP_GTID 명령어 코드
const COM_BINLOG_DUMP_GTID: u8 = 0x1e;

const BINLOG_THROUGH_GTID: u16 = 0x04;

/// semi-sync 이벤트/ACK 패킷 표시 바이트
const SEMI_SYNC_INDICATOR: u8 = 0xef;

/// MariaDB 5.5 이후 이벤트(GTID, annotate rows)를 받기 위한 capability
const MARIADB_SLAVE_CAPABILITY_GTID: u8 = 4;

/// 백업 타임아웃 0 은 사실상 무제한
const UNBOUNDED_BACKUP_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// 덤프 요청 시작점
#[derive(Debug, Clone)]
enum DumpRequest {
    Position(ReplicationCursor),
    Gtid(GtidSet),
}

/// 세션 진행 상황. 읽기 task 가 갱신하고 `position()` 등으로 조회
#[derive(Debug, Default)]
struct Progress {
    cursor: ReplicationCursor,
    gtid_set: Option<GtidSet>,
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Binlog 동기화 클라이언트
pub struct BinlogSyncer {
    config: SyncerConfig,
    progress: Arc<Mutex<Progress>>,
    session: Option<Session>,
    closed: bool,
}

impl BinlogSyncer {
    pub fn new(config: SyncerConfig) -> Result<Self> {
        config.validate()?;
        Ok(BinlogSyncer {
            config,
            progress: Arc::new(Mutex::new(Progress::default())),
            session: None,
            closed: false,
        })
    }

    pub fn config(&self) -> &SyncerConfig {
        &self.config
    }

    /// 마지막으로 받은 이벤트 다음 위치
    pub fn position(&self) -> ReplicationCursor {
        self.progress.lock().cursor.clone()
    }

    /// GTID 세션에서 지금까지 커밋된 트랜잭션 집합
    pub fn gtid_set(&self) -> Option<GtidSet> {
        self.progress.lock().gtid_set.clone()
    }

    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .map_or(false, |session| !session.task.is_finished())
    }

    /// 파일/위치부터 동기화 시작
    pub async fn start_sync(&mut self, cursor: ReplicationCursor) -> Result<BinlogStreamer> {
        info!("Starting binlog sync from {}", cursor);
        let raw_mode = self.config.raw_mode;
        self.start(DumpRequest::Position(cursor), raw_mode).await
    }

    /// GTID 집합부터 동기화 시작
    pub async fn start_sync_gtid(&mut self, gtid_set: GtidSet) -> Result<BinlogStreamer> {
        if gtid_set.flavor() != self.config.flavor {
            return Err(ReplicationError::ConfigError(format!(
                "GTID set flavor {} does not match syncer flavor {}",
                gtid_set.flavor(),
                self.config.flavor
            )));
        }
        info!("Starting binlog sync from GTID set {}", gtid_set);
        let raw_mode = self.config.raw_mode;
        self.start(DumpRequest::Gtid(gtid_set), raw_mode).await
    }

    /// raw 모드로 동기화하며 `dir` 에 binlog 파일을 그대로 백업
    ///
    /// 백업이 끝나면 세션은 정리하지만 syncer 는 닫지 않습니다.
    pub async fn start_backup(
        &mut self,
        dir: impl AsRef<Path>,
        cursor: ReplicationCursor,
        timeout: Duration,
    ) -> Result<BackupSummary> {
        let timeout = if timeout.is_zero() {
            UNBOUNDED_BACKUP_TIMEOUT
        } else {
            timeout
        };

        info!("Starting binlog backup from {} into {}", cursor, dir.as_ref().display());
        let mut streamer = self.start(DumpRequest::Position(cursor), true).await?;
        let mut writer = BackupWriter::new(dir.as_ref(), timeout);
        let result = writer.run(&mut streamer).await;
        self.stop_session().await;

        match &result {
            Ok(summary) => info!(
                "Backup finished: {} files, {} events, {} bytes",
                summary.files, summary.events, summary.bytes
            ),
            Err(e) => error!("Backup failed: {}", e),
        }
        result
    }

    /// 연결과 읽기 task 종료. 여러 번 호출해도 안전
    pub async fn close(&mut self) -> Result<()> {
        if !self.closed {
            info!("Closing binlog syncer");
        }
        self.closed = true;
        self.stop_session().await;
        Ok(())
    }

    async fn stop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            if let Err(e) = session.task.await {
                warn!("binlog reader task ended abnormally: {}", e);
            }
        }
    }

    async fn start(&mut self, request: DumpRequest, raw_mode: bool) -> Result<BinlogStreamer> {
        if self.closed {
            return Err(ReplicationError::AlreadyClosed);
        }
        if self.is_running() {
            return Err(ReplicationError::SyncRunning);
        }
        // 이전 세션이 에러로 끝났다면 정리
        self.stop_session().await;

        let span = info_span!(
            "binlog_sync",
            server_id = self.config.server_id,
            flavor = %self.config.flavor,
            master = %self.config.address(),
        );

        let (mut channel, semi_sync) = self.prepare().instrument(span.clone()).await?;
        self.send_dump(&mut channel, &request)
            .instrument(span.clone())
            .await?;

        {
            let mut progress = self.progress.lock();
            match &request {
                DumpRequest::Position(cursor) => {
                    progress.cursor = cursor.clone();
                    progress.gtid_set = None;
                }
                DumpRequest::Gtid(set) => {
                    progress.cursor = ReplicationCursor::default();
                    progress.gtid_set = Some(set.clone());
                }
            }
        }

        let (streamer, handle) =
            BinlogStreamer::with_span(self.config.event_queue_capacity, span.clone());
        let cancel = CancellationToken::new();

        let reader = SessionReader {
            channel,
            parser: BinlogParser::with_raw_mode(raw_mode),
            handle,
            cancel: cancel.clone(),
            progress: self.progress.clone(),
            semi_sync,
            ack_enabled: semi_sync,
            ack_timeout: self.config.semi_sync_ack_timeout,
            read_timeout: self.config.read_timeout,
            pending_gtid: None,
        };
        let task = tokio::spawn(reader.run().instrument(span));

        self.session = Some(Session { cancel, task });
        Ok(streamer)
    }

    /// 연결, 인증, 세션 변수 설정, 복제본 등록
    async fn prepare(&self) -> Result<(PacketChannel, bool)> {
        let config = &self.config;
        let mut channel =
            PacketChannel::connect(&config.address(), config.connect_timeout).await?;

        let greeting = GreetingPacket::parse(&channel.read_packet().await?)?;
        info!(
            "MySQL Server version: {}, Thread ID: {}",
            greeting.server_version, greeting.thread_id
        );

        auth::authenticate(&mut channel, &greeting, &config.user, &config.password).await?;
        info!("Authentication successful");

        // 체크섬을 이해하는 클라이언트임을 알림. 실제 이벤트 체크섬은 포맷 설명 이벤트를 따름
        let checksum = channel
            .query("SHOW GLOBAL VARIABLES LIKE 'BINLOG_CHECKSUM'")
            .await?;
        if checksum.first_value(1).map_or(false, |value| !value.is_empty()) {
            channel
                .execute("SET @master_binlog_checksum='NONE'")
                .await?;
            debug!("Binlog checksum negotiated");
        }

        if let Some(period) = config.heartbeat_period {
            channel
                .execute(&format!(
                    "SET @master_heartbeat_period={}",
                    period.as_nanos()
                ))
                .await?;
        }

        if config.flavor == Flavor::Mariadb {
            channel
                .execute(&format!(
                    "SET @mariadb_slave_capability={}",
                    MARIADB_SLAVE_CAPABILITY_GTID
                ))
                .await?;
        }

        let semi_sync = if config.semi_sync_enabled {
            self.enable_semi_sync(&mut channel).await?
        } else {
            false
        };

        let register = self.create_register_slave_command()?;
        channel.write_command(COM_REGISTER_SLAVE, &register).await?;
        channel.read_ok().await?;
        debug!("Registered as replica with server id {}", config.server_id);

        Ok((channel, semi_sync))
    }

    async fn enable_semi_sync(&self, channel: &mut PacketChannel) -> Result<bool> {
        let result = channel
            .query("SHOW VARIABLES LIKE 'rpl_semi_sync_master_enabled'")
            .await?;
        if result.first_value(1) != Some("ON") {
            warn!("Master does not support semi-sync, continuing without ACKs");
            return Ok(false);
        }

        channel.execute("SET @rpl_semi_sync_slave = 1").await?;
        info!("Semi-sync replication enabled");
        Ok(true)
    }

    async fn send_dump(&self, channel: &mut PacketChannel, request: &DumpRequest) -> Result<()> {
        match request {
            DumpRequest::Position(cursor) => {
                let command = create_binlog_dump_command(self.config.server_id, cursor)?;
                channel.write_command(COM_BINLOG_DUMP, &command).await?;
                info!(
                    "Sent COM_BINLOG_DUMP: file={}, position={}",
                    cursor.file(),
                    cursor.position()
                );
            }
            DumpRequest::Gtid(GtidSet::Mysql(set)) => {
                let command = create_binlog_dump_gtid_command(self.config.server_id, &set.encode())?;
                channel.write_command(COM_BINLOG_DUMP_GTID, &command).await?;
                info!("Sent COM_BINLOG_DUMP_GTID: {}", set);
            }
            DumpRequest::Gtid(GtidSet::Mariadb(set)) => {
                channel
                    .execute(&format!("SET @slave_connect_state='{}'", set))
                    .await?;
                channel.execute("SET @slave_gtid_strict_mode=0").await?;
                channel.execute("SET @slave_gtid_ignore_duplicates=0").await?;

                let command =
                    create_binlog_dump_command(self.config.server_id, &ReplicationCursor::default())?;
                channel.write_command(COM_BINLOG_DUMP, &command).await?;
                info!("Sent COM_BINLOG_DUMP with slave_connect_state={}", set);
            }
        }
        Ok(())
    }

    /// COM_REGISTER_SLAVE 인자 (명령 코드 제외)
    fn create_register_slave_command(&self) -> Result<Vec<u8>> {
        let config = &self.config;
        let mut buffer = Vec::new();

        buffer.write_u32::<LittleEndian>(config.server_id)?;
        for value in [
            config.report_host.as_deref().unwrap_or_default(),
            config.user.as_str(),
            config.password.as_str(),
        ] {
            let bytes = &value.as_bytes()[..value.len().min(u8::MAX as usize)];
            buffer.write_u8(bytes.len() as u8)?;
            buffer.write_all(bytes)?;
        }
        buffer.write_u16::<LittleEndian>(config.report_port)?;
        // replication rank, master id
        buffer.write_u32::<LittleEndian>(0)?;
        buffer.write_u32::<LittleEndian>(0)?;

        Ok(buffer)
    }
}

impl Drop for BinlogSyncer {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.cancel.cancel();
        }
    }
}

/// COM_BINLOG_DUMP 인자 생성 (명령 코드 제외)
fn create_binlog_dump_command(server_id: u32, cursor: &ReplicationCursor) -> Result<Vec<u8>> {
    let position = cursor.position().max(FIRST_EVENT_POSITION);
    let position = u32::try_from(position).map_err(|_| {
        ReplicationError::InvalidCursor(format!(
            "position {} does not fit in a binlog dump request",
            position
        ))
    })?;

    let mut buffer = Vec::new();

    // Binlog position (4 bytes, little-endian)
    buffer.write_u32::<LittleEndian>(position)?;

    // Flags (2 bytes) - 0 이면 새 이벤트를 기다림
    buffer.write_u16::<LittleEndian>(0)?;

    buffer.write_u32::<LittleEndian>(server_id)?;

    // Binlog filename (패킷 끝까지)
    buffer.write_all(cursor.file().as_bytes())?;

    Ok(buffer)
}

/// COM_BINLOG_DUMP_GTID 인자 생성 (명령 코드 제외)
fn create_binlog_dump_gtid_command(server_id: u32, encoded_set: &[u8]) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    buffer.write_u16::<LittleEndian>(BINLOG_THROUGH_GTID)?;
    buffer.write_u32::<LittleEndian>(server_id)?;

    // 파일명 없음
    buffer.write_u32::<LittleEndian>(0)?;
    buffer.write_u64::<LittleEndian>(FIRST_EVENT_POSITION)?;

    buffer.write_u32::<LittleEndian>(encoded_set.len() as u32)?;
    buffer.write_all(encoded_set)?;

    Ok(buffer)
}

/// 세션 하나의 읽기 task 상태
struct SessionReader {
    channel: PacketChannel,
    parser: BinlogParser,
    handle: StreamerHandle,
    cancel: CancellationToken,
    progress: Arc<Mutex<Progress>>,
    /// 마스터가 이벤트에 semi-sync 헤더를 붙이는지 여부. 세션 동안 바뀌지 않음
    semi_sync: bool,
    /// ACK 응답 여부. ACK 실패 시 꺼짐
    ack_enabled: bool,
    ack_timeout: Duration,
    read_timeout: Option<Duration>,
    pending_gtid: Option<String>,
}

impl SessionReader {
    async fn run(mut self) {
        info!("Binlog event streaming started");
        let mut event_count: u64 = 0;

        loop {
            let packet = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.handle.close();
                    break;
                }
                packet = read_packet(&mut self.channel, self.read_timeout) => packet,
            };

            let event = match packet.and_then(|packet| self.decode(packet)) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    error!("Binlog stream failed after {} events: {}", event_count, e);
                    self.handle.close_with_error(e);
                    break;
                }
            };

            let (event, need_ack) = event;
            self.track(&event);
            let torn_ack = if need_ack {
                self.reply_ack().await.err()
            } else {
                None
            };
            event_count += 1;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.handle.close();
                    break;
                }
                sent = self.handle.send_event(event) => {
                    if sent.is_err() {
                        debug!("Streamer dropped, stopping reader");
                        break;
                    }
                }
            }

            // ACK 프레임이 중간에 끊기면 이 연결의 패킷 경계를 더 믿을 수 없음
            if let Some(e) = torn_ack {
                error!("Binlog stream failed after {} events: {}", event_count, e);
                self.handle.close_with_error(e);
                break;
            }
        }

        self.channel.shutdown().await;
        info!("Binlog streaming ended. Total events received: {}", event_count);
    }

    /// 패킷 하나를 이벤트로. 반환값의 bool 은 semi-sync ACK 필요 여부
    fn decode(&mut self, packet: Vec<u8>) -> Result<Option<(BinlogEvent, bool)>> {
        match packet.first() {
            Some(&OK_HEADER) => {}
            Some(&ERR_HEADER) => return Err(protocol::parse_error_packet(&packet)),
            Some(&EOF_HEADER) if packet.len() < 9 => {
                return Err(ReplicationError::ConnectionError(
                    "binlog stream ended by server".to_string(),
                ))
            }
            None => return Ok(None),
            Some(other) => {
                return Err(ReplicationError::ProtocolError(format!(
                    "unexpected binlog packet header 0x{:02x}",
                    other
                )))
            }
        }

        let mut offset = 1;
        let mut need_ack = false;
        if self.semi_sync && packet.get(1) == Some(&SEMI_SYNC_INDICATOR) {
            need_ack = self.ack_enabled && packet.get(2) == Some(&0x01);
            offset = 3;
        }

        let raw = Bytes::from(packet).slice(offset..);
        let event = self.parser.parse(raw)?;
        debug!(
            "event type={:?} size={} pos={}",
            event.header.event_type, event.header.event_size, event.header.log_pos
        );
        Ok(Some((event, need_ack)))
    }

    /// 위치와 GTID 집합 갱신
    fn track(&mut self, event: &BinlogEvent) {
        let mut progress = self.progress.lock();

        if event.header.log_pos > 0 {
            progress.cursor = progress.cursor.with_position(event.header.log_pos as u64);
        }

        match &event.data {
            BinlogEventData::Rotate(rotate) => {
                if let Ok(cursor) =
                    ReplicationCursor::new(rotate.next_binlog_name.clone(), rotate.position)
                {
                    progress.cursor = cursor;
                } else {
                    warn!("Ignoring rotate to invalid file {:?}", rotate.next_binlog_name);
                }
            }
            BinlogEventData::Gtid(gtid) => self.pending_gtid = gtid.gtid.clone(),
            BinlogEventData::MariadbGtid(gtid) => self.pending_gtid = Some(gtid.gtid.clone()),
            BinlogEventData::Xid(_) => commit_gtid(&mut progress, self.pending_gtid.take()),
            BinlogEventData::Query(query) if query.query != "BEGIN" => {
                commit_gtid(&mut progress, self.pending_gtid.take())
            }
            _ => {}
        }
    }

    /// semi-sync ACK 전송
    ///
    /// 보내지 못하면 경고 후 이 세션의 ACK 를 끄고 계속 진행합니다.
    /// 프레임 일부만 보낸 경우에만 `ConnectionError` 를 돌려줍니다.
    async fn reply_ack(&mut self) -> Result<()> {
        let cursor = self.progress.lock().cursor.clone();

        let mut packet = Vec::with_capacity(9 + cursor.file().len());
        packet.push(SEMI_SYNC_INDICATOR);
        packet.extend_from_slice(&cursor.position().to_le_bytes());
        packet.extend_from_slice(cursor.file().as_bytes());

        self.channel.reset_sequence();
        let Err(failure) = self
            .channel
            .write_packet_within(&packet, self.ack_timeout)
            .await
        else {
            return Ok(());
        };

        self.ack_enabled = false;
        if failure.is_torn() {
            return Err(ReplicationError::ConnectionError(format!(
                "semi-sync ACK for {} interrupted after {} bytes: {}",
                cursor, failure.written, failure.error
            )));
        }
        warn!(
            "Semi-sync ACK for {} failed, disabling ACKs for this session: {}",
            cursor, failure.error
        );
        Ok(())
    }
}

fn commit_gtid(progress: &mut Progress, gtid: Option<String>) {
    let (Some(set), Some(gtid)) = (progress.gtid_set.as_mut(), gtid) else {
        return;
    };
    if let Err(e) = set.update(&gtid) {
        warn!("Cannot add GTID {} to executed set: {}", gtid, e);
    }
}

async fn read_packet(channel: &mut PacketChannel, timeout: Option<Duration>) -> Result<Vec<u8>> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, channel.read_packet())
            .await
            .map_err(|_| {
                ReplicationError::ConnectionError(format!(
                    "no binlog packet received for {:?}",
                    timeout
                ))
            })?,
        None => channel.read_packet().await,
    }
}
