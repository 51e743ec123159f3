//! 마스터 binlog 파일을 그대로 복제하는 백업
//!
//! 스트리머에서 이벤트를 꺼내 원본 바이트를 로컬 파일에 이어 씁니다.
//! 포맷 설명 이벤트마다 새 파일을 열고, 파일 이름은 직전 회전 이벤트에서 얻습니다.

use crate::binlog::BINLOG_MAGIC;
use crate::cursor::ReplicationCursor;
use crate::error::{ReplicationError, Result};
use crate::events::{BinlogEvent, BinlogEventData};
use crate::streamer::BinlogStreamer;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

/// 백업 진행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Idle,
    Draining,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupSummary {
    pub files: usize,
    pub events: u64,
    pub bytes: u64,
}

struct OpenFile {
    name: String,
    writer: BufWriter<File>,
}

pub struct BackupWriter {
    dir: PathBuf,
    per_call_timeout: Duration,
    state: BackupState,
    next_file: Option<String>,
    current: Option<OpenFile>,
    summary: BackupSummary,
}

impl BackupWriter {
    /// `per_call_timeout` 동안 이벤트가 없으면 따라잡은 것으로 보고 종료
    pub fn new(dir: impl Into<PathBuf>, per_call_timeout: Duration) -> Self {
        BackupWriter {
            dir: dir.into(),
            per_call_timeout,
            state: BackupState::Idle,
            next_file: None,
            current: None,
            summary: BackupSummary::default(),
        }
    }

    pub fn state(&self) -> BackupState {
        self.state
    }

    pub fn summary(&self) -> &BackupSummary {
        &self.summary
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 지금 쓰고 있는 파일 이름
    pub fn current_file(&self) -> Option<&str> {
        self.current.as_ref().map(|file| file.name.as_str())
    }

    /// 스트림이 조용해질 때까지 백업
    ///
    /// 호출 단위 타임아웃은 정상 종료, 그 외 스트림 에러와 I/O 에러는 실패입니다.
    pub async fn run(&mut self, streamer: &mut BinlogStreamer) -> Result<BackupSummary> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            ReplicationError::BackupError(format!("cannot create {}: {}", self.dir.display(), e))
        })?;
        self.state = BackupState::Draining;

        let result = self.drain(streamer).await;
        let closed = self.close_current().await;

        match result.and(closed) {
            Ok(()) => {
                self.state = BackupState::Idle;
                Ok(self.summary.clone())
            }
            Err(e) => {
                self.state = BackupState::Failed;
                Err(e)
            }
        }
    }

    async fn drain(&mut self, streamer: &mut BinlogStreamer) -> Result<()> {
        loop {
            match streamer.get_event_timeout(self.per_call_timeout).await {
                Ok(event) => self.handle_event(&event).await?,
                Err(ReplicationError::Timeout) => {
                    info!(
                        "No binlog event for {:?}, backup caught up",
                        self.per_call_timeout
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 이벤트 하나 처리
    pub async fn handle_event(&mut self, event: &BinlogEvent) -> Result<()> {
        match &event.data {
            BinlogEventData::Rotate(rotate) => {
                let name = validate_file_name(&rotate.next_binlog_name)?;
                self.next_file = Some(name);
                // 가짜 회전은 현재 파일을 알려줄 뿐 파일에 속하지 않음
                if event.is_fake_rotate() {
                    return Ok(());
                }
            }
            BinlogEventData::FormatDescription(_) => {
                self.close_current().await?;
                let name = self.next_file.clone().ok_or_else(|| {
                    ReplicationError::BackupError(
                        "format description event before any rotate event".to_string(),
                    )
                })?;
                self.open(name).await?;
            }
            // heartbeat 는 마스터 파일에 존재하지 않음
            BinlogEventData::Heartbeat(_) => return Ok(()),
            _ => {}
        }

        let Some(file) = self.current.as_mut() else {
            return Err(ReplicationError::BackupError(format!(
                "{:?} event at {} before any format description event",
                event.event_type(),
                event.header.log_pos
            )));
        };

        file.writer.write_all(&event.raw).await.map_err(|e| {
            ReplicationError::IoError(format!("write to {} failed: {}", file.name, e))
        })?;
        self.summary.events += 1;
        self.summary.bytes += event.raw.len() as u64;
        Ok(())
    }

    async fn open(&mut self, name: String) -> Result<()> {
        let path = self.dir.join(&name);
        // 위치 중간부터 재개해도 파일은 처음부터 다시 씀
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| ReplicationError::IoError(format!("cannot create {}: {}", path.display(), e)))?;

        let mut writer = BufWriter::new(file);
        writer.write_all(BINLOG_MAGIC).await.map_err(|e| {
            ReplicationError::IoError(format!("write to {} failed: {}", name, e))
        })?;

        info!("Backing up binlog file {}", path.display());
        self.summary.files += 1;
        self.summary.bytes += BINLOG_MAGIC.len() as u64;
        self.current = Some(OpenFile { name, writer });
        Ok(())
    }

    async fn close_current(&mut self) -> Result<()> {
        let Some(mut file) = self.current.take() else {
            return Ok(());
        };

        let flushed = async {
            file.writer.flush().await?;
            file.writer.get_mut().sync_all().await
        }
        .await;

        match flushed {
            Ok(()) => {
                debug!("Closed backup file {}", file.name);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to close backup file {}: {}", file.name, e);
                Err(ReplicationError::IoError(format!(
                    "cannot flush {}: {}",
                    file.name, e
                )))
            }
        }
    }
}

/// 서버가 보낸 파일 이름은 경로 요소 없는 binlog 파일 이름이어야 함
fn validate_file_name(name: &str) -> Result<String> {
    match ReplicationCursor::start_of(name) {
        Ok(cursor) if !cursor.is_unspecified() => Ok(cursor.file().to_string()),
        _ => Err(ReplicationError::BackupError(format!(
            "refusing to write binlog file {:?}",
            name
        ))),
    }
}
