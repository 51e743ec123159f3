//! 읽기 task 와 소비자 사이의 이벤트 스트림
//!
//! 생산자(`StreamerHandle`)는 이벤트 큐가 가득 차면 대기하고, 종료 에러는
//! 작은 에러 슬롯에 non-blocking 으로만 넣습니다. 소비자(`BinlogStreamer`)는
//! 처음 관찰한 종료 에러를 보관하고, 이후 호출은 큐를 보지 않고 바로
//! `Temporary(AlreadyClosed)` 를 돌려줍니다.
//!
//! 에러 슬롯이 가득 찬 상태에서 들어온 에러는 버려집니다. 소비자가 아직
//! 첫 에러를 보관하기 전이면 그 사이에는 버려진 에러를 볼 수 없습니다.

use crate::error::{ReplicationError, Result};
use crate::events::BinlogEvent;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Span};

pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 10240;
pub const ERROR_SLOT_CAPACITY: usize = 4;

/// 소비자 측 스트림
#[derive(Debug)]
pub struct BinlogStreamer {
    events: mpsc::Receiver<BinlogEvent>,
    errors: mpsc::Receiver<ReplicationError>,
    terminal: Option<ReplicationError>,
    span: Span,
}

/// 생산자 측 핸들
#[derive(Debug, Clone)]
pub struct StreamerHandle {
    events: mpsc::Sender<BinlogEvent>,
    errors: mpsc::Sender<ReplicationError>,
    span: Span,
}

impl BinlogStreamer {
    pub fn new(capacity: usize) -> (BinlogStreamer, StreamerHandle) {
        Self::with_span(capacity, Span::none())
    }

    /// 로그를 남길 span 을 지정해서 생성
    pub fn with_span(capacity: usize, span: Span) -> (BinlogStreamer, StreamerHandle) {
        let (event_tx, event_rx) = mpsc::channel(capacity.max(1));
        let (error_tx, error_rx) = mpsc::channel(ERROR_SLOT_CAPACITY);

        let streamer = BinlogStreamer {
            events: event_rx,
            errors: error_rx,
            terminal: None,
            span: span.clone(),
        };
        let handle = StreamerHandle {
            events: event_tx,
            errors: error_tx,
            span,
        };
        (streamer, handle)
    }

    /// 이벤트 또는 종료 에러가 올 때까지 대기
    pub async fn get_event(&mut self) -> Result<BinlogEvent> {
        self.next_event(None, None).await
    }

    /// 이 호출에만 적용되는 타임아웃. 만료되면 `Timeout`, 스트림은 그대로 유지
    pub async fn get_event_timeout(&mut self, timeout: Duration) -> Result<BinlogEvent> {
        let deadline = Instant::now() + timeout;
        self.next_event(Some(deadline), None).await
    }

    pub async fn get_event_until(&mut self, deadline: Instant) -> Result<BinlogEvent> {
        self.next_event(Some(deadline), None).await
    }

    /// 토큰이 취소되면 `Cancelled`, 스트림은 그대로 유지
    pub async fn get_event_with_cancel(&mut self, cancel: &CancellationToken) -> Result<BinlogEvent> {
        self.next_event(None, Some(cancel)).await
    }

    async fn next_event(
        &mut self,
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> Result<BinlogEvent> {
        if self.terminal.is_some() {
            return Err(already_closed());
        }

        // 이미 만료된 호출은 큐를 건드리지 않음
        if cancel.map_or(false, |token| token.is_cancelled()) {
            return Err(ReplicationError::Cancelled);
        }
        if deadline.map_or(false, |deadline| deadline <= Instant::now()) {
            return Err(ReplicationError::Timeout);
        }

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(ReplicationError::Cancelled),
            _ = expired => Err(ReplicationError::Timeout),
            event = self.events.recv() => match event {
                Some(event) => Ok(event),
                None => Err(self.producer_gone()),
            },
            err = self.errors.recv() => {
                Err(self.observe(err.unwrap_or(ReplicationError::AlreadyClosed)))
            }
        }
    }

    /// 대기하지 않는 조회. 지금 가져올 이벤트가 없으면 `Ok(None)`
    pub fn try_get_event(&mut self) -> Result<Option<BinlogEvent>> {
        if self.terminal.is_some() {
            return Err(already_closed());
        }

        match self.events.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Disconnected) => Err(self.producer_gone()),
            Err(TryRecvError::Empty) => match self.errors.try_recv() {
                Ok(err) => Err(self.observe(err)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => {
                    Err(self.observe(ReplicationError::AlreadyClosed))
                }
            },
        }
    }

    /// 이미 종료 에러를 관찰했는지 여부
    pub fn is_closed(&self) -> bool {
        self.terminal.is_some()
    }

    /// 관찰한 종료 에러
    pub fn terminal_error(&self) -> Option<&ReplicationError> {
        self.terminal.as_ref()
    }

    /// 큐에 남은 이벤트 수
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    // 생산자가 모두 사라짐: 슬롯에 남은 에러가 있으면 그것을 우선
    fn producer_gone(&mut self) -> ReplicationError {
        let err = self
            .errors
            .try_recv()
            .unwrap_or(ReplicationError::AlreadyClosed);
        self.observe(err)
    }

    fn observe(&mut self, err: ReplicationError) -> ReplicationError {
        if err.is_already_closed() {
            debug!(parent: &self.span, "binlog stream closed");
        } else {
            error!(parent: &self.span, "binlog stream failed: {}", err);
        }
        self.terminal = Some(err.clone());
        err
    }
}

impl StreamerHandle {
    /// 이벤트 전달. 큐가 가득 차면 소비자가 비울 때까지 대기
    pub async fn send_event(&self, event: BinlogEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| ReplicationError::AlreadyClosed)
    }

    /// `AlreadyClosed` 로 종료
    pub fn close(&self) -> bool {
        self.close_with_error(ReplicationError::AlreadyClosed)
    }

    /// 종료 에러를 슬롯에 넣음. 절대 대기하지 않으며, 슬롯이 가득 차면 버림
    pub fn close_with_error(&self, err: ReplicationError) -> bool {
        match self.errors.try_send(err) {
            Ok(()) => true,
            Err(TrySendError::Full(err)) => {
                warn!(parent: &self.span, "error slot full, dropping terminal error: {}", err);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// 소비자가 사라졌는지 여부
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

fn already_closed() -> ReplicationError {
    ReplicationError::Temporary(Box::new(ReplicationError::AlreadyClosed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::sample_event;
    use tokio_test::{assert_pending, assert_ready_ok};

    #[test]
    fn test_get_event_waits_for_producer() {
        let (mut streamer, handle) = BinlogStreamer::new(4);

        let mut pending = tokio_test::task::spawn(streamer.get_event());
        assert_pending!(pending.poll());

        tokio_test::block_on(handle.send_event(sample_event(120))).unwrap();
        assert!(pending.is_woken());
        let event = assert_ready_ok!(pending.poll());
        assert_eq!(event.header.log_pos, 120);
    }

    #[tokio::test]
    async fn test_events_keep_arrival_order() {
        let (mut streamer, handle) = BinlogStreamer::new(16);
        for pos in [100, 200, 300] {
            handle.send_event(sample_event(pos)).await.unwrap();
        }

        for pos in [100, 200, 300] {
            assert_eq!(streamer.get_event().await.unwrap().header.log_pos, pos);
        }
        assert_eq!(streamer.try_get_event().unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_timeout_does_not_consume_event() {
        let (mut streamer, handle) = BinlogStreamer::new(4);
        handle.send_event(sample_event(120)).await.unwrap();

        let result = streamer.get_event_timeout(Duration::ZERO).await;
        assert_eq!(result.unwrap_err(), ReplicationError::Timeout);
        assert_eq!(streamer.pending_events(), 1);

        let event = streamer
            .get_event_timeout(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(event.header.log_pos, 120);
    }

    #[tokio::test]
    async fn test_cancelled_token_does_not_consume_event() {
        let (mut streamer, handle) = BinlogStreamer::new(4);
        handle.send_event(sample_event(120)).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(
            streamer.get_event_with_cancel(&token).await.unwrap_err(),
            ReplicationError::Cancelled
        );

        let fresh = CancellationToken::new();
        let event = streamer.get_event_with_cancel(&fresh).await.unwrap();
        assert_eq!(event.header.log_pos, 120);
    }

    #[tokio::test]
    async fn test_timeout_is_local_to_one_call() {
        let (mut streamer, handle) = BinlogStreamer::new(4);

        let result = streamer.get_event_timeout(Duration::from_millis(20)).await;
        assert!(result.unwrap_err().is_context());
        assert!(!streamer.is_closed());

        handle.close_with_error(ReplicationError::ConnectionError("reset".into()));
        assert_eq!(
            streamer.get_event_timeout(Duration::from_secs(1)).await.unwrap_err(),
            ReplicationError::ConnectionError("reset".into())
        );
    }

    #[tokio::test]
    async fn test_terminal_error_is_cached() {
        let (mut streamer, handle) = BinlogStreamer::new(4);
        handle.send_event(sample_event(120)).await.unwrap();
        assert!(handle.close_with_error(ReplicationError::ProtocolError("bad frame".into())));

        // 에러 이전에 큐에 들어간 이벤트는 먼저 전달
        assert_eq!(streamer.get_event().await.unwrap().header.log_pos, 120);
        assert_eq!(
            streamer.get_event().await.unwrap_err(),
            ReplicationError::ProtocolError("bad frame".into())
        );

        // 이후 호출은 큐 내용과 무관하게 바로 반환
        handle.send_event(sample_event(200)).await.unwrap();
        for _ in 0..3 {
            let err = streamer.get_event().await.unwrap_err();
            assert!(err.is_temporary());
            assert!(err.is_already_closed());
        }
        assert!(streamer.try_get_event().unwrap_err().is_temporary());
        assert_eq!(streamer.pending_events(), 1);
    }

    #[tokio::test]
    async fn test_full_error_slot_drops_without_blocking() {
        let (mut streamer, handle) = BinlogStreamer::new(4);

        for i in 0..ERROR_SLOT_CAPACITY {
            assert!(handle.close_with_error(ReplicationError::ConnectionError(i.to_string())));
        }
        // 슬롯이 가득 찼으므로 이 에러는 버려짐 (알려진 race)
        assert!(!handle.close_with_error(ReplicationError::ConnectionError("lost".into())));

        assert_eq!(
            streamer.get_event().await.unwrap_err(),
            ReplicationError::ConnectionError("0".into())
        );
        assert_eq!(
            streamer.terminal_error(),
            Some(&ReplicationError::ConnectionError("0".into()))
        );
        assert!(streamer.get_event().await.unwrap_err().is_temporary());
    }

    #[tokio::test]
    async fn test_dropped_producer_closes_stream() {
        let (mut streamer, handle) = BinlogStreamer::new(4);
        handle.send_event(sample_event(120)).await.unwrap();
        drop(handle);

        assert!(streamer.get_event().await.is_ok());
        assert_eq!(
            streamer.get_event().await.unwrap_err(),
            ReplicationError::AlreadyClosed
        );
        assert!(streamer.get_event().await.unwrap_err().is_temporary());
    }

    #[tokio::test]
    async fn test_send_fails_after_consumer_dropped() {
        let (streamer, handle) = BinlogStreamer::new(4);
        drop(streamer);
        assert!(handle.is_closed());
        assert_eq!(
            handle.send_event(sample_event(120)).await.unwrap_err(),
            ReplicationError::AlreadyClosed
        );
        assert!(!handle.close());
    }
}
