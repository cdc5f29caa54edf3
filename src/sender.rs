//! 송신자
//!
//! 상태: `Idle -> Prepared(청크 분할, begin 전송) -> Sending -> Done`
//!
//! - 파일 전체를 호출 시점에 미리 청크로 잘라 메모리에 보관
//! - 백프레셔(고수위)와 크레딧 쿼터를 모두 통과한 청크만 전송
//! - 두 재개 트리거(저수위 알림, 크레딧 지급)는 같은 `Notify`를 깨우고,
//!   그 신호를 기다리는 송신 루프는 전송당 하나뿐이다

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backpressure::{BackpressureController, Watermarks};
use crate::channel::Channel;
use crate::chunk::{Chunk, ChunkSlicer};
use crate::message::{ControlMessage, FileInfo, Frame};
use crate::quota::{CreditGate, Quota};
use crate::stats::{Direction, TransferStats};
use crate::{Config, Error, Result};

/// 송신 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    Prepared,
    Sending,
    Done,
}

impl SenderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderState::Idle => "idle",
            SenderState::Prepared => "prepared",
            SenderState::Sending => "sending",
            SenderState::Done => "done",
        }
    }
}

/// 송신 루프 재진입 방지
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::AlreadyRunning)?;
        Ok(Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// 파일 송신자 (전송 하나, 방향 하나)
pub struct FileSender {
    /// 송신 채널 (세션 소유, 여기선 참조만)
    channel: Arc<dyn Channel>,

    /// 백프레셔 컨트롤러
    backpressure: BackpressureController,

    /// 송신측 크레딧 쿼터
    gate: CreditGate,

    /// begin 메시지에 실릴 파일 정보
    file_info: FileInfo,

    /// 미리 잘라둔 청크
    chunks: Vec<Chunk>,

    /// 다음에 보낼 청크 인덱스
    next_chunk: AtomicUsize,

    state: Mutex<SenderState>,

    /// 실행 중 플래그
    running: AtomicBool,

    cancel: CancellationToken,

    stats: RwLock<TransferStats>,
}

impl FileSender {
    /// 새 송신자 생성 (Idle). 데이터는 여기서 바로 청크로 분할
    pub fn new(
        config: &Config,
        channel: Arc<dyn Channel>,
        file_name: impl Into<String>,
        data: Bytes,
    ) -> Result<Self> {
        config.validate()?;

        let chunks = ChunkSlicer::new(config.chunk_size).split(&data);
        let total_chunks = chunks.len();

        let backpressure = BackpressureController::new(Watermarks::from_config(config)?);
        let quota = if config.gate.gates_sender() {
            Quota::new(total_chunks, config.credit_divisor)
        } else {
            Quota::unlimited(total_chunks)
        };
        let gate = CreditGate::with_wake(quota, backpressure.wake_handle());

        let mut stats = TransferStats::new(Direction::Outgoing);
        stats.total_chunks = total_chunks as u64;
        stats.total_bytes = Some(data.len() as u64);

        Ok(Self {
            channel,
            backpressure,
            gate,
            file_info: FileInfo::new(file_name, Some(data.len() as u64)),
            chunks,
            next_chunk: AtomicUsize::new(0),
            state: Mutex::new(SenderState::Idle),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            stats: RwLock::new(stats),
        })
    }

    /// 생성 + begin 전송 (Prepared)
    pub async fn prepare(
        config: &Config,
        channel: Arc<dyn Channel>,
        file_name: impl Into<String>,
        data: Bytes,
    ) -> Result<Self> {
        let sender = Self::new(config, channel, file_name, data)?;
        sender.begin().await?;
        Ok(sender)
    }

    /// 디스크 파일을 읽어 송신자 준비
    pub async fn from_path(
        config: &Config,
        channel: Arc<dyn Channel>,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file.bin".to_string());

        Self::prepare(config, channel, file_name, Bytes::from(data)).await
    }

    /// begin 전송, 저수위 알림 등록 (Idle -> Prepared)
    pub async fn begin(&self) -> Result<()> {
        self.transition(SenderState::Idle, SenderState::Prepared)?;

        if !self.channel.is_open() {
            *self.state.lock() = SenderState::Idle;
            return Err(Error::ChannelClosed);
        }

        self.backpressure.attach(self.channel.as_ref()).await;

        let begin = ControlMessage::begin(self.file_info.clone());
        if let Err(e) = self.channel.send(Frame::control(&begin)?).await {
            *self.state.lock() = SenderState::Idle;
            return Err(e);
        }

        info!(
            file = ?self.file_info.file_name,
            size = ?self.file_info.file_size,
            chunks = self.chunks.len(),
            channel = %self.channel.label(),
            "전송 시작 (begin)"
        );
        Ok(())
    }

    /// 송신 루프 실행 (Prepared -> Sending -> Done)
    ///
    /// 쿼터가 허용하고 버퍼 게이지가 고수위 이하인 동안 청크를 하나씩 보낸다.
    /// 막히면 재개 신호(저수위 알림 또는 크레딧)를 기다린다.
    /// 모든 청크가 나가면 end를 보내고 끝난다. 같은 전송에 대해 동시에 두 번
    /// 실행하면 `AlreadyRunning`.
    pub async fn run(&self) -> Result<TransferStats> {
        let _guard = RunGuard::acquire(&self.running)?;

        if self.state() == SenderState::Idle {
            self.begin().await?;
        }
        match self.state() {
            SenderState::Prepared => *self.state.lock() = SenderState::Sending,
            SenderState::Sending => {}
            other => {
                return Err(Error::InvalidState {
                    from: other.as_str(),
                    to: SenderState::Sending.as_str(),
                })
            }
        }

        loop {
            self.pump().await?;

            if self.next_chunk.load(Ordering::SeqCst) >= self.chunks.len() {
                break;
            }

            tokio::select! {
                _ = self.backpressure.wait() => {
                    self.stats.write().wakeups += 1;
                    debug!("송신 루프 재개");
                }
                _ = self.cancel.cancelled() => {
                    warn!(
                        sent = self.next_chunk.load(Ordering::SeqCst),
                        total = self.chunks.len(),
                        "전송 취소"
                    );
                    return Err(Error::Cancelled);
                }
            }
        }

        self.finish().await
    }

    /// 보낼 수 있는 만큼 보냄
    async fn pump(&self) -> Result<()> {
        let total = self.chunks.len();

        loop {
            let next = self.next_chunk.load(Ordering::SeqCst);
            if next >= total {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !self.channel.is_open() {
                return Err(Error::ChannelClosed);
            }

            if !self.backpressure.admit(self.channel.as_ref()).await {
                self.stats.write().backpressure_pauses += 1;
                return Ok(());
            }
            if !self.gate.try_commit() {
                return Ok(());
            }

            let chunk = &self.chunks[next];
            self.channel.send(Frame::Binary(chunk.data.clone())).await?;
            self.next_chunk.store(next + 1, Ordering::SeqCst);
            self.stats.write().record_chunk(chunk.len());

            debug!(index = chunk.index, size = chunk.len(), total, "청크 전송");
        }
    }

    /// end 전송 (Sending -> Done)
    async fn finish(&self) -> Result<TransferStats> {
        let end = ControlMessage::end();
        self.channel.send(Frame::control(&end)?).await?;
        *self.state.lock() = SenderState::Done;

        let stats = {
            let mut stats = self.stats.write();
            stats.credits = self.gate.credits();
            stats.finish();
            stats.clone()
        };
        info!("전송 완료 (end): {}", stats.summary());
        Ok(stats)
    }

    /// 버퍼가 비워질 때까지 대기 (채널 닫기 전)
    ///
    /// 시간 안에 비워지지 않으면 `DrainTimeout`.
    pub async fn wait_drained(&self, max_wait: Duration) -> Result<()> {
        const POLL_INTERVAL: Duration = Duration::from_millis(20);
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            if !self.channel.is_open() {
                return Err(Error::ChannelClosed);
            }
            let buffered = self.channel.buffered_amount().await;
            if buffered == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(buffered, "버퍼 비우기 타임아웃");
                return Err(Error::DrainTimeout {
                    buffered,
                    waited_ms: max_wait.as_millis() as u64,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn transition(&self, from: SenderState, to: SenderState) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(Error::InvalidState {
                from: state.as_str(),
                to: to.as_str(),
            });
        }
        *state = to;
        Ok(())
    }

    /// 크레딧 지급 핸들 (UI 등 외부에서 사용)
    pub fn credit_gate(&self) -> CreditGate {
        self.gate.clone()
    }

    /// 크레딧 1단위 지급
    pub fn grant_credit(&self) -> usize {
        self.gate.grant_credit()
    }

    /// 진행 중인 전송 취소
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> SenderState {
        *self.state.lock()
    }

    pub fn file_info(&self) -> &FileInfo {
        &self.file_info
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// 보낸 청크 수
    pub fn sent_chunks(&self) -> usize {
        self.next_chunk.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 통계 반환
    pub fn stats(&self) -> TransferStats {
        let mut stats = self.stats.read().clone();
        stats.credits = self.gate.credits();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{memory_pair, Inbox};
    use crate::config::Gate;

    fn sample(len: usize) -> Bytes {
        (0..len).map(|i| (i % 253) as u8).collect::<Vec<u8>>().into()
    }

    async fn next_frame(inbox: &mut Inbox) -> Option<Frame> {
        tokio::time::timeout(Duration::from_millis(50), inbox.recv())
            .await
            .ok()
            .flatten()
    }

    fn expect_control(frame: Option<Frame>) -> ControlMessage {
        match frame {
            Some(Frame::Text(text)) => ControlMessage::from_json(&text).unwrap(),
            other => panic!("expected control frame, got {other:?}"),
        }
    }

    fn expect_chunk(frame: Option<Frame>) -> Bytes {
        match frame {
            Some(Frame::Binary(data)) => data,
            other => panic!("expected chunk frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sends_begin_chunks_end() {
        let ((a, _), (_b, mut inbox)) = memory_pair("data");
        let data = sample(130 * 1024);
        let sender = FileSender::prepare(&Config::default(), Arc::new(a), "a.bin", data.clone())
            .await
            .unwrap();
        assert_eq!(sender.state(), SenderState::Prepared);

        let stats = sender.run().await.unwrap();
        assert_eq!(sender.state(), SenderState::Done);
        assert_eq!(stats.chunks, 3);

        assert_eq!(
            expect_control(next_frame(&mut inbox).await),
            ControlMessage::begin(FileInfo::new("a.bin", Some(133_120)))
        );
        let mut received = Vec::new();
        for expected in [65536, 65536, 2048] {
            let chunk = expect_chunk(next_frame(&mut inbox).await);
            assert_eq!(chunk.len(), expected);
            received.extend_from_slice(&chunk);
        }
        assert_eq!(expect_control(next_frame(&mut inbox).await), ControlMessage::end());
        assert_eq!(Bytes::from(received), data);
    }

    #[tokio::test]
    async fn test_empty_file_sends_begin_then_end() {
        let ((a, _), (_b, mut inbox)) = memory_pair("data");
        let sender = FileSender::new(&Config::throttled(), Arc::new(a), "empty", Bytes::new())
            .unwrap();
        assert_eq!(sender.state(), SenderState::Idle);

        // 게이트가 켜져 있어도 청크가 없으면 크레딧 없이 끝남
        sender.run().await.unwrap();
        assert_eq!(
            expect_control(next_frame(&mut inbox).await),
            ControlMessage::begin(FileInfo::new("empty", Some(0)))
        );
        assert_eq!(expect_control(next_frame(&mut inbox).await), ControlMessage::end());
        assert!(next_frame(&mut inbox).await.is_none());
    }

    #[tokio::test]
    async fn test_quota_releases_one_chunk_per_credit() {
        let ((a, _), (_b, mut inbox)) = memory_pair("data");
        let config = Config {
            gate: Gate::Sender,
            ..Config::default().with_chunk_size(10)
        };
        let sender = Arc::new(
            FileSender::prepare(&config, Arc::new(a), "q.bin", sample(220))
                .await
                .unwrap(),
        );
        assert_eq!(sender.total_chunks(), 22);

        let task = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.run().await })
        };

        expect_control(next_frame(&mut inbox).await);
        // 크레딧 없이는 아무 청크도 나가지 않음
        assert!(next_frame(&mut inbox).await.is_none());

        assert_eq!(sender.grant_credit(), 1);
        expect_chunk(next_frame(&mut inbox).await);
        assert!(next_frame(&mut inbox).await.is_none());
        assert_eq!(sender.sent_chunks(), 1);

        for _ in 1..22 {
            sender.grant_credit();
            expect_chunk(next_frame(&mut inbox).await);
        }
        assert_eq!(expect_control(next_frame(&mut inbox).await), ControlMessage::end());

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.credits, 22);
        assert_eq!(stats.chunks, 22);
    }

    #[tokio::test]
    async fn test_backpressure_suspends_and_resumes_without_duplicates() {
        let ((a, _), (_b, mut inbox)) = memory_pair("data");
        let channel: Arc<dyn Channel> = Arc::new(a);
        let config = Config {
            low_watermark: 40,
            high_watermark: 80,
            ..Config::default().with_chunk_size(10)
        };
        let data = sample(300);
        let sender = Arc::new(
            FileSender::prepare(&config, channel.clone(), "bp.bin", data.clone())
                .await
                .unwrap(),
        );

        let task = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.run().await })
        };

        // 아무것도 읽지 않으면 고수위를 넘은 직후 멈춤
        tokio::time::sleep(Duration::from_millis(30)).await;
        let stalled_at = sender.sent_chunks();
        assert!(stalled_at < 30);
        let buffered = channel.buffered_amount().await;
        assert!(buffered > 80);
        assert!(buffered <= 80 + 10 + 200, "begin frame + at most one chunk over HIGH");
        assert_eq!(sender.stats().backpressure_pauses, 1);

        // 읽기 시작하면 저수위 알림으로 재개되어 끝까지 감
        let mut frames = Vec::new();
        while let Some(frame) = inbox.recv().await {
            let is_end = matches!(&frame, Frame::Text(t) if t.contains("\"end\""));
            frames.push(frame);
            if is_end {
                break;
            }
        }
        let stats = task.await.unwrap().unwrap();
        assert!(stats.wakeups >= 1);

        let chunks: Vec<u8> = frames
            .iter()
            .filter_map(|f| match f {
                Frame::Binary(data) => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(frames.len(), 32);
        assert_eq!(Bytes::from(chunks), data);
    }

    #[tokio::test]
    async fn test_second_run_is_rejected_while_running() {
        let ((a, _), (_b, _inbox)) = memory_pair("data");
        let config = Config {
            gate: Gate::Sender,
            ..Config::default().with_chunk_size(10)
        };
        let sender = Arc::new(
            FileSender::prepare(&config, Arc::new(a), "x", sample(50))
                .await
                .unwrap(),
        );

        let task = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.run().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sender.is_running());
        assert!(matches!(sender.run().await, Err(Error::AlreadyRunning)));

        sender.cancel();
        assert!(matches!(task.await.unwrap(), Err(Error::Cancelled)));
        assert!(!sender.is_running());
    }

    #[tokio::test]
    async fn test_closed_channel_is_rejected() {
        let ((a, _), (b, _inbox)) = memory_pair("data");
        b.close().await.unwrap();

        let result = FileSender::prepare(&Config::default(), Arc::new(a), "x", sample(5)).await;
        assert!(matches!(result, Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_from_path_uses_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let ((a, _), (_b, mut inbox)) = memory_pair("data");
        let sender = FileSender::from_path(&Config::default(), Arc::new(a), &path)
            .await
            .unwrap();
        assert_eq!(sender.file_info().file_name.as_deref(), Some("report.txt"));
        sender.run().await.unwrap();

        expect_control(next_frame(&mut inbox).await);
        assert_eq!(expect_chunk(next_frame(&mut inbox).await).as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_wait_drained_reports_timeout() {
        let ((a, _), (_b, mut inbox)) = memory_pair("data");
        let sender = FileSender::prepare(&Config::default(), Arc::new(a), "d", sample(100))
            .await
            .unwrap();
        sender.run().await.unwrap();

        // 상대가 읽지 않으면 시간 안에 비워지지 않음
        let result = sender.wait_drained(Duration::from_millis(30)).await;
        assert!(matches!(result, Err(Error::DrainTimeout { buffered, .. }) if buffered > 0));

        for _ in 0..3 {
            next_frame(&mut inbox).await.unwrap();
        }
        sender.wait_drained(Duration::from_millis(30)).await.unwrap();
    }
}
