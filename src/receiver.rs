//! 수신자
//!
//! 상태: `Idle -> Receiving(begin 수신) -> Finalizing(end 수신 또는 선언 크기 도달) -> Done`
//!
//! - 채널당 한 번에 하나의 전송만 추적 (새 begin은 이전 미완료 전송을 버림)
//! - 바이너리 프레임은 도착 순서대로 이어붙임 (청크 번호, 체크섬 없음)
//! - 수신측 게이트가 켜져 있으면 받은 청크를 크레딧만큼만 풀어줌(unlock)

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::Inbox;
use crate::chunk::Reassembler;
use crate::message::{ControlMessage, FileInfo, Frame, Inbound};
use crate::quota::{CreditGate, Quota};
use crate::stats::{Direction, TransferStats};
use crate::{Config, Error, Result};

/// 파일 이름이 없을 때 저장용 이름
pub const FALLBACK_FILE_NAME: &str = "file.bin";

/// 수신 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Receiving,
    Finalizing,
    Done,
}

impl ReceiverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiverState::Idle => "idle",
            ReceiverState::Receiving => "receiving",
            ReceiverState::Finalizing => "finalizing",
            ReceiverState::Done => "done",
        }
    }
}

/// 완성된 결과물
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: Option<String>,
    pub data: Bytes,
}

impl ReceivedFile {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 경로 요소를 제거한 저장용 파일 이름
    pub fn safe_name(&self) -> String {
        self.name
            .as_deref()
            .and_then(|name| Path::new(name).file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty() && name != "." && name != "..")
            .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
    }

    /// 디렉터리 아래에 저장, 저장된 경로 반환
    pub async fn save_to(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        let path = dir.join(self.safe_name());
        tokio::fs::write(&path, &self.data).await?;
        info!(path = %path.display(), size = self.data.len(), "파일 저장");
        Ok(path)
    }
}

/// UI 쪽으로 나가는 수신 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    /// begin 수신 (또는 암묵적 전송 시작)
    Started(FileInfo),

    /// 청크 수신. 선언 크기를 모르면 total = received
    Progress { received: u64, total: u64 },

    /// 크레딧으로 풀린 바이트
    Unlocked { bytes: u64, total: u64 },

    /// 결과물 완성
    Completed(ReceivedFile),

    /// 전송 실패
    Failed { reason: String },
}

/// 파일 수신자 (채널 하나, 방향 하나)
pub struct FileReceiver {
    config: Config,

    state: ReceiverState,

    /// 현재 전송의 파일 정보
    file_info: FileInfo,

    reassembler: Reassembler,

    /// 수신측 unlock 게이트 (꺼져 있으면 None)
    gate: Option<CreditGate>,

    /// end까지 왔지만 아직 다 풀리지 않은 결과물
    pending: Option<ReceivedFile>,

    /// run()에 돌려줄 완성 결과물
    completed: Option<ReceivedFile>,

    stats: TransferStats,

    events: mpsc::UnboundedSender<ReceiverEvent>,
}

impl FileReceiver {
    /// 수신자 생성. 이벤트 스트림을 함께 반환
    pub fn new(config: Config) -> Result<(Self, mpsc::UnboundedReceiver<ReceiverEvent>)> {
        config.validate()?;

        let gate = config
            .gate
            .gates_receiver()
            .then(|| CreditGate::new(Quota::growing(0, config.credit_divisor)));
        let (events, events_rx) = mpsc::unbounded_channel();

        let receiver = Self {
            config,
            state: ReceiverState::Idle,
            file_info: FileInfo::default(),
            reassembler: Reassembler::new(),
            gate,
            pending: None,
            completed: None,
            stats: TransferStats::new(Direction::Incoming),
            events,
        };
        Ok((receiver, events_rx))
    }

    /// 프레임 하나 처리
    ///
    /// 잘못된 컨트롤 프레임은 로그를 남기고 버린다. 에러로 알려주지만
    /// 전송 상태는 바뀌지 않는다.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match Inbound::classify(frame) {
            Ok(Inbound::Control(message)) => {
                debug!(kind = message.kind(), state = ?self.state, "컨트롤 메시지");
                match message {
                    ControlMessage::Begin { file_info } => {
                        self.on_begin(file_info);
                        Ok(())
                    }
                    ControlMessage::End {} => self.on_end(),
                }
            }
            Ok(Inbound::Chunk(data)) => self.on_chunk(data),
            Err(e) => {
                self.stats.malformed_frames += 1;
                warn!(state = ?self.state, "컨트롤 프레임 무시: {}", e);
                Err(e)
            }
        }
    }

    fn on_begin(&mut self, file_info: FileInfo) {
        if self.state == ReceiverState::Receiving {
            warn!(
                received = self.reassembler.received_bytes(),
                "미완료 전송 폐기, 새 전송 시작"
            );
        }
        self.start(file_info);
    }

    /// 전송 레코드 초기화
    fn start(&mut self, file_info: FileInfo) {
        self.reassembler.reset();
        self.pending = None;
        self.completed = None;

        self.stats = TransferStats::new(Direction::Incoming);
        self.stats.total_bytes = file_info.file_size;
        if let Some(size) = file_info.file_size {
            self.stats.total_chunks = self.config.chunk_count(size) as u64;
        }

        if let Some(gate) = &self.gate {
            let expected = match file_info.file_size {
                Some(size) => self.config.chunk_count(size),
                None => 1,
            };
            gate.replace(Quota::growing(expected, self.config.credit_divisor));
        }

        info!(
            file = ?file_info.file_name,
            size = ?file_info.file_size,
            "수신 시작 (begin)"
        );

        self.file_info = file_info.clone();
        self.state = if file_info.file_size == Some(0) {
            ReceiverState::Finalizing
        } else {
            ReceiverState::Receiving
        };
        self.emit(ReceiverEvent::Started(file_info));
    }

    fn on_chunk(&mut self, data: Bytes) -> Result<()> {
        if matches!(self.state, ReceiverState::Idle | ReceiverState::Done) {
            warn!(size = data.len(), "begin 없이 청크 도착, 이름 없는 전송으로 시작");
            self.start(FileInfo::default());
        }

        let received = self.reassembler.received_bytes() + data.len() as u64;
        if let Some(declared) = self.file_info.file_size {
            if received > declared {
                warn!(declared, received, "선언 크기 초과 청크 버림");
                return Err(Error::SizeExceeded { declared, received });
            }
        }

        let size = data.len();
        self.reassembler.push(data);
        self.stats.record_chunk(size);
        if self.file_info.file_size.is_none() {
            self.stats.total_chunks = self.reassembler.chunk_count() as u64;
        }
        if let Some(gate) = &self.gate {
            let count = self.reassembler.chunk_count();
            gate.with_quota(|quota| quota.extend_total(count));
        }

        let total = self.file_info.file_size.unwrap_or(received);
        debug!(size, received, total, "청크 수신");
        self.emit(ReceiverEvent::Progress { received, total });

        if self.file_info.file_size == Some(received) {
            debug!("선언 크기 도달, end 대기");
            self.state = ReceiverState::Finalizing;
        }
        Ok(())
    }

    fn on_end(&mut self) -> Result<()> {
        // 전송당 end는 한 번만 확정
        if self.state == ReceiverState::Done || self.pending.is_some() {
            warn!(state = ?self.state, "이미 확정된 전송의 중복 end 버림");
            return Err(Error::InvalidState {
                from: self.state.as_str(),
                to: ReceiverState::Finalizing.as_str(),
            });
        }
        if self.state == ReceiverState::Idle {
            warn!("begin 없이 end 도착, 빈 파일로 확정");
            self.start(FileInfo::default());
        }

        let received = self.reassembler.received_bytes();
        if let Some(declared) = self.file_info.file_size {
            if received < declared {
                if self.config.strict_size {
                    let err = Error::PrematureEnd { declared, received };
                    warn!("전송 실패: {}", err);
                    self.emit(ReceiverEvent::Failed {
                        reason: err.to_string(),
                    });
                    self.reassembler.reset();
                    self.state = ReceiverState::Idle;
                    return Err(err);
                }
                warn!(declared, received, "선언 크기보다 적게 받은 채로 end, 받은 만큼 확정");
            }
        }

        // 크기를 몰랐으면 받은 만큼으로 확정
        self.file_info.file_size = Some(received);
        self.stats.total_bytes = Some(received);
        self.stats.total_chunks = self.reassembler.chunk_count() as u64;
        self.state = ReceiverState::Finalizing;

        self.pending = Some(ReceivedFile {
            name: self.file_info.file_name.clone(),
            data: self.reassembler.assemble(),
        });
        self.release_pending();
        Ok(())
    }

    /// 지급된 크레딧만큼 청크를 풀어줌
    pub fn apply_credits(&mut self) {
        let Some(gate) = &self.gate else {
            return;
        };

        let mut unlocked = 0usize;
        while gate.try_commit() {
            unlocked += 1;
        }
        if unlocked > 0 {
            let committed = gate.snapshot().committed();
            let bytes = self.reassembler.prefix_bytes(committed);
            self.stats.unlocked_bytes = bytes;
            self.stats.credits = gate.credits();

            let total = self.reassembler.received_bytes();
            info!(unlocked, bytes, total, "청크 잠금 해제");
            self.emit(ReceiverEvent::Unlocked { bytes, total });
        }

        self.release_pending();
    }

    /// 결과물이 준비되고 모두 풀렸으면 완료 처리 (전송당 한 번)
    fn release_pending(&mut self) {
        if self.pending.is_none() {
            return;
        }
        if let Some(gate) = &self.gate {
            if gate.snapshot().committed() < self.reassembler.chunk_count() {
                return;
            }
        }
        let Some(file) = self.pending.take() else {
            return;
        };

        if self.gate.is_none() {
            self.stats.unlocked_bytes = file.data.len() as u64;
        }
        self.stats.finish();
        info!("수신 완료 (end): {}", self.stats.summary());

        self.state = ReceiverState::Done;
        self.completed = Some(file.clone());
        self.emit(ReceiverEvent::Completed(file));
    }

    /// 완성된 결과물 꺼내기
    pub fn take_completed(&mut self) -> Option<ReceivedFile> {
        self.completed.take()
    }

    /// 전송 하나가 완료될 때까지 채널에서 프레임을 받아 처리
    ///
    /// 잘못된 프레임은 건너뛴다. 채널이 닫히거나 취소되면 에러.
    pub async fn run(
        &mut self,
        inbox: &mut Inbox,
        cancel: &CancellationToken,
    ) -> Result<ReceivedFile> {
        let wake = self.gate.as_ref().map(|gate| gate.wake_handle());

        loop {
            if let Some(file) = self.take_completed() {
                return Ok(file);
            }

            tokio::select! {
                frame = inbox.recv() => match frame {
                    Some(frame) => match self.handle_frame(frame) {
                        Err(e @ Error::PrematureEnd { .. }) => return Err(e),
                        Err(e) => debug!("프레임 처리 건너뜀: {}", e),
                        Ok(()) => {}
                    },
                    None => {
                        if self.state != ReceiverState::Idle {
                            self.emit(ReceiverEvent::Failed {
                                reason: Error::ChannelClosed.to_string(),
                            });
                        }
                        return Err(Error::ChannelClosed);
                    }
                },
                _ = async {
                    match &wake {
                        Some(wake) => wake.notified().await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.stats.wakeups += 1;
                    self.apply_credits();
                }
                _ = cancel.cancelled() => {
                    warn!(state = ?self.state, "수신 취소");
                    return Err(Error::Cancelled);
                }
            }
        }
    }

    fn emit(&self, event: ReceiverEvent) {
        let _ = self.events.send(event);
    }

    /// 크레딧 지급 핸들 (수신측 게이트가 꺼져 있으면 None)
    pub fn credit_gate(&self) -> Option<CreditGate> {
        self.gate.clone()
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn file_info(&self) -> &FileInfo {
        &self.file_info
    }

    pub fn received_bytes(&self) -> u64 {
        self.reassembler.received_bytes()
    }

    /// 통계 반환
    pub fn stats(&self) -> TransferStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory_pair;
    use crate::channel::Channel;
    use crate::config::Gate;

    fn begin(name: &str, size: Option<u64>) -> Frame {
        Frame::control(&ControlMessage::begin(FileInfo::new(name, size))).unwrap()
    }

    fn end() -> Frame {
        Frame::control(&ControlMessage::end()).unwrap()
    }

    fn chunk(len: usize, fill: u8) -> Frame {
        Frame::Binary(Bytes::from(vec![fill; len]))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ReceiverEvent>) -> Vec<ReceiverEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn gated_config() -> Config {
        Config {
            gate: Gate::Receiver,
            ..Config::default().with_chunk_size(10)
        }
    }

    #[test]
    fn test_three_chunks_materialize_declared_size() {
        let (mut receiver, mut events) = FileReceiver::new(Config::default()).unwrap();

        receiver.handle_frame(begin("a.bin", Some(133_120))).unwrap();
        assert_eq!(receiver.state(), ReceiverState::Receiving);
        receiver.handle_frame(chunk(65536, 1)).unwrap();
        receiver.handle_frame(chunk(65536, 2)).unwrap();
        receiver.handle_frame(chunk(2048, 3)).unwrap();
        assert_eq!(receiver.state(), ReceiverState::Finalizing);
        receiver.handle_frame(end()).unwrap();

        assert_eq!(receiver.state(), ReceiverState::Done);
        let file = receiver.take_completed().unwrap();
        assert_eq!(file.len(), 133_120);
        assert_eq!(file.name.as_deref(), Some("a.bin"));
        assert_eq!(file.data[65536], 2);

        let events = drain(&mut events);
        assert!(matches!(events[0], ReceiverEvent::Started(_)));
        assert_eq!(
            events[3],
            ReceiverEvent::Progress {
                received: 133_120,
                total: 133_120
            }
        );
        assert!(matches!(events.last(), Some(ReceiverEvent::Completed(_))));
    }

    #[test]
    fn test_empty_file_completes_without_chunks() {
        let (mut receiver, _events) = FileReceiver::new(Config::default()).unwrap();

        receiver.handle_frame(begin("empty", Some(0))).unwrap();
        receiver.handle_frame(end()).unwrap();

        let file = receiver.take_completed().unwrap();
        assert!(file.is_empty());
        assert_eq!(receiver.state(), ReceiverState::Done);
    }

    #[test]
    fn test_unknown_size_uses_received_as_total() {
        let (mut receiver, mut events) = FileReceiver::new(Config::default()).unwrap();

        receiver
            .handle_frame(Frame::Text(
                r#"{"type":"begin","fileInfo":{"fileName":"n","fileSize":null}}"#.into(),
            ))
            .unwrap();
        receiver.handle_frame(chunk(5, 0)).unwrap();
        receiver.handle_frame(chunk(7, 0)).unwrap();
        receiver.handle_frame(end()).unwrap();

        assert_eq!(receiver.file_info().file_size, Some(12));
        let events = drain(&mut events);
        assert_eq!(events[2], ReceiverEvent::Progress { received: 12, total: 12 });
        assert_eq!(receiver.take_completed().unwrap().len(), 12);
    }

    #[test]
    fn test_malformed_control_frame_leaves_state_unchanged() {
        let (mut receiver, _events) = FileReceiver::new(Config::default()).unwrap();
        receiver.handle_frame(begin("a", Some(10))).unwrap();
        receiver.handle_frame(chunk(4, 0)).unwrap();

        let result = receiver.handle_frame(Frame::Text("not json".into()));
        assert!(matches!(result, Err(Error::MalformedControlFrame { .. })));
        let result = receiver.handle_frame(Frame::Text(r#"{"type":"pause"}"#.into()));
        assert!(matches!(result, Err(Error::MalformedControlFrame { .. })));

        assert_eq!(receiver.state(), ReceiverState::Receiving);
        assert_eq!(receiver.received_bytes(), 4);
        assert_eq!(receiver.stats().malformed_frames, 2);
    }

    #[test]
    fn test_premature_end_lenient_and_strict() {
        let (mut lenient, _events) = FileReceiver::new(Config::default()).unwrap();
        lenient.handle_frame(begin("a", Some(100))).unwrap();
        lenient.handle_frame(chunk(40, 0)).unwrap();
        lenient.handle_frame(end()).unwrap();
        assert_eq!(lenient.take_completed().unwrap().len(), 40);
        assert_eq!(lenient.file_info().file_size, Some(40));

        let config = Config {
            strict_size: true,
            ..Config::default()
        };
        let (mut strict, mut events) = FileReceiver::new(config).unwrap();
        strict.handle_frame(begin("a", Some(100))).unwrap();
        strict.handle_frame(chunk(40, 0)).unwrap();
        let result = strict.handle_frame(end());
        assert!(matches!(
            result,
            Err(Error::PrematureEnd {
                declared: 100,
                received: 40
            })
        ));
        assert!(strict.take_completed().is_none());
        assert_eq!(strict.state(), ReceiverState::Idle);
        assert!(matches!(
            drain(&mut events).last(),
            Some(ReceiverEvent::Failed { .. })
        ));
    }

    #[test]
    fn test_oversize_chunk_is_rejected() {
        let (mut receiver, _events) = FileReceiver::new(Config::default()).unwrap();
        receiver.handle_frame(begin("a", Some(10))).unwrap();
        receiver.handle_frame(chunk(8, 0)).unwrap();

        let result = receiver.handle_frame(chunk(8, 0));
        assert!(matches!(
            result,
            Err(Error::SizeExceeded {
                declared: 10,
                received: 16
            })
        ));
        assert_eq!(receiver.received_bytes(), 8);
    }

    #[test]
    fn test_end_without_begin_is_empty_unnamed_file() {
        let (mut receiver, _events) = FileReceiver::new(Config::default()).unwrap();
        receiver.handle_frame(end()).unwrap();

        let file = receiver.take_completed().unwrap();
        assert!(file.is_empty());
        assert_eq!(file.name, None);
        assert_eq!(file.safe_name(), FALLBACK_FILE_NAME);
    }

    #[test]
    fn test_duplicate_end_does_not_complete_twice() {
        let (mut receiver, mut events) = FileReceiver::new(Config::default()).unwrap();
        receiver.handle_frame(begin("abc.txt", Some(3))).unwrap();
        receiver.handle_frame(Frame::Binary(Bytes::from_static(b"abc"))).unwrap();
        receiver.handle_frame(end()).unwrap();
        assert_eq!(receiver.take_completed().unwrap().len(), 3);

        let result = receiver.handle_frame(end());
        assert!(matches!(
            result,
            Err(Error::InvalidState {
                from: "done",
                to: "finalizing"
            })
        ));
        assert_eq!(receiver.state(), ReceiverState::Done);
        assert!(receiver.take_completed().is_none());

        let completed = drain(&mut events)
            .into_iter()
            .filter(|event| matches!(event, ReceiverEvent::Completed(_)))
            .count();
        assert_eq!(completed, 1);
    }

    #[test]
    fn test_duplicate_end_while_locked_is_dropped() {
        let (mut receiver, mut events) = FileReceiver::new(gated_config()).unwrap();
        receiver.handle_frame(begin("g", Some(30))).unwrap();
        for fill in 0..3 {
            receiver.handle_frame(chunk(10, fill)).unwrap();
        }
        receiver.handle_frame(end()).unwrap();
        assert!(receiver.handle_frame(end()).is_err());
        assert_eq!(receiver.state(), ReceiverState::Finalizing);

        let gate = receiver.credit_gate().unwrap();
        for _ in 0..3 {
            gate.grant_credit();
        }
        receiver.apply_credits();

        assert_eq!(receiver.take_completed().unwrap().len(), 30);
        let completed = drain(&mut events)
            .into_iter()
            .filter(|event| matches!(event, ReceiverEvent::Completed(_)))
            .count();
        assert_eq!(completed, 1);
    }

    #[test]
    fn test_chunk_without_begin_starts_implicit_transfer() {
        let (mut receiver, _events) = FileReceiver::new(Config::default()).unwrap();
        receiver.handle_frame(chunk(3, 9)).unwrap();
        assert_eq!(receiver.state(), ReceiverState::Receiving);
        receiver.handle_frame(end()).unwrap();

        assert_eq!(receiver.take_completed().unwrap().data.as_ref(), &[9, 9, 9]);
    }

    #[test]
    fn test_new_begin_discards_incomplete_transfer() {
        let (mut receiver, _events) = FileReceiver::new(Config::default()).unwrap();
        receiver.handle_frame(begin("old", Some(100))).unwrap();
        receiver.handle_frame(chunk(50, 1)).unwrap();

        receiver.handle_frame(begin("new", Some(2))).unwrap();
        receiver.handle_frame(chunk(2, 2)).unwrap();
        receiver.handle_frame(end()).unwrap();

        let file = receiver.take_completed().unwrap();
        assert_eq!(file.name.as_deref(), Some("new"));
        assert_eq!(file.data.as_ref(), &[2, 2]);
    }

    #[test]
    fn test_receiver_gate_unlocks_per_credit() {
        let (mut receiver, mut events) = FileReceiver::new(gated_config()).unwrap();
        let gate = receiver.credit_gate().unwrap();

        // 22청크, K=22 -> 크레딧당 1청크
        receiver.handle_frame(begin("g", Some(220))).unwrap();
        for _ in 0..22 {
            receiver.handle_frame(chunk(10, 0)).unwrap();
        }
        receiver.handle_frame(end()).unwrap();
        assert!(receiver.take_completed().is_none());
        assert_eq!(receiver.state(), ReceiverState::Finalizing);
        drain(&mut events);

        gate.grant_credit();
        receiver.apply_credits();
        assert_eq!(
            drain(&mut events),
            vec![ReceiverEvent::Unlocked { bytes: 10, total: 220 }]
        );

        for _ in 1..22 {
            gate.grant_credit();
            receiver.apply_credits();
        }
        let file = receiver.take_completed().unwrap();
        assert_eq!(file.len(), 220);
        assert_eq!(receiver.stats().unlocked_bytes, 220);
    }

    #[test]
    fn test_credits_without_buffered_chunks_are_not_banked() {
        let (mut receiver, _events) = FileReceiver::new(gated_config()).unwrap();
        let gate = receiver.credit_gate().unwrap();

        receiver.handle_frame(begin("g", Some(30))).unwrap();
        gate.grant_credit();
        gate.grant_credit();
        receiver.apply_credits();
        assert_eq!(receiver.stats().unlocked_bytes, 0);

        receiver.handle_frame(chunk(10, 0)).unwrap();
        receiver.handle_frame(chunk(10, 0)).unwrap();
        receiver.apply_credits();
        assert_eq!(receiver.stats().unlocked_bytes, 0);

        gate.grant_credit();
        receiver.apply_credits();
        assert_eq!(receiver.stats().unlocked_bytes, 10);
    }

    #[test]
    fn test_safe_name_strips_path() {
        let file = ReceivedFile {
            name: Some("../../etc/passwd".into()),
            data: Bytes::new(),
        };
        assert_eq!(file.safe_name(), "passwd");

        let file = ReceivedFile {
            name: Some("..".into()),
            data: Bytes::new(),
        };
        assert_eq!(file.safe_name(), FALLBACK_FILE_NAME);
    }

    #[tokio::test]
    async fn test_save_to_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = ReceivedFile {
            name: Some("hello.txt".into()),
            data: Bytes::from_static(b"hi"),
        };

        let path = file.save_to(dir.path().join("out")).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "hello.txt");
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_run_over_channel_with_credit_wakeups() {
        let ((a, _), (_b, mut inbox)) = memory_pair("data");
        let (mut receiver, _events) = FileReceiver::new(gated_config()).unwrap();
        let gate = receiver.credit_gate().unwrap();

        a.send(begin("r", Some(20))).await.unwrap();
        a.send(chunk(10, 1)).await.unwrap();
        a.send(chunk(10, 2)).await.unwrap();
        a.send(end()).await.unwrap();

        let granter = tokio::spawn(async move {
            for _ in 0..2 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                gate.grant_credit();
            }
        });

        let cancel = CancellationToken::new();
        let file = receiver.run(&mut inbox, &cancel).await.unwrap();
        granter.await.unwrap();
        assert_eq!(file.len(), 20);
        assert_eq!(receiver.state(), ReceiverState::Done);
    }

    #[tokio::test]
    async fn test_run_reports_closed_channel() {
        let ((a, _), (_b, mut inbox)) = memory_pair("data");
        let (mut receiver, mut events) = FileReceiver::new(Config::default()).unwrap();

        a.send(begin("r", Some(20))).await.unwrap();
        a.close().await.unwrap();

        let cancel = CancellationToken::new();
        let result = receiver.run(&mut inbox, &cancel).await;
        assert!(matches!(result, Err(Error::ChannelClosed)));
        assert!(matches!(
            drain(&mut events).last(),
            Some(ReceiverEvent::Failed { .. })
        ));
    }
}
