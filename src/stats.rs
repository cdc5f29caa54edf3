//! 전송 통계

use std::time::{Duration, Instant};

/// 전송 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// 전송 하나에 대한 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 전송 방향
    pub direction: Direction,

    /// 시작 시간
    pub start_time: Instant,

    /// 완료 시간
    pub finish_time: Option<Instant>,

    /// 전체 청크 수 (수신측은 받은 만큼)
    pub total_chunks: u64,

    /// 전체 바이트 (모르면 None)
    pub total_bytes: Option<u64>,

    /// 채널을 넘어간(받은) 청크 수
    pub chunks: u64,

    /// 채널을 넘어간(받은) 바이트
    pub bytes: u64,

    /// 잠금 해제된 바이트 (수신측 게이트)
    pub unlocked_bytes: u64,

    /// 고수위 초과로 멈춘 횟수
    pub backpressure_pauses: u64,

    /// 루프 재개 횟수 (저수위 알림 또는 크레딧)
    pub wakeups: u64,

    /// 지급된 크레딧 수
    pub credits: u64,

    /// 무시된 잘못된 컨트롤 프레임 수
    pub malformed_frames: u64,
}

impl TransferStats {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            start_time: Instant::now(),
            finish_time: None,
            total_chunks: 0,
            total_bytes: None,
            chunks: 0,
            bytes: 0,
            unlocked_bytes: 0,
            backpressure_pauses: 0,
            wakeups: 0,
            credits: 0,
            malformed_frames: 0,
        }
    }

    /// 청크 하나 기록
    pub fn record_chunk(&mut self, size: usize) {
        self.chunks += 1;
        self.bytes += size as u64;
    }

    /// 완료 표시
    pub fn finish(&mut self) {
        if self.finish_time.is_none() {
            self.finish_time = Some(Instant::now());
        }
    }

    /// 경과 시간 (완료되었으면 완료 시점까지)
    pub fn elapsed(&self) -> Duration {
        match self.finish_time {
            Some(finish) => finish.duration_since(self.start_time),
            None => self.start_time.elapsed(),
        }
    }

    /// 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes as f64 / elapsed
    }

    /// 진행률 (0.0 ~ 1.0). 전체 크기를 모르면 None
    pub fn progress(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some((self.bytes as f64 / total as f64).min(1.0)),
            None => None,
        }
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        let total = match self.total_bytes {
            Some(total) => total.to_string(),
            None => "?".to_string(),
        };
        format!(
            "{:?} | Elapsed: {:.2}s | Chunks: {}/{} | Bytes: {}/{} | Throughput: {:.2} MB/s | Pauses: {} | Wakeups: {} | Credits: {}",
            self.direction,
            self.elapsed().as_secs_f64(),
            self.chunks,
            self.total_chunks,
            self.bytes,
            total,
            self.throughput() / 1_000_000.0,
            self.backpressure_pauses,
            self.wakeups,
            self.credits,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new(Direction::Outgoing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress() {
        let mut stats = TransferStats::new(Direction::Incoming);
        assert_eq!(stats.progress(), None);

        stats.total_bytes = Some(200);
        stats.record_chunk(50);
        assert_eq!(stats.progress(), Some(0.25));
        assert_eq!(stats.chunks, 1);

        stats.total_bytes = Some(0);
        assert_eq!(stats.progress(), Some(1.0));
    }

    #[test]
    fn test_finish_freezes_elapsed() {
        let mut stats = TransferStats::default();
        stats.finish();
        let first = stats.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(stats.elapsed(), first);
        assert!(stats.summary().contains("Outgoing"));
    }
}
