//! 입장 제어 쿼터 (크레딧 게이트)
//!
//! 채널 용량과 무관하게, 외부 보상 신호(크레딧)로만 늘어나는 인위적 상한.
//! - 송신측: 와이어를 넘어갈 수 있는 청크 수를 제한
//! - 수신측: 이미 받은 청크 중 사용자에게 풀어줄(unlock) 청크 수를 제한
//!
//! 불변식: `committed <= allowed <= total`. allowed는 줄어들지 않는다.
//! 컨트롤 메시지(`begin`/`end`)는 쿼터의 영향을 받지 않는다.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

/// 쿼터 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    /// 전체 청크 수 (수신측은 받은 만큼 늘어남)
    total_chunks: usize,

    /// 허용된 청크 수
    allowed: usize,

    /// 실제로 나간(또는 풀린) 청크 수
    committed: usize,

    /// 크레딧 1회당 증가량 = max(기준 / divisor, 1)
    step: usize,
}

impl Quota {
    /// 송신측 쿼터: 전체 청크 수를 알고 시작
    pub fn new(total_chunks: usize, divisor: usize) -> Self {
        Self {
            total_chunks,
            allowed: 0,
            committed: 0,
            step: credit_step(total_chunks, divisor),
        }
    }

    /// 게이트가 꺼진 경우: 처음부터 전부 허용
    pub fn unlimited(total_chunks: usize) -> Self {
        Self {
            total_chunks,
            allowed: total_chunks,
            committed: 0,
            step: total_chunks.max(1),
        }
    }

    /// 수신측 쿼터: 전체는 0에서 시작해 청크가 도착할 때마다 늘어남.
    /// 증가량은 예상 청크 수(`expected_chunks`) 기준
    pub fn growing(expected_chunks: usize, divisor: usize) -> Self {
        Self {
            total_chunks: 0,
            allowed: 0,
            committed: 0,
            step: credit_step(expected_chunks, divisor),
        }
    }

    /// 크레딧 1회 지급. 새 allowed 반환
    pub fn grant_credit(&mut self) -> usize {
        self.allowed = (self.allowed + self.step).min(self.total_chunks).max(self.allowed);
        self.allowed
    }

    /// 다음 청크를 내보낼 수 있는지
    pub fn is_committable(&self) -> bool {
        self.committed < self.allowed
    }

    /// 청크 하나 커밋. 허용 범위를 넘으면 false
    pub fn commit(&mut self) -> bool {
        if !self.is_committable() {
            return false;
        }
        self.committed += 1;
        true
    }

    /// 전체 청크 수 증가 (수신측). 줄어들지는 않음
    pub fn extend_total(&mut self, total_chunks: usize) {
        self.total_chunks = self.total_chunks.max(total_chunks);
    }

    /// 게이트 해제: 현재 전체를 모두 허용
    pub fn allow_all(&mut self) {
        self.allowed = self.total_chunks;
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    pub fn allowed(&self) -> usize {
        self.allowed
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// 전부 커밋되었는지
    pub fn is_exhausted(&self) -> bool {
        self.committed >= self.total_chunks
    }
}

/// max(total / divisor, 1)
pub fn credit_step(total_chunks: usize, divisor: usize) -> usize {
    (total_chunks / divisor.max(1)).max(1)
}

/// 공유 쿼터 핸들
///
/// UI 쪽 크레딧 이벤트와 송수신 루프가 같은 쿼터를 본다.
/// 크레딧이 지급되면 wake를 깨워 루프가 다시 돌게 한다.
#[derive(Debug, Clone)]
pub struct CreditGate {
    quota: Arc<Mutex<Quota>>,
    wake: Arc<Notify>,
    credits: Arc<AtomicU64>,
}

impl CreditGate {
    pub fn new(quota: Quota) -> Self {
        Self::with_wake(quota, Arc::new(Notify::new()))
    }

    /// 재개 신호를 다른 트리거(저수위 알림)와 공유
    pub fn with_wake(quota: Quota, wake: Arc<Notify>) -> Self {
        Self {
            quota: Arc::new(Mutex::new(quota)),
            wake,
            credits: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 크레딧 1단위 지급 (외부 이벤트 진입점)
    pub fn grant_credit(&self) -> usize {
        let (allowed, total) = {
            let mut quota = self.quota.lock();
            (quota.grant_credit(), quota.total_chunks())
        };
        let credits = self.credits.fetch_add(1, Ordering::Relaxed) + 1;
        info!(allowed, total, credits, "크레딧 지급");

        self.wake.notify_one();
        allowed
    }

    pub fn is_committable(&self) -> bool {
        self.quota.lock().is_committable()
    }

    /// 청크 하나 커밋 시도
    pub fn try_commit(&self) -> bool {
        let committed = self.quota.lock().commit();
        if !committed {
            debug!("쿼터 소진, 크레딧 대기");
        }
        committed
    }

    /// 쿼터 교체 (새 전송 시작)
    pub fn replace(&self, quota: Quota) {
        *self.quota.lock() = quota;
    }

    /// 쿼터에 직접 접근
    pub fn with_quota<R>(&self, f: impl FnOnce(&mut Quota) -> R) -> R {
        f(&mut *self.quota.lock())
    }

    /// 현재 상태 복사본
    pub fn snapshot(&self) -> Quota {
        self.quota.lock().clone()
    }

    /// 지금까지 받은 크레딧 수
    pub fn credits(&self) -> u64 {
        self.credits.load(Ordering::Relaxed)
    }

    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// 재개 신호 대기
    pub async fn notified(&self) {
        self.wake.notified().await;
    }
}
