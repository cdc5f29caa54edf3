//! 채널 추상화
//!
//! 피어 사이의 순서 보장 + 신뢰성 있는 양방향 메시지 파이프.
//! 송신 쪽은 `Channel` 트레이트, 수신 쪽은 `Inbox`로 나뉜다.
//!
//! 버퍼 게이지(`buffered_amount`)는 큐에 들어갔지만 아직 상대에게 소비되지 않은
//! 바이트 수다. 게이지가 저수위 임계값 위에서 아래로 내려오는 순간 등록된
//! `Notify`를 깨운다.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::message::Frame;
use crate::{Error, Result};

/// 양방향 메시지 채널 (송신 측면)
#[async_trait]
pub trait Channel: Send + Sync {
    /// 채널 라벨
    fn label(&self) -> &str;

    /// 열려 있는지
    fn is_open(&self) -> bool;

    /// 아직 상대에게 전달되지 않은 버퍼 바이트 수
    async fn buffered_amount(&self) -> usize;

    /// 프레임 하나를 큐에 넣음. 닫힌 채널이면 `ChannelClosed`
    async fn send(&self, frame: Frame) -> Result<()>;

    /// 게이지가 `threshold` 위에서 이하로 내려올 때 `wake`를 깨우도록 등록
    async fn set_low_watermark(&self, threshold: usize, wake: Arc<Notify>);

    /// 채널 닫기
    async fn close(&self) -> Result<()>;
}

/// 버퍼 게이지
#[derive(Debug, Default)]
pub struct BufferGauge {
    buffered: AtomicUsize,
    low: Mutex<Option<(usize, Arc<Notify>)>>,
}

impl BufferGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    /// 큐에 들어간 바이트 추가
    pub fn add(&self, bytes: usize) {
        self.buffered.fetch_add(bytes, Ordering::SeqCst);
    }

    /// 소비된 바이트 반영. 임계값을 위에서 아래로 넘으면 wake
    pub fn release(&self, bytes: usize) {
        let prev = self
            .buffered
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(bytes))
            })
            .unwrap_or(0);
        let now = prev.saturating_sub(bytes);

        if let Some((threshold, wake)) = self.low.lock().as_ref() {
            if prev > *threshold && now <= *threshold {
                debug!(buffered = now, threshold = *threshold, "buffered amount low");
                wake.notify_one();
            }
        }
    }

    pub fn set_low_watermark(&self, threshold: usize, wake: Arc<Notify>) {
        *self.low.lock() = Some((threshold, wake));
    }
}

/// 수신 프레임 스트림 (수신 측면)
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Frame>,

    /// 상대 송신측 게이지. 꺼낼 때마다 소비 반영
    gauge: Option<Arc<BufferGauge>>,
}

impl Inbox {
    pub fn new(rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self { rx, gauge: None }
    }

    fn with_gauge(rx: mpsc::UnboundedReceiver<Frame>, gauge: Arc<BufferGauge>) -> Self {
        Self {
            rx,
            gauge: Some(gauge),
        }
    }

    /// 다음 프레임. 채널이 닫히고 비면 None
    pub async fn recv(&mut self) -> Option<Frame> {
        let frame = self.rx.recv().await?;
        self.consumed(&frame);
        Some(frame)
    }

    /// 대기 없이 꺼내기
    pub fn try_recv(&mut self) -> Option<Frame> {
        let frame = self.rx.try_recv().ok()?;
        self.consumed(&frame);
        Some(frame)
    }

    fn consumed(&self, frame: &Frame) {
        if let Some(gauge) = &self.gauge {
            gauge.release(frame.len());
        }
    }
}

/// 한 방향 링크
struct Link {
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    gauge: Arc<BufferGauge>,
}

struct PairShared {
    open: AtomicBool,
    links: [Link; 2],
}

/// 프로세스 내 채널 (테스트, 루프백용)
///
/// 한쪽이 닫으면 양쪽 모두 닫힌다.
pub struct MemoryChannel {
    label: String,
    side: usize,
    shared: Arc<PairShared>,
}

/// 연결된 메모리 채널 한 쌍 생성
pub fn memory_pair(label: &str) -> ((MemoryChannel, Inbox), (MemoryChannel, Inbox)) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    let gauge_a = Arc::new(BufferGauge::new());
    let gauge_b = Arc::new(BufferGauge::new());

    // links[0]: a -> b, links[1]: b -> a
    let shared = Arc::new(PairShared {
        open: AtomicBool::new(true),
        links: [
            Link {
                tx: Mutex::new(Some(tx_a)),
                gauge: gauge_a.clone(),
            },
            Link {
                tx: Mutex::new(Some(tx_b)),
                gauge: gauge_b.clone(),
            },
        ],
    });

    let a = MemoryChannel {
        label: label.to_string(),
        side: 0,
        shared: shared.clone(),
    };
    let b = MemoryChannel {
        label: label.to_string(),
        side: 1,
        shared,
    };

    (
        (a, Inbox::with_gauge(rx_b, gauge_b)),
        (b, Inbox::with_gauge(rx_a, gauge_a)),
    )
}

impl MemoryChannel {
    fn link(&self) -> &Link {
        &self.shared.links[self.side]
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    async fn buffered_amount(&self) -> usize {
        self.link().gauge.get()
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }

        let link = self.link();
        let guard = link.tx.lock();
        let tx = guard.as_ref().ok_or(Error::ChannelClosed)?;

        let len = frame.len();
        link.gauge.add(len);
        if tx.send(frame).is_err() {
            link.gauge.release(len);
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }

    async fn set_low_watermark(&self, threshold: usize, wake: Arc<Notify>) {
        self.link().gauge.set_low_watermark(threshold, wake);
    }

    async fn close(&self) -> Result<()> {
        if self.shared.open.swap(false, Ordering::SeqCst) {
            debug!(channel = %self.label, "memory channel closed");
        }
        for link in &self.shared.links {
            link.tx.lock().take();
        }
        Ok(())
    }
}
