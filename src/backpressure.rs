//! 백프레셔 컨트롤러
//!
//! 채널 버퍼 게이지를 고수위/저수위 두 임계값으로 묶어둔다.
//! - 게이지 <= HIGH 인 동안만 다음 청크를 보낸다
//! - 게이지가 LOW 아래로 내려오면 채널이 wake를 깨워 송신 루프 재개
//!
//! 레벨 트리거 방식이라 중복 알림은 무해하다. 와이어에는 아무것도 나가지 않는다.

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::debug;

use crate::channel::Channel;
use crate::{Config, Error, Result};

/// 저수위/고수위 임계값 (LOW < HIGH)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: usize,
    pub high: usize,
}

impl Watermarks {
    pub fn new(low: usize, high: usize) -> Result<Self> {
        if low >= high {
            return Err(Error::InvalidConfig(format!(
                "low_watermark({low})는 high_watermark({high})보다 작아야 함"
            )));
        }
        Ok(Self { low, high })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.low_watermark, config.high_watermark)
    }
}

/// 백프레셔 컨트롤러
#[derive(Debug)]
pub struct BackpressureController {
    watermarks: Watermarks,

    /// 송신 루프 재개 신호 (저수위 알림, 크레딧 지급이 공유)
    wake: Arc<Notify>,
}

impl BackpressureController {
    pub fn new(watermarks: Watermarks) -> Self {
        Self {
            watermarks,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn watermarks(&self) -> Watermarks {
        self.watermarks
    }

    /// 재개 신호 핸들 (쿼터 등 다른 재개 트리거와 공유)
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// 채널에 저수위 알림 등록
    pub async fn attach(&self, channel: &dyn Channel) {
        channel
            .set_low_watermark(self.watermarks.low, self.wake.clone())
            .await;
    }

    /// 게이지 값에 대해 다음 청크를 보내도 되는지
    pub fn may_send(&self, buffered: usize) -> bool {
        buffered <= self.watermarks.high
    }

    /// 채널 게이지를 읽어 송신 여부 결정
    pub async fn admit(&self, channel: &dyn Channel) -> bool {
        let buffered = channel.buffered_amount().await;
        if self.may_send(buffered) {
            return true;
        }

        debug!(
            buffered,
            high = self.watermarks.high,
            "backpressure: 고수위 초과, 송신 중단"
        );
        false
    }

    /// 송신 루프 깨우기 (여러 번 불러도 한 번 깨우는 것과 같음)
    pub fn resume(&self) {
        self.wake.notify_one();
    }

    /// 재개 신호 대기
    pub async fn wait(&self) {
        self.wake.notified().await;
    }
}
