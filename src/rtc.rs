//! WebRTC 연결 계층
//!
//! - 순서 보장 + 신뢰성 데이터 채널 하나 (`data`)
//! - ICE 후보를 모두 모은 뒤 세션 기술을 내보냄 (trickle 없음)
//! - 문자열 메시지는 컨트롤 프레임, 바이너리는 청크
//! - 네이티브 `buffered_amount_low` 콜백이 저수위 알림

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::channel::{Channel, Inbox};
use crate::message::Frame;
use crate::session::Connectivity;
use crate::signaling::{SdpKind, SessionDescription};
use crate::{Config, Error, Result, CONTROL_CHANNEL_LABEL};

/// 데이터 채널 어댑터
pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    opened: Arc<Notify>,
}

impl WebRtcChannel {
    /// 핸들러 등록. 수신 프레임은 Inbox로 나간다
    fn attach(dc: Arc<RTCDataChannel>) -> (Self, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let opened = Arc::new(Notify::new());

        let on_message_tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let frame = if msg.is_string {
                Frame::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                Frame::Binary(msg.data)
            };
            if let Some(tx) = on_message_tx.lock().as_ref() {
                let _ = tx.send(frame);
            }
            Box::pin(async {})
        }));

        let label = dc.label().to_string();
        dc.on_close(Box::new(move || {
            debug!(channel = %label, "data channel closed");
            tx.lock().take();
            Box::pin(async {})
        }));

        let on_open = opened.clone();
        dc.on_open(Box::new(move || {
            on_open.notify_one();
            Box::pin(async {})
        }));

        (Self { dc, opened }, Inbox::new(rx))
    }

    /// 채널이 열릴 때까지 대기
    async fn wait_open(&self, timeout: Duration) -> Result<()> {
        let wait = async {
            loop {
                match self.dc.ready_state() {
                    RTCDataChannelState::Open => return Ok(()),
                    RTCDataChannelState::Closing | RTCDataChannelState::Closed => {
                        return Err(Error::ChannelClosed)
                    }
                    _ => self.opened.notified().await,
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::HandshakeTimeout {
                waited_ms: timeout.as_millis() as u64,
            })?
    }
}

#[async_trait]
impl Channel for WebRtcChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }

        let result = match frame {
            Frame::Text(text) => self.dc.send_text(text).await,
            Frame::Binary(data) => self.dc.send(&data).await,
        };
        result.map(|_| ()).map_err(|e| {
            if self.is_open() {
                Error::WebRtc(e)
            } else {
                Error::ChannelClosed
            }
        })
    }

    async fn set_low_watermark(&self, threshold: usize, wake: Arc<Notify>) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
        self.dc
            .on_buffered_amount_low(Box::new(move || {
                wake.notify_one();
                Box::pin(async {})
            }))
            .await;
    }

    async fn close(&self) -> Result<()> {
        self.dc.close().await?;
        Ok(())
    }
}

/// 피어 연결 하나와 그 실패 신호
#[derive(Clone)]
struct Peer {
    pc: Arc<RTCPeerConnection>,
    failed: Arc<Notify>,
}

/// WebRTC 연결 계층
pub struct WebRtcConnectivity {
    api: API,
    rtc_config: RTCConfiguration,
    gather_timeout: Duration,
    open_timeout: Duration,

    /// 현재 시도의 피어 연결 (reset 시 교체)
    peer: Mutex<Peer>,

    /// ICE 수집 완료 신호
    gather: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,

    /// 열린(또는 열릴) 데이터 채널
    channel_tx: mpsc::UnboundedSender<(WebRtcChannel, Inbox)>,
    channel_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(WebRtcChannel, Inbox)>>,
}

impl WebRtcConnectivity {
    pub async fn new(config: &Config) -> Result<Self> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let peer = new_peer(&api, rtc_config.clone(), channel_tx.clone()).await?;

        Ok(Self {
            api,
            rtc_config,
            gather_timeout: Duration::from_millis(config.ice_gather_timeout_ms),
            open_timeout: Duration::from_millis(config.handshake_timeout_ms),
            peer: Mutex::new(peer),
            gather: tokio::sync::Mutex::new(None),
            channel_tx,
            channel_rx: tokio::sync::Mutex::new(channel_rx),
        })
    }

    fn peer(&self) -> Peer {
        self.peer.lock().clone()
    }

    /// 수집 완료 신호를 잡아두고 로컬 기술 설정
    async fn set_local(&self, desc: RTCSessionDescription) -> Result<()> {
        let pc = self.peer().pc;
        let gather = pc.gathering_complete_promise().await;
        pc.set_local_description(desc).await?;
        *self.gather.lock().await = Some(gather);
        Ok(())
    }
}

/// 피어 연결 생성, 상태와 원격 채널 핸들러 등록
async fn new_peer(
    api: &API,
    rtc_config: RTCConfiguration,
    channel_tx: mpsc::UnboundedSender<(WebRtcChannel, Inbox)>,
) -> Result<Peer> {
    let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

    let failed = Arc::new(Notify::new());
    let on_failed = failed.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        info!(?state, "peer connection state");
        if state == RTCPeerConnectionState::Failed {
            on_failed.notify_one();
        }
        Box::pin(async {})
    }));

    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        debug!(channel = %dc.label(), "remote data channel");
        let _ = channel_tx.send(WebRtcChannel::attach(dc));
        Box::pin(async {})
    }));

    Ok(Peer { pc, failed })
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone())?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone())?,
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(Error::HandshakeFailure(format!(
            "지원하지 않는 세션 기술: {other}"
        ))),
    }
}

#[async_trait]
impl Connectivity for WebRtcConnectivity {
    async fn create_offer(&self) -> Result<()> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let pc = self.peer().pc;
        let dc = pc.create_data_channel(CONTROL_CHANNEL_LABEL, Some(init)).await?;
        let _ = self.channel_tx.send(WebRtcChannel::attach(dc));

        let offer = pc.create_offer(None).await?;
        self.set_local(offer).await
    }

    async fn accept_offer(&self, offer: &SessionDescription) -> Result<()> {
        let pc = self.peer().pc;
        pc.set_remote_description(to_rtc(offer)?).await?;
        let answer = pc.create_answer(None).await?;
        self.set_local(answer).await
    }

    async fn local_description(&self) -> Result<SessionDescription> {
        if let Some(mut gather) = self.gather.lock().await.take() {
            if tokio::time::timeout(self.gather_timeout, gather.recv())
                .await
                .is_err()
            {
                warn!(
                    timeout_ms = self.gather_timeout.as_millis() as u64,
                    "ICE 수집 타임아웃, 모인 후보로 진행"
                );
            }
        }

        let desc = self
            .peer()
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::HandshakeFailure("로컬 세션 기술 없음".into()))?;
        from_rtc(desc)
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<()> {
        self.peer().pc.set_remote_description(to_rtc(answer)?).await?;
        Ok(())
    }

    async fn wait_channel(&self) -> Result<(Arc<dyn Channel>, Inbox)> {
        let failed = self.peer().failed;
        let (channel, inbox) = {
            let mut rx = self.channel_rx.lock().await;
            tokio::select! {
                next = rx.recv() => next.ok_or_else(|| Error::HandshakeFailure("데이터 채널 없음".into()))?,
                _ = failed.notified() => {
                    return Err(Error::HandshakeFailure("피어 연결 실패".into()));
                }
            }
        };

        tokio::select! {
            result = channel.wait_open(self.open_timeout) => result?,
            _ = failed.notified() => {
                return Err(Error::HandshakeFailure("피어 연결 실패".into()));
            }
        }

        info!(channel = %channel.label(), "data channel open");
        Ok((Arc::new(channel) as Arc<dyn Channel>, inbox))
    }

    async fn reset(&self) -> Result<()> {
        let fresh = new_peer(&self.api, self.rtc_config.clone(), self.channel_tx.clone()).await?;
        let stale = std::mem::replace(&mut *self.peer.lock(), fresh);
        stale.pc.close().await?;

        self.gather.lock().await.take();
        let mut rx = self.channel_rx.lock().await;
        while let Ok((channel, _)) = rx.try_recv() {
            debug!(channel = %channel.label(), "이전 시도의 데이터 채널 폐기");
            if let Err(e) = channel.close().await {
                warn!("데이터 채널 닫기 실패: {}", e);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer().pc.close().await?;
        Ok(())
    }
}
