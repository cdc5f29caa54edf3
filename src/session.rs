//! 세션 / 핸드쉐이크
//!
//! 릴레이를 통해 세션 기술을 주고받아 두 피어 사이에 채널을 연다.
//!
//! - 개시자: `Idle -> Creating -> Gathering -> Waiting -> Connecting -> Connected`
//! - 응답자: `Idle -> Connecting -> AnswerPosted -> Connected`
//!
//! 릴레이 오류, `NotFound`, 타임아웃, 취소는 연결 계층을 초기화하고 `Idle`로 되돌린다.
//! 연결 계층 자체가 실패하면 `Failed`. 명시적으로 닫으면 `Disconnected` (이후 상태 고정).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{memory_pair, Channel, Inbox, MemoryChannel};
use crate::signaling::{Relay, SdpKind, SessionDescription};
use crate::{Config, Error, Result};

/// 세션 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Creating,
    Gathering,
    Waiting,
    Connecting,
    AnswerPosted,
    Connected,
    Disconnected,
    Failed,
}

/// 점대점 연결 계층 (ICE 등)
#[async_trait]
pub trait Connectivity: Send + Sync {
    /// 오퍼 생성 시작
    async fn create_offer(&self) -> Result<()>;

    /// 상대 오퍼 적용 후 응답 생성 시작
    async fn accept_offer(&self, offer: &SessionDescription) -> Result<()>;

    /// 후보 수집이 끝난 로컬 세션 기술
    async fn local_description(&self) -> Result<SessionDescription>;

    /// 상대 응답 적용
    async fn apply_answer(&self, answer: &SessionDescription) -> Result<()>;

    /// 채널이 열릴 때까지 대기
    async fn wait_channel(&self) -> Result<(Arc<dyn Channel>, Inbox)>;

    /// 실패한 시도의 자원을 버리고 다음 시도를 준비
    async fn reset(&self) -> Result<()>;

    /// 연결 자원 해제
    async fn close(&self) -> Result<()>;
}

/// 연결된 채널
pub struct Established {
    pub channel: Arc<dyn Channel>,
    pub inbox: Inbox,
}

/// 세션 (전송 시도 하나)
pub struct Session {
    config: Config,
    relay: Arc<dyn Relay>,
    connectivity: Arc<dyn Connectivity>,
    role: Mutex<Option<Role>>,
    state: watch::Sender<SessionState>,

    /// 릴레이 식별자
    identifier: Mutex<Option<String>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    channel: Mutex<Option<Arc<dyn Channel>>>,

    /// 폴링 타이머, 대기 중인 핸드쉐이크 취소
    cancel: CancellationToken,

    /// close() 호출 여부
    closed: AtomicBool,
}

impl Session {
    pub fn new(config: Config, relay: Arc<dyn Relay>, connectivity: Arc<dyn Connectivity>) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            config,
            relay,
            connectivity,
            role: Mutex::new(None),
            state,
            identifier: Mutex::new(None),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            channel: Mutex::new(None),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// 개시자로 연결: 오퍼 게시 후 응답이 올 때까지 폴링
    pub async fn create_as_initiator(&self) -> Result<Established> {
        self.publish_offer().await?;
        self.await_answer().await
    }

    /// 오퍼 생성, 후보 수집, 릴레이 게시. 식별자 반환 (Waiting)
    pub async fn publish_offer(&self) -> Result<String> {
        self.begin(Role::Initiator)?;

        let result: Result<String> = async {
            self.set_state(SessionState::Creating);
            self.connectivity.create_offer().await?;

            self.set_state(SessionState::Gathering);
            let offer = self.guarded(self.connectivity.local_description()).await?;
            *self.local.lock() = Some(offer.clone());

            let id = self.relay.publish_offer(&offer).await?;
            *self.identifier.lock() = Some(id.clone());
            self.set_state(SessionState::Waiting);

            info!(%id, "오퍼 게시 완료, 응답 대기");
            Ok(id)
        }
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// 응답 폴링, 적용, 채널 대기 (Waiting -> Connecting -> Connected)
    pub async fn await_answer(&self) -> Result<Established> {
        if self.state() != SessionState::Waiting {
            return Err(Error::InvalidState {
                from: self.state().as_str(),
                to: SessionState::Connecting.as_str(),
            });
        }
        let id = self
            .identifier()
            .ok_or_else(|| Error::HandshakeFailure("식별자 없음".into()))?;

        let result: Result<Established> = async {
            let answer = self.poll_answer(&id).await?;
            if answer.kind != SdpKind::Answer {
                return Err(Error::HandshakeFailure(format!(
                    "응답이 아닌 세션 기술: {:?}",
                    answer.kind
                )));
            }
            *self.remote.lock() = Some(answer.clone());

            self.set_state(SessionState::Connecting);
            self.connectivity
                .apply_answer(&answer)
                .await
                .map_err(transport_failure)?;
            self.connected().await
        }
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// 고정 간격으로 응답 조회. 성공, 취소, 타임아웃 시 타이머 종료
    async fn poll_answer(&self, id: &str) -> Result<SessionDescription> {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = &mut deadline => {
                    return Err(Error::HandshakeTimeout {
                        waited_ms: self.config.handshake_timeout_ms,
                    });
                }
                _ = ticker.tick() => {
                    match self.relay.fetch_answer(id).await? {
                        Some(answer) => {
                            info!(%id, "응답 수신");
                            return Ok(answer);
                        }
                        None => debug!(%id, "응답 아직 없음"),
                    }
                }
            }
        }
    }

    /// 응답자로 연결: 오퍼 조회, 응답 게시, 채널 대기
    pub async fn connect_as_responder(&self, id: &str) -> Result<Established> {
        self.begin(Role::Responder)?;
        *self.identifier.lock() = Some(id.to_string());

        let result: Result<Established> = async {
            self.set_state(SessionState::Connecting);
            let offer = self.relay.fetch_offer(id).await?;
            if offer.kind != SdpKind::Offer {
                return Err(Error::HandshakeFailure(format!(
                    "오퍼가 아닌 세션 기술: {:?}",
                    offer.kind
                )));
            }
            *self.remote.lock() = Some(offer.clone());

            self.connectivity
                .accept_offer(&offer)
                .await
                .map_err(transport_failure)?;
            let answer = self.guarded(self.connectivity.local_description()).await?;
            *self.local.lock() = Some(answer.clone());

            self.relay.publish_answer(id, &answer).await?;
            self.set_state(SessionState::AnswerPosted);
            info!(%id, "응답 게시 완료, 연결 대기");

            self.connected().await
        }
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// 채널이 열릴 때까지 대기 후 Connected
    async fn connected(&self) -> Result<Established> {
        let (channel, inbox) = self
            .guarded(self.connectivity.wait_channel())
            .await
            .map_err(transport_failure)?;
        *self.channel.lock() = Some(channel.clone());
        self.set_state(SessionState::Connected);

        info!(channel = %channel.label(), role = ?self.role(), "채널 연결됨");
        Ok(Established { channel, inbox })
    }

    /// 취소와 전체 타임아웃을 함께 거는 대기
    async fn guarded<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, fut) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::HandshakeTimeout {
                    waited_ms: self.config.handshake_timeout_ms,
                }),
            },
        }
    }

    fn begin(&self, role: Role) -> Result<()> {
        let state = self.state();
        if state != SessionState::Idle {
            return Err(Error::InvalidState {
                from: state.as_str(),
                to: SessionState::Connecting.as_str(),
            });
        }
        if self.cancel.is_cancelled() || self.is_closed() {
            return Err(Error::Cancelled);
        }
        *self.role.lock() = Some(role);
        Ok(())
    }

    /// 실패 처리: 연결 계층 실패면 Failed, 나머지는 연결 계층을 초기화하고 Idle
    ///
    /// 이미 닫힌 세션은 그대로 둔다.
    async fn fail(&self, err: Error) -> Error {
        if self.is_closed() {
            debug!("닫힌 세션의 핸드쉐이크 종료: {}", err);
            return err;
        }

        if is_transport_failure(&err) {
            warn!(state = ?self.state(), "핸드쉐이크 실패, 연결 계층 오류: {}", err);
            self.set_state(SessionState::Failed);
            return err;
        }

        warn!(state = ?self.state(), "핸드쉐이크 실패, idle로 복귀: {}", err);
        if let Err(e) = self.connectivity.reset().await {
            warn!("연결 계층 초기화 실패: {}", e);
        }
        *self.local.lock() = None;
        *self.remote.lock() = None;
        self.set_state(SessionState::Idle);
        err
    }

    /// 세션 종료. 어느 상태에서든 타이머와 연결 자원을 해제
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();

        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!("채널 닫기 실패: {}", e);
            }
        }
        self.connectivity.close().await?;

        let prev = self.state.send_replace(SessionState::Disconnected);
        info!(from = ?prev, "세션 종료");
        Ok(())
    }

    /// 진행 중인 핸드쉐이크 취소
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 상태 변경. Disconnected 이후에는 바뀌지 않는다
    fn set_state(&self, state: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == state || *current == SessionState::Disconnected {
                return false;
            }
            debug!(from = ?*current, to = ?state, "세션 상태 변경");
            *current = state;
            true
        });
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// 상태 변화 구독
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn role(&self) -> Option<Role> {
        *self.role.lock()
    }

    pub fn identifier(&self) -> Option<String> {
        self.identifier.lock().clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Creating => "creating",
            SessionState::Gathering => "gathering",
            SessionState::Waiting => "waiting",
            SessionState::Connecting => "connecting",
            SessionState::AnswerPosted => "answer_posted",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
        }
    }
}

const TRANSPORT_FAILURE_PREFIX: &str = "연결 계층: ";

/// 연결 계층 에러 표시 (취소, 타임아웃은 그대로)
fn transport_failure(err: Error) -> Error {
    match err {
        Error::Cancelled | Error::HandshakeTimeout { .. } => err,
        other => Error::HandshakeFailure(format!("{TRANSPORT_FAILURE_PREFIX}{other}")),
    }
}

fn is_transport_failure(err: &Error) -> bool {
    matches!(err, Error::HandshakeFailure(reason) if reason.starts_with(TRANSPORT_FAILURE_PREFIX))
}

const MEMORY_SDP_PREFIX: &str = "memory:";

/// 프로세스 내 연결망 (테스트, 루프백용)
///
/// 오퍼의 SDP에는 토큰만 들어가고, 응답자는 그 토큰으로 채널 반대편을 가져간다.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    pending: Arc<Mutex<HashMap<String, (MemoryChannel, Inbox)>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connectivity(&self) -> MemoryConnectivity {
        MemoryConnectivity {
            network: self.clone(),
            inner: Mutex::new(MemoryPeer::default()),
            answered: Notify::new(),
        }
    }
}

#[derive(Default)]
struct MemoryPeer {
    token: Option<String>,
    local: Option<SessionDescription>,
    endpoint: Option<(MemoryChannel, Inbox)>,
    answered: bool,
}

/// 메모리 연결 계층
pub struct MemoryConnectivity {
    network: MemoryNetwork,
    inner: Mutex<MemoryPeer>,
    answered: Notify,
}

fn parse_token(desc: &SessionDescription) -> Result<String> {
    desc.sdp
        .strip_prefix(MEMORY_SDP_PREFIX)
        .map(|token| token.to_string())
        .ok_or_else(|| Error::HandshakeFailure(format!("잘못된 세션 기술: {}", desc.sdp)))
}

#[async_trait]
impl Connectivity for MemoryConnectivity {
    async fn create_offer(&self) -> Result<()> {
        let token = format!("{:016x}", rand::thread_rng().gen::<u64>());
        let ((local, local_inbox), remote) = memory_pair(crate::CONTROL_CHANNEL_LABEL);
        self.network.pending.lock().insert(token.clone(), remote);

        let mut inner = self.inner.lock();
        inner.local = Some(SessionDescription::offer(format!("{MEMORY_SDP_PREFIX}{token}")));
        inner.token = Some(token);
        inner.endpoint = Some((local, local_inbox));
        Ok(())
    }

    async fn accept_offer(&self, offer: &SessionDescription) -> Result<()> {
        let token = parse_token(offer)?;
        let endpoint = self
            .network
            .pending
            .lock()
            .remove(&token)
            .ok_or_else(|| Error::HandshakeFailure(format!("알 수 없는 오퍼: {token}")))?;

        let mut inner = self.inner.lock();
        inner.local = Some(SessionDescription::answer(format!("{MEMORY_SDP_PREFIX}{token}")));
        inner.token = Some(token);
        inner.endpoint = Some(endpoint);
        inner.answered = true;
        Ok(())
    }

    async fn local_description(&self) -> Result<SessionDescription> {
        self.inner
            .lock()
            .local
            .clone()
            .ok_or_else(|| Error::HandshakeFailure("로컬 세션 기술 없음".into()))
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<()> {
        let token = parse_token(answer)?;
        {
            let mut inner = self.inner.lock();
            if inner.token.as_deref() != Some(token.as_str()) {
                return Err(Error::HandshakeFailure(format!("토큰 불일치: {token}")));
            }
            inner.answered = true;
        }
        self.answered.notify_one();
        Ok(())
    }

    async fn wait_channel(&self) -> Result<(Arc<dyn Channel>, Inbox)> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.answered {
                    let (channel, inbox) = inner
                        .endpoint
                        .take()
                        .ok_or_else(|| Error::HandshakeFailure("채널 없음".into()))?;
                    return Ok((Arc::new(channel) as Arc<dyn Channel>, inbox));
                }
            }
            self.answered.notified().await;
        }
    }

    async fn reset(&self) -> Result<()> {
        let peer = std::mem::take(&mut *self.inner.lock());
        if let Some(token) = peer.token {
            if self.network.pending.lock().remove(&token).is_some() {
                debug!(%token, "응답자가 가져가지 않은 오퍼 회수");
            }
        }
        if let Some((channel, _)) = peer.endpoint {
            channel.close().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.reset().await
    }
}
