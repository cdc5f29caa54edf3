//! 시그널링 릴레이
//!
//! 릴레이는 세션 기술(SDP)을 식별자 단위로 보관했다가 돌려줄 뿐, 내용은 해석하지 않는다.
//!
//! REST 계약 (`{relay_url}/api` 아래):
//! - `POST /peer` `{peer:{publicKey, webRTC:{offer}}}` -> `{identifier}`
//! - `GET /peer/{id}` -> `{peer:{webRTC:{offer}}}` (없으면 404)
//! - `POST /peer/{id}/client` `{client:{publicKey, webRTC:{answer}}}`
//! - `GET /peer/{id}/client` -> `{client:{webRTC:{answer}}}` (아직 없으면 `{client:null}`)

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// 인증은 하지 않으므로 publicKey 자리에 넣는 값
const PUBLIC_KEY_PLACEHOLDER: &str = "none";

/// 릴레이 요청 타임아웃
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// 세션 기술 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// 세션 기술 (`{"type":"offer","sdp":"..."}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// 릴레이 계약
#[async_trait]
pub trait Relay: Send + Sync {
    /// 오퍼 게시, 새 식별자 반환
    async fn publish_offer(&self, offer: &SessionDescription) -> Result<String>;

    /// 식별자로 오퍼 조회. 없으면 `NotFound`
    async fn fetch_offer(&self, id: &str) -> Result<SessionDescription>;

    /// 응답 게시 (client 하위 리소스)
    async fn publish_answer(&self, id: &str, answer: &SessionDescription) -> Result<()>;

    /// 응답 조회. 아직 없으면 None
    async fn fetch_answer(&self, id: &str) -> Result<Option<SessionDescription>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct WebRtcBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    answer: Option<SessionDescription>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PeerBody {
    #[serde(rename = "publicKey", default, skip_serializing_if = "Option::is_none")]
    public_key: Option<String>,
    #[serde(rename = "webRTC")]
    web_rtc: WebRtcBody,
}

#[derive(Debug, Serialize, Deserialize)]
struct PeerEnvelope {
    peer: PeerBody,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClientEnvelope {
    client: Option<PeerBody>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    identifier: String,
}

/// HTTP 릴레이 클라이언트
#[derive(Debug, Clone)]
pub struct HttpRelay {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRelay {
    pub fn new(relay_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("gatedrop/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            base_url: format!("{}/api", relay_url.trim_end_matches('/')),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Relay for HttpRelay {
    async fn publish_offer(&self, offer: &SessionDescription) -> Result<String> {
        let body = PeerEnvelope {
            peer: PeerBody {
                public_key: Some(PUBLIC_KEY_PLACEHOLDER.to_string()),
                web_rtc: WebRtcBody {
                    offer: Some(offer.clone()),
                    answer: None,
                },
            },
        };

        let response: CreateResponse = self
            .client
            .post(self.url("/peer"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        info!(id = %response.identifier, "오퍼 게시");
        Ok(response.identifier)
    }

    async fn fetch_offer(&self, id: &str) -> Result<SessionDescription> {
        let response = self.client.get(self.url(&format!("/peer/{id}"))).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound { id: id.to_string() });
        }

        let envelope: PeerEnvelope = response.error_for_status()?.json().await?;
        envelope
            .peer
            .web_rtc
            .offer
            .ok_or_else(|| Error::NotFound { id: id.to_string() })
    }

    async fn publish_answer(&self, id: &str, answer: &SessionDescription) -> Result<()> {
        let body = ClientEnvelope {
            client: Some(PeerBody {
                public_key: Some(PUBLIC_KEY_PLACEHOLDER.to_string()),
                web_rtc: WebRtcBody {
                    offer: None,
                    answer: Some(answer.clone()),
                },
            }),
        };

        let response = self
            .client
            .post(self.url(&format!("/peer/{id}/client")))
            .json(&body)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound { id: id.to_string() });
        }
        response.error_for_status()?;

        info!(%id, "응답 게시");
        Ok(())
    }

    async fn fetch_answer(&self, id: &str) -> Result<Option<SessionDescription>> {
        let response = self
            .client
            .get(self.url(&format!("/peer/{id}/client")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound { id: id.to_string() });
        }

        let envelope: ClientEnvelope = response.error_for_status()?.json().await?;
        Ok(envelope.client.and_then(|client| client.web_rtc.answer))
    }
}

#[derive(Debug, Clone)]
struct RelayEntry {
    offer: SessionDescription,
    answer: Option<SessionDescription>,
}

/// 프로세스 내 릴레이 (테스트, 루프백용)
#[derive(Debug, Default)]
pub struct MemoryRelay {
    entries: DashMap<String, RelayEntry>,

    /// true면 모든 요청 실패 (연결 불가 흉내)
    offline: AtomicBool,

    /// 응답 조회 횟수
    answer_polls: AtomicUsize,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn answer_polls(&self) -> usize {
        self.answer_polls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::HandshakeFailure("릴레이 연결 불가".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn publish_offer(&self, offer: &SessionDescription) -> Result<String> {
        self.check_online()?;

        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(0..10_000u32).to_string();
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.entries.entry(id.clone()) {
                slot.insert(RelayEntry {
                    offer: offer.clone(),
                    answer: None,
                });
                debug!(%id, "memory relay: 오퍼 저장");
                return Ok(id);
            }
        }
    }

    async fn fetch_offer(&self, id: &str) -> Result<SessionDescription> {
        self.check_online()?;
        self.entries
            .get(id)
            .map(|entry| entry.offer.clone())
            .ok_or_else(|| Error::NotFound { id: id.to_string() })
    }

    async fn publish_answer(&self, id: &str, answer: &SessionDescription) -> Result<()> {
        self.check_online()?;
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound { id: id.to_string() })?;
        entry.answer = Some(answer.clone());
        Ok(())
    }

    async fn fetch_answer(&self, id: &str) -> Result<Option<SessionDescription>> {
        self.answer_polls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.entries
            .get(id)
            .map(|entry| entry.answer.clone())
            .ok_or_else(|| Error::NotFound { id: id.to_string() })
    }
}
