//! # gatedrop
//!
//! 피어 간 직접 채널 위의 청크 파일 전송
//!
//! ## 핵심 특징
//! - **시그널링 릴레이**: 세션 기술만 중계, 내용은 해석하지 않음
//! - **청크 전송**: `begin` / 바이너리 청크 / `end`, 순서 번호 없이 도착 순서로 조립
//! - **백프레셔**: 버퍼 게이지를 저수위/고수위(4x / 8x 청크)로 제한
//! - **크레딧 게이트**: 외부 보상 신호로만 늘어나는 송신/수신 쿼터
//! - **단일 송신 루프**: 저수위 알림과 크레딧 지급이 같은 루프를 깨움

pub mod backpressure;
pub mod channel;
pub mod chunk;
pub mod config;
pub mod error;
pub mod message;
pub mod quota;
pub mod receiver;
#[cfg(feature = "webrtc")]
pub mod rtc;
pub mod sender;
pub mod session;
pub mod signaling;
pub mod stats;

pub use backpressure::{BackpressureController, Watermarks};
pub use channel::{memory_pair, Channel, Inbox, MemoryChannel};
pub use chunk::{Chunk, ChunkSlicer, Reassembler};
pub use config::{Config, Gate};
pub use error::{Error, Result};
pub use message::{ControlMessage, FileInfo, Frame, Inbound};
pub use quota::{CreditGate, Quota};
pub use receiver::{FileReceiver, ReceivedFile, ReceiverEvent, ReceiverState};
#[cfg(feature = "webrtc")]
pub use rtc::{WebRtcChannel, WebRtcConnectivity};
pub use sender::{FileSender, SenderState};
pub use session::{
    Connectivity, Established, MemoryConnectivity, MemoryNetwork, Role, Session, SessionState,
};
pub use signaling::{HttpRelay, MemoryRelay, Relay, SessionDescription};
pub use stats::TransferStats;

/// 기본 청크 크기 (바이트)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024; // 64KB

/// 크레딧 1회당 허용량 = max(total / K, 1) 의 K
pub const DEFAULT_CREDIT_DIVISOR: usize = 22;

/// 데이터 채널 라벨
pub const CONTROL_CHANNEL_LABEL: &str = "data";
