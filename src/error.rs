//! 에러 타입 정의

use thiserror::Error;

/// gatedrop 에러 타입
///
/// 어떤 에러도 프로세스를 종료시키지 않는다. 호출자는 상태 값으로 사용자에게 보여준다.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 에러: {0}")]
    Json(#[from] serde_json::Error),

    #[error("릴레이 요청 실패: {0}")]
    Relay(#[from] reqwest::Error),

    #[cfg(feature = "webrtc")]
    #[error("WebRTC 에러: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("핸드쉐이크 실패: {0}")]
    HandshakeFailure(String),

    #[error("릴레이에 세션 없음: id={id}")]
    NotFound { id: String },

    #[error("핸드쉐이크 타임아웃: {waited_ms}ms 동안 응답 없음")]
    HandshakeTimeout { waited_ms: u64 },

    #[error("채널이 열려있지 않음")]
    ChannelClosed,

    #[error("잘못된 컨트롤 프레임: {reason}")]
    MalformedControlFrame { reason: String },

    #[error("조기 종료: 선언 크기 {declared} bytes, 수신 {received} bytes")]
    PrematureEnd { declared: u64, received: u64 },

    #[error("선언 크기 초과: 선언 {declared} bytes, 수신 {received} bytes")]
    SizeExceeded { declared: u64, received: u64 },

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("유효하지 않은 상태 전이: {from} -> {to}")]
    InvalidState { from: &'static str, to: &'static str },

    #[error("버퍼 비우기 타임아웃: {buffered} bytes 남음 ({waited_ms}ms)")]
    DrainTimeout { buffered: usize, waited_ms: u64 },

    #[error("송신 루프가 이미 실행 중")]
    AlreadyRunning,

    #[error("취소됨")]
    Cancelled,
}

impl Error {
    /// 새 세션으로 다시 시도하면 나아질 수 있는 에러인지
    ///
    /// 릴레이, 핸드쉐이크, 채널 문제는 재시도 대상. 설정, 상태, 프로토콜 위반,
    /// 사용자 취소는 아니다.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Relay(_)
                | Error::HandshakeFailure(_)
                | Error::NotFound { .. }
                | Error::HandshakeTimeout { .. }
                | Error::ChannelClosed
                | Error::DrainTimeout { .. }
        )
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::HandshakeTimeout { waited_ms: 1 }.is_recoverable());
        assert!(Error::NotFound { id: "7".into() }.is_recoverable());
        assert!(Error::ChannelClosed.is_recoverable());
        assert!(Error::DrainTimeout {
            buffered: 10,
            waited_ms: 1
        }
        .is_recoverable());

        assert!(!Error::Cancelled.is_recoverable());
        assert!(!Error::AlreadyRunning.is_recoverable());
        assert!(!Error::InvalidConfig("x".into()).is_recoverable());
        assert!(!Error::PrematureEnd {
            declared: 2,
            received: 1
        }
        .is_recoverable());
    }
}
