//! 프로토콜 설정

use crate::{Error, Result, DEFAULT_CHUNK_SIZE, DEFAULT_CREDIT_DIVISOR};

/// 크레딧 게이트 적용 위치
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Gate {
    /// 게이트 없음 (백프레셔만 적용)
    #[default]
    None,
    /// 송신측: 전송 가능한 청크 수 제한
    Sender,
    /// 수신측: 이미 받은 청크의 잠금 해제 제한
    Receiver,
    /// 양쪽 모두
    Both,
}

impl Gate {
    pub fn gates_sender(self) -> bool {
        matches!(self, Gate::Sender | Gate::Both)
    }

    pub fn gates_receiver(self) -> bool {
        matches!(self, Gate::Receiver | Gate::Both)
    }
}

impl std::str::FromStr for Gate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Gate::None),
            "sender" | "send" => Ok(Gate::Sender),
            "receiver" | "recv" => Ok(Gate::Receiver),
            "both" => Ok(Gate::Both),
            other => Err(Error::InvalidConfig(format!("알 수 없는 게이트: {other}"))),
        }
    }
}

/// gatedrop 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 청크 크기 (바이트)
    pub chunk_size: usize,

    /// 버퍼 저수위 (바이트)
    /// 버퍼 게이지가 이 값 이하로 내려오면 송신 루프 재개
    pub low_watermark: usize,

    /// 버퍼 고수위 (바이트)
    /// 버퍼 게이지가 이 값을 넘으면 송신 루프 중단
    pub high_watermark: usize,

    /// 크레딧 1회당 허용 청크 = max(total / divisor, 1)
    pub credit_divisor: usize,

    /// 크레딧 게이트 위치
    pub gate: Gate,

    /// 선언 크기보다 적게 받은 채로 end가 오면 에러로 처리할지
    /// false면 경고만 남기고 받은 만큼 확정
    pub strict_size: bool,

    /// 릴레이 주소
    pub relay_url: String,

    /// 응답 폴링 간격 (밀리초)
    pub poll_interval_ms: u64,

    /// 핸드쉐이크 전체 타임아웃 (밀리초)
    pub handshake_timeout_ms: u64,

    /// ICE 수집 타임아웃 (밀리초)
    pub ice_gather_timeout_ms: u64,

    /// STUN/TURN 서버 URL
    pub ice_servers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            low_watermark: 4 * DEFAULT_CHUNK_SIZE,
            high_watermark: 8 * DEFAULT_CHUNK_SIZE,
            credit_divisor: DEFAULT_CREDIT_DIVISOR,
            gate: Gate::None,
            strict_size: false,
            relay_url: "http://127.0.0.1:3000".to_string(),
            poll_interval_ms: 2000,      // 2초
            handshake_timeout_ms: 120_000, // 2분
            ice_gather_timeout_ms: 15_000,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 청크 크기를 바꾸고 워터마크를 같은 비율(4x / 8x)로 맞춤
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self.low_watermark = 4 * chunk_size;
        self.high_watermark = 8 * chunk_size;
        self
    }

    /// 파일 크기에 대한 청크 수 = ceil(size / chunk_size)
    pub fn chunk_count(&self, file_size: u64) -> usize {
        crate::chunk::chunk_count(file_size, self.chunk_size)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size는 0보다 커야 함".into()));
        }
        if self.low_watermark >= self.high_watermark {
            return Err(Error::InvalidConfig(format!(
                "low_watermark({})는 high_watermark({})보다 작아야 함",
                self.low_watermark, self.high_watermark
            )));
        }
        if self.credit_divisor == 0 {
            return Err(Error::InvalidConfig("credit_divisor는 0보다 커야 함".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig("poll_interval_ms는 0보다 커야 함".into()));
        }
        Ok(())
    }

    /// 브라우저 피어와 같은 16KB 청크
    pub fn browser_compatible() -> Self {
        Self::default().with_chunk_size(16 * 1024)
    }

    /// 저메모리 기기용 설정
    pub fn low_memory() -> Self {
        Self {
            low_watermark: DEFAULT_CHUNK_SIZE,
            high_watermark: 2 * DEFAULT_CHUNK_SIZE,
            ..Self::default()
        }
    }

    /// 송수신 양쪽 모두 크레딧으로 제한
    pub fn throttled() -> Self {
        Self {
            gate: Gate::Both,
            ..Self::default()
        }
    }
}
