//! 채널 메시지 정의
//!
//! 하나의 순서 보장 채널 위에 두 종류의 프레임이 섞여서 흐른다.
//! - 텍스트 프레임: JSON 컨트롤 메시지 (`begin`, `end`)
//! - 바이너리 프레임: 청크 페이로드 (순서 번호 없음, 도착 순서가 곧 파일 순서)

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// 파일 정보 (`begin` 메시지에 포함)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// 파일 이름
    #[serde(rename = "fileName", default)]
    pub file_name: Option<String>,

    /// 파일 크기 (바이트). 모르면 null
    #[serde(rename = "fileSize", default)]
    pub file_size: Option<u64>,
}

impl FileInfo {
    pub fn new(file_name: impl Into<String>, file_size: Option<u64>) -> Self {
        Self {
            file_name: Some(file_name.into()),
            file_size,
        }
    }
}

/// 컨트롤 메시지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// 전송 시작
    #[serde(rename = "begin")]
    Begin {
        #[serde(rename = "fileInfo", default)]
        file_info: FileInfo,
    },

    /// 전송 종료
    #[serde(rename = "end")]
    End {},
}

impl ControlMessage {
    pub fn begin(file_info: FileInfo) -> Self {
        ControlMessage::Begin { file_info }
    }

    pub fn end() -> Self {
        ControlMessage::End {}
    }

    /// 메시지 이름 (로그용)
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Begin { .. } => "begin",
            ControlMessage::End {} => "end",
        }
    }

    /// JSON 문자열로 직렬화
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// JSON 문자열에서 역직렬화
    ///
    /// 파싱 실패는 `MalformedControlFrame`으로 돌려준다.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::MalformedControlFrame {
            reason: e.to_string(),
        })
    }
}

/// 채널 위의 단일 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// 텍스트 (컨트롤 메시지)
    Text(String),

    /// 바이너리 (청크)
    Binary(Bytes),
}

impl Frame {
    /// 컨트롤 메시지를 텍스트 프레임으로
    pub fn control(msg: &ControlMessage) -> Result<Self> {
        Ok(Frame::Text(msg.to_json()?))
    }

    /// 버퍼 게이지에 잡히는 바이트 수
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 수신 프레임 분류 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Control(ControlMessage),
    Chunk(Bytes),
}

impl Inbound {
    /// 프레임 분류
    ///
    /// 바이너리는 무조건 다음 청크. 텍스트는 컨트롤 메시지로 파싱하고
    /// 실패하면 `MalformedControlFrame`.
    pub fn classify(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Binary(data) => Ok(Inbound::Chunk(data)),
            Frame::Text(text) => ControlMessage::from_json(&text).map(Inbound::Control),
        }
    }
}
