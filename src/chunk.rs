//! 청크 분할과 재조립
//!
//! - 송신측: 파일 전체를 `chunk_size` 단위로 미리 잘라 메모리에 보관
//! - 수신측: 도착 순서대로 이어붙임. 순서 번호도 체크섬도 없다
//!   (채널의 순서/신뢰성 보장에 전적으로 의존)

use bytes::{Bytes, BytesMut};

/// 청크 인덱스 (전송 내 위치, 와이어에는 실리지 않음)
pub type ChunkIndex = usize;

/// 파일 크기에 대한 청크 수 = ceil(size / chunk_size)
pub fn chunk_count(file_size: u64, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size as u64) as usize
}

/// 청크 (최대 `chunk_size` 바이트의 불변 바이트열)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 전송 내 위치
    pub index: ChunkIndex,

    /// 실제 데이터
    pub data: Bytes,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// 청크 분할기 (송신측)
#[derive(Debug, Clone, Copy)]
pub struct ChunkSlicer {
    chunk_size: usize,
}

impl ChunkSlicer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// 데이터를 청크들로 분할 (복사 없이 `Bytes::slice`)
    pub fn split(&self, data: &Bytes) -> Vec<Chunk> {
        let total = chunk_count(data.len() as u64, self.chunk_size);

        (0..total)
            .map(|index| {
                let start = index * self.chunk_size;
                let end = (start + self.chunk_size).min(data.len());
                Chunk {
                    index,
                    data: data.slice(start..end),
                }
            })
            .collect()
    }
}

/// 재조립기 (수신측)
///
/// 경계에 무관하다. 도착한 바이너리 프레임을 그대로 뒤에 붙인다.
#[derive(Debug, Default)]
pub struct Reassembler {
    chunks: Vec<Bytes>,
    received_bytes: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 청크 추가, 누적 수신 바이트 반환
    pub fn push(&mut self, data: Bytes) -> u64 {
        self.received_bytes += data.len() as u64;
        self.chunks.push(data);
        self.received_bytes
    }

    /// 수신된 청크 수
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// 누적 수신 바이트
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// 앞에서부터 `count`개 청크의 바이트 합
    pub fn prefix_bytes(&self, count: usize) -> u64 {
        self.chunks
            .iter()
            .take(count)
            .map(|c| c.len() as u64)
            .sum()
    }

    /// 도착 순서대로 이어붙여 하나의 결과물로
    pub fn assemble(&self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks[0].clone(),
            _ => {
                let mut buf = BytesMut::with_capacity(self.received_bytes as usize);
                for chunk in &self.chunks {
                    buf.extend_from_slice(chunk);
                }
                buf.freeze()
            }
        }
    }

    /// 상태 초기화 (새 전송 시작)
    pub fn reset(&mut self) {
        self.chunks.clear();
        self.received_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 64), 0);
        assert_eq!(chunk_count(1, 64), 1);
        assert_eq!(chunk_count(64, 64), 1);
        assert_eq!(chunk_count(65, 64), 2);
        assert_eq!(chunk_count(133_120, 64 * 1024), 3);
        assert_eq!(chunk_count(10, 0), 0);
    }

    #[test]
    fn test_split_130k() {
        let data = sample(130 * 1024);
        let chunks = ChunkSlicer::new(64 * 1024).split(&data);

        let sizes: Vec<usize> = chunks.iter().map(Chunk::len).collect();
        assert_eq!(sizes, vec![65536, 65536, 2048]);
        assert_eq!(chunks[2].index, 2);
    }

    #[test]
    fn test_split_then_reassemble() {
        for (len, chunk_size) in [(0, 7), (1, 7), (7, 7), (100, 7), (4096, 1000), (250, 100)] {
            let data = sample(len);
            let chunks = ChunkSlicer::new(chunk_size).split(&data);
            assert_eq!(chunks.len(), chunk_count(len as u64, chunk_size));
            assert!(chunks.iter().all(|c| c.len() <= chunk_size && !c.is_empty()));

            let mut reassembler = Reassembler::new();
            for chunk in chunks {
                reassembler.push(chunk.data);
            }
            assert_eq!(reassembler.received_bytes(), len as u64);
            assert_eq!(reassembler.assemble(), data);
        }
    }

    #[test]
    fn test_reassembler_is_boundary_agnostic() {
        let mut reassembler = Reassembler::new();
        reassembler.push(Bytes::from_static(b"hel"));
        reassembler.push(Bytes::from_static(b"lo, w"));
        reassembler.push(Bytes::from_static(b"orld"));

        assert_eq!(reassembler.chunk_count(), 3);
        assert_eq!(reassembler.prefix_bytes(2), 8);
        assert_eq!(reassembler.prefix_bytes(10), 12);
        assert_eq!(reassembler.assemble().as_ref(), b"hello, world");

        reassembler.reset();
        assert_eq!(reassembler.received_bytes(), 0);
        assert!(reassembler.assemble().is_empty());
    }
}
