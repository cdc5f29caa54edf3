//! gatedrop 송신자 (개시자)
//!
//! 오퍼를 릴레이에 게시하고 식별자를 출력한 뒤, 응답이 올 때까지 폴링한다.
//! 연결되면 파일을 보내고 버퍼가 비워지면 종료.
//!
//! 사용법:
//!   cargo run --release --features webrtc --bin gatedrop-send -- [OPTIONS] <FILE>
//!
//! 예시:
//!   # 기본 전송
//!   cargo run --release --features webrtc --bin gatedrop-send -- report.pdf
//!
//!   # 송신측 크레딧 게이트 (Enter 한 번 = 크레딧 1)
//!   cargo run --release --features webrtc --bin gatedrop-send -- --gate sender big.iso

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gatedrop::{Config, CreditGate, FileSender, Gate, HttpRelay, Session, WebRtcConnectivity};

/// 종료 전 버퍼 비우기 최대 대기
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "gatedrop-send", version, about = "파일을 피어에게 보냄 (개시자)")]
struct Args {
    /// 보낼 파일
    file: PathBuf,

    /// 릴레이 주소
    #[arg(long, env = "GATEDROP_RELAY_URL", default_value = "http://127.0.0.1:3000")]
    relay: String,

    /// 청크 크기 (바이트). 워터마크는 4x / 8x로 맞춰짐
    #[arg(long)]
    chunk_size: Option<usize>,

    /// 크레딧 게이트 (none, sender, receiver, both)
    #[arg(long, default_value = "none")]
    gate: Gate,

    /// 응답 폴링 간격 (밀리초)
    #[arg(long, default_value_t = 2000)]
    poll_interval_ms: u64,

    /// 핸드쉐이크 타임아웃 (초)
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,

    /// STUN/TURN 서버 (여러 번 지정 가능)
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// 디버그 로그
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn config(&self) -> anyhow::Result<Config> {
        let mut config = match self.chunk_size {
            Some(size) => Config::default().with_chunk_size(size),
            None => Config::default(),
        };
        config.relay_url = self.relay.clone();
        config.gate = self.gate;
        config.poll_interval_ms = self.poll_interval_ms;
        config.handshake_timeout_ms = self.timeout_secs * 1000;
        if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// 실패 보고. 재시도할 만한 에러면 안내를 덧붙인다
fn report_failure(context: &str, e: &gatedrop::Error) {
    error!("{}: {}", context, e);
    if e.is_recoverable() {
        println!("새 세션으로 다시 시도해 보세요.");
    }
}

/// 표준 입력 한 줄 = 크레딧 1
fn spawn_credit_reader(gate: CreditGate) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(_)) = lines.next_line().await {
            let allowed = gate.grant_credit();
            let quota = gate.snapshot();
            println!("크레딧 지급: {}/{} 청크 허용", allowed, quota.total_chunks());
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = args.config()?;
    let metadata = tokio::fs::metadata(&args.file)
        .await
        .with_context(|| format!("파일을 열 수 없음: {}", args.file.display()))?;

    info!("=== gatedrop 송신 ===");
    info!("File: {} ({} bytes)", args.file.display(), metadata.len());
    info!("Relay: {}", config.relay_url);
    info!(
        "Chunk: {} bytes, watermarks: {}/{}",
        config.chunk_size, config.low_watermark, config.high_watermark
    );
    info!("Gate: {:?}", config.gate);

    let relay = Arc::new(HttpRelay::new(&config.relay_url)?);
    let connectivity = Arc::new(WebRtcConnectivity::new(&config).await?);
    let session = Session::new(config.clone(), relay, connectivity);

    let id = match session.publish_offer().await {
        Ok(id) => id,
        Err(e) => {
            report_failure("오퍼 게시 실패", &e);
            return Err(e.into());
        }
    };
    println!();
    println!("  세션 ID: {id}");
    println!("  받는 쪽에서 실행: gatedrop-recv {id}");
    println!();

    let established = tokio::select! {
        result = session.await_answer() => match result {
            Ok(established) => established,
            Err(e) => {
                report_failure("연결 실패", &e);
                return Err(e.into());
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("중단 요청, 세션 종료");
            session.close().await?;
            return Ok(());
        }
    };
    // 상대는 컨트롤 메시지를 보내지 않으므로 받은 프레임은 버린다
    let _inbox = established.inbox;

    let sender = FileSender::from_path(&config, established.channel.clone(), &args.file).await?;
    if config.gate.gates_sender() {
        println!("Enter를 누를 때마다 크레딧 1 지급");
        spawn_credit_reader(sender.credit_gate());
    }

    let result = tokio::select! {
        result = sender.run() => result,
        _ = tokio::signal::ctrl_c() => {
            sender.cancel();
            Err(gatedrop::Error::Cancelled)
        }
    };

    let result = match result {
        Ok(stats) => sender.wait_drained(DRAIN_TIMEOUT).await.map(|_| stats),
        Err(e) => Err(e),
    };

    match &result {
        Ok(stats) => {
            info!("=== 전송 완료 ===");
            info!("{}", stats.summary());
        }
        Err(e) => {
            report_failure("전송 실패", e);
            info!("{}", sender.stats().summary());
        }
    }

    session.close().await?;
    result.map(|_| ()).map_err(Into::into)
}
