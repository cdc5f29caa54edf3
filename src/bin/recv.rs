//! gatedrop 수신자 (응답자)
//!
//! 식별자로 오퍼를 가져와 응답을 게시하고, 파일을 받아 출력 디렉터리에 저장한다.
//!
//! 사용법:
//!   cargo run --release --features webrtc --bin gatedrop-recv -- [OPTIONS] <ID>
//!
//! 예시:
//!   # 현재 디렉터리에 저장
//!   cargo run --release --features webrtc --bin gatedrop-recv -- 4821
//!
//!   # 수신측 잠금 해제 게이트 (Enter 한 번 = 크레딧 1)
//!   cargo run --release --features webrtc --bin gatedrop-recv -- --gate receiver -o downloads 4821

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gatedrop::{
    Config, CreditGate, FileReceiver, Gate, HttpRelay, ReceiverEvent, Session, WebRtcConnectivity,
};

#[derive(Parser, Debug)]
#[command(name = "gatedrop-recv", version, about = "피어에게서 파일을 받음 (응답자)")]
struct Args {
    /// 보내는 쪽이 출력한 세션 ID
    id: String,

    /// 저장할 디렉터리
    #[arg(short, long, default_value = ".")]
    out: PathBuf,

    /// 릴레이 주소
    #[arg(long, env = "GATEDROP_RELAY_URL", default_value = "http://127.0.0.1:3000")]
    relay: String,

    /// 크레딧 게이트 (none, sender, receiver, both)
    #[arg(long, default_value = "none")]
    gate: Gate,

    /// 선언 크기보다 적게 받으면 실패로 처리
    #[arg(long)]
    strict_size: bool,

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
        let mut config = Config::default();
        config.relay_url = self.relay.clone();
        config.gate = self.gate;
        config.strict_size = self.strict_size;
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
            gate.grant_credit();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = args.config()?;

    info!("=== gatedrop 수신 ===");
    info!("Session: {}", args.id);
    info!("Relay: {}", config.relay_url);
    info!("Output: {}", args.out.display());
    info!("Gate: {:?}", config.gate);

    let relay = Arc::new(HttpRelay::new(&config.relay_url)?);
    let connectivity = Arc::new(WebRtcConnectivity::new(&config).await?);
    let session = Session::new(config.clone(), relay, connectivity);

    let established = tokio::select! {
        result = session.connect_as_responder(&args.id) => match result {
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
    let mut inbox = established.inbox;

    let (mut receiver, mut events) = FileReceiver::new(config.clone())?;
    if let Some(gate) = receiver.credit_gate() {
        println!("Enter를 누를 때마다 크레딧 1 지급");
        spawn_credit_reader(gate);
    }

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ReceiverEvent::Started(info) => println!(
                    "수신 시작: {} ({})",
                    info.file_name.as_deref().unwrap_or("(이름 없음)"),
                    info.file_size
                        .map(|size| format!("{size} bytes"))
                        .unwrap_or_else(|| "크기 모름".into())
                ),
                ReceiverEvent::Progress { received, total } => {
                    info!("수신: {}/{} bytes", received, total)
                }
                ReceiverEvent::Unlocked { bytes, total } => {
                    println!("잠금 해제: {}/{} bytes", bytes, total)
                }
                ReceiverEvent::Completed(file) => println!("수신 완료: {} bytes", file.len()),
                ReceiverEvent::Failed { reason } => println!("수신 실패: {reason}"),
            }
        }
    });

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let result = match receiver.run(&mut inbox, &cancel).await {
        Ok(file) => file.save_to(&args.out).await,
        Err(e) => Err(e),
    };

    match &result {
        Ok(path) => {
            info!("=== 수신 완료 ===");
            info!("Saved: {}", path.display());
            info!("{}", receiver.stats().summary());
        }
        Err(e) => report_failure("수신 실패", e),
    }

    session.close().await?;
    result.map(|_| ()).map_err(Into::into)
}
