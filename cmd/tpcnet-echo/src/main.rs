//! Framed echo over the tpcnet reactor.
//!
//! Usage:
//!     tpcnet-echo serve [addr]                 # echo server
//!     tpcnet-echo bench [addr] [frames] [len]  # load a running server
//!     tpcnet-echo loop [frames] [len]          # server + client in-process
//!
//! Test a running server with the wire format directly:
//!     printf '\x00\x00\x00\x0d\x00\x00\x00\x00hello' | nc 127.0.0.1 9710

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use tracing::info;

use tpcnet_reactor::{
    Frame, ParallelFrameAllocator, Reactor, ReactorConfig, ReactorHandle, Service,
    FLAG_OP_RESPONSE,
};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

// ── services ─────────────────────────────────────────────────────────

struct EchoService {
    pool: Arc<ParallelFrameAllocator>,
    requests: u64,
}

impl Service for EchoService {
    fn on_request(&mut self, frame: Box<Frame>) -> Option<Box<Frame>> {
        self.requests += 1;
        Some(self.pool.allocate_message(FLAG_OP_RESPONSE, frame.payload()))
    }

    fn on_accept(&mut self, id: tpcnet_reactor::ChannelId, peer: SocketAddr) {
        info!(channel = %id, %peer, "client connected");
    }

    fn on_close(&mut self, id: tpcnet_reactor::ChannelId, _err: Option<tpcnet_reactor::TpcError>) {
        info!(channel = %id, requests = self.requests, "client gone");
    }
}

struct BenchService {
    received: Arc<AtomicU64>,
    done_tx: mpsc::Sender<()>,
    expected: u64,
}

impl Service for BenchService {
    fn on_responses(&mut self, chain: Box<Frame>) {
        let mut cur = Some(chain);
        let mut n = 0;
        while let Some(mut frame) = cur {
            cur = frame.next.take();
            n += 1;
        }
        let total = self.received.fetch_add(n, Ordering::Relaxed) + n;
        if total >= self.expected {
            let _ = self.done_tx.send(());
        }
    }
}

// ── modes ────────────────────────────────────────────────────────────

fn start_server(addr: SocketAddr, cpu: usize) -> (ReactorHandle, SocketAddr) {
    let handle = Reactor::start(
        ReactorConfig::from_env().cpu(cpu).name("tpc-echo-server"),
        Box::new(EchoService {
            pool: ParallelFrameAllocator::new(),
            requests: 0,
        }),
    )
    .expect("reactor start failed");
    let (_lid, local) = handle.register_accept(addr).expect("bind failed");
    info!(%local, "echo server up");
    (handle, local)
}

fn run_bench(addr: SocketAddr, frames: u64, len: usize, cpu: usize) {
    let received = Arc::new(AtomicU64::new(0));
    let (done_tx, done_rx) = mpsc::channel();
    let handle = Reactor::start(
        ReactorConfig::from_env().cpu(cpu).name("tpc-echo-client"),
        Box::new(BenchService {
            received: Arc::clone(&received),
            done_tx,
            expected: frames,
        }),
    )
    .expect("reactor start failed");

    let channel = handle.connect(addr).expect("connect failed");
    let pool = ParallelFrameAllocator::new();
    let payload = vec![0x5Au8; len];

    let start = Instant::now();
    for _ in 0..frames {
        // Backpressure: the unflushed queue is bounded, retry on full.
        loop {
            match channel.write_and_flush(pool.allocate_message(0, &payload)) {
                Ok(()) => break,
                Err(tpcnet_reactor::TpcError::QueueFull) => std::thread::yield_now(),
                Err(e) => panic!("write failed: {e}"),
            }
        }
    }

    done_rx
        .recv_timeout(Duration::from_secs(60))
        .expect("bench timed out");
    let elapsed = start.elapsed();
    let got = received.load(Ordering::Relaxed);
    let per_sec = got as f64 / elapsed.as_secs_f64();
    eprintln!(
        "{} round-trips of {}-byte payloads in {:.2?} — {:.0} frames/s",
        got, len, elapsed, per_sec
    );
    handle.shutdown();
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
    }

    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(String::as_str).unwrap_or("loop");
    let cpus = num_cpus::get();

    match mode {
        "serve" => {
            let addr: SocketAddr = args
                .get(2)
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| "127.0.0.1:9710".parse().unwrap());
            let (handle, _local) = start_server(addr, 0);
            while RUNNING.load(Ordering::Relaxed) && handle.is_running() {
                std::thread::sleep(Duration::from_millis(200));
            }
            handle.shutdown();
        }
        "bench" => {
            let addr: SocketAddr = args
                .get(2)
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| "127.0.0.1:9710".parse().unwrap());
            let frames: u64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(100_000);
            let len: usize = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(24);
            run_bench(addr, frames, len, 1 % cpus);
        }
        "loop" => {
            let frames: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(100_000);
            let len: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(24);
            let (server, addr) = start_server("127.0.0.1:0".parse().unwrap(), 0);
            run_bench(addr, frames, len, 1 % cpus);
            server.shutdown();
        }
        other => {
            eprintln!("unknown mode '{other}'");
            eprintln!("usage: tpcnet-echo [serve <addr> | bench <addr> [frames] [len] | loop [frames] [len]]");
            std::process::exit(2);
        }
    }
}
