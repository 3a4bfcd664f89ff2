//! Component tests: the full harness against the compiled demo binary.
//!
//! The "build" step copies the binary cargo already built for this test run,
//! so no Go or nested cargo toolchain is needed.

#![cfg(unix)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use comptest::{
    BuildTool, ComptestError, Comptest, ExitHandler, HarnessConfig, HarnessState, ReadinessError,
    UnexpectedExit,
};
use tokio::sync::mpsc;

fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

struct Sut {
    main: SocketAddr,
    metrics: SocketAddr,
    config: HarnessConfig,
}

fn sut(dir: &Path, readiness_delay_ms: u64) -> Sut {
    let main = free_addr();
    let metrics = free_addr();

    let config = HarnessConfig {
        build_path: Some(PathBuf::from(env!("CARGO_BIN_EXE_comptest-demo"))),
        build_tool: BuildTool::Command {
            program: "cp".to_string(),
            args: vec!["{entry}".to_string(), "{output}".to_string()],
        },
        binary_path: dir.join("main"),
        logs_path: dir.join("comptest.log"),
        readiness_url: Some(format!("http://{metrics}/readiness")),
        readiness_timeout: Duration::from_secs(10),
        env: [
            ("PORT".to_string(), main.to_string()),
            ("METRICS_ADDR".to_string(), metrics.to_string()),
            (
                "READINESS_DELAY_MS".to_string(),
                readiness_delay_ms.to_string(),
            ),
        ]
        .into_iter()
        .collect(),
        ..HarnessConfig::default()
    };

    Sut {
        main,
        metrics,
        config,
    }
}

fn recorder() -> (ExitHandler, mpsc::UnboundedReceiver<UnexpectedExit>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: ExitHandler = Arc::new(move |exit| {
        let _ = tx.send(exit);
    });
    (handler, rx)
}

async fn get(url: String) -> anyhow::Result<String> {
    let resp = reqwest::get(&url).await?;
    anyhow::ensure!(resp.status().is_success(), "GET {url}: {}", resp.status());
    Ok(resp.text().await?)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tests_run_only_after_readiness() {
    let dir = tempfile::tempdir().unwrap();
    let sut = sut(dir.path(), 1000);
    let main = sut.main;
    let (handler, mut exits) = recorder();
    let mut harness = Comptest::new(sut.config).with_exit_handler(handler);

    let started = Instant::now();
    let body = harness
        .run(None, move |info| async move {
            anyhow::ensure!(info.pid.is_some(), "sut pid missing");
            for _ in 0..2 {
                get(format!("http://{main}/event")).await?;
            }
            let count = get(format!("http://{main}/event_count")).await?;
            anyhow::ensure!(count == "Current count: 2", "unexpected count: {count}");
            get(format!("http://{main}/")).await
        })
        .await
        .unwrap();

    assert_eq!(body, "Potato");
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(harness.state(), HarnessState::TornDown);
    assert!(exits.try_recv().is_err(), "teardown is not an unexpected exit");

    let logs = std::fs::read_to_string(dir.path().join("comptest.log")).unwrap();
    assert!(logs.contains("START"));
    assert!(logs.contains("Readiness endpoint"));
    assert!(
        std::net::TcpStream::connect(main).is_err(),
        "sut still listening after teardown"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readiness_timeout_tears_the_sut_down() {
    let dir = tempfile::tempdir().unwrap();
    let mut sut = sut(dir.path(), 60_000);
    sut.config.readiness_timeout = Duration::from_millis(500);
    let main = sut.main;
    let expected_check = format!("[HTTPCheck: http://{}/readiness]", sut.metrics);
    let (handler, mut exits) = recorder();
    let mut harness = Comptest::new(sut.config).with_exit_handler(handler);

    let started = Instant::now();
    let err = harness
        .run(None, |_| async { anyhow::Ok(()) })
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    match err {
        ComptestError::Readiness(ReadinessError::TimedOut { checker, .. }) => {
            assert_eq!(checker, expected_check)
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.state(), HarnessState::Aborted);
    assert!(exits.try_recv().is_err());
    assert!(std::net::TcpStream::connect(main).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sut_crash_is_reported_with_logs() {
    let dir = tempfile::tempdir().unwrap();
    let sut = sut(dir.path(), 0);
    let main = sut.main;
    let (handler, mut exits) = recorder();
    let mut harness = Comptest::new(sut.config).with_exit_handler(handler);

    let running = harness.build_and_run(None).await.unwrap();
    assert_eq!(get(format!("http://{main}/exit")).await.unwrap(), "Bye");

    let exit = tokio::time::timeout(Duration::from_secs(5), exits.recv())
        .await
        .expect("unexpected exit reported")
        .unwrap();
    assert_eq!(exit.status.and_then(|status| status.code()), Some(3));
    assert!(exit.logs.contains("START"));
    assert!(exit.logs.contains("exit requested"));
    assert_eq!(exit.executable, dir.path().join("main"));

    assert!(!running.handle().stop(), "process already gone");
    running.teardown().await;
    assert_eq!(harness.state(), HarnessState::TornDown);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_dependency_fails_fast_without_starting_tests() {
    let dir = tempfile::tempdir().unwrap();
    let mut sut = sut(dir.path(), 0);
    sut.config.readiness_timeout = Duration::from_millis(500);
    let closed = free_addr();
    sut.config.dependencies = vec![format!("tcp://{closed}")];
    let (handler, _exits) = recorder();
    let mut harness = Comptest::new(sut.config).with_exit_handler(handler);

    let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let err = harness
        .run(None, move |_| async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            anyhow::Ok(())
        })
        .await
        .unwrap_err();

    assert_eq!(
        match &err {
            ComptestError::Readiness(err) => err.checker().map(str::to_string),
            _ => None,
        },
        Some(format!("[TCPCheck: {closed}]")),
        "{err}"
    );
    assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
}
