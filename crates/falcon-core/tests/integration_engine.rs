//! End-to-end engine tests against a local range-capable HTTP server.

mod common;

use common::range_server::{self, RangeServerOptions};
use falcon_core::config::EngineConfig;
use falcon_core::engine::Engine;
use falcon_core::events::EventListener;
use falcon_core::hash::{self, HashAlgorithm};
use falcon_core::options::DownloadOptions;
use falcon_core::types::{ProgressInfo, TaskId, TaskStatus};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::tempdir;

#[derive(Default)]
struct Recorder {
    transitions: Mutex<Vec<(TaskStatus, TaskStatus)>>,
    completed_paths: Mutex<Vec<PathBuf>>,
    progress_downloads: Mutex<Vec<u64>>,
}

impl EventListener for Recorder {
    fn on_status_changed(&self, _: TaskId, old: TaskStatus, new: TaskStatus) {
        self.transitions.lock().unwrap().push((old, new));
    }

    fn on_progress(&self, info: &ProgressInfo) {
        self.progress_downloads
            .lock()
            .unwrap()
            .push(info.downloaded_bytes);
    }

    fn on_completed(&self, _: TaskId, output_path: &Path) {
        self.completed_paths
            .lock()
            .unwrap()
            .push(output_path.to_path_buf());
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        poll_timeout_ms: 20,
        ..EngineConfig::default()
    }
}

fn options_into(dir: &Path, filename: &str) -> DownloadOptions {
    DownloadOptions {
        output_directory: dir.to_string_lossy().into_owned(),
        output_filename: filename.to_string(),
        ..DownloadOptions::default()
    }
}

fn no_leftover_temp_files(dir: &Path) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let name = entry.unwrap().file_name().to_string_lossy().into_owned();
        assert!(
            !name.contains(".part.") && !name.ends_with(".falcon.tmp"),
            "temp file left behind: {name}"
        );
    }
}

#[test]
fn small_single_connection_get() {
    let body = b"hello, falcon!\n\n".to_vec();
    let server = range_server::start(body.clone());
    let dir = tempdir().unwrap();

    let mut engine = Engine::new(test_config()).unwrap();
    let recorder = Arc::new(Recorder::default());
    engine.add_listener(recorder.clone());
    let id = engine
        .add_download(&server.url, options_into(dir.path(), "hello.txt"))
        .unwrap();
    engine.run();

    let task = engine.task(id).unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    assert_eq!(task.downloaded_bytes(), body.len() as u64);
    assert_eq!(task.total_bytes(), body.len() as u64);

    let output = dir.path().join("hello.txt");
    assert_eq!(std::fs::read(&output).unwrap(), body);
    no_leftover_temp_files(dir.path());

    let transitions = recorder.transitions.lock().unwrap().clone();
    assert_eq!(
        transitions,
        vec![
            (TaskStatus::Pending, TaskStatus::Preparing),
            (TaskStatus::Preparing, TaskStatus::Downloading),
            (TaskStatus::Downloading, TaskStatus::Completed),
        ]
    );
    assert_eq!(recorder.completed_paths.lock().unwrap().as_slice(), &[output]);
}

#[test]
fn segmented_download_with_four_connections() {
    let body: Vec<u8> = (0u32..1_048_576 / 4)
        .flat_map(|i| i.to_le_bytes())
        .collect();
    assert_eq!(body.len(), 1_048_576);
    let server = range_server::start(body.clone());
    let dir = tempdir().unwrap();

    let mut engine = Engine::new(test_config()).unwrap();
    let recorder = Arc::new(Recorder::default());
    engine.add_listener(recorder.clone());
    let mut options = options_into(dir.path(), "big.bin");
    options.max_connections = 4;
    options.min_segment_size = 65_536;
    let id = engine.add_download(&server.url, options).unwrap();
    engine.run();

    let task = engine.task(id).unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    assert_eq!(task.downloaded_bytes(), 1_048_576);
    let content = std::fs::read(dir.path().join("big.bin")).unwrap();
    assert_eq!(content.len(), 1_048_576);
    assert_eq!(content, body);
    no_leftover_temp_files(dir.path());

    // Probe plus one range request per segment.
    assert!(
        server.requests.load(std::sync::atomic::Ordering::SeqCst) >= 5,
        "expected probe + 4 range workers"
    );

    // Progress updates never go backwards.
    let progress = recorder.progress_downloads.lock().unwrap().clone();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn pause_then_resume_keeps_partial_progress() {
    let body: Vec<u8> = (0u8..=255).cycle().take(1_048_576).collect();
    let server = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            throttle: Some(Duration::from_millis(10)),
            ..RangeServerOptions::default()
        },
    );
    let dir = tempdir().unwrap();

    let mut engine = Engine::new(test_config()).unwrap();
    let handle = engine.handle();
    let mut options = options_into(dir.path(), "resumable.bin");
    options.max_connections = 4;
    options.min_segment_size = 65_536;
    options.progress_interval_ms = 50;
    let id = engine.add_download(&server.url, options).unwrap();

    let runner = std::thread::spawn(move || {
        engine.run();
        engine
    });

    // Let roughly 300 KiB arrive, then pause.
    let task = handle.task(id).unwrap();
    let deadline = Instant::now() + Duration::from_secs(30);
    while task.downloaded_bytes() < 300 * 1024 {
        assert!(Instant::now() < deadline, "no progress before pause");
        assert!(!task.status().is_terminal(), "finished before pause");
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(handle.pause_task(id));
    assert_eq!(task.status(), TaskStatus::Paused);

    // Workers wind down; part files hold the progress.
    std::thread::sleep(Duration::from_millis(400));
    let parts: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".part."))
        .collect();
    assert!(!parts.is_empty(), "paused download left no part files");
    let paused_bytes = task.downloaded_bytes();
    assert!(paused_bytes >= 300 * 1024);

    assert!(handle.resume_task(id));
    assert!(task.wait_for(Duration::from_secs(60)), "resume did not finish");
    assert_eq!(task.status(), TaskStatus::Completed);

    let engine = runner.join().unwrap();
    let content = std::fs::read(dir.path().join("resumable.bin")).unwrap();
    assert_eq!(content, body);
    // The counter reflects the file size once, not the sum of both runs.
    assert_eq!(task.downloaded_bytes(), body.len() as u64);
    no_leftover_temp_files(dir.path());
    assert_eq!(engine.get_statistics().completed_tasks, 1);
}

#[test]
fn failover_after_retry_budget() {
    let body = vec![42u8; 50 * 1024];
    let broken = range_server::start_with_options(
        vec![],
        RangeServerOptions {
            fail_first: usize::MAX,
            ..RangeServerOptions::default()
        },
    );
    let good = range_server::start(body.clone());
    let dir = tempdir().unwrap();

    let mut engine = Engine::new(test_config()).unwrap();
    let mut options = options_into(dir.path(), "failover.bin");
    options.max_retries = 1;
    options.retry_delay_seconds = 1;
    let id = engine
        .add_download_uris(vec![broken.url.clone(), good.url.clone()], options)
        .unwrap();
    engine.run();

    let task = engine.task(id).unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    assert_eq!(
        std::fs::read(dir.path().join("failover.bin")).unwrap(),
        body
    );
    // Initial attempt plus exactly one retry against the first URI.
    assert_eq!(broken.requests.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[test]
fn failover_from_refused_connection() {
    let body = vec![7u8; 10 * 1024];
    let good = range_server::start(body.clone());
    let dir = tempdir().unwrap();

    let mut engine = Engine::new(test_config()).unwrap();
    let mut options = options_into(dir.path(), "refused.bin");
    options.max_retries = 0;
    let id = engine
        .add_download_uris(vec![range_server::refused_url(), good.url.clone()], options)
        .unwrap();
    engine.run();

    let task = engine.task(id).unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    assert_eq!(std::fs::read(dir.path().join("refused.bin")).unwrap(), body);
}

#[test]
fn redirect_chain_is_followed_once() {
    let body = vec![9u8; 10];
    let origin = range_server::start(body.clone());
    let hop2 = range_server::start_with_options(
        vec![],
        RangeServerOptions {
            redirect_to: Some(origin.url.clone()),
            ..RangeServerOptions::default()
        },
    );
    let hop1 = range_server::start_with_options(
        vec![],
        RangeServerOptions {
            redirect_to: Some(hop2.url.clone()),
            ..RangeServerOptions::default()
        },
    );
    let dir = tempdir().unwrap();

    let mut engine = Engine::new(test_config()).unwrap();
    let recorder = Arc::new(Recorder::default());
    engine.add_listener(recorder.clone());
    let id = engine
        .add_download(&hop1.url, options_into(dir.path(), "hopped.bin"))
        .unwrap();
    engine.run();

    let task = engine.task(id).unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    let content = std::fs::read(dir.path().join("hopped.bin")).unwrap();
    assert_eq!(content.len(), 10);
    assert_eq!(content, body);

    // The redirect hops stay in Preparing; Downloading appears exactly once.
    let transitions = recorder.transitions.lock().unwrap().clone();
    let downloading = transitions
        .iter()
        .filter(|(_, new)| *new == TaskStatus::Downloading)
        .count();
    assert_eq!(downloading, 1);
}

#[test]
fn checksum_verification_pass_and_fail() {
    let body = b"content that gets hashed\n".to_vec();
    let digest = hash::calculate_buffer(&body, HashAlgorithm::Sha256);

    let server = range_server::start(body.clone());
    let dir = tempdir().unwrap();
    let mut engine = Engine::new(test_config()).unwrap();
    let mut options = options_into(dir.path(), "verified.bin");
    options.checksum = Some(digest.clone());
    let id = engine.add_download(&server.url, options).unwrap();
    engine.run();
    assert_eq!(engine.task(id).unwrap().status(), TaskStatus::Completed);

    // Same download with a corrupted expected digest fails but keeps the
    // file for inspection.
    let mut bad_digest = digest.into_bytes();
    bad_digest[0] = if bad_digest[0] == b'0' { b'1' } else { b'0' };
    let server2 = range_server::start(body.clone());
    let dir2 = tempdir().unwrap();
    let mut engine2 = Engine::new(test_config()).unwrap();
    let mut options2 = options_into(dir2.path(), "corrupt.bin");
    options2.checksum = Some(String::from_utf8(bad_digest).unwrap());
    let id2 = engine2.add_download(&server2.url, options2).unwrap();
    engine2.run();

    let task2 = engine2.task(id2).unwrap();
    assert_eq!(task2.status(), TaskStatus::Failed);
    assert!(task2.error_message().contains("verification failed"));
    assert!(dir2.path().join("corrupt.bin").exists());
}

#[test]
fn chunked_body_without_content_length() {
    let body: Vec<u8> = (0u8..=255).cycle().take(10_000).collect();
    let server = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            chunked: true,
            ..RangeServerOptions::default()
        },
    );
    let dir = tempdir().unwrap();

    let mut engine = Engine::new(test_config()).unwrap();
    let id = engine
        .add_download(&server.url, options_into(dir.path(), "chunked.bin"))
        .unwrap();
    engine.run();

    let task = engine.task(id).unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    assert_eq!(std::fs::read(dir.path().join("chunked.bin")).unwrap(), body);
    assert_eq!(task.total_bytes(), body.len() as u64);
}

#[test]
fn no_range_support_falls_back_to_single_stream() {
    let body: Vec<u8> = (0u8..100).cycle().take(512 * 1024).collect();
    let server = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            no_ranges: true,
            ..RangeServerOptions::default()
        },
    );
    let dir = tempdir().unwrap();

    let mut engine = Engine::new(test_config()).unwrap();
    let mut options = options_into(dir.path(), "plain.bin");
    options.max_connections = 4;
    options.min_segment_size = 1024;
    let id = engine.add_download(&server.url, options).unwrap();
    engine.run();

    assert_eq!(engine.task(id).unwrap().status(), TaskStatus::Completed);
    assert_eq!(std::fs::read(dir.path().join("plain.bin")).unwrap(), body);
    no_leftover_temp_files(dir.path());
}

#[test]
fn filename_from_content_disposition() {
    let body = b"named by the server".to_vec();
    let server = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            content_disposition: Some("attachment; filename=\"from-server.dat\"".into()),
            ..RangeServerOptions::default()
        },
    );
    let dir = tempdir().unwrap();

    let mut engine = Engine::new(test_config()).unwrap();
    let id = engine
        .add_download(&server.url, options_into(dir.path(), ""))
        .unwrap();
    engine.run();

    let task = engine.task(id).unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    assert_eq!(task.file_info().filename, "from-server.dat");
    assert_eq!(
        std::fs::read(dir.path().join("from-server.dat")).unwrap(),
        body
    );
}

#[test]
fn cancel_discards_temp_state() {
    let body: Vec<u8> = vec![5u8; 1_048_576];
    let server = range_server::start_with_options(
        body,
        RangeServerOptions {
            throttle: Some(Duration::from_millis(10)),
            ..RangeServerOptions::default()
        },
    );
    let dir = tempdir().unwrap();

    let mut engine = Engine::new(test_config()).unwrap();
    let handle = engine.handle();
    let mut options = options_into(dir.path(), "doomed.bin");
    options.max_connections = 2;
    options.min_segment_size = 65_536;
    options.progress_interval_ms = 50;
    let id = engine.add_download(&server.url, options).unwrap();

    let runner = std::thread::spawn(move || {
        engine.run();
        engine
    });
    let task = handle.task(id).unwrap();
    let deadline = Instant::now() + Duration::from_secs(30);
    while task.downloaded_bytes() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(handle.cancel_task(id));
    assert_eq!(task.status(), TaskStatus::Cancelled);
    // Cancel is idempotent and terminal.
    assert!(!handle.cancel_task(id));
    assert!(!handle.resume_task(id));

    let engine = runner.join().unwrap();
    assert!(!dir.path().join("doomed.bin").exists());
    no_leftover_temp_files(dir.path());
    assert_eq!(engine.get_statistics().stopped_tasks, 1);
}

#[test]
fn statistics_reflect_completed_work() {
    let body = vec![1u8; 4096];
    let server = range_server::start(body.clone());
    let dir = tempdir().unwrap();

    let mut engine = Engine::new(test_config()).unwrap();
    let a = engine
        .add_download(&server.url, options_into(dir.path(), "a.bin"))
        .unwrap();
    let b = engine
        .add_download(&server.url, options_into(dir.path(), "b.bin"))
        .unwrap();
    engine.run();

    assert_eq!(engine.task(a).unwrap().status(), TaskStatus::Completed);
    assert_eq!(engine.task(b).unwrap().status(), TaskStatus::Completed);
    let stats = engine.get_statistics();
    assert_eq!(stats.completed_tasks, 2);
    assert_eq!(stats.active_tasks, 0);
    assert_eq!(stats.waiting_tasks, 0);
    assert_eq!(stats.total_downloaded, 2 * body.len() as u64);
}
