//! End-to-end export session tests against the in-memory backend

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::oneshot;

use reframe_cli::adapters::memory::{synthetic_asset, MemoryBackend, MemoryScript, WriterRecord};
use reframe_cli::domain::composition::AudioMix;
use reframe_cli::domain::media::PixelBuffer;
use reframe_cli::domain::model::{AudioTrackInfo, MetadataItem, Size, TrackKind};
use reframe_cli::domain::orientation::Rotation;
use reframe_cli::engine::progress::ProgressCallback;
use reframe_cli::ports::OutputRequest;
use reframe_cli::*;

mod test_utils {
    use super::*;

    pub fn session(script: MemoryScript) -> (ExportSession, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::with_script(script));
        let session = ExportSession::with_backend(backend.clone());
        (session, backend)
    }

    pub fn landscape_asset(seconds: f64, with_audio: bool) -> AssetInfo {
        synthetic_asset(seconds, Size::new(1920, 1080), Rotation::Deg0, 10.0, with_audio)
    }

    pub fn track<'a>(record: &'a WriterRecord, kind: TrackKind) -> &'a reframe_cli::adapters::memory::TrackRecord {
        record
            .tracks
            .iter()
            .find(|track| track.kind == Some(kind))
            .expect("track not recorded")
    }

    /// Observer counting terminal callbacks and keeping every progress value
    #[derive(Default)]
    pub struct RecordingCallback {
        pub progress: Mutex<Vec<f64>>,
        pub completes: AtomicUsize,
        pub errors: AtomicUsize,
        pub cancels: AtomicUsize,
    }

    impl RecordingCallback {
        pub fn terminal_calls(&self) -> usize {
            self.completes.load(Ordering::SeqCst)
                + self.errors.load(Ordering::SeqCst)
                + self.cancels.load(Ordering::SeqCst)
        }
    }

    impl ProgressCallback for RecordingCallback {
        fn on_start(&self, _operation: &str, _total_duration: TimeSpec) {}

        fn on_progress(&self, progress: f64, _position: TimeSpec) {
            self.progress.lock().unwrap().push(progress);
        }

        fn on_complete(&self, _message: Option<String>) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }
}

use test_utils::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_video_only_export_completes() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.mp4");
    let (session, backend) = session(MemoryScript::default());
    let observer = Arc::new(RecordingCallback::default());
    session.set_progress_callback(observer.clone());

    session
        .configure(ExportJob::new(landscape_asset(10.0, false), Preset::P480).with_output(&output))
        .unwrap();
    let report = session.export().await;

    assert!(report.is_success(), "unexpected report: {:?}", report);
    assert_eq!(session.status(), ExportStatus::Completed);
    assert_eq!(session.progress(), 1.0);
    assert!(session.error().is_none());
    assert!(output.exists());

    let progress = observer.progress.lock().unwrap().clone();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(observer.completes.load(Ordering::SeqCst), 1);
    assert_eq!(observer.terminal_calls(), 1);

    let record = backend.last_writer_record().unwrap();
    let video = track(&record, TrackKind::Video);
    assert_eq!(video.samples, 100);
    assert!(video.finished);
    let settings = video.video_settings.as_ref().unwrap();
    assert_eq!((settings.width, settings.height), (640, 360));
    assert_eq!(settings.compression.average_bit_rate, 1_200_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_audio_and_video_export_completes() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.mov");
    let (session, backend) = session(MemoryScript::default());

    let asset = landscape_asset(3.0, true);
    session
        .configure(
            ExportJob::new(asset, Preset::P720)
                .with_output(&output)
                .with_metadata(MetadataItem::new("title", "Holiday")),
        )
        .unwrap();
    let report = session.export().await;
    assert!(report.is_success(), "unexpected report: {:?}", report);

    let record = backend.last_writer_record().unwrap();
    assert_eq!(record.metadata, vec![MetadataItem::new("title", "Holiday")]);
    assert!(track(&record, TrackKind::Audio).samples > 0);
    assert!(track(&record, TrackKind::Audio).finished);
    assert_eq!(track(&record, TrackKind::Video).samples, 30);
}

#[tokio::test]
async fn test_missing_output_fails_before_opening() {
    let (session, backend) = session(MemoryScript::default());
    session
        .configure(ExportJob::new(landscape_asset(5.0, true), Preset::P720))
        .unwrap();

    let (tx, rx) = oneshot::channel();
    let handle = session.start(move |report| {
        let _ = tx.send(report);
    });
    assert!(handle.is_none());

    let report = rx.await.unwrap();
    assert_eq!(report.status, ExportStatus::Failed);
    assert!(matches!(report.error, Some(ExportError::Configuration { .. })));
    assert_eq!(session.status(), ExportStatus::Failed);
    assert_eq!(backend.reader_opens(), 0);
    assert_eq!(backend.writer_opens(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_mid_export() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.mp4");
    let (session, _backend) = session(MemoryScript::default().sample_delay(Duration::from_millis(20)));
    let observer = Arc::new(RecordingCallback::default());
    session.set_progress_callback(observer.clone());
    session
        .configure(ExportJob::new(landscape_asset(10.0, true), Preset::P720).with_output(&output))
        .unwrap();

    let (tx, rx) = oneshot::channel();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    session
        .start(move |report| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(report);
        })
        .expect("export should start");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(session.status(), ExportStatus::ReadingAndWriting);
    session.cancel();
    session.cancel();

    let report = tokio::time::timeout(Duration::from_secs(10), rx)
        .await
        .expect("export did not stop after cancel")
        .unwrap();
    assert_eq!(report.status, ExportStatus::Cancelled);
    assert!(report.error.is_none());
    assert!(session.progress() < 1.0);
    assert!(!output.exists());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(observer.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(observer.terminal_calls(), 1);

    // cancelling a finished session leaves it alone
    session.cancel();
    assert_eq!(session.status(), ExportStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_before_start_is_a_no_op() {
    let (session, backend) = session(MemoryScript::default());
    session.cancel();
    assert_eq!(session.status(), ExportStatus::Idle);
    assert_eq!(backend.reader_opens(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rotated_source_is_exported_upright() {
    let dir = TempDir::new().unwrap();
    let (session, backend) = session(MemoryScript::default());
    let asset = synthetic_asset(2.0, Size::new(1280, 720), Rotation::Deg90, 30.0, false);
    session
        .configure(ExportJob::new(asset, Preset::P720).with_output(dir.path().join("out.mp4")))
        .unwrap();
    let report = session.export().await;
    assert!(report.is_success(), "unexpected report: {:?}", report);

    let requests = backend.last_output_requests();
    let composition = requests
        .iter()
        .find_map(|request| match request {
            OutputRequest::VideoComposition { composition, .. } => Some(composition.clone()),
            _ => None,
        })
        .expect("rotated track should be read through a composition");
    assert_eq!(composition.render_size, Size::new(720, 1280));
    assert_eq!(composition.frame_rate, 30.0);

    let record = backend.last_writer_record().unwrap();
    let video = track(&record, TrackKind::Video);
    let settings = video.video_settings.as_ref().unwrap();
    assert_eq!((settings.width, settings.height), (720, 1280));
    assert_eq!(video.last_frame_size, Some((720, 1280)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_time_range_is_retimed_from_zero() {
    let dir = TempDir::new().unwrap();
    let (session, backend) = session(MemoryScript::default());
    let range = TimeRange::new(TimeSpec::from_seconds(2.0), Some(TimeSpec::from_seconds(3.0))).unwrap();
    session
        .configure(
            ExportJob::new(landscape_asset(10.0, false), Preset::P720)
                .with_output(dir.path().join("out.mp4"))
                .with_time_range(range),
        )
        .unwrap();
    let report = session.export().await;
    assert!(report.is_success(), "unexpected report: {:?}", report);
    assert_eq!(report.duration, TimeSpec::from_seconds(3.0));

    let record = backend.last_writer_record().unwrap();
    assert_eq!(record.session_start, Some(TimeSpec::zero()));
    let video = track(&record, TrackKind::Video);
    assert_eq!(video.first_time, Some(TimeSpec::zero()));
    assert!(video.last_time.unwrap().seconds < 3.0);
    assert!((29..=31).contains(&video.samples));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_audio_mix_is_requested_from_the_reader() {
    let dir = TempDir::new().unwrap();
    let (session, backend) = session(MemoryScript::default());
    let asset = landscape_asset(2.0, true).with_audio_track(AudioTrackInfo::new(3, 44_100, 2));
    let mix = AudioMix::default().with_track(2, 1.0).with_track(3, 0.5);
    session
        .configure(
            ExportJob::new(asset, Preset::P720)
                .with_output(dir.path().join("out.mp4"))
                .with_audio_mix(mix.clone()),
        )
        .unwrap();
    let report = session.export().await;
    assert!(report.is_success(), "unexpected report: {:?}", report);

    let requests = backend.last_output_requests();
    assert!(requests.iter().any(|request| matches!(
        request,
        OutputRequest::AudioMix { tracks, mix: requested, .. } if tracks.len() == 2 && *requested == mix
    )));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_frame_processor_writes_pool_frames() {
    let dir = TempDir::new().unwrap();
    let (session, backend) = session(MemoryScript::default());
    let frames = Arc::new(AtomicUsize::new(0));
    let seen = frames.clone();
    session.set_frame_processor(Arc::new(
        move |_source: &PixelBuffer, _time: TimeSpec, destination: &mut PixelBuffer| {
            destination.fill_bgra([0, 0, 255, 255]);
            seen.fetch_add(1, Ordering::SeqCst);
        },
    ));
    session
        .configure(
            ExportJob::new(landscape_asset(2.0, false), Preset::P720)
                .with_output(dir.path().join("out.mp4")),
        )
        .unwrap();
    let report = session.export().await;
    assert!(report.is_success(), "unexpected report: {:?}", report);

    let record = backend.last_writer_record().unwrap();
    let video = track(&record, TrackKind::Video);
    assert!(video.pixel_buffer_attributes.is_some());
    assert_eq!(video.pixel_buffers, frames.load(Ordering::SeqCst) as u64);
    assert_eq!(video.pixel_buffers, video.samples);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_failure_fails_the_export() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.mp4");
    let (session, _backend) = session(MemoryScript::default().read_failure_after(TrackKind::Video, 3));
    let observer = Arc::new(RecordingCallback::default());
    session.set_progress_callback(observer.clone());
    session
        .configure(ExportJob::new(landscape_asset(5.0, false), Preset::P720).with_output(&output))
        .unwrap();

    let report = session.export().await;
    assert_eq!(report.status, ExportStatus::Failed);
    assert!(matches!(report.error, Some(ExportError::Read { .. })));
    assert!(matches!(session.error(), Some(ExportError::Read { .. })));
    assert!(!output.exists());
    assert_eq!(observer.errors.load(Ordering::SeqCst), 1);
    assert_eq!(observer.terminal_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_failure_fails_the_export() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.mp4");
    let (session, _backend) = session(MemoryScript::default().write_failure_after(TrackKind::Video, 5));
    session
        .configure(ExportJob::new(landscape_asset(5.0, false), Preset::P720).with_output(&output))
        .unwrap();

    let report = session.export().await;
    assert_eq!(report.status, ExportStatus::Failed);
    assert!(matches!(report.error, Some(ExportError::Write { .. })));
    assert!(!output.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_finalize_failure_fails_the_export() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.mp4");
    let (session, _backend) = session(MemoryScript::default().fail_finish("disk full"));
    session
        .configure(ExportJob::new(landscape_asset(1.0, true), Preset::P720).with_output(&output))
        .unwrap();

    let report = session.export().await;
    assert_eq!(report.status, ExportStatus::Failed);
    assert!(matches!(report.error, Some(ExportError::Finalize { .. })));
    assert!(!output.exists());
}

#[tokio::test]
async fn test_open_failures_are_reported_once() {
    let dir = TempDir::new().unwrap();
    for script in [
        MemoryScript::default().fail_open_reader("unreadable"),
        MemoryScript::default().fail_open_writer("read-only volume"),
    ] {
        let (session, _backend) = session(script);
        let observer = Arc::new(RecordingCallback::default());
        session.set_progress_callback(observer.clone());
        session
            .configure(
                ExportJob::new(landscape_asset(1.0, true), Preset::P720)
                    .with_output(dir.path().join("out.mp4")),
            )
            .unwrap();

        let report = session.export().await;
        assert_eq!(report.status, ExportStatus::Failed);
        assert!(matches!(report.error, Some(ExportError::Open { .. })));
        assert_eq!(observer.errors.load(Ordering::SeqCst), 1);
        assert_eq!(observer.terminal_calls(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_early_end_of_stream_still_completes() {
    let dir = TempDir::new().unwrap();
    let (session, backend) = session(MemoryScript::default().stall_after(TrackKind::Video, 5));
    session
        .configure(
            ExportJob::new(landscape_asset(3.0, true), Preset::P720)
                .with_output(dir.path().join("out.mp4")),
        )
        .unwrap();

    let report = session.export().await;
    assert!(report.is_success(), "unexpected report: {:?}", report);
    let record = backend.last_writer_record().unwrap();
    assert_eq!(track(&record, TrackKind::Video).samples, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconfigure_after_completion() {
    let dir = TempDir::new().unwrap();
    let (session, backend) = session(MemoryScript::default());
    let job = ExportJob::new(landscape_asset(1.0, false), Preset::P720).with_output(dir.path().join("a.mp4"));
    session.configure(job.clone()).unwrap();
    assert!(session.export().await.is_success());

    // a finished session refuses to run again until it is reconfigured
    let report = session.export().await;
    assert!(matches!(report.error, Some(ExportError::InvalidState { .. })));
    assert_eq!(session.status(), ExportStatus::Completed);

    session.configure(job.with_output(dir.path().join("b.mp4"))).unwrap();
    assert_eq!(session.status(), ExportStatus::Idle);
    assert_eq!(session.progress(), 0.0);
    assert!(session.export().await.is_success());
    assert_eq!(backend.reader_opens(), 2);
}

#[test]
fn test_estimated_output_size() {
    let (session, _backend) = session(MemoryScript::default());
    assert_eq!(session.estimated_output_size(), 0);

    session
        .configure(ExportJob::new(landscape_asset(10.0, true), Preset::P720))
        .unwrap();
    // (128 kbit/s audio + 3.5 Mbit/s video) / 8 * 10 s
    assert_eq!(session.estimated_output_size(), 4_535_000);

    // video-only assets still count the default audio bitrate
    session
        .configure(ExportJob::new(landscape_asset(10.0, false), Preset::P720))
        .unwrap();
    assert_eq!(session.estimated_output_size(), 4_535_000);

    let mut audio_only = landscape_asset(10.0, true);
    audio_only.video_tracks.clear();
    session.configure(ExportJob::new(audio_only, Preset::P720)).unwrap();
    assert_eq!(session.estimated_output_size(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_existing_output_is_replaced() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.mp4");
    std::fs::write(&output, b"stale bytes from an earlier run").unwrap();

    let (session, _backend) = session(MemoryScript::default());
    session
        .configure(ExportJob::new(landscape_asset(1.0, true), Preset::P480).with_output(&output))
        .unwrap();
    let report = session.export().await;
    assert!(report.is_success(), "unexpected report: {:?}", report);

    let content = std::fs::read_to_string(&output).unwrap();
    assert!(!content.contains("stale bytes"));
    let record: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(record["status"], "completed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_after_completion_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.mp4");
    let (session, _backend) = session(MemoryScript::default());
    let observer = Arc::new(RecordingCallback::default());
    session.set_progress_callback(observer.clone());
    session
        .configure(ExportJob::new(landscape_asset(2.0, true), Preset::P480).with_output(&output))
        .unwrap();

    let (tx, rx) = oneshot::channel();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    session
        .start(move |report| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(report);
        })
        .expect("export should start");
    let report = rx.await.unwrap();
    assert_eq!(report.status, ExportStatus::Completed);

    session.cancel();
    session.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session.status(), ExportStatus::Completed);
    assert_eq!(session.progress(), 1.0);
    assert!(output.exists());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(observer.completes.load(Ordering::SeqCst), 1);
    assert_eq!(observer.terminal_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_during_setup_is_applied() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.mp4");
    let (session, backend) = session(MemoryScript::default().open_delay(Duration::from_millis(300)));
    session
        .configure(ExportJob::new(landscape_asset(10.0, true), Preset::P720).with_output(&output))
        .unwrap();

    // start() blocks in open_reader while another thread cancels
    let canceller = session.clone();
    let cancel_thread = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        canceller.cancel();
    });

    let (tx, rx) = oneshot::channel();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handle = session.start(move |report| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(report);
    });
    cancel_thread.join().unwrap();
    assert!(handle.is_some());
    assert_eq!(backend.reader_opens(), 1);

    let report = tokio::time::timeout(Duration::from_secs(10), rx)
        .await
        .expect("export did not stop after cancel")
        .unwrap();
    assert_eq!(report.status, ExportStatus::Cancelled);
    assert!(report.error.is_none());
    assert!(!output.exists());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
