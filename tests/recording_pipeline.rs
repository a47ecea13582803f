//! Integration tests for pre-roll recording onto the filesystem.
//!
//! Frames are timestamped on a synthetic 30 fps clock so the pre-roll and
//! post-roll windows land on exact frames.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pitch_tracker::events::ErrorEventBus;
use pitch_tracker::frame::{CameraId, Frame, PixelFormat, SharedFrame};
use pitch_tracker::recording::{
    DiskSpaceProbe, ManifestRecorderFactory, PitchSummary, RecordingCoordinator,
    RecordingSettings, MANIFEST_FILE,
};
use tempfile::TempDir;

const FRAME_US: u64 = 33_333;

struct PlentyOfSpace;

impl DiskSpaceProbe for PlentyOfSpace {
    fn available_bytes(&self, _: &Path) -> Option<u64> {
        Some(1 << 40)
    }
}

fn cameras() -> Vec<CameraId> {
    vec!["left".to_string(), "right".to_string()]
}

fn coordinator(dir: &TempDir) -> RecordingCoordinator {
    let settings = RecordingSettings {
        output_dir: dir.path().to_path_buf(),
        ..RecordingSettings::default()
    };
    RecordingCoordinator::new(
        &cameras(),
        settings,
        Arc::new(ManifestRecorderFactory::new(dir.path())),
        Arc::new(PlentyOfSpace),
        Arc::new(ErrorEventBus::default()),
    )
}

fn frame(base: Instant, camera: &str, index: u64) -> SharedFrame {
    let ts = base + Duration::from_micros(index * FRAME_US);
    Frame::new(camera, index, ts, 8, 6, PixelFormat::Gray8, vec![0; 48]).shared()
}

fn read_rows(path: &Path) -> Vec<Vec<String>> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .map(|l| l.split(',').map(str::to_string).collect())
        .collect()
}

#[test]
fn test_pitch_recording_with_pre_and_post_roll() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);
    let base = Instant::now();
    let mut submitted = 0u64;

    let session = coordinator.start_session("bullpen").unwrap();
    assert_eq!(session.directory, dir.path().join("bullpen"));

    for i in 0..60 {
        for camera in ["left", "right"] {
            assert!(coordinator.record_frame(frame(base, camera, i)).unwrap().is_none());
            submitted += 1;
        }
    }

    let start = coordinator.start_pitch().unwrap();
    assert_eq!(start.pitch_id, 1);
    assert!((28..=32).contains(&start.pre_roll_frames));

    for i in 60..75 {
        for camera in ["left", "right"] {
            coordinator.record_frame(frame(base, camera, i)).unwrap();
            submitted += 1;
        }
    }
    let end = base + Duration::from_micros(74 * FRAME_US);
    assert!(coordinator.stop_pitch_at(end).unwrap().is_none());
    assert!(coordinator.is_post_roll());

    let mut closed: Option<(String, u64, PitchSummary)> = None;
    'feed: for i in 75..100 {
        for camera in ["left", "right"] {
            let result = coordinator.record_frame(frame(base, camera, i)).unwrap();
            submitted += 1;
            if let Some(summary) = result {
                closed = Some((camera.to_string(), i, summary));
                break 'feed;
            }
        }
    }
    let (camera, index, summary) = closed.expect("post-roll never completed");
    assert_eq!((camera.as_str(), index), ("right", 90));
    assert_eq!(summary.pitch_id, 1);
    assert_eq!(
        summary.frames_written,
        start.pre_roll_frames as u64 + 30 + 30
    );
    assert!(coordinator.active_pitch().is_none());

    let rows = read_rows(&summary.directory.join(MANIFEST_FILE));
    assert_eq!(rows.len() as u64, summary.frames_written);
    assert_eq!(rows[0][2], "0");
    let offsets: Vec<u64> = rows.iter().map(|r| r[2].parse().unwrap()).collect();
    assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(rows.last().unwrap()[1], "89");

    let stopped = coordinator.stop_session().unwrap();
    assert_eq!(stopped.frames_written, submitted);
    assert_eq!(stopped.pitches, 1);
    assert!(stopped.closed_pitch.is_none());
    let session_rows = read_rows(&dir.path().join("bullpen").join(MANIFEST_FILE));
    assert_eq!(session_rows.len() as u64, submitted);
}

#[test]
fn test_frames_without_session_only_fill_pre_roll() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);
    let base = Instant::now();

    for i in 0..100 {
        coordinator.record_frame(frame(base, "left", i)).unwrap();
    }
    let buffered = coordinator.pre_roll_len("left").unwrap();
    assert!((15..=16).contains(&buffered));
    assert_eq!(coordinator.pre_roll_len("right"), Some(0));
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}
