//! End-to-end tests through a [`Session`]: start-up reclamation, loading,
//! operations and shutdown cleanup.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tomopar::config::{Config, PoolConfig, ShmConfig};
use tomopar::error::Error;
use tomopar::execution::{NoProgress, Roi, TaskKind};
use tomopar::memory::DType;
use tomopar::session::Session;

fn config(shm_dir: &Path, workers: usize) -> Config {
    Config {
        shm: ShmConfig::default().with_dir(shm_dir),
        pool: PoolConfig::default()
            .with_workers(workers)
            .with_worker_program(env!("CARGO_BIN_EXE_tomopar-worker")),
        ..Config::default()
    }
}

fn write_image(path: &Path, width: u32, height: u32, value: u16) {
    image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_pixel(width, height, image::Luma([value]))
        .save(path)
        .unwrap();
}

fn write_stack(dir: &Path, count: usize, width: u32, height: u32) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let path = dir.join(format!("img_{i:03}.png"));
            write_image(&path, width, height, i as u16 * 10);
            path
        })
        .collect()
}

fn segments(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Pid of a process that has already exited.
fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

fn plant_segment(dir: &Path, name: &str, age: Duration) {
    let file = std::fs::File::create(dir.join(name)).unwrap();
    file.set_len(64).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
}

#[test]
fn test_start_reclaims_orphans() {
    let shm = tempfile::tempdir().unwrap();
    let orphan = format!("TP_{}_crashed-run", dead_pid());
    plant_segment(shm.path(), &orphan, Duration::from_secs(3600));
    plant_segment(shm.path(), "TP_1_init-owned", Duration::from_secs(3600));
    plant_segment(shm.path(), "OTHER_5_unrelated", Duration::from_secs(3600));

    let session = Session::start(config(shm.path(), 2)).unwrap();
    assert_eq!(
        segments(shm.path()),
        vec!["OTHER_5_unrelated".to_string(), "TP_1_init-owned".to_string()]
    );
    session.shutdown();
}

#[test]
fn test_load_process_and_shutdown() {
    let shm = tempfile::tempdir().unwrap();
    let images = tempfile::tempdir().unwrap();
    let paths = write_stack(images.path(), 14, 6, 4);

    let session = Session::start(config(shm.path(), 3)).unwrap();
    assert_eq!(session.pool().live_workers(), 3);

    let mut steps = 0;
    let stack = session
        .loader()
        .with_chunksize(2)
        .load(&paths, DType::F32, &mut |n: usize, label: &str| {
            assert_eq!(label, "Loading");
            steps += n;
        })
        .unwrap();
    assert_eq!(steps, 14);
    assert_eq!(stack.shape(), &[14, 4, 6]);
    for i in 0..14 {
        assert!(stack.slice::<f32>(i).unwrap().iter().all(|&v| v == i as f32 * 10.0));
    }

    let processed = session
        .operation()
        .apply_safe(
            &stack,
            TaskKind::Scale { factor: 0.5 },
            Some(Roi::new(1, 1, 3, 3)),
            &mut NoProgress,
        )
        .unwrap();
    let original = stack.slice::<f32>(4).unwrap();
    let scaled = processed.slice::<f32>(4).unwrap();
    assert!(original.iter().all(|&v| v == 40.0));
    for (j, &v) in scaled.iter().enumerate() {
        let (row, col) = (j / 6, j % 6);
        let inside = (1..3).contains(&row) && (1..3).contains(&col);
        assert_eq!(v, if inside { 20.0 } else { 40.0 }, "element {j}");
    }

    // A segment tagged with our pid that the allocator never recorded
    let stray = format!("TP_{}_stray", std::process::id());
    plant_segment(shm.path(), &stray, Duration::ZERO);

    let report = session.shutdown();
    assert_eq!(report.freed_owned, 2);
    assert_eq!(report.cleared.freed_count(), 1);
    assert!(segments(shm.path()).is_empty());
}

#[test]
fn test_parallel_load_dimension_mismatch() {
    let shm = tempfile::tempdir().unwrap();
    let images = tempfile::tempdir().unwrap();
    let mut paths = write_stack(images.path(), 12, 8, 8);
    paths[7] = images.path().join("odd.png");
    write_image(&paths[7], 8, 5, 70);

    let session = Session::start(config(shm.path(), 4)).unwrap();
    let err = session
        .loader()
        .with_cores(4)
        .load(&paths, DType::U16, &mut NoProgress)
        .unwrap_err();

    match err {
        Error::DimensionMismatch {
            path,
            expected,
            actual,
        } => {
            assert_eq!(path, images.path().join("odd.png"));
            assert_eq!(expected, vec![8, 8]);
            assert_eq!(actual, vec![5, 8]);
        }
        other => panic!("expected a dimension mismatch, got {other}"),
    }
    assert!(session.allocator().owned_names().is_empty());
    assert!(segments(shm.path()).is_empty());
}

#[test]
fn test_drop_cleans_up() {
    let shm = tempfile::tempdir().unwrap();
    {
        let session = Session::start(config(shm.path(), 2)).unwrap();
        let _a = session.allocator().create(&[4, 4], DType::U8).unwrap();
        let _b = session.allocator().create(&[2, 2, 2], DType::F64).unwrap();
        assert_eq!(segments(shm.path()).len(), 2);
    }
    assert!(segments(shm.path()).is_empty());
}

#[test]
fn test_missing_worker_program_fails_start() {
    let shm = tempfile::tempdir().unwrap();
    let mut config = config(shm.path(), 2);
    config.pool = config.pool.with_worker_program("/nonexistent/tomopar-worker");
    assert!(matches!(Session::start(config), Err(Error::WorkerSpawn(_))));
}
