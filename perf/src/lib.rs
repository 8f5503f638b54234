use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use strata_config::MboxConfig;

static NEXT: AtomicU32 = AtomicU32::new(0);

/// Per-process scratch directory for bench arenas.
pub fn temp_shm_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("strata_bench_{}", std::process::id()));
    let _ = std::fs::create_dir_all(&dir);
    dir
}

/// Config for a fresh arena under [`temp_shm_dir`]; `label` keeps file
/// names readable.
pub fn bench_config(label: &str) -> MboxConfig {
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let key = 0x5BE0_0000 | ((std::process::id() & 0xFFF) << 8) | (n << 1);
    let cfg = MboxConfig {
        shm_dir: temp_shm_dir(),
        arena_name: format!("{label}_{n}"),
        arena_size: 1 << 20,
        lock_sem_key: key,
        wait_sem_key: key | 1,
        log_level: "warn".into(),
    };
    for path in [cfg.arena_path(), cfg.lock_sem_path(), cfg.wait_sem_path()] {
        let _ = std::fs::remove_file(path);
    }
    cfg
}

/// Removes whatever the benches left in [`temp_shm_dir`].
pub fn cleanup() {
    let _ = std::fs::remove_dir_all(temp_shm_dir());
}
