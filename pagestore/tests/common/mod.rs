use pagestore::{Options, Pagestore};
use std::path::PathBuf;

/// The directory of a test store. Tests that run in parallel must use different names.
#[allow(dead_code)]
pub fn test_path(name: &str) -> PathBuf {
    let mut p = PathBuf::from("test");
    p.push(name);
    p
}

/// Small pages and small extensions so that tests exercise page chains and file growth.
pub fn opts(name: &str) -> Options {
    let mut o = Options::new();
    o.path(test_path(name));
    o.partitions(2);
    o.page_size(512);
    o.extend_batch(8);
    o.metrics(true);
    o
}

#[allow(dead_code)]
pub fn setup(name: &str, should_clean_up: bool) -> Pagestore {
    reopen_with(opts(name), should_clean_up)
}

pub fn reopen_with(o: Options, should_clean_up: bool) -> Pagestore {
    init_tracing();
    let path = o.get_path().to_path_buf();
    if should_clean_up && path.exists() {
        std::fs::remove_dir_all(&path).unwrap();
    }
    Pagestore::open(o).unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
