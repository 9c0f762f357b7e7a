use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;
use tempfile::TempDir;

use vellum::{
    tree::cursor::Cursor,
    utils::init_log,
    Config, Database, Key,
};

// The engine is a process-wide singleton; tests that reopen it must
// not interleave.
static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub struct TestDb {
    pub dir: TempDir,
    pub page_size: usize,
    _guard: MutexGuard<'static, ()>,
}

impl TestDb {
    /// Reopen in place without a clean shutdown, as a crash would.
    pub fn crash_and_reopen(&self) {
        Database::init(self.config()).unwrap();
    }

    /// Close cleanly, then reopen.
    pub fn close_and_reopen(&self) {
        Database::close().unwrap();
        Database::init(self.config()).unwrap();
    }

    pub fn config(&self) -> Config {
        config_for(&self.dir, self.page_size)
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        let _ = Database::close();
    }
}

fn config_for(dir: &TempDir, page_size: usize) -> Config {
    let text = format!(
        "\
journalpath = {}/journal/vellum
journalsize = 1048576
buffer.count.{} = 64
volume.1 = {}/main.v01,pageSize:{},initialPages:8,extensionPages:8,maximumPages:100000,create
",
        dir.path().display(),
        page_size,
        dir.path().display(),
        page_size,
    );
    Config::parse(&text).unwrap()
}

/// # Conduct the initialization
///
/// - Setting up log configurations.
/// - Serializing access to the engine singleton.
/// - Reopening the database in a scratch directory.
pub fn setup() -> TestDb {
    setup_with_page_size(8192)
}

pub fn setup_with_page_size(page_size: usize) -> TestDb {
    init_log();
    let guard = DB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = TempDir::new().unwrap();

    let db = TestDb {
        page_size,
        _guard: guard,
        dir,
    };
    Database::init(db.config()).unwrap();
    db
}

pub fn cursor(tree_name: &str) -> Cursor {
    let volume = Database::volumes().into_iter().next().unwrap();
    let tree = Database::get_tree(volume.handle(), tree_name, true).unwrap();
    Cursor::new(tree)
}

pub fn key(segment: &[u8]) -> Key {
    let mut k = Key::new();
    k.append(segment).unwrap();
    k
}

/// Order-preserving key for a sequence number: one nibble per byte,
/// offset past the segment terminator.
pub fn seq_key(i: u32) -> Key {
    let segment = [
        1 + ((i >> 12) & 0xF) as u8,
        1 + ((i >> 8) & 0xF) as u8,
        1 + ((i >> 4) & 0xF) as u8,
        1 + (i & 0xF) as u8,
    ];
    key(&segment)
}

pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
