use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The one entry present from process start.
pub const SEED_FILENAME: &str = "cheese";
pub const SEED_CONTENTS: &[u8] = b"This is not the sound of the train";

/// In-memory file namespace shared by every transfer. Contents live for the
/// process lifetime; there is no eviction.
///
/// `get` hands out a clone, so a read session works from a snapshot and a
/// concurrent overwrite cannot mutate an in-flight transfer's view.
#[derive(Clone)]
pub struct FileStore {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl FileStore {
    pub fn new() -> FileStore {
        let mut files = HashMap::new();
        files.insert(SEED_FILENAME.to_string(), SEED_CONTENTS.to_vec());
        FileStore {
            files: Arc::new(Mutex::new(files)),
        }
    }

    pub fn get(&self, filename: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .expect("file store lock poisoned")
            .get(filename)
            .cloned()
    }

    /// Stores `contents` under `filename`, overwriting unconditionally.
    pub fn put(&self, filename: impl Into<String>, contents: Vec<u8>) {
        self.files
            .lock()
            .expect("file store lock poisoned")
            .insert(filename.into(), contents);
    }

    pub fn list(&self) -> Vec<String> {
        self.files
            .lock()
            .expect("file store lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for FileStore {
    fn default() -> FileStore {
        FileStore::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_entry_present() {
        let store = FileStore::new();
        assert_eq!(store.get(SEED_FILENAME), Some(SEED_CONTENTS.to_vec()));
        assert_eq!(store.list(), vec![SEED_FILENAME.to_string()]);
    }

    #[test]
    fn test_missing_file() {
        let store = FileStore::new();
        assert_eq!(store.get("nosuch"), None);
    }

    #[test]
    fn test_put_overwrites() {
        let store = FileStore::new();
        store.put("greeting", b"hello".to_vec());
        assert_eq!(store.get("greeting"), Some(b"hello".to_vec()));

        store.put("greeting", b"goodbye".to_vec());
        assert_eq!(store.get("greeting"), Some(b"goodbye".to_vec()));
    }

    #[test]
    fn test_get_is_a_snapshot() {
        let store = FileStore::new();
        let before = store.get(SEED_FILENAME).unwrap();
        store.put(SEED_FILENAME, b"overwritten".to_vec());
        assert_eq!(before, SEED_CONTENTS.to_vec());
    }

    #[test]
    fn test_list_after_puts() {
        let store = FileStore::new();
        store.put("greeting", b"hello".to_vec());
        let mut names = store.list();
        names.sort();
        assert_eq!(names, vec!["cheese".to_string(), "greeting".to_string()]);
    }
}
