// SPDX-License-Identifier: GPL-2.0-only
use crate::store::traits::{StoreError, VmStore};
use crate::vm::VmRecord;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// One pretty-printed JSON file per VM: `<dir>/<name>.json`.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileStore { dir: dir.into() }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Write the encoded record to a unique sibling temp file and fsync it.
    fn write_temp(&self, record: &VmRecord) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| StoreError::Io(format!("cannot create {}: {e}", self.dir.display())))?;
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| StoreError::Corrupt(format!("cannot encode '{}': {e}", record.name)))?;
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", record.name, uuid::Uuid::new_v4().simple()));
        let mut file = fs::File::create(&tmp)
            .map_err(|e| StoreError::Io(format!("cannot create {}: {e}", tmp.display())))?;
        let written = file.write_all(&json).and_then(|_| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::Io(format!("cannot write {}: {e}", tmp.display())));
        }
        Ok(tmp)
    }
}

impl VmStore for FileStore {
    fn create(&self, record: &VmRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.name);
        let tmp = self.write_temp(record)?;
        // hard_link refuses an existing destination, so create-if-absent is atomic
        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StoreError::AlreadyExists(record.name.clone()))
            }
            Err(e) => Err(StoreError::Io(format!("cannot create {}: {e}", path.display()))),
        }
    }

    fn load(&self, name: &str) -> Result<VmRecord, StoreError> {
        let path = self.record_path(name);
        let data = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(name.to_string())
            } else {
                StoreError::Io(format!("cannot read {}: {e}", path.display()))
            }
        })?;
        serde_json::from_slice(&data)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))
    }

    fn save(&self, record: &VmRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.name);
        let tmp = self.write_temp(record)?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            StoreError::Io(format!("cannot replace {}: {e}", path.display()))
        })
    }

    fn list(&self) -> Result<Vec<VmRecord>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::Io(format!("cannot read {}: {e}", self.dir.display())))
            }
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_record = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|data| {
                    serde_json::from_slice::<VmRecord>(&data).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable VM record");
                }
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(records)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        let path = self.record_path(name);
        fs::remove_file(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(name.to_string())
            } else {
                StoreError::Io(format!("cannot remove {}: {e}", path.display()))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{parse_mount_spec, CreateVmParams, PortForward, Protocol, VmState};
    use std::path::Path;

    fn record(name: &str) -> VmRecord {
        let mut params = CreateVmParams::new(name);
        params.mounts = vec![parse_mount_spec("/srv/data:data").unwrap()];
        VmRecord::new(&params, Path::new("/tmp/sockets"))
    }

    #[test]
    fn create_then_load_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());
        let mut vm = record("alpha");
        vm.port_forwards.push(PortForward {
            host_port: 2222,
            guest_port: 22,
            protocol: Protocol::Tcp,
        });
        store.create(&vm).unwrap();
        assert_eq!(store.load("alpha").unwrap(), vm);
        assert!(tmp.path().join("alpha.json").is_file());
    }

    #[test]
    fn create_twice_fails_with_already_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());
        store.create(&record("x")).unwrap();
        let err = store.create(&record("x")).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(ref n) if n == "x"));
    }

    #[test]
    fn load_missing_fails_with_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());
        assert!(matches!(store.load("missing"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn save_overwrites_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());
        let mut vm = record("beta");
        store.create(&vm).unwrap();
        vm.state = VmState::Running;
        vm.pid = 4242;
        vm.ip_address = Some("172.16.0.2".to_string());
        store.save(&vm).unwrap();
        assert_eq!(store.load("beta").unwrap(), vm);
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());
        let vm = record("gamma");
        store.create(&vm).unwrap();
        store.save(&vm).unwrap();
        let names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["gamma.json".to_string()]);
    }

    #[test]
    fn list_skips_corrupt_records() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());
        store.create(&record("good1")).unwrap();
        store.create(&record("good2")).unwrap();
        fs::write(tmp.path().join("broken.json"), "{not json").unwrap();
        fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let names: Vec<String> = store.list().unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"good1".to_string()));
        assert!(names.contains(&"good2".to_string()));
    }

    #[test]
    fn list_orders_by_creation_time() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());
        let mut first = record("zzz");
        let mut second = record("aaa");
        first.created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
        second.created_at = chrono::Utc::now();
        store.create(&second).unwrap();
        store.create(&first).unwrap();
        let names: Vec<String> = store.list().unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["zzz", "aaa"]);
    }

    #[test]
    fn list_of_missing_dir_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path().join("nope"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn delete_removes_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());
        store.create(&record("gone")).unwrap();
        store.delete("gone").unwrap();
        assert!(!store.exists("gone"));
        assert!(matches!(store.delete("gone"), Err(StoreError::NotFound(_))));
    }
}
