//! Backups of the store file.
//!
//! A backup is a gzip'd tar holding one consistent snapshot of the database (taken
//! with `VACUUM INTO` while the store stays open), plus an entry in `backups.json`
//! with its SHA256 checksum. Restoring verifies the checksum and replaces the store
//! file, dropping any stale WAL side files.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

/// Name of the database inside every archive.
pub const SNAPSHOT_ENTRY: &str = "storage.db";
const METADATA_FILE: &str = "backups.json";

/// Backup metadata kept in `backups.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Unique backup identifier (timestamp-based)
    pub id: String,
    /// Human-readable name (optional)
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Size of the archive in bytes
    pub size_bytes: u64,
    pub kind: BackupKind,
    /// SHA256 of the archive
    pub checksum: String,
    /// Whether the checksum has been re-checked since creation
    pub verified: bool,
    /// Archive path relative to the backup directory
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupKind {
    Manual,
    /// Taken automatically before a bulk import.
    PreImport,
}

pub struct BackupManager {
    backup_path: PathBuf,
    /// Retention count; zero keeps everything.
    keep: usize,
    backups: HashMap<String, BackupMetadata>,
}

impl BackupManager {
    pub fn new(backup_path: PathBuf, keep: usize) -> io::Result<Self> {
        fs::create_dir_all(&backup_path)?;
        let mut manager = Self {
            backup_path,
            keep,
            backups: HashMap::new(),
        };
        manager.load_metadata()?;
        Ok(manager)
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Where a caller should write the snapshot that `create_backup` will archive.
    pub fn staging_path(&self) -> PathBuf {
        self.backup_path.join(format!("{SNAPSHOT_ENTRY}.staging"))
    }

    fn load_metadata(&mut self) -> io::Result<()> {
        let metadata_path = self.backup_path.join(METADATA_FILE);
        if metadata_path.exists() {
            let contents = fs::read_to_string(&metadata_path)?;
            self.backups = serde_json::from_str(&contents)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
        Ok(())
    }

    fn save_metadata(&self) -> io::Result<()> {
        let metadata_path = self.backup_path.join(METADATA_FILE);
        let contents = serde_json::to_string_pretty(&self.backups)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&metadata_path, contents)?;
        Ok(())
    }

    /// Archive a snapshot file. The snapshot itself is left in place.
    pub fn create_backup(
        &mut self,
        snapshot: &Path,
        name: Option<String>,
        kind: BackupKind,
    ) -> io::Result<BackupMetadata> {
        let timestamp = Utc::now();
        let mut id = format!("backup_{}", timestamp.format("%Y%m%d_%H%M%S_%3f"));
        let mut n = 1;
        while self.backups.contains_key(&id) {
            n += 1;
            id = format!("backup_{}_{}", timestamp.format("%Y%m%d_%H%M%S_%3f"), n);
        }
        let filename = format!("{}.tar.gz", id);
        let backup_file = self.backup_path.join(&filename);

        log::info!("Creating backup: {} ({:?})", id, kind);

        let tar_gz = File::create(&backup_file)?;
        let enc = GzEncoder::new(tar_gz, Compression::default());
        let mut tar = Builder::new(enc);
        let mut source = File::open(snapshot)?;
        tar.append_file(SNAPSHOT_ENTRY, &mut source)?;
        // The gzip stream must be complete before it is hashed.
        let enc = tar.into_inner()?;
        enc.finish()?;

        let checksum = calculate_checksum(&backup_file)?;
        let size_bytes = fs::metadata(&backup_file)?.len();
        let metadata = BackupMetadata {
            id: id.clone(),
            name,
            created_at: timestamp,
            size_bytes,
            kind,
            checksum,
            verified: false,
            path: PathBuf::from(&filename),
        };
        self.backups.insert(id.clone(), metadata.clone());
        self.save_metadata()?;

        log::info!("Backup created: {} ({} bytes)", id, size_bytes);
        Ok(metadata)
    }

    fn archive_of(&self, backup_id: &str) -> io::Result<(&BackupMetadata, PathBuf)> {
        let metadata = self
            .backups
            .get(backup_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Backup not found"))?;
        let backup_file = self.backup_path.join(&metadata.path);
        if !backup_file.exists() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "Backup file missing"));
        }
        Ok((metadata, backup_file))
    }

    pub fn verify_backup(&mut self, backup_id: &str) -> io::Result<bool> {
        let (metadata, backup_file) = self.archive_of(backup_id)?;
        let valid = calculate_checksum(&backup_file)? == metadata.checksum;
        if valid {
            log::info!("Backup verification passed: {}", backup_id);
            if let Some(meta) = self.backups.get_mut(backup_id) {
                meta.verified = true;
            }
            self.save_metadata()?;
        } else {
            log::error!("Backup verification FAILED: {} (checksum mismatch)", backup_id);
        }
        Ok(valid)
    }

    /// Replace the store file at `db_path` with the backup's snapshot. The store must
    /// not be open.
    pub fn restore_backup(&self, backup_id: &str, db_path: &Path) -> io::Result<()> {
        let (metadata, backup_file) = self.archive_of(backup_id)?;
        if calculate_checksum(&backup_file)? != metadata.checksum {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Backup checksum mismatch"));
        }
        log::info!("Restoring backup {} to {}", backup_id, db_path.display());

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let staged = db_path.with_extension("restoring");
        let mut archive = Archive::new(GzDecoder::new(File::open(&backup_file)?));
        let mut found = false;
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.as_os_str() == SNAPSHOT_ENTRY {
                entry.unpack(&staged)?;
                found = true;
                break;
            }
        }
        if !found {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Backup archive has no database snapshot",
            ));
        }
        for suffix in ["-wal", "-shm"] {
            let side = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if side.exists() {
                fs::remove_file(&side)?;
            }
        }
        fs::rename(&staged, db_path)?;
        log::info!("Backup restored: {}", backup_id);
        Ok(())
    }

    /// Keep the newest `keep` backups and delete the rest. Returns deleted ids.
    pub fn apply_retention_policy(&mut self) -> io::Result<Vec<String>> {
        if self.keep == 0 {
            return Ok(Vec::new());
        }
        let deleted: Vec<String> = self
            .list_backups()
            .into_iter()
            .skip(self.keep)
            .map(|b| b.id)
            .collect();
        for backup_id in &deleted {
            if let Some(metadata) = self.backups.remove(backup_id) {
                let backup_file = self.backup_path.join(&metadata.path);
                if backup_file.exists() {
                    fs::remove_file(&backup_file)?;
                }
                log::info!("Deleted old backup: {}", backup_id);
            }
        }
        if !deleted.is_empty() {
            self.save_metadata()?;
        }
        Ok(deleted)
    }

    /// All backups, newest first.
    pub fn list_backups(&self) -> Vec<BackupMetadata> {
        let mut backups: Vec<_> = self.backups.values().cloned().collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        backups
    }

    pub fn get_backup(&self, backup_id: &str) -> Option<&BackupMetadata> {
        self.backups.get(backup_id)
    }

    pub fn delete_backup(&mut self, backup_id: &str) -> io::Result<()> {
        let metadata = self
            .backups
            .remove(backup_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Backup not found"))?;
        let backup_file = self.backup_path.join(&metadata.path);
        if backup_file.exists() {
            fs::remove_file(&backup_file)?;
        }
        self.save_metadata()?;
        log::info!("Deleted backup: {}", backup_id);
        Ok(())
    }
}

fn calculate_checksum(path: &Path) -> io::Result<String> {
    use sha2::{Digest, Sha256};

    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot(dir: &Path, contents: &[u8]) -> PathBuf {
        let path = dir.join("snapshot.db");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_create_and_verify_backup() {
        let temp = TempDir::new().unwrap();
        let snap = snapshot(temp.path(), b"sqlite bytes");
        let mut manager = BackupManager::new(temp.path().join("backups"), 10).unwrap();

        let metadata = manager
            .create_backup(&snap, Some("before wipe".to_string()), BackupKind::Manual)
            .unwrap();
        assert_eq!(metadata.name.as_deref(), Some("before wipe"));
        assert!(metadata.size_bytes > 0);
        assert!(manager.backup_path().join(&metadata.path).exists());

        assert!(manager.verify_backup(&metadata.id).unwrap());
        assert!(manager.get_backup(&metadata.id).unwrap().verified);
    }

    #[test]
    fn test_tampered_backup_fails_verification() {
        let temp = TempDir::new().unwrap();
        let snap = snapshot(temp.path(), b"sqlite bytes");
        let mut manager = BackupManager::new(temp.path().join("backups"), 10).unwrap();
        let metadata = manager.create_backup(&snap, None, BackupKind::Manual).unwrap();

        fs::write(manager.backup_path().join(&metadata.path), b"garbage").unwrap();
        assert!(!manager.verify_backup(&metadata.id).unwrap());
        assert!(manager
            .restore_backup(&metadata.id, &temp.path().join("restored.db"))
            .is_err());
    }

    #[test]
    fn test_restore_replaces_file_and_side_files() {
        let temp = TempDir::new().unwrap();
        let snap = snapshot(temp.path(), b"first");
        let mut manager = BackupManager::new(temp.path().join("backups"), 10).unwrap();
        let metadata = manager.create_backup(&snap, None, BackupKind::PreImport).unwrap();

        let db = temp.path().join("data").join("storage.db");
        fs::create_dir_all(db.parent().unwrap()).unwrap();
        fs::write(&db, b"second").unwrap();
        let wal = temp.path().join("data").join("storage.db-wal");
        fs::write(&wal, b"stale").unwrap();

        manager.restore_backup(&metadata.id, &db).unwrap();
        assert_eq!(fs::read(&db).unwrap(), b"first");
        assert!(!wal.exists());
    }

    #[test]
    fn test_retention_keeps_newest() {
        let temp = TempDir::new().unwrap();
        let snap = snapshot(temp.path(), b"data");
        let mut manager = BackupManager::new(temp.path().join("backups"), 2).unwrap();
        for i in 0..5 {
            manager
                .create_backup(&snap, Some(format!("b{}", i)), BackupKind::Manual)
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let deleted = manager.apply_retention_policy().unwrap();
        assert_eq!(deleted.len(), 3);
        let names: Vec<_> = manager
            .list_backups()
            .into_iter()
            .filter_map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["b4".to_string(), "b3".to_string()]);
    }

    #[test]
    fn test_metadata_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let snap = snapshot(temp.path(), b"data");
        let dir = temp.path().join("backups");
        let id = {
            let mut manager = BackupManager::new(dir.clone(), 10).unwrap();
            manager.create_backup(&snap, None, BackupKind::Manual).unwrap().id
        };
        let mut manager = BackupManager::new(dir, 10).unwrap();
        assert!(manager.get_backup(&id).is_some());
        manager.delete_backup(&id).unwrap();
        assert!(manager.list_backups().is_empty());
    }
}
