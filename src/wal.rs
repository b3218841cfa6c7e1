//! Append-only write-ahead log: one JSON object per line, rotated by
//! size. Recovery replays the live file plus any archived rotations in
//! order; rotation is forward-only and never rewrites history.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct WalConfig {
    pub path: PathBuf,
    pub max_bytes: u64,
}

impl WalConfig {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
        }
    }
}

/// One logical record appended to the WAL. `ts_ns` is the simulated
/// event time; `event` names the variant so replay can dispatch on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub ts_ns: i64,
    pub event: String,
    #[serde(flatten)]
    pub fields: Value,
}

pub struct WalWriter {
    config: WalConfig,
    writer: BufWriter<File>,
    current_bytes: u64,
    rotation: u32,
}

impl WalWriter {
    pub fn open(config: WalConfig) -> io::Result<Self> {
        if let Some(parent) = config.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)?;
        let current_bytes = file.metadata()?.len();
        Ok(Self {
            config,
            writer: BufWriter::with_capacity(64 * 1024, file),
            current_bytes,
            rotation: 0,
        })
    }

    pub fn append(&mut self, entry: &WalEntry) -> io::Result<()> {
        let line = serde_json::to_string(entry)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.current_bytes += line.len() as u64 + 1;
        self.flush()?;
        if self.config.max_bytes > 0 && self.current_bytes >= self.config.max_bytes {
            self.rotate()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.flush()?;
        self.rotation += 1;
        let rotated_path = rotated_path(&self.config.path, self.rotation);
        fs::rename(&self.config.path, &rotated_path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)?;
        self.writer = BufWriter::with_capacity(64 * 1024, file);
        self.current_bytes = 0;
        Ok(())
    }

    /// Renames the live WAL aside as an archive after a checkpoint, so
    /// the next append starts a fresh live file.
    pub fn truncate_after_checkpoint(&mut self, checkpoint_ns: i64) -> io::Result<()> {
        self.flush()?;
        if self.config.path.exists() && fs::metadata(&self.config.path)?.len() > 0 {
            let archived = self.config.path.with_extension(format!(
                "jsonl.{checkpoint_ns}.archived"
            ));
            fs::rename(&self.config.path, &archived)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)?;
        self.writer = BufWriter::with_capacity(64 * 1024, file);
        self.current_bytes = 0;
        Ok(())
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn rotated_path(base: &Path, n: u32) -> PathBuf {
    let mut os = base.as_os_str().to_owned();
    os.push(format!(".{n}"));
    PathBuf::from(os)
}

/// Reads every entry in the live WAL whose `ts_ns` is strictly greater
/// than `after_ns`, skipping any line that fails to parse.
pub fn load_entries_after(path: &Path, after_ns: i64) -> io::Result<Vec<WalEntry>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<WalEntry>(&line) {
            if entry.ts_ns > after_ns {
                entries.push(entry);
            }
        }
    }
    Ok(entries)
}

/// Lists archived WAL files for cleanup, in lexicographic (== chronological,
/// since the suffix is a nanosecond timestamp) order.
pub fn archived_files(dir: &Path, session_id: &str) -> io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let prefix = format!("session_{session_id}.wal.jsonl.");
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".archived"))
        })
        .collect();
    files.sort();
    Ok(files)
}

pub fn cleanup_old_archives(dir: &Path, session_id: &str, keep: usize) -> io::Result<()> {
    let files = archived_files(dir, session_id)?;
    if files.len() <= keep {
        return Ok(());
    }
    for stale in &files[..files.len() - keep] {
        fs::remove_file(stale)?;
    }
    Ok(())
}
