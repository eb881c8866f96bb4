//! Durable, self-contained run snapshots.
//!
//! A checkpoint holds everything needed to continue a run bit-for-bit on the
//! same machine class: the configuration it was started with, the clock, the
//! geometry, every species value with its carried rounding remainder, the
//! exact position of the random stream and the integrator's step-size hint.
//! New fields are added with serde defaults so older files stay readable;
//! files written by a newer schema are refused.

use crate::clock::SimulationClock;
use crate::error::{SimError, SimResult};
use crate::growth::CellGeometry;
use crate::species::{Domain, Unit};
use crate::stochastic::EngineRng;
use cell_common::{ConfigError, RunConfig, RunStatus};
use log::{debug, info, warn};
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Wait before the single retry of a failed filesystem operation.
const IO_RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesRecord {
    pub name: String,
    pub domain: Domain,
    pub unit: Unit,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub concentration_mm: f64,
    /// Carried rounding remainder of a dual species.
    #[serde(default)]
    pub remainder: f64,
}

/// Exact position of a ChaCha stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngState {
    pub seed: [u8; 32],
    pub stream: u64,
    /// Word position split into halves; not every format carries 128-bit integers.
    pub word_pos_hi: u64,
    pub word_pos_lo: u64,
}

impl RngState {
    pub fn capture(rng: &EngineRng) -> Self {
        let pos = rng.get_word_pos();
        RngState {
            seed: rng.get_seed(),
            stream: rng.get_stream(),
            word_pos_hi: (pos >> 64) as u64,
            word_pos_lo: pos as u64,
        }
    }

    pub fn restore(&self) -> EngineRng {
        let mut rng = EngineRng::from_seed(self.seed);
        rng.set_stream(self.stream);
        rng.set_word_pos(((self.word_pos_hi as u128) << 64) | self.word_pos_lo as u128);
        rng
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    /// Version of the engine that wrote the checkpoint. Informational.
    #[serde(default)]
    pub engine_version: String,
    pub config: RunConfig,
    /// Seed the run was started with, after resolving an absent seed.
    pub seed: u64,
    pub status: RunStatus,
    pub clock: SimulationClock,
    pub geometry: CellGeometry,
    pub species: Vec<SpeciesRecord>,
    pub rng: RngState,
    pub integrator_step_hint: f64,
    #[serde(default)]
    pub state_version: u64,
    #[serde(default)]
    pub total_events: u64,
}

impl Checkpoint {
    pub fn time_min(&self) -> f64 {
        self.clock.time_min()
    }

    /// Rejects checkpoints written by a newer schema.
    pub fn check_schema(&self) -> Result<(), ConfigError> {
        if self.schema_version > CHECKPOINT_SCHEMA_VERSION {
            return Err(ConfigError::InvalidValue {
                field: "schema_version".to_string(),
                reason: format!(
                    "checkpoint schema {} is newer than supported schema {}",
                    self.schema_version, CHECKPOINT_SCHEMA_VERSION
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    Json,
    MessagePack,
}

impl CheckpointFormat {
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name {
            "json" => Ok(CheckpointFormat::Json),
            "messagepack" => Ok(CheckpointFormat::MessagePack),
            other => Err(ConfigError::InvalidValue {
                field: "output.checkpoint_format".to_string(),
                reason: format!("unsupported format '{}'", other),
            }),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            CheckpointFormat::Json => "json",
            CheckpointFormat::MessagePack => "msgpack",
        }
    }

    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("msgpack") => CheckpointFormat::MessagePack,
            _ => CheckpointFormat::Json,
        }
    }

    fn encode(self, checkpoint: &Checkpoint) -> io::Result<Vec<u8>> {
        match self {
            CheckpointFormat::Json => serde_json::to_vec_pretty(checkpoint).map_err(io::Error::other),
            CheckpointFormat::MessagePack => rmp_serde::to_vec_named(checkpoint).map_err(io::Error::other),
        }
    }

    fn decode(self, bytes: &[u8]) -> io::Result<Checkpoint> {
        match self {
            CheckpointFormat::Json => {
                serde_json::from_slice(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            }
            CheckpointFormat::MessagePack => {
                rmp_serde::from_slice(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            }
        }
    }
}

/// Writes and reads checkpoints in one directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    format: CheckpointFormat,
    label: String,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, format: CheckpointFormat) -> Self {
        CheckpointStore { dir: dir.into(), format, label: "checkpoint".to_string() }
    }

    /// Prefix for file names, so replicates can share a directory.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, checkpoint: &Checkpoint) -> PathBuf {
        self.dir.join(format!(
            "{}_step{:08}.{}",
            self.label,
            checkpoint.clock.step_index(),
            self.format.extension()
        ))
    }

    /// Persists `checkpoint` atomically and returns its path.
    ///
    /// The bytes go to a temporary file that is flushed to disk and then
    /// renamed over the target, so an interrupted write never damages an
    /// earlier checkpoint.
    pub fn save(&self, checkpoint: &Checkpoint) -> SimResult<PathBuf> {
        let path = self.path_for(checkpoint);
        let time_sec = Some(checkpoint.clock.time_sec());
        let bytes = self.format.encode(checkpoint).map_err(|source| SimError::Io {
            operation: "encode",
            path: path.clone(),
            time_sec,
            source,
        })?;

        with_retry("write", &path, time_sec, || {
            fs::create_dir_all(&self.dir)?;
            write_atomically(&path, &bytes)
        })?;
        info!("Checkpoint written to {} (t={:.1} min)", path.display(), checkpoint.time_min());
        Ok(path)
    }

    /// Reads a checkpoint, choosing the decoder from the file extension.
    pub fn load(path: impl AsRef<Path>) -> SimResult<Checkpoint> {
        let path = path.as_ref();
        let bytes = with_retry("read", path, None, || fs::read(path))?;
        let checkpoint = CheckpointFormat::from_path(path).decode(&bytes).map_err(|source| SimError::Io {
            operation: "decode",
            path: path.to_path_buf(),
            time_sec: None,
            source,
        })?;
        checkpoint.check_schema()?;
        debug!("Loaded checkpoint {} (schema {})", path.display(), checkpoint.schema_version);
        Ok(checkpoint)
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;

    // Persist the rename itself where the platform allows syncing directories.
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Runs a filesystem operation, retrying once after a short backoff.
fn with_retry<T>(
    operation: &'static str,
    path: &Path,
    time_sec: Option<f64>,
    mut op: impl FnMut() -> io::Result<T>,
) -> SimResult<T> {
    match op() {
        Ok(value) => Ok(value),
        Err(first) => {
            warn!("Checkpoint {} failed for '{}': {}; retrying once", operation, path.display(), first);
            thread::sleep(IO_RETRY_BACKOFF);
            op().map_err(|source| SimError::Io { operation, path: path.to_path_buf(), time_sec, source })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn rng_state_resumes_the_same_stream() {
        let mut rng = EngineRng::seed_from_u64(42);
        for _ in 0..1_000 {
            let _: f64 = rng.random();
        }
        let saved = RngState::capture(&rng);
        let mut resumed = saved.restore();
        let a: Vec<u64> = (0..16).map(|_| rng.random()).collect();
        let b: Vec<u64> = (0..16).map(|_| resumed.random()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(CheckpointFormat::parse("yaml").is_err());
        assert_eq!(CheckpointFormat::parse("messagepack").unwrap().extension(), "msgpack");
    }

    #[test]
    fn missing_file_is_an_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = CheckpointStore::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, SimError::Io { operation: "read", .. }));
        assert_eq!(err.time_sec(), None);
    }

    #[test]
    fn corrupt_file_is_an_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, b"{ not json").unwrap();
        let err = CheckpointStore::load(&path).unwrap_err();
        assert!(matches!(err, SimError::Io { operation: "decode", .. }));
    }
}
