/// Point-in-time process counters read from the `/proc` pseudo-filesystem.
///
/// Every read opens, parses, and drops its own handle. Nothing here retries;
/// the monitor loop owns the retry policy.
use nix::unistd::{sysconf, SysconfVar};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Label of the resident-set-size line in `/proc/<pid>/status`.
const RSS_LABEL: &[u8] = b"VmRSS:";

/// 1-based field positions in `/proc/<pid>/stat` (see proc(5)).
const STAT_STATE_FIELD: usize = 3;
const STAT_UTIME_FIELD: usize = 14;
const STAT_STIME_FIELD: usize = 15;

/// Upper bound on tokens scanned after the command name.
const STAT_MAX_TOKENS: usize = 64;

/// Used when `sysconf(_SC_CLK_TCK)` gives nothing usable.
const DEFAULT_CLOCK_TICKS: u64 = 100;

/// Errors from a single pseudo-file read.
#[derive(Debug)]
pub enum ReadError {
    /// The file could not be opened or read (process gone, permission denied).
    Unavailable {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file was read but the expected field was not in it.
    FieldMissing { path: PathBuf, field: &'static str },
    /// The field was present but its value is not a number.
    Parse {
        path: PathBuf,
        field: &'static str,
        value: String,
    },
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::Unavailable { path, source } => {
                write!(f, "cannot read {}: {}", path.display(), source)
            }
            ReadError::FieldMissing { path, field } => {
                write!(f, "field {} not found in {}", field, path.display())
            }
            ReadError::Parse { path, field, value } => {
                write!(
                    f,
                    "field {} in {} is not a number: {:?}",
                    field,
                    path.display(),
                    value
                )
            }
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReadError::Unavailable { source, .. } => Some(source),
            ReadError::FieldMissing { .. } | ReadError::Parse { .. } => None,
        }
    }
}

/// Source of per-process counters consumed by the monitor loop.
pub trait ProcessSampler {
    /// Resident memory in kilobytes.
    fn resident_memory_kb(&self, pid: u32) -> Result<u64, ReadError>;
    /// User plus kernel CPU time in clock ticks.
    fn cpu_ticks(&self, pid: u32) -> Result<u64, ReadError>;
}

/// Reads `status`, `stat`, and `comm` under a proc root (normally `/proc`).
#[derive(Debug, Clone)]
pub struct ProcStatReader {
    root: PathBuf,
}

impl ProcStatReader {
    /// Create a reader rooted at `root`. Tests point this at a fixture directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The proc root this reader resolves PIDs against.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pid_file(&self, pid: u32, name: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(name)
    }

    /// Resident set size of `pid` in KB, from the `VmRSS:` line of its status file.
    pub fn read_resident_memory(&self, pid: u32) -> Result<u64, ReadError> {
        let path = self.pid_file(pid, "status");
        let file = File::open(&path).map_err(|e| ReadError::Unavailable {
            path: path.clone(),
            source: e,
        })?;
        parse_resident_memory(BufReader::new(file), &path)
    }

    /// utime + stime of `pid` in clock ticks, from its stat file.
    pub fn read_cpu_ticks(&self, pid: u32) -> Result<u64, ReadError> {
        let path = self.pid_file(pid, "stat");
        let content = std::fs::read(&path).map_err(|e| ReadError::Unavailable {
            path: path.clone(),
            source: e,
        })?;
        parse_cpu_ticks(&content, &path)
    }

    /// Short command name of `pid`, from its comm file.
    pub fn read_process_name(&self, pid: u32) -> Result<String, ReadError> {
        let path = self.pid_file(pid, "comm");
        let content = std::fs::read(&path).map_err(|e| ReadError::Unavailable {
            path: path.clone(),
            source: e,
        })?;
        let name = String::from_utf8_lossy(&content).trim_end().to_string();
        if name.is_empty() {
            return Err(ReadError::FieldMissing { path, field: "comm" });
        }
        Ok(name)
    }
}

impl Default for ProcStatReader {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcessSampler for ProcStatReader {
    fn resident_memory_kb(&self, pid: u32) -> Result<u64, ReadError> {
        self.read_resident_memory(pid)
    }

    fn cpu_ticks(&self, pid: u32) -> Result<u64, ReadError> {
        self.read_cpu_ticks(pid)
    }
}

/// Scan status lines for `VmRSS:` and parse the first token after it.
///
/// Lines are split on raw bytes with a growing buffer, so long lines and
/// non-UTF-8 process names elsewhere in the file are harmless.
fn parse_resident_memory<R: BufRead>(reader: R, path: &Path) -> Result<u64, ReadError> {
    for line in reader.split(b'\n') {
        let line = line.map_err(|e| ReadError::Unavailable {
            path: path.to_path_buf(),
            source: e,
        })?;
        let Some(rest) = line.strip_prefix(RSS_LABEL) else {
            continue;
        };
        let rest = String::from_utf8_lossy(rest);
        let value = rest.split_whitespace().next().unwrap_or_default();
        return value.parse().map_err(|_| ReadError::Parse {
            path: path.to_path_buf(),
            field: "VmRSS",
            value: value.to_string(),
        });
    }

    Err(ReadError::FieldMissing {
        path: path.to_path_buf(),
        field: "VmRSS",
    })
}

/// Parse utime + stime out of a stat line.
///
/// Format: `pid (comm) state ppid ... utime stime ...`. The command name can
/// hold spaces and parentheses, so counting restarts after the last `)`.
fn parse_cpu_ticks(content: &[u8], path: &Path) -> Result<u64, ReadError> {
    let comm_end = content
        .iter()
        .rposition(|&b| b == b')')
        .ok_or_else(|| ReadError::FieldMissing {
            path: path.to_path_buf(),
            field: "comm",
        })?;

    let after_comm = String::from_utf8_lossy(&content[comm_end + 1..]);
    let fields: Vec<&str> = after_comm
        .split_whitespace()
        .take(STAT_MAX_TOKENS)
        .collect();

    let utime = stat_field(&fields, STAT_UTIME_FIELD, "utime", path)?;
    let stime = stat_field(&fields, STAT_STIME_FIELD, "stime", path)?;
    Ok(utime.saturating_add(stime))
}

/// Look up a 1-based stat field in the tokens that follow the command name.
fn stat_field(
    fields: &[&str],
    position: usize,
    name: &'static str,
    path: &Path,
) -> Result<u64, ReadError> {
    let raw = fields
        .get(position - STAT_STATE_FIELD)
        .ok_or_else(|| ReadError::FieldMissing {
            path: path.to_path_buf(),
            field: name,
        })?;
    raw.parse().map_err(|_| ReadError::Parse {
        path: path.to_path_buf(),
        field: name,
        value: raw.to_string(),
    })
}

/// Kernel clock ticks per second (`_SC_CLK_TCK`).
pub fn clock_ticks_per_second() -> u64 {
    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as u64,
        _ => DEFAULT_CLOCK_TICKS,
    }
}
