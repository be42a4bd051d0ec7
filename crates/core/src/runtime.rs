use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::conf::Conf;
use crate::error::Result;

/// Version of the descriptor document layout.
pub const SCHEMA_VERSION: u32 = 1;

const FILE_SUFFIX: &str = ".turtle";

/// What a running instance records about itself in its working directory,
/// for out-of-process tooling.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RuntimeDescriptor {
    /// Layout version, `SCHEMA_VERSION` when written by this crate.
    pub schema_version: u32,
    /// Service name.
    pub name: String,
    /// Instance id.
    pub id: String,
    /// Process id.
    pub pid: u32,
    /// Bound API port, once the API started.
    pub port: Option<u16>,
    /// Bound API address, once the API started.
    pub host: Option<String>,
    /// Working directory of the process.
    pub cwd: PathBuf,
    /// Program and arguments the process was started with.
    pub start_command: Vec<String>,
    /// When the process started.
    pub started_at: DateTime<Utc>,
}

impl RuntimeDescriptor {
    /// Describes the current process running `conf`.
    ///
    /// # Errors
    ///
    /// Fails if the working directory cannot be read.
    pub fn for_current_process(conf: &Conf) -> Result<Self> {
        Ok(Self {
            schema_version: SCHEMA_VERSION,
            name: conf.name.clone(),
            id: conf.id.to_string(),
            pid: std::process::id(),
            port: None,
            host: None,
            cwd: std::env::current_dir()?,
            start_command: std::env::args().collect(),
            started_at: Utc::now(),
        })
    }

    /// `.<name>.<id>.turtle`
    #[must_use]
    pub fn file_name(name: &str, id: &str) -> String {
        format!(".{name}.{id}{FILE_SUFFIX}")
    }

    /// Location of this descriptor inside `dir`.
    #[must_use]
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(Self::file_name(&self.name, &self.id))
    }

    /// Writes the descriptor into `dir`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Fails on IO or serialization errors.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = self.path_in(dir);
        fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        debug!(path = %path.display(), pid = self.pid, port = ?self.port, "runtime descriptor written");

        Ok(path)
    }

    /// Reads a descriptor file.
    ///
    /// # Errors
    ///
    /// Fails on IO or parse errors.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    /// Whether the recorded process is alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        process_alive(self.pid)
    }

    /// The display name used by tooling, `<name>.<id>`.
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{}.{}", self.name, self.id)
    }
}

/// Probes `pid` with the null signal.
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    // EPERM means the process exists but belongs to someone else.
    matches!(signal::kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

/// The address other processes should use to reach a listener bound to
/// `ip`. Wildcard binds are replaced by the machine's local address, or
/// loopback when it cannot be determined.
#[must_use]
pub fn advertised_host(ip: IpAddr) -> String {
    if !ip.is_unspecified() {
        return ip.to_string();
    }

    match local_ip_address::local_ip() {
        Ok(local) => local.to_string(),
        Err(e) => {
            warn!(error = %e, "cannot determine the local address, advertising loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST).to_string()
        }
    }
}

fn is_descriptor_file(file_name: &str) -> bool {
    file_name.starts_with('.')
        && file_name.ends_with(FILE_SUFFIX)
        && file_name.len() > FILE_SUFFIX.len() + 1
}

/// Every readable descriptor in `dir`, sorted by file name. Unreadable files
/// are skipped with a warning.
///
/// # Errors
///
/// Fails if `dir` cannot be listed.
pub fn discover(dir: &Path) -> Result<Vec<(PathBuf, RuntimeDescriptor)>> {
    let mut found = Vec::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !is_descriptor_file(file_name) {
            continue;
        }

        match RuntimeDescriptor::load(&path) {
            Ok(descriptor) => found.push((path, descriptor)),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable runtime file"),
        }
    }

    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

/// Finds the descriptor in `dir` that `target` names: a file name, a
/// `<name>.<id>` pair, a bare service name or a pid.
///
/// # Errors
///
/// Fails if `dir` cannot be listed.
pub fn find(dir: &Path, target: &str) -> Result<Option<(PathBuf, RuntimeDescriptor)>> {
    let pid = target.parse::<u32>().ok();
    let dotted = format!(".{target}{FILE_SUFFIX}");

    Ok(discover(dir)?.into_iter().find(|(path, descriptor)| {
        let file_name = path.file_name().and_then(|name| name.to_str());
        file_name == Some(target)
            || file_name == Some(dotted.as_str())
            || descriptor.name == target
            || pid == Some(descriptor.pid)
    }))
}
