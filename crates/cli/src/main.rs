//! `turtle`: inspect, stop and restart turtle instances through the runtime
//! files they leave in their working directory, and read the logs `restart`
//! writes there.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::fs::{self, OpenOptions};
use std::future::Future;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;
use turtle_core::{RuntimeDescriptor, discover, find};

const STOP_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_POLL: Duration = Duration::from_millis(200);
const FOLLOW_POLL: Duration = Duration::from_millis(250);

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Core library error
    #[error(transparent)]
    Core(#[from] turtle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The log index is outside the listed files.
    #[error("log index {index} is out of range, expected 0..{count} or -1 for the last one")]
    InvalidLogIndex {
        /// Requested index.
        index: i64,
        /// Number of listed files.
        count: usize,
    },

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The runtime file records no command to start the instance with.
    #[error("cannot extract the start command from {0}")]
    NoStartCommand(PathBuf),

    /// No turtle log file was found.
    #[error("no turtle logs found in {0}")]
    NoLogs(PathBuf),

    /// No runtime file matches the target.
    #[error("cannot find the turtle process {0} in {1}")]
    NotFound(String, PathBuf),

    /// The recorded process is not running.
    #[error("process {pid} of {name} is not running")]
    NotRunning {
        /// Display name of the instance.
        name: String,
        /// Recorded pid.
        pid: u32,
    },

    /// The recorded pid does not fit a platform pid.
    #[error("invalid pid {0}")]
    InvalidPid(u32),

    /// Could not set global default subscriber.
    #[error("could not set global default subscriber: {0}")]
    SetTracing(#[from] tracing::dispatcher::SetGlobalDefaultError),

    /// Sending a signal failed.
    #[error("signal error: {0}")]
    Signal(#[from] nix::Error),

    /// The process did not exit in time after SIGINT.
    #[error("process {0} did not exit within {1:?}")]
    StopTimeout(u32, Duration),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory holding the runtime files
    #[arg(short = 'C', long, default_value = ".", global = true)]
    dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, Subcommand)]
enum Commands {
    /// List the turtle instances of the directory
    Ls {
        /// Print whether each process is alive
        #[arg(short, long)]
        process: bool,

        /// Print the full runtime info of each instance
        #[arg(short, long)]
        info: bool,
    },

    /// Send SIGINT to an instance and wait for it to exit
    Stop {
        /// File name, `<name>.<id>`, service name or pid
        target: String,
    },

    /// List the log files written by `restart` and optionally follow one
    Log {
        /// Only logs of this service name or `<name>.<id>`
        target: Option<String>,

        /// Index of the file to select, -1 for the last one
        #[arg(short = 'n', long, default_value_t = -1, allow_negative_numbers = true)]
        index: i64,

        /// Keep printing data appended to the selected file until interrupted
        #[arg(short, long)]
        follow: bool,
    },

    /// Stop an instance if running and start it again with its recorded
    /// command
    Restart {
        /// File name, `<name>.<id>`, service name or pid
        target: String,

        /// File receiving the new process's stdout and stderr
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

fn list(dir: &Path, process: bool, show_info: bool) -> Result<(), Error> {
    let found = discover(dir)?;
    if found.is_empty() {
        println!("no turtle process found in {}", dir.display());
        return Ok(());
    }

    for (path, descriptor) in found {
        let mut line = descriptor.display_name();
        if process {
            let status = if descriptor.is_alive() { "active" } else { "inactive" };
            line = format!("{line}\tpid:{}\t{status}", descriptor.pid);
        }
        if let Some(port) = descriptor.port {
            line = format!("{line}\tport:{port}");
        }
        println!("{line}");

        if show_info {
            println!("  {}", path.display());
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }
    }

    Ok(())
}

fn locate(dir: &Path, target: &str) -> Result<(PathBuf, RuntimeDescriptor), Error> {
    find(dir, target)?.ok_or_else(|| Error::NotFound(target.to_string(), dir.to_path_buf()))
}

async fn interrupt_and_wait(descriptor: &RuntimeDescriptor) -> Result<(), Error> {
    let raw = i32::try_from(descriptor.pid).map_err(|_| Error::InvalidPid(descriptor.pid))?;

    info!(
        name = %descriptor.display_name(),
        pid = descriptor.pid,
        "process is running, sending SIGINT"
    );
    signal::kill(Pid::from_raw(raw), Signal::SIGINT)?;

    tokio::time::timeout(STOP_TIMEOUT, async {
        while descriptor.is_alive() {
            tokio::time::sleep(STOP_POLL).await;
        }
    })
    .await
    .map_err(|_| Error::StopTimeout(descriptor.pid, STOP_TIMEOUT))?;

    info!(name = %descriptor.display_name(), pid = descriptor.pid, "process has been stopped");
    Ok(())
}

async fn stop(dir: &Path, target: &str) -> Result<(), Error> {
    let (_, descriptor) = locate(dir, target)?;
    if !descriptor.is_alive() {
        return Err(Error::NotRunning {
            name: descriptor.display_name(),
            pid: descriptor.pid,
        });
    }

    interrupt_and_wait(&descriptor).await
}

async fn restart(dir: &Path, target: &str, out: Option<PathBuf>) -> Result<(), Error> {
    let (path, descriptor) = locate(dir, target)?;
    info!(path = %path.display(), "runtime file loaded");

    if descriptor.is_alive() {
        interrupt_and_wait(&descriptor).await?;
    }

    let Some((program, args)) = descriptor.start_command.split_first() else {
        return Err(Error::NoStartCommand(path));
    };

    let out = out.unwrap_or_else(|| {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("turtle");
        dir.join(format!("{file_name}.{}.log", Utc::now().format("%Y%m%d%H%M%S")))
    });
    let log = OpenOptions::new().create(true).append(true).open(&out)?;

    let child = Command::new(program)
        .args(args)
        .current_dir(&descriptor.cwd)
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .process_group(0)
        .spawn()?;

    info!(
        pid = child.id(),
        program = %program,
        out = %out.display(),
        "process has been created"
    );
    Ok(())
}

fn is_log_file(file_name: &str, target: Option<&str>) -> bool {
    const MARKER: &str = ".turtle";

    let is_log = file_name
        .find(MARKER)
        .is_some_and(|position| file_name[position + MARKER.len()..].ends_with(".log"));

    is_log && target.is_none_or(|target| file_name.starts_with(&format!(".{target}.")))
}

fn log_files(dir: &Path, target: Option<&str>) -> Result<Vec<PathBuf>, Error> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| is_log_file(name, target))
        {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

fn select_log(files: &[PathBuf], index: i64) -> Result<&PathBuf, Error> {
    let count = files.len();
    let selected = if index == -1 {
        files.last()
    } else {
        usize::try_from(index).ok().and_then(|index| files.get(index))
    };

    selected.ok_or(Error::InvalidLogIndex { index, count })
}

/// Copies `path` to `out`, then keeps copying whatever is appended until
/// `stop` resolves.
async fn follow_file<W, S>(path: &Path, out: &mut W, stop: S) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0_u8; 8192];
    tokio::pin!(stop);

    loop {
        let read = file.read(&mut buf).await?;
        if read > 0 {
            out.write_all(&buf[..read]).await?;
            out.flush().await?;
            continue;
        }

        tokio::select! {
            () = &mut stop => return Ok(()),
            () = tokio::time::sleep(FOLLOW_POLL) => {}
        }
    }
}

async fn log(dir: &Path, target: Option<&str>, index: i64, follow: bool) -> Result<(), Error> {
    let files = log_files(dir, target)?;
    if files.is_empty() {
        return Err(Error::NoLogs(dir.to_path_buf()));
    }

    println!("turtle log files in {}", dir.display());
    for (i, file) in files.iter().enumerate() {
        println!("[{i}] {}", file.display());
    }

    let selected = select_log(&files, index)?;
    println!("log file selected: {}", selected.display());

    if follow {
        info!(path = %selected.display(), "following log file");
        follow_file(selected, &mut tokio::io::stdout(), async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c");
            }
        })
        .await?;
        info!(path = %selected.display(), "stopped following log file");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(Level::INFO)
            .finish(),
    )?;

    let args = Args::parse();

    let result = match args.command {
        Commands::Ls { process, info } => list(&args.dir, process, info),
        Commands::Log {
            target,
            index,
            follow,
        } => log(&args.dir, target.as_deref(), index, follow).await,
        Commands::Stop { target } => stop(&args.dir, &target).await,
        Commands::Restart { target, out } => restart(&args.dir, &target, out).await,
    };

    if let Err(e) = &result {
        warn!(error = %e, "command failed");
    }
    result
}
