//! Remote Read Broker
//!
//! Fetches byte ranges of files that live on other hosts. `SshReader` keeps
//! one persistent remote-shell control connection per host and reads the
//! requested range with `dd` on the far side.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use parking_lot::Mutex;

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::registry::{Host, HostId};

/// Reads file ranges from a remote host
pub trait RemoteReader: Send + Sync {
    /// Read up to `length` bytes at `offset` of `path` on `host`
    fn read(&self, host: &Host, path: &Path, offset: u64, length: u64) -> Result<Vec<u8>>;
}

/// Read up to `length` bytes at `offset` of a local file
pub fn read_local_range(path: &Path, offset: u64, length: u64) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;

    let mut buf = Vec::with_capacity(length.min(1 << 20) as usize);
    file.take(length).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Control connection kept for one host
#[derive(Debug, Clone)]
struct Control {
    socket: PathBuf,
    destination: String,
    port: u16,
}

/// Remote reader backed by the system ssh client
pub struct SshReader {
    config: BrokerConfig,
    controls: Mutex<HashMap<HostId, Control>>,
}

impl SshReader {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            controls: Mutex::new(HashMap::new()),
        }
    }

    fn control_for(&self, host: &Host) -> Control {
        let destination = match &self.config.user {
            Some(user) => format!("{}@{}", user, host.address),
            None => host.address.clone(),
        };
        let socket = self
            .config
            .control_dir
            .join(format!("gsfs-{}-{}.ctl", std::process::id(), host.id));

        let mut controls = self.controls.lock();
        let control = controls.entry(host.id).or_insert_with(|| Control {
            socket: socket.clone(),
            destination: destination.clone(),
            port: host.ssh_port,
        });
        // the registry may have moved the host
        if control.destination != destination || control.port != host.ssh_port {
            *control = Control {
                socket,
                destination,
                port: host.ssh_port,
            };
        }
        control.clone()
    }

    fn base_command(&self, control: &Control) -> Command {
        let mut cmd = Command::new(&self.config.ssh_program);
        cmd.arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg(format!("ControlPath={}", control.socket.display()))
            .arg("-o")
            .arg("ControlPersist=yes")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_secs))
            .arg("-p")
            .arg(control.port.to_string());
        cmd
    }

    fn read_once(&self, control: &Control, path: &Path, offset: u64, length: u64) -> std::result::Result<Vec<u8>, String> {
        let output = self
            .base_command(control)
            .arg(&control.destination)
            .arg(dd_command(path, offset, length))
            .stdin(Stdio::null())
            .output()
            .map_err(|e| format!("cannot run {}: {}", self.config.ssh_program, e))?;

        if !output.status.success() {
            return Err(format!(
                "{} ({})",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(output.stdout)
    }

    /// Tear down the control connection so the next call opens a fresh one
    fn invalidate(&self, control: &Control) {
        let status = self
            .base_command(control)
            .arg("-O")
            .arg("exit")
            .arg(&control.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = status {
            tracing::debug!("Closing control connection to {} failed: {}", control.destination, e);
        }
    }
}

impl RemoteReader for SshReader {
    fn read(&self, host: &Host, path: &Path, offset: u64, length: u64) -> Result<Vec<u8>> {
        let control = self.control_for(host);

        match self.read_once(&control, path, offset, length) {
            Ok(data) => Ok(data),
            Err(first) => {
                tracing::warn!(
                    "Read of {} from host {} failed, reconnecting: {}",
                    path.display(),
                    host.id,
                    first
                );
                self.invalidate(&control);
                self.read_once(&control, path, offset, length)
                    .map_err(|reason| {
                        self.invalidate(&control);
                        Error::RemoteRead { host: host.id, reason }
                    })
            }
        }
    }
}

impl Drop for SshReader {
    fn drop(&mut self) {
        let controls: Vec<Control> = self.controls.lock().drain().map(|(_, c)| c).collect();
        for control in controls {
            self.invalidate(&control);
        }
    }
}

/// Remote command reading one byte range
fn dd_command(path: &Path, offset: u64, length: u64) -> String {
    format!(
        "dd if={} bs=65536 iflag=skip_bytes,count_bytes skip={} count={} status=none",
        shell_quote(&path.to_string_lossy()),
        offset,
        length
    )
}

/// Single-quote `s` for a POSIX shell
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
