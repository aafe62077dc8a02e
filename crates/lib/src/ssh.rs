//! A [`Device`] reached over SSH.

use std::io::Write;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use abflash_utils::{check_output, shell_join, CommandRunExt};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::device::{Compression, Device, Input};
use crate::progress::REBOOT_WAIT_MARKER;

const DEFAULT_WORK_DIR: &str = "/usr/local/tmp";
const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";
const MAKE_DEV_SSD: &str = "/usr/share/vboot/bin/make_dev_ssd.sh";
const SSH_OPTIONS: &[&str] = &[
    "BatchMode=yes",
    "StrictHostKeyChecking=no",
    "UserKnownHostsFile=/dev/null",
    "LogLevel=ERROR",
    "ConnectTimeout=30",
    "ServerAliveInterval=10",
    "ServerAliveCountMax=3",
];

/// A device reachable as `root` over SSH.
#[derive(Debug, Clone)]
pub struct SshDevice {
    hostname: String,
    port: Option<u16>,
    identity: Option<Utf8PathBuf>,
    work_dir: String,
    poll_interval: Duration,
}

impl SshDevice {
    /// A device at `hostname` using the default port and identity.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: None,
            identity: None,
            work_dir: DEFAULT_WORK_DIR.to_string(),
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Connect to a non-default port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Authenticate with the given private key.
    pub fn with_identity(mut self, identity: &Utf8Path) -> Self {
        self.identity = Some(identity.to_owned());
        self
    }

    fn ssh_command(&self, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        for opt in SSH_OPTIONS {
            cmd.args(["-o", opt]);
        }
        if let Some(port) = self.port {
            cmd.args(["-p", &port.to_string()]);
        }
        if let Some(identity) = &self.identity {
            cmd.args(["-i", identity.as_str()]);
        }
        cmd.arg(format!("root@{}", self.hostname));
        cmd.arg("--");
        cmd.arg(remote);
        cmd
    }

    fn boot_id(&self) -> Result<String> {
        Ok(self
            .run(&["cat", BOOT_ID_PATH], Input::Null)?
            .trim()
            .to_string())
    }
}

impl Device for SshDevice {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn run(&self, argv: &[&str], input: Input) -> Result<String> {
        let remote = shell_join(argv)?;
        let (stdin, buf) = match input {
            Input::Null => (Stdio::null(), None),
            Input::Bytes(b) => (Stdio::piped(), Some(b)),
            Input::Stream(f) => (Stdio::from(f), None),
        };
        // Scoped so our copy of a streamed stdin is closed once the child owns it
        let mut child = {
            let mut cmd = self.ssh_command(&remote);
            cmd.stdin(stdin)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .log_debug();
            cmd.spawn().context("Spawning ssh")?
        };
        let output: Output = std::thread::scope(|s| {
            if let (Some(buf), Some(mut stdin)) = (buf.as_deref(), child.stdin.take()) {
                s.spawn(move || {
                    // A write error shows up as the command failing
                    let _ = stdin.write_all(buf);
                });
            }
            child.wait_with_output()
        })
        .context("Waiting for ssh")?;
        check_output("ssh", &output)
            .with_context(|| format!("Running `{remote}` on {}", self.hostname))?;
        String::from_utf8(output.stdout).context("Parsing command output")
    }

    fn root_dev(&self) -> Result<Utf8PathBuf> {
        let dev = self.run(&["rootdev", "-s"], Input::Null)?;
        Ok(Utf8PathBuf::from(dev.trim()))
    }

    fn work_dir(&self) -> &str {
        &self.work_dir
    }

    #[context("Rebooting {}", self.hostname)]
    fn reboot(&self, timeout: Duration) -> Result<()> {
        let old = self.boot_id()?;
        // The connection is usually torn down before `reboot` returns.
        if let Err(e) = self.run(&["reboot"], Input::Null) {
            tracing::debug!("reboot: {e:#}");
        }
        let deadline = Instant::now() + timeout;
        loop {
            std::thread::sleep(self.poll_interval);
            match self.boot_id() {
                Ok(id) if !id.is_empty() && id != old => {
                    tracing::debug!("{} is back with boot id {id}", self.hostname);
                    return Ok(());
                }
                _ => tracing::info!("{REBOOT_WAIT_MARKER}, still waiting for reboot"),
            }
            if Instant::now() >= deadline {
                anyhow::bail!("Timed out after {timeout:?} waiting for the device to come back");
            }
        }
    }

    fn decompressor(&self, kind: Compression) -> Result<Vec<String>> {
        match kind {
            Compression::Gzip => {
                let prog = if self.run(&["sh", "-c", "command -v pigz"], Input::Null).is_ok() {
                    "pigz"
                } else {
                    "gzip"
                };
                Ok(vec![prog.to_string(), "-dc".to_string()])
            }
        }
    }

    #[context("Clearing TPM owner")]
    fn clear_tpm_owner(&self) -> Result<()> {
        self.run(&["crossystem", "clear_tpm_owner_request=1"], Input::Null)?;
        Ok(())
    }

    #[context("Disabling rootfs verification")]
    fn disable_rootfs_verification(&self, timeout: Duration) -> Result<()> {
        self.run(
            &[
                MAKE_DEV_SSD,
                "--partitions",
                "2 4",
                "--remove_rootfs_verification",
                "--force",
            ],
            Input::Null,
        )?;
        self.reboot(timeout)
    }
}
