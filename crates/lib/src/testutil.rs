//! In-memory stand-ins for the device and host collaborators.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::device::{Compression, Device, Input};
use crate::source::{ImagePartition, PartitionReader};
use crate::stateful::StatefulPayloadGenerator;
use crate::storage::ObjectStore;

#[derive(Debug, Default)]
struct Recorded {
    commands: Vec<String>,
    inputs: Vec<(String, Vec<u8>)>,
}

/// A scripted [`Device`].
///
/// Every command is recorded as its space joined argv. Stream inputs are
/// read to EOF before the command "runs", like a remote process would.
#[derive(Debug, Default)]
pub(crate) struct FakeDevice {
    root_dev: Mutex<Utf8PathBuf>,
    root_after_reboot: Mutex<Option<Utf8PathBuf>>,
    responses: Mutex<Vec<(String, String)>>,
    failures: Mutex<Vec<(String, usize)>>,
    recorded: Mutex<Recorded>,
    reboots: AtomicUsize,
    tpm_clears: AtomicUsize,
    verification_disables: AtomicUsize,
}

impl FakeDevice {
    pub(crate) fn new(root_dev: &str) -> Self {
        Self {
            root_dev: Mutex::new(root_dev.into()),
            ..Default::default()
        }
    }

    /// Commands starting with `prefix` print `stdout`.
    pub(crate) fn respond(&self, prefix: &str, stdout: &str) {
        self.responses
            .lock()
            .unwrap()
            .push((prefix.to_string(), stdout.to_string()));
    }

    /// The next `times` commands containing `pattern` fail.
    pub(crate) fn fail_matching(&self, pattern: &str, times: usize) {
        self.failures
            .lock()
            .unwrap()
            .push((pattern.to_string(), times));
    }

    /// The device comes back from a reboot running from `root_dev`.
    pub(crate) fn reboot_into(&self, root_dev: &str) {
        *self.root_after_reboot.lock().unwrap() = Some(root_dev.into());
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.recorded.lock().unwrap().commands.clone()
    }

    /// Number of commands starting with `prefix`.
    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.recorded
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// The stdin of the last command starting with `prefix`.
    pub(crate) fn input_of(&self, prefix: &str) -> Option<Vec<u8>> {
        self.recorded
            .lock()
            .unwrap()
            .inputs
            .iter()
            .rev()
            .find(|(c, _)| c.starts_with(prefix))
            .map(|(_, data)| data.clone())
    }

    pub(crate) fn reboots(&self) -> usize {
        self.reboots.load(Ordering::SeqCst)
    }

    pub(crate) fn tpm_clears(&self) -> usize {
        self.tpm_clears.load(Ordering::SeqCst)
    }

    pub(crate) fn verification_disables(&self) -> usize {
        self.verification_disables.load(Ordering::SeqCst)
    }

    fn injected_failure(&self, cmd: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures
            .iter_mut()
            .find(|(pattern, n)| *n > 0 && cmd.contains(pattern.as_str()))
        {
            Some((_, n)) => {
                *n -= 1;
                true
            }
            None => false,
        }
    }

    fn finish_reboot(&self) {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.root_after_reboot.lock().unwrap().take() {
            *self.root_dev.lock().unwrap() = next;
        }
    }
}

impl Device for FakeDevice {
    fn hostname(&self) -> &str {
        "fake-dut"
    }

    fn run(&self, argv: &[&str], input: Input) -> Result<String> {
        let cmd = argv.join(" ");
        let data = match input {
            Input::Null => None,
            Input::Bytes(b) => Some(b),
            Input::Stream(mut f) => {
                let mut buf = Vec::new();
                f.read_to_end(&mut buf)?;
                Some(buf)
            }
        };
        {
            let mut recorded = self.recorded.lock().unwrap();
            recorded.commands.push(cmd.clone());
            if let Some(data) = data {
                recorded.inputs.push((cmd.clone(), data));
            }
        }
        if self.injected_failure(&cmd) {
            anyhow::bail!("injected failure: {cmd}");
        }
        let responses = self.responses.lock().unwrap();
        Ok(responses
            .iter()
            .rev()
            .find(|(prefix, _)| cmd.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }

    fn root_dev(&self) -> Result<Utf8PathBuf> {
        Ok(self.root_dev.lock().unwrap().clone())
    }

    fn work_dir(&self) -> &str {
        "/usr/local/tmp"
    }

    fn reboot(&self, _timeout: Duration) -> Result<()> {
        if self.injected_failure("reboot") {
            anyhow::bail!("injected failure: reboot");
        }
        self.finish_reboot();
        Ok(())
    }

    fn decompressor(&self, _kind: Compression) -> Result<Vec<String>> {
        Ok(vec!["gzip".into(), "-dc".into()])
    }

    fn clear_tpm_owner(&self) -> Result<()> {
        self.tpm_clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disable_rootfs_verification(&self, _timeout: Duration) -> Result<()> {
        self.verification_disables.fetch_add(1, Ordering::SeqCst);
        self.finish_reboot();
        Ok(())
    }
}

/// An [`ObjectStore`] backed by a map.
#[derive(Debug, Default)]
pub(crate) struct FakeStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeStore {
    pub(crate) fn insert(&self, uri: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(uri.to_string(), data.to_vec());
    }
}

impl ObjectStore for FakeStore {
    fn copy(&self, uri: &str, dest: &Utf8Path) -> Result<()> {
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No such object: {uri}"))?;
        let mut f = OpenOptions::new().write(true).open(dest)?;
        f.write_all(&data)?;
        Ok(())
    }

    fn exists(&self, uri: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(uri))
    }
}

/// A [`PartitionReader`] returning a fixed table.
#[derive(Debug, Default)]
pub(crate) struct FakePartitions(pub(crate) Vec<ImagePartition>);

impl PartitionReader for FakePartitions {
    fn partitions(&self, _image: &Utf8Path) -> Result<Vec<ImagePartition>> {
        Ok(self.0.clone())
    }
}

/// A [`StatefulPayloadGenerator`] writing a fixed payload.
#[derive(Debug)]
pub(crate) struct FakeStatefulGenerator(pub(crate) &'static [u8]);

impl StatefulPayloadGenerator for FakeStatefulGenerator {
    fn generate(&self, _image: &Utf8Path, out: OwnedFd) -> Result<()> {
        std::fs::File::from(out).write_all(self.0)?;
        Ok(())
    }
}
