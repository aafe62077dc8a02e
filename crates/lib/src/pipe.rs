//! Streaming partition payloads through OS pipes.
//!
//! A [`PipeTransfer`] runs a producer on a dedicated thread that writes into
//! one end of a pipe, while the caller hands the other end to a consumer
//! (usually a device command reading stdin). The pipe's bounded buffer
//! provides back-pressure, so payloads are never held in memory.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use abflash_utils::{check_output, CommandRunExt};
use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use rustix::fs::{FileType, Mode, CWD};
use rustix::pipe::PipeFlags;
use tempfile::TempDir;

use crate::storage::{is_storage_uri, ObjectStore};

/// How often we poke a named pipe while waiting for its producer to exit.
const UNBLOCK_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
enum PipeTarget {
    /// Read end of an anonymous pipe, until handed to the consumer.
    Anonymous(Option<OwnedFd>),
    /// A FIFO in a private temporary directory.
    Named { dir: Option<TempDir>, path: Utf8PathBuf },
}

/// A producer thread writing into a pipe, plus the consumer's end of that pipe.
///
/// The producer always closes its end when it returns, on success or error.
/// [`PipeTransfer::finish`] closes the consumer's end, removes a FIFO node and
/// joins the producer; dropping an unfinished transfer does the same on a best
/// effort basis.
#[derive(Debug)]
pub(crate) struct PipeTransfer {
    name: &'static str,
    target: PipeTarget,
    worker: Option<JoinHandle<Result<()>>>,
}

/// Open `fifo` for writing and close it again, so that a consumer blocked
/// opening it (or reading it) observes EOF.
fn signal_eof(fifo: &Utf8Path) {
    if let Err(e) = OpenOptions::new().write(true).open(fifo) {
        tracing::debug!("Signalling EOF on {fifo}: {e}");
    }
}

impl PipeTransfer {
    /// Start `producer` writing into the write end of an anonymous pipe.
    pub(crate) fn anonymous<F>(name: &'static str, producer: F) -> Result<Self>
    where
        F: FnOnce(OwnedFd) -> Result<()> + Send + 'static,
    {
        // CLOEXEC so that concurrently spawned children (other transfers,
        // ssh sessions) never inherit a copy of the write end.
        let (read, write) = rustix::pipe::pipe_with(PipeFlags::CLOEXEC).context("Creating pipe")?;
        let worker = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || producer(write))
            .with_context(|| format!("Spawning {name}"))?;
        Ok(Self {
            name,
            target: PipeTarget::Anonymous(Some(read)),
            worker: Some(worker),
        })
    }

    /// Start `producer` writing into a freshly created named pipe, for
    /// producers which need a filesystem path rather than a descriptor.
    pub(crate) fn named<F>(name: &'static str, producer: F) -> Result<Self>
    where
        F: FnOnce(&Utf8Path) -> Result<()> + Send + 'static,
    {
        let dir = tempfile::Builder::new()
            .prefix("abflash-device-imager")
            .tempdir()
            .context("Creating temporary directory")?;
        let path = Utf8PathBuf::try_from(dir.path().join("pipe"))?;
        rustix::fs::mknodat(CWD, path.as_std_path(), FileType::Fifo, Mode::RUSR | Mode::WUSR, 0)
            .with_context(|| format!("Creating FIFO {path}"))?;
        let fifo = path.clone();
        let worker = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let r = producer(&fifo);
                if r.is_err() {
                    signal_eof(&fifo);
                }
                r
            })
            .with_context(|| format!("Spawning {name}"))?;
        Ok(Self {
            name,
            target: PipeTarget::Named {
                dir: Some(dir),
                path,
            },
            worker: Some(worker),
        })
    }

    /// Open the consumer's end of the pipe. For a named pipe this blocks until
    /// the producer opens it for writing (or gives up).
    pub(crate) fn reader(&mut self) -> Result<File> {
        match &mut self.target {
            PipeTarget::Anonymous(fd) => fd
                .take()
                .map(File::from)
                .ok_or_else(|| anyhow!("{}: pipe reader already taken", self.name)),
            PipeTarget::Named { path, .. } => {
                File::open(&path).with_context(|| format!("Opening FIFO {path}"))
            }
        }
    }

    /// Hand the consumer's end to `consumer`, then finish the transfer.
    ///
    /// A consumer error takes precedence over the producer's, which is
    /// usually just the broken pipe it caused.
    pub(crate) fn consume<F>(mut self, consumer: F) -> Result<()>
    where
        F: FnOnce(File) -> Result<()>,
    {
        let consumed = self.reader().and_then(consumer);
        let produced = self.finish();
        consumed?;
        produced
    }

    /// Close the consumer's end, join the producer and return its result.
    pub(crate) fn finish(mut self) -> Result<()> {
        self.impl_finish()
    }

    // Shared backend for our `finish` and `drop` implementations.
    fn impl_finish(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        match &mut self.target {
            PipeTarget::Anonymous(fd) => {
                // The producer sees EPIPE if it is still writing.
                drop(fd.take());
            }
            PipeTarget::Named { path, .. } => {
                // A producer blocked opening the FIFO for writing needs a
                // reader before it can proceed; ours is closed right away so
                // further writes fail.
                while !worker.is_finished() {
                    let _ = OpenOptions::new()
                        .read(true)
                        .custom_flags(libc::O_NONBLOCK)
                        .open(&path);
                    std::thread::sleep(UNBLOCK_INTERVAL);
                }
            }
        }
        let r = worker
            .join()
            .map_err(|_| anyhow!("{} panicked", self.name))?;
        if let PipeTarget::Named { dir, path } = &mut self.target {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!("Removing {path}: {e}");
            }
            drop(dir.take());
        }
        r.with_context(|| format!("{} failed", self.name))
    }
}

impl Drop for PipeTransfer {
    fn drop(&mut self) {
        if let Err(e) = self.impl_finish() {
            tracing::debug!("Dropping unfinished transfer: {e:#}");
        }
    }
}

/// Reads a byte range of a local file and writes it, compressed, into a pipe.
#[derive(Debug, Clone)]
pub(crate) struct RangeReader {
    pub(crate) image: Utf8PathBuf,
    pub(crate) offset: u64,
    pub(crate) length: u64,
    pub(crate) compressor: Vec<String>,
}

impl RangeReader {
    /// Start reading on a worker thread.
    pub(crate) fn spawn(self) -> Result<PipeTransfer> {
        PipeTransfer::anonymous("range-reader", move |out| self.run(out))
    }

    fn run(&self, out: OwnedFd) -> Result<()> {
        let image = &self.image;
        let (prog, args) = self
            .compressor
            .split_first()
            .ok_or_else(|| anyhow!("Empty compressor command"))?;
        let mut f = File::open(image).with_context(|| format!("Opening {image}"))?;
        f.seek(SeekFrom::Start(self.offset))
            .with_context(|| format!("Seeking {image} to {}", self.offset))?;
        // Scoped so the write end is only held by the child once it is spawned
        let mut child = {
            let mut cmd = Command::new(prog);
            cmd.args(args)
                .stdin(Stdio::piped())
                .stdout(Stdio::from(out))
                .stderr(Stdio::piped())
                .log_debug();
            cmd.spawn().with_context(|| format!("Spawning {prog}"))?
        };
        let copied = child
            .stdin
            .take()
            .map(|mut stdin| std::io::copy(&mut (&f).take(self.length), &mut stdin));
        let output = child.wait_with_output()?;
        check_output(prog, &output)?;
        let copied = copied
            .transpose()
            .with_context(|| format!("Reading {image}"))?
            .unwrap_or_default();
        anyhow::ensure!(
            copied == self.length,
            "Short read of {image}: {copied} of {} bytes at offset {}",
            self.length,
            self.offset
        );
        Ok(())
    }
}

/// Streams an object from storage, or a local file, unmodified into a named pipe.
pub(crate) struct RemoteCopier {
    pub(crate) source: String,
    pub(crate) storage: Arc<dyn ObjectStore>,
}

impl RemoteCopier {
    /// Start copying on a worker thread.
    pub(crate) fn spawn(self) -> Result<PipeTransfer> {
        PipeTransfer::named("remote-copier", move |fifo| self.run(fifo))
    }

    fn run(&self, fifo: &Utf8Path) -> Result<()> {
        let source = self.source.as_str();
        if is_storage_uri(source) {
            return self.storage.copy(source, fifo);
        }
        let mut src = File::open(source).with_context(|| format!("Opening {source}"))?;
        let mut dst = OpenOptions::new()
            .write(true)
            .open(fifo)
            .with_context(|| format!("Opening {fifo}"))?;
        std::io::copy(&mut src, &mut dst).with_context(|| format!("Copying {source}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::sync::mpsc;
    use std::time::Instant;

    use super::*;
    use crate::testutil::FakeStore;

    fn fixture(len: usize) -> (tempfile::NamedTempFile, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&data).unwrap();
        (f, data)
    }

    fn utf8(f: &tempfile::NamedTempFile) -> Utf8PathBuf {
        Utf8PathBuf::try_from(f.path().to_path_buf()).unwrap()
    }

    /// Read the transfer to EOF on another thread, failing if that takes too long.
    fn read_bounded(mut r: File) -> Vec<u8> {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = r.read_to_end(&mut buf);
            let _ = tx.send(buf);
        });
        rx.recv_timeout(Duration::from_secs(30))
            .expect("consumer did not observe EOF")
    }

    #[test]
    fn test_range_reader() {
        // Larger than a pipe buffer to exercise back-pressure
        let (f, data) = fixture(1 << 20);
        let mut t = RangeReader {
            image: utf8(&f),
            offset: 4096,
            length: 300_000,
            compressor: vec!["cat".into()],
        }
        .spawn()
        .unwrap();
        let got = read_bounded(t.reader().unwrap());
        t.finish().unwrap();
        assert_eq!(got.len(), 300_000);
        assert!(got == data[4096..4096 + 300_000]);
    }

    #[test]
    fn test_range_reader_compressor_fails() {
        let (f, _) = fixture(8192);
        let mut t = RangeReader {
            image: utf8(&f),
            offset: 0,
            length: 8192,
            compressor: vec!["sh".into(), "-c".into(), "exit 3".into()],
        }
        .spawn()
        .unwrap();
        let got = read_bounded(t.reader().unwrap());
        assert!(got.is_empty());
        assert!(t.finish().is_err());
    }

    #[test]
    fn test_range_reader_missing_compressor() {
        let (f, _) = fixture(512);
        let mut t = RangeReader {
            image: utf8(&f),
            offset: 0,
            length: 512,
            compressor: vec!["/nonexistent/compressor".into()],
        }
        .spawn()
        .unwrap();
        read_bounded(t.reader().unwrap());
        assert!(t.finish().is_err());
    }

    #[test]
    fn test_range_reader_short() {
        let (f, _) = fixture(1000);
        let mut t = RangeReader {
            image: utf8(&f),
            offset: 500,
            length: 1000,
            compressor: vec!["cat".into()],
        }
        .spawn()
        .unwrap();
        assert_eq!(read_bounded(t.reader().unwrap()).len(), 500);
        let e = t.finish().unwrap_err();
        assert!(format!("{e:#}").contains("Short read"), "{e:#}");
    }

    #[test]
    fn test_remote_copier_local() {
        let (f, data) = fixture(200_000);
        let mut t = RemoteCopier {
            source: utf8(&f).into_string(),
            storage: Arc::new(FakeStore::default()),
        }
        .spawn()
        .unwrap();
        let PipeTarget::Named { path, .. } = &t.target else {
            panic!("expected a named pipe");
        };
        let fifo = path.clone();
        assert!(fifo.exists());
        let got = read_bounded(t.reader().unwrap());
        t.finish().unwrap();
        assert!(got == data);
        assert!(!fifo.exists());
    }

    #[test]
    fn test_remote_copier_storage() {
        let store = FakeStore::default();
        store.insert("gs://bucket/build/full_dev_part_KERN.bin.gz", b"kernel bytes");
        let mut t = RemoteCopier {
            source: "gs://bucket/build/full_dev_part_KERN.bin.gz".into(),
            storage: Arc::new(store),
        }
        .spawn()
        .unwrap();
        assert_eq!(read_bounded(t.reader().unwrap()), b"kernel bytes");
        t.finish().unwrap();
    }

    #[test]
    fn test_remote_copier_missing_source() {
        let mut t = RemoteCopier {
            source: "gs://bucket/build/missing".into(),
            storage: Arc::new(FakeStore::default()),
        }
        .spawn()
        .unwrap();
        // The producer fails without ever writing; we must still see EOF.
        assert!(read_bounded(t.reader().unwrap()).is_empty());
        assert!(t.finish().is_err());
    }

    #[test]
    fn test_consume() {
        let (f, data) = fixture(100_000);
        let t = RemoteCopier {
            source: utf8(&f).into_string(),
            storage: Arc::new(FakeStore::default()),
        }
        .spawn()
        .unwrap();
        t.consume(|r| {
            assert!(read_bounded(r) == data);
            Ok(())
        })
        .unwrap();

        // The consumer gives up without reading anything
        let (f, _) = fixture(1 << 20);
        let t = RangeReader {
            image: utf8(&f),
            offset: 0,
            length: 1 << 20,
            compressor: vec!["cat".into()],
        }
        .spawn()
        .unwrap();
        let e = t
            .consume(|_r| anyhow::bail!("device went away"))
            .unwrap_err();
        assert_eq!(e.to_string(), "device went away");
    }

    #[test]
    fn test_unconsumed_transfer_does_not_hang() {
        let (f, _) = fixture(1 << 20);
        let start = Instant::now();
        let t = RemoteCopier {
            source: utf8(&f).into_string(),
            storage: Arc::new(FakeStore::default()),
        }
        .spawn()
        .unwrap();
        // Nobody ever opens the reader; the producer is stuck in open(2)
        std::thread::sleep(Duration::from_millis(20));
        assert!(t.finish().is_err());
        assert!(start.elapsed() < Duration::from_secs(30));

        let (f, _) = fixture(1 << 20);
        let t = RangeReader {
            image: utf8(&f),
            offset: 0,
            length: 1 << 20,
            compressor: vec!["cat".into()],
        }
        .spawn()
        .unwrap();
        assert!(t.finish().is_err());
    }
}
