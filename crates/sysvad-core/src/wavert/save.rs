//! Render data capture to WAV files
//!
//! The position engine hands rendered bytes to [`SaveData::write`] on the
//! real-time path. Bytes go into a lock-free ring; a writer thread drains
//! the ring into a WAV file and patches the header when it stops.
//!
//! ## File naming
//!
//! `<dir>/<label>_YYYYMMDD_HHMMSS_mmm.wav`, one file per allocated buffer.

use super::error::StreamError;
use crate::format::{AudioFormat, SampleFormat};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Consumer of render data, called from the position engine
pub trait RenderSink: Send {
    /// Accept rendered bytes; must not block
    fn write(&mut self, data: &[u8]);

    /// Size the staging area for up to `bytes` of pending data
    fn set_max_write_size(&mut self, bytes: usize) -> Result<(), StreamError>;

    /// Stop persisting data (content protection)
    fn disable(&mut self, disabled: bool);

    /// Handle used to wait until accepted data has been persisted
    fn work_items(&self) -> WorkItems;
}

#[derive(Debug, Default)]
struct Progress {
    accepted: AtomicU64,
    completed: Mutex<u64>,
    cond: Condvar,
}

/// Waitable count of accepted vs persisted bytes
#[derive(Debug, Clone, Default)]
pub struct WorkItems {
    progress: Arc<Progress>,
}

impl WorkItems {
    fn accept(&self, bytes: u64) {
        self.progress.accepted.fetch_add(bytes, Ordering::AcqRel);
    }

    fn complete(&self, bytes: u64) {
        if let Ok(mut done) = self.progress.completed.lock() {
            *done += bytes;
            self.progress.cond.notify_all();
        }
    }

    /// Bytes accepted but not yet persisted
    pub fn pending(&self) -> u64 {
        let accepted = self.progress.accepted.load(Ordering::Acquire);
        let done = self.progress.completed.lock().map(|d| *d).unwrap_or(accepted);
        accepted.saturating_sub(done)
    }

    /// Block until everything accepted so far has been persisted
    ///
    /// Returns false if the timeout expired first.
    pub fn wait_all(&self, timeout: Duration) -> bool {
        let target = self.progress.accepted.load(Ordering::Acquire);
        let deadline = Instant::now() + timeout;
        let Ok(mut done) = self.progress.completed.lock() else {
            return false;
        };
        while *done < target {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            done = match self.progress.cond.wait_timeout(done, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return false,
            };
        }
        true
    }
}

struct Writer {
    producer: HeapProd<u8>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Writer {
    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(h) = self.thread.take() {
            if h.join().is_err() {
                tracing::error!("Render data writer thread panicked");
            }
        }
    }
}

/// WAV file sink for a render stream
pub struct SaveData {
    dir: PathBuf,
    label: String,
    format: AudioFormat,
    disabled: bool,
    writer: Option<Writer>,
    work_items: WorkItems,
    /// Bytes dropped because the ring was full or not yet sized
    dropped: Arc<AtomicU64>,
}

impl SaveData {
    /// Create a sink; no file is opened until the staging size is set
    ///
    /// # Arguments
    /// * `dir` - Directory for WAV files (created on demand)
    /// * `label` - File name prefix, e.g. `sysvad_pin0_s1`
    /// * `format` - Format written into the WAV header
    pub fn new(dir: impl Into<PathBuf>, label: impl Into<String>, format: AudioFormat) -> Self {
        Self {
            dir: dir.into(),
            label: label.into(),
            format,
            disabled: false,
            writer: None,
            work_items: WorkItems::default(),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bytes dropped so far
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn spawn_writer(
        &self,
        producer: HeapProd<u8>,
        consumer: HeapCons<u8>,
    ) -> Result<Writer, StreamError> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop_flag);
        let work_items = self.work_items.clone();
        let path = self
            .dir
            .join(format!("{}_{}.wav", self.label, chrono::Local::now().format("%Y%m%d_%H%M%S_%3f")));
        let dir = self.dir.clone();
        let format = self.format;

        let thread = std::thread::Builder::new()
            .name(format!("save-data-{}", self.label))
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    writer_loop(&dir, &path, format, consumer, &flag, &work_items);
                }));
                if let Err(panic_info) = result {
                    let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic_info.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    tracing::error!(panic = %msg, "SaveData writer thread PANICKED");
                }
            })
            .map_err(|_| StreamError::InsufficientResources("SaveData writer thread"))?;

        Ok(Writer {
            producer,
            stop_flag,
            thread: Some(thread),
        })
    }
}

impl RenderSink for SaveData {
    fn write(&mut self, data: &[u8]) {
        if self.disabled || data.is_empty() {
            return;
        }
        let Some(writer) = self.writer.as_mut() else {
            self.dropped.fetch_add(data.len() as u64, Ordering::Relaxed);
            return;
        };
        let pushed = writer.producer.push_slice(data);
        self.work_items.accept(pushed as u64);
        if pushed < data.len() {
            self.dropped
                .fetch_add((data.len() - pushed) as u64, Ordering::Relaxed);
        }
    }

    fn set_max_write_size(&mut self, bytes: usize) -> Result<(), StreamError> {
        if let Some(mut old) = self.writer.take() {
            old.stop();
        }
        let (producer, consumer) = HeapRb::<u8>::new(bytes.max(1)).split();
        self.writer = Some(self.spawn_writer(producer, consumer)?);
        tracing::debug!(label = %self.label, bytes, "SaveData staging ring sized");
        Ok(())
    }

    fn disable(&mut self, disabled: bool) {
        if disabled != self.disabled {
            tracing::info!(label = %self.label, disabled, "SaveData persistence toggled");
        }
        self.disabled = disabled;
    }

    fn work_items(&self) -> WorkItems {
        self.work_items.clone()
    }
}

impl Drop for SaveData {
    fn drop(&mut self) {
        if let Some(mut w) = self.writer.take() {
            w.stop();
        }
    }
}

fn writer_loop(
    dir: &Path,
    path: &Path,
    format: AudioFormat,
    mut consumer: HeapCons<u8>,
    stop_flag: &AtomicBool,
    work_items: &WorkItems,
) {
    let mut file = match fs::create_dir_all(dir).and_then(|_| File::create(path)) {
        Ok(f) => {
            let mut w = BufWriter::with_capacity(64 * 1024, f);
            match write_wav_header(&mut w, format, 0) {
                Ok(()) => Some(w),
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Failed to write WAV header");
                    None
                }
            }
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to create render capture file");
            None
        }
    };
    tracing::debug!(path = %path.display(), "SaveData writer running");

    let mut buf = vec![0u8; 16 * 1024];
    let mut data_len: u64 = 0;
    loop {
        let stopping = stop_flag.load(Ordering::Acquire);
        let available = consumer.occupied_len();
        if available == 0 {
            if stopping {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
            continue;
        }
        let chunk = available.min(buf.len());
        let read = consumer.pop_slice(&mut buf[..chunk]);
        if let Some(w) = file.as_mut() {
            if let Err(e) = w.write_all(&buf[..read]) {
                tracing::error!(error = %e, "Failed to write render data, discarding further data");
                file = None;
            } else {
                data_len += read as u64;
            }
        }
        // Discarded bytes still count as handled so waiters never hang
        work_items.complete(read as u64);
    }

    if let Some(mut w) = file.take() {
        let finished = w
            .flush()
            .and_then(|_| w.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|_| write_wav_header(&mut w, format, data_len))
            .and_then(|_| w.flush());
        if let Err(e) = finished {
            tracing::error!(path = %path.display(), error = %e, "Failed to finalize WAV file");
        }
    }
    tracing::info!(path = %path.display(), bytes = data_len, "SaveData writer stopped");
}

/// Write a 44-byte canonical WAV header
fn write_wav_header<W: Write>(w: &mut W, format: AudioFormat, data_len: u64) -> std::io::Result<()> {
    let data_len = data_len.min(u32::MAX as u64 - 36) as u32;
    let tag: u16 = match format.sample_format {
        SampleFormat::Pcm => 1,
        SampleFormat::Float => 3,
    };
    w.write_all(b"RIFF")?;
    w.write_all(&(36 + data_len).to_le_bytes())?;
    w.write_all(b"WAVEfmt ")?;
    w.write_all(&16u32.to_le_bytes())?;
    w.write_all(&tag.to_le_bytes())?;
    w.write_all(&format.channels.to_le_bytes())?;
    w.write_all(&format.sample_rate.to_le_bytes())?;
    w.write_all(&format.avg_bytes_per_sec().to_le_bytes())?;
    w.write_all(&(format.block_align() as u16).to_le_bytes())?;
    w.write_all(&format.bits_per_sample.to_le_bytes())?;
    w.write_all(b"data")?;
    w.write_all(&data_len.to_le_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_files(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "wav").unwrap_or(false))
            .collect()
    }

    #[test]
    fn test_writes_wav_file() {
        let dir = tempfile::tempdir().unwrap();
        let fmt = AudioFormat::pcm(2, 48000, 16);
        let mut sink = SaveData::new(dir.path(), "test", fmt);
        sink.set_max_write_size(4096).unwrap();

        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        sink.write(&data);
        assert!(sink.work_items().wait_all(Duration::from_secs(5)));
        drop(sink);

        let files = wav_files(dir.path());
        assert_eq!(files.len(), 1);
        let bytes = fs::read(&files[0]).unwrap();
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes([bytes[40], bytes[41], bytes[42], bytes[43]]), 1000);
        assert_eq!(&bytes[44..], &data[..]);
    }

    #[test]
    fn test_write_before_sizing_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SaveData::new(dir.path(), "early", AudioFormat::default());
        sink.write(&[1, 2, 3]);
        assert_eq!(sink.dropped_bytes(), 3);
        assert_eq!(sink.work_items().pending(), 0);
    }

    #[test]
    fn test_disabled_sink_ignores_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SaveData::new(dir.path(), "protected", AudioFormat::default());
        sink.set_max_write_size(1024).unwrap();
        sink.disable(true);
        sink.write(&[7; 100]);
        assert!(sink.work_items().wait_all(Duration::from_secs(1)));
        drop(sink);

        let bytes = fs::read(&wav_files(dir.path())[0]).unwrap();
        assert_eq!(bytes.len(), 44, "only the header should be written");
    }

    #[test]
    fn test_full_ring_drops_excess() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SaveData::new(dir.path(), "small", AudioFormat::default());
        sink.set_max_write_size(16).unwrap();
        sink.write(&[0; 64]);
        assert!(sink.dropped_bytes() >= 48);
    }

    #[test]
    fn test_float_header_tag() {
        let mut out = Vec::new();
        write_wav_header(&mut out, AudioFormat::float32(2, 48000), 8).unwrap();
        assert_eq!(out.len(), 44);
        assert_eq!(u16::from_le_bytes([out[20], out[21]]), 3);
        assert_eq!(u16::from_le_bytes([out[32], out[33]]), 8);
    }
}
