//! Payload gathering and compression. One computation per source key at a time; concurrent
//! callers for the same key share it.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::integrity;
use crate::transport::PayloadSource;

/// Reversible byte transform applied to whole payloads.
pub trait Compressor: Send + Sync + 'static {
    fn compress(&self, raw: &[u8]) -> std::io::Result<Vec<u8>>;
    fn decompress(&self, packed: &[u8]) -> std::io::Result<Vec<u8>>;
}

/// Raw deflate via flate2.
#[derive(Debug, Clone, Copy)]
pub struct Deflate {
    level: u32,
}

impl Deflate {
    pub fn new(level: u32) -> Self {
        Self { level: level.min(9) }
    }
}

impl Default for Deflate {
    fn default() -> Self {
        Self::new(6)
    }
}

impl Compressor for Deflate {
    fn compress(&self, raw: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(
            Vec::with_capacity(raw.len() / 2),
            flate2::Compression::new(self.level),
        );
        encoder.write_all(raw)?;
        encoder.finish()
    }

    fn decompress(&self, packed: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(packed.len() * 2);
        DeflateDecoder::new(packed).read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Immutable bytes ready to send, with the flag the receiver needs to undo compression.
#[derive(Debug)]
pub struct Payload {
    logical_name: String,
    bytes: Vec<u8>,
    compressed: bool,
    digest: [u8; 32],
}

impl Payload {
    pub fn new(logical_name: impl Into<String>, bytes: Vec<u8>, compressed: bool) -> Self {
        let digest = integrity::digest(&bytes);
        Self {
            logical_name: logical_name.into(),
            bytes,
            compressed,
            digest,
        }
    }

    /// Compress `raw` with `codec` when given, keeping whichever form is smaller.
    pub fn pack(
        logical_name: impl Into<String>,
        raw: Vec<u8>,
        codec: Option<&dyn Compressor>,
    ) -> std::io::Result<Self> {
        let Some(codec) = codec else {
            return Ok(Self::new(logical_name, raw, false));
        };
        let packed = codec.compress(&raw)?;
        if packed.len() < raw.len() {
            Ok(Self::new(logical_name, packed, true))
        } else {
            Ok(Self::new(logical_name, raw, false))
        }
    }

    /// Original bytes: decompressed if the payload was compressed, otherwise a copy.
    pub fn unpack(&self, codec: &dyn Compressor) -> std::io::Result<Vec<u8>> {
        if self.compressed {
            codec.decompress(&self.bytes)
        } else {
            Ok(self.bytes.clone())
        }
    }

    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn total_length(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }
}

type Shared = Result<Arc<Payload>, TransferError>;

struct InFlight {
    generation: u64,
    rx: watch::Receiver<Option<Shared>>,
    waiters: usize,
    abort: AbortHandle,
}

type InFlightMap = Arc<Mutex<HashMap<String, InFlight>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Counts one caller of `obtain` against the entry it joined, until it returns or is dropped.
struct Waiter {
    inflight: InFlightMap,
    key: String,
    generation: u64,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let mut inflight = lock(&self.inflight);
        if let Some(entry) = inflight.get_mut(&self.key) {
            if entry.generation == self.generation {
                entry.waiters = entry.waiters.saturating_sub(1);
            }
        }
    }
}

/// Gathers and compresses payloads on blocking workers, deduplicating by source key.
pub struct PayloadCompressor {
    source: Arc<dyn PayloadSource>,
    codec: Arc<dyn Compressor>,
    compress: bool,
    inflight: InFlightMap,
    next_generation: AtomicU64,
    cycles: Arc<AtomicU64>,
}

impl PayloadCompressor {
    pub fn new(source: Arc<dyn PayloadSource>, codec: Arc<dyn Compressor>, compress: bool) -> Self {
        Self {
            source,
            codec,
            compress,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn codec(&self) -> &Arc<dyn Compressor> {
        &self.codec
    }

    /// Gather+compress cycles started so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Callers currently waiting on the in-flight computation for `key`.
    pub fn waiters(&self, key: &str) -> usize {
        lock(&self.inflight).get(key).map_or(0, |entry| entry.waiters)
    }

    /// Payload for `key`. Joins an in-flight computation for the same key if there is one.
    /// Dropping the returned future stops waiting without stopping the computation.
    pub async fn obtain(&self, key: &str) -> Result<Arc<Payload>, TransferError> {
        let (mut rx, _waiter) = {
            let mut inflight = lock(&self.inflight);
            let (rx, generation) = match inflight.get_mut(key) {
                Some(entry) => {
                    entry.waiters += 1;
                    debug!(key, waiters = entry.waiters, "joining in-flight payload computation");
                    (entry.rx.clone(), entry.generation)
                }
                None => self.start(key, &mut inflight),
            };
            let waiter = Waiter {
                inflight: self.inflight.clone(),
                key: key.to_string(),
                generation,
            };
            (rx, waiter)
        };
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(TransferError::Cancelled))
    }

    /// Abort the shared computation for `key`. Every waiter sees `Cancelled`.
    pub fn cancel(&self, key: &str) -> bool {
        match lock(&self.inflight).remove(key) {
            Some(entry) => {
                entry.abort.abort();
                info!(key, waiters = entry.waiters, "payload computation cancelled");
                true
            }
            None => false,
        }
    }

    fn start(
        &self,
        key: &str,
        inflight: &mut HashMap<String, InFlight>,
    ) -> (watch::Receiver<Option<Shared>>, u64) {
        let (tx, rx) = watch::channel(None);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let source = self.source.clone();
        let codec = self.codec.clone();
        let compress = self.compress;
        let cycles = self.cycles.clone();
        let registry = self.inflight.clone();
        let owned_key = key.to_string();

        let task = tokio::spawn(async move {
            let work_key = owned_key.clone();
            let joined = tokio::task::spawn_blocking(move || {
                cycles.fetch_add(1, Ordering::SeqCst);
                let raw = source.gather(&work_key)?;
                let raw_len = raw.len();
                let codec = compress.then_some(codec.as_ref());
                let payload = Payload::pack(work_key, raw, codec)?;
                Ok::<_, std::io::Error>((payload, raw_len))
            })
            .await;
            let result = match joined {
                Ok(Ok((payload, raw_len))) => {
                    info!(
                        key = %owned_key,
                        raw = raw_len,
                        sent = payload.total_length(),
                        compressed = payload.is_compressed(),
                        "payload ready"
                    );
                    Ok(Arc::new(payload))
                }
                Ok(Err(e)) => {
                    warn!(key = %owned_key, error = %e, "payload gather failed");
                    Err(TransferError::from(e))
                }
                Err(e) => Err(TransferError::LocalIo(format!("payload worker failed: {}", e))),
            };
            {
                let mut entries = lock(&registry);
                if entries.get(&owned_key).is_some_and(|e| e.generation == generation) {
                    entries.remove(&owned_key);
                }
            }
            let _ = tx.send(Some(result));
        });

        inflight.insert(
            key.to_string(),
            InFlight {
                generation,
                rx: rx.clone(),
                waiters: 1,
                abort: task.abort_handle(),
            },
        );
        (rx, generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    struct SlowSource {
        bytes: Vec<u8>,
        delay: Duration,
        fail: bool,
    }

    impl PayloadSource for SlowSource {
        fn gather(&self, _key: &str) -> std::io::Result<Vec<u8>> {
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "snapshot missing",
                ));
            }
            Ok(self.bytes.clone())
        }
    }

    fn compressor(bytes: Vec<u8>, delay_ms: u64, fail: bool) -> PayloadCompressor {
        PayloadCompressor::new(
            Arc::new(SlowSource {
                bytes,
                delay: Duration::from_millis(delay_ms),
                fail,
            }),
            Arc::new(Deflate::default()),
            true,
        )
    }

    fn noise(len: usize) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        (0..len).map(|_| rng.gen()).collect()
    }

    #[test]
    fn compressible_payload_shrinks_and_unpacks() {
        let raw: Vec<u8> = b"tile:grass;".repeat(10_000);
        let codec = Deflate::default();
        let p = Payload::pack("world", raw.clone(), Some(&codec)).unwrap();
        assert!(p.is_compressed());
        assert!(p.total_length() < raw.len() as u64);
        assert_eq!(p.unpack(&codec).unwrap(), raw);
    }

    #[test]
    fn incompressible_payload_stays_raw() {
        let raw = noise(4096);
        let codec = Deflate::default();
        let p = Payload::pack("world", raw.clone(), Some(&codec)).unwrap();
        assert!(!p.is_compressed());
        assert_eq!(p.bytes(), raw.as_slice());
        assert_eq!(p.unpack(&codec).unwrap(), raw);
    }

    #[test]
    fn packed_never_longer_than_raw() {
        let codec = Deflate::default();
        for raw in [Vec::new(), vec![0u8; 1], noise(100), b"ab".repeat(500)] {
            let len = raw.len() as u64;
            let p = Payload::pack("x", raw.clone(), Some(&codec)).unwrap();
            assert!(p.total_length() <= len);
            assert_eq!(p.unpack(&codec).unwrap(), raw);
        }
    }

    #[tokio::test]
    async fn concurrent_obtain_shares_one_cycle() {
        let c = compressor(b"save".repeat(1000), 50, false);
        let (a, b) = tokio::join!(c.obtain("world"), c.obtain("world"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(c.cycles(), 1);
    }

    #[tokio::test]
    async fn later_obtain_recomputes() {
        let c = compressor(b"save".repeat(10), 0, false);
        let a = c.obtain("world").await.unwrap();
        let b = c.obtain("world").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(c.cycles(), 2);
    }

    #[tokio::test]
    async fn gather_failure_reaches_every_waiter() {
        let c = compressor(Vec::new(), 30, true);
        let (a, b) = tokio::join!(c.obtain("world"), c.obtain("world"));
        let (a, b) = (a.unwrap_err(), b.unwrap_err());
        assert!(matches!(a, TransferError::LocalIo(_)));
        assert_eq!(a, b);
        assert_eq!(c.cycles(), 1);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_cancel_others() {
        let c = compressor(b"save".repeat(100), 80, false);
        let (gave_up, kept) = tokio::join!(
            tokio::time::timeout(Duration::from_millis(5), c.obtain("world")),
            c.obtain("world")
        );
        assert!(gave_up.is_err());
        assert!(kept.is_ok());
        assert_eq!(c.cycles(), 1);
    }

    #[tokio::test]
    async fn cancel_reaches_waiters() {
        let c = Arc::new(compressor(b"save".repeat(100), 200, false));
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.obtain("world").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(c.cancel("world"));
        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap_err(), TransferError::Cancelled);
        assert!(!c.cancel("world"));
    }

    fn spawn_obtain(
        c: &Arc<PayloadCompressor>,
    ) -> tokio::task::JoinHandle<Result<Arc<Payload>, TransferError>> {
        let c = c.clone();
        tokio::spawn(async move { c.obtain("world").await })
    }

    #[tokio::test]
    async fn waiter_count_follows_joins_and_departures() {
        let c = Arc::new(compressor(b"save".repeat(100), 200, false));
        let leaving = spawn_obtain(&c);
        let staying = spawn_obtain(&c);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(c.waiters("world"), 2);

        leaving.abort();
        let _ = leaving.await;
        assert_eq!(c.waiters("world"), 1);

        assert!(staying.await.unwrap().is_ok());
        assert_eq!(c.waiters("world"), 0);
        assert_eq!(c.cycles(), 1);
    }

    /// Each gather sleeps for the next delay in line.
    struct StaggeredSource(Mutex<Vec<u64>>);

    impl PayloadSource for StaggeredSource {
        fn gather(&self, _key: &str) -> std::io::Result<Vec<u8>> {
            let delay = lock(&self.0).pop().unwrap_or(0);
            std::thread::sleep(Duration::from_millis(delay));
            Ok(b"save".repeat(100))
        }
    }

    #[tokio::test]
    async fn cancelled_computation_leaves_its_successor_alone() {
        let c = Arc::new(PayloadCompressor::new(
            Arc::new(StaggeredSource(Mutex::new(vec![400, 100]))),
            Arc::new(Deflate::default()),
            true,
        ));
        let first = spawn_obtain(&c);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(c.cancel("world"));
        assert_eq!(first.await.unwrap().unwrap_err(), TransferError::Cancelled);

        let second = spawn_obtain(&c);
        tokio::time::sleep(Duration::from_millis(150)).await;
        let third = spawn_obtain(&c);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(c.waiters("world"), 2);

        let second = second.await.unwrap().unwrap();
        let third = third.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&second, &third));
        assert_eq!(c.cycles(), 2);
    }
}
