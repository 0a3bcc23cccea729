use crate::InferenceError;
use crate::term::{ByteReader, MAX_TERM_SIZE, PageTerm};
use bincode::{Decode, Encode};
use fixedbitset::FixedBitSet;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Two big-endian u32s: encoded body length in bytes, then record count.
/// Pages come from the grounding side, which writes network byte order.
pub const HEADER_SIZE: usize = 8;

const MANIFEST_FILE: &str = "manifest.bin";
const PAGES_DIR: &str = "pages";

/// Bytes moved between the cache and disk.
#[derive(Debug, Default)]
pub struct DiskStats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl DiskStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn log_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn log_write(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

/// Describes the pages under a cache directory. Written once by [`PageWriter`].
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PageManifest {
    pub capacity: u32,
    pub volatile_size: u32,
    pub term_counts: Vec<u32>,
}

impl PageManifest {
    pub fn page_count(&self) -> usize {
        self.term_counts.len()
    }

    pub fn term_count(&self) -> usize {
        self.term_counts.iter().map(|n| *n as usize).sum()
    }

    pub fn load(cache_dir: &Path) -> Result<Self, InferenceError> {
        let path = cache_dir.join(MANIFEST_FILE);
        let bytes = fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => InferenceError::MissingPage(path.clone()),
            _ => InferenceError::Io(e),
        })?;
        let (manifest, _): (PageManifest, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(manifest)
    }

    fn save(&self, cache_dir: &Path) -> Result<(), InferenceError> {
        let bytes = bincode::encode_to_vec(self, bincode::config::standard())?;
        fs::write(cache_dir.join(MANIFEST_FILE), bytes)?;
        Ok(())
    }
}

pub fn term_page_path(cache_dir: &Path, page: u32) -> PathBuf {
    cache_dir.join(PAGES_DIR).join(format!("{}.terms", page))
}

pub fn volatile_page_path(cache_dir: &Path, page: u32) -> PathBuf {
    cache_dir.join(PAGES_DIR).join(format!("{}.volatile", page))
}

/// How the store walks its pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub shuffle_page: bool,
    pub randomize_page_access: bool,
    pub seed: u64,
    /// Never write volatile pages back, even for algorithms that keep state.
    pub readonly: bool,
    /// Largest page (in terms) the pool may be sized for. Caches written with
    /// bigger pages are refused at open.
    pub max_page_capacity: Option<usize>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            shuffle_page: true,
            randomize_page_access: true,
            seed: 4,
            readonly: false,
            max_page_capacity: None,
        }
    }
}

/// Fills `buf` from `reader` and reports how many bytes actually arrived.
fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn open_page(path: &Path) -> Result<File, InferenceError> {
    File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => InferenceError::MissingPage(path.to_path_buf()),
        _ => InferenceError::Io(e),
    })
}

/// Reads one header-prefixed page file into `buffer`, returning the record count.
/// `buffer` keeps its allocation from page to page.
fn read_page_file(path: &Path, buffer: &mut Vec<u8>) -> Result<(usize, usize), InferenceError> {
    let mut file = open_page(path)?;

    let mut header = [0u8; HEADER_SIZE];
    let read = read_fully(&mut file, &mut header)?;
    if read != HEADER_SIZE {
        return Err(InferenceError::PageIo {
            path: path.to_path_buf(),
            what: "page header",
            expected: HEADER_SIZE,
            actual: read,
        });
    }

    let body_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let count = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

    buffer.clear();
    buffer.resize(body_len, 0);
    let read = read_fully(&mut file, buffer)?;
    if read != body_len {
        return Err(InferenceError::PageIo {
            path: path.to_path_buf(),
            what: "page body",
            expected: body_len,
            actual: read,
        });
    }

    Ok((count, HEADER_SIZE + body_len))
}

/// Writes `[body_len][count][body]` to a temporary sibling and renames it into
/// place, so an interrupted write never replaces a good page.
fn write_page_file(path: &Path, count: usize, body: &[u8]) -> Result<usize, InferenceError> {
    let too_large = |what: &str, n: usize| {
        InferenceError::Other(format!(
            "Page [{}] {} of {} does not fit the 32-bit header",
            path.display(),
            what,
            n
        ))
    };
    let body_len = u32::try_from(body.len()).map_err(|_| too_large("body length", body.len()))?;
    let count = u32::try_from(count).map_err(|_| too_large("term count", count))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let result = (|| -> io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(&body_len.to_be_bytes())?;
        file.write_all(&count.to_be_bytes())?;
        file.write_all(body)?;
        file.sync_data()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(InferenceError::Io(e));
    }
    Ok(HEADER_SIZE + body.len())
}

/// Writes terms into fixed-capacity pages under a cache directory.
pub struct PageWriter<T: PageTerm> {
    cache_dir: PathBuf,
    capacity: usize,
    pending: Vec<T>,
    term_buffer: Vec<u8>,
    volatile_buffer: Vec<u8>,
    term_counts: Vec<u32>,
    stats: Arc<DiskStats>,
}

impl<T: PageTerm> PageWriter<T> {
    /// Starts a fresh cache, discarding any pages already under `cache_dir`.
    pub fn create(cache_dir: &Path, capacity: usize, stats: Arc<DiskStats>) -> Result<Self, InferenceError> {
        if capacity == 0 {
            return Err(InferenceError::Config("page capacity must be positive".to_string()));
        }
        let pages = cache_dir.join(PAGES_DIR);
        if pages.exists() {
            fs::remove_dir_all(&pages)?;
        }
        fs::create_dir_all(&pages)?;

        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
            capacity,
            pending: Vec::with_capacity(capacity),
            term_buffer: Vec::new(),
            volatile_buffer: Vec::new(),
            term_counts: Vec::new(),
            stats,
        })
    }

    pub fn push(&mut self, term: T) -> Result<(), InferenceError> {
        let size = term.objective().size();
        if size > MAX_TERM_SIZE {
            return Err(InferenceError::Other(format!(
                "Term references {} atoms, a record holds at most {}",
                size, MAX_TERM_SIZE
            )));
        }
        self.pending.push(term);
        if self.pending.len() >= self.capacity {
            self.flush_page()?;
        }
        Ok(())
    }

    fn flush_page(&mut self) -> Result<(), InferenceError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let page = self.term_counts.len() as u32;

        self.term_buffer.clear();
        self.volatile_buffer.clear();
        for term in &self.pending {
            term.encode(&mut self.term_buffer);
            term.encode_volatile(&mut self.volatile_buffer);
        }

        let mut written = write_page_file(
            &term_page_path(&self.cache_dir, page),
            self.pending.len(),
            &self.term_buffer,
        )?;
        if T::VOLATILE_SIZE > 0 {
            written += write_page_file(
                &volatile_page_path(&self.cache_dir, page),
                self.pending.len(),
                &self.volatile_buffer,
            )?;
        }
        self.stats.log_write(written);

        debug!(page, terms = self.pending.len(), bytes = written, "wrote term page");
        self.term_counts.push(self.pending.len() as u32);
        self.pending.clear();
        Ok(())
    }

    pub fn finish(mut self) -> Result<PageManifest, InferenceError> {
        self.flush_page()?;
        let manifest = PageManifest {
            capacity: self.capacity as u32,
            volatile_size: T::VOLATILE_SIZE as u32,
            term_counts: std::mem::take(&mut self.term_counts),
        };
        manifest.save(&self.cache_dir)?;
        info!(
            pages = manifest.page_count(),
            terms = manifest.term_count(),
            "term cache written"
        );
        Ok(manifest)
    }
}

/// Out-of-core cache over every term page in a directory.
///
/// Terms are decoded into a pool sized to the page capacity, so iteration
/// never allocates terms once the pool is warm. Disk reads only happen from
/// whoever drives [`TermPageStore::open_epoch`].
pub struct TermPageStore<T: PageTerm> {
    cache_dir: PathBuf,
    manifest: PageManifest,
    options: StoreOptions,
    pool: Vec<T>,
    shuffle_maps: Vec<Vec<u32>>,
    cached: FixedBitSet,
    page_order: Vec<u32>,
    term_buffer: Vec<u8>,
    volatile_buffer: Vec<u8>,
    stats: Arc<DiskStats>,
}

impl<T: PageTerm> TermPageStore<T> {
    pub fn open(cache_dir: &Path, options: StoreOptions, stats: Arc<DiskStats>) -> Result<Self, InferenceError> {
        let manifest = PageManifest::load(cache_dir)?;
        if manifest.volatile_size as usize != T::VOLATILE_SIZE {
            return Err(InferenceError::Other(format!(
                "Cache at {} was written with volatile records of {} bytes, this algorithm uses {}",
                cache_dir.display(),
                manifest.volatile_size,
                T::VOLATILE_SIZE
            )));
        }

        let capacity = manifest.capacity as usize;
        if let Some(limit) = options.max_page_capacity {
            if capacity > limit {
                return Err(InferenceError::Config(format!(
                    "Cache at {} has pages of {} terms, more than the configured limit of {}",
                    cache_dir.display(),
                    capacity,
                    limit
                )));
            }
        }
        let page_count = manifest.page_count();
        let mut pool = Vec::with_capacity(capacity);
        pool.resize_with(capacity, T::default);

        info!(
            cache_dir = %cache_dir.display(),
            pages = page_count,
            capacity,
            shuffle_page = options.shuffle_page,
            randomize_page_access = options.randomize_page_access,
            "opened term page store"
        );

        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
            manifest,
            options,
            pool,
            shuffle_maps: vec![Vec::new(); page_count],
            cached: FixedBitSet::with_capacity(page_count),
            page_order: (0..page_count as u32).collect(),
            term_buffer: Vec::new(),
            volatile_buffer: Vec::new(),
            stats,
        })
    }

    pub fn page_count(&self) -> usize {
        self.manifest.page_count()
    }

    pub fn term_count(&self) -> usize {
        self.manifest.term_count()
    }

    pub fn capacity(&self) -> usize {
        self.pool.len()
    }

    pub fn stats(&self) -> &Arc<DiskStats> {
        &self.stats
    }

    pub fn options(&self) -> StoreOptions {
        self.options
    }

    /// Page visitation order of the most recent epoch.
    pub fn page_order(&self) -> &[u32] {
        &self.page_order
    }

    /// Begins a pass over every term.
    ///
    /// The page permutation comes from the configured seed alone, so every
    /// epoch of a run, and every run with the same seed, visits pages in the
    /// same order.
    pub fn open_epoch(&mut self) -> Epoch<'_, T> {
        for (i, page) in self.page_order.iter_mut().enumerate() {
            *page = i as u32;
        }
        if self.options.randomize_page_access {
            let mut rng = StdRng::seed_from_u64(self.options.seed);
            self.page_order.shuffle(&mut rng);
        }

        Epoch {
            store: self,
            next_page: 0,
            current: None,
            len: 0,
            cursor: 0,
            failed: false,
        }
    }

    /// Loads a page into the pool and returns how many slots it filled.
    /// Nothing is decoded unless both files were read in full.
    fn read_page(&mut self, page: u32) -> Result<usize, InferenceError> {
        let term_path = term_page_path(&self.cache_dir, page);
        let (count, mut bytes) = read_page_file(&term_path, &mut self.term_buffer)?;
        if count > self.pool.len() {
            return Err(InferenceError::Other(format!(
                "Page [{}] holds {} terms but the pool only has {} slots",
                term_path.display(),
                count,
                self.pool.len()
            )));
        }

        if T::VOLATILE_SIZE > 0 {
            let volatile_path = volatile_page_path(&self.cache_dir, page);
            let (volatile_count, volatile_bytes) = read_page_file(&volatile_path, &mut self.volatile_buffer)?;
            let expected = count * T::VOLATILE_SIZE;
            if volatile_count != count || self.volatile_buffer.len() != expected {
                return Err(InferenceError::PageIo {
                    path: volatile_path,
                    what: "volatile page",
                    expected,
                    actual: self.volatile_buffer.len(),
                });
            }
            bytes += volatile_bytes;
        }

        self.stats.log_read(bytes);

        let mut terms = ByteReader::new(&self.term_buffer);
        let mut volatile = ByteReader::new(&self.volatile_buffer);
        for slot in &mut self.pool[..count] {
            slot.decode(&mut terms)?;
            if T::VOLATILE_SIZE > 0 {
                slot.decode_volatile(&mut volatile)?;
            }
        }
        if terms.remaining() != 0 {
            return Err(InferenceError::Other(format!(
                "Page [{}] has {} undecoded trailing bytes",
                term_path.display(),
                terms.remaining()
            )));
        }

        if self.options.shuffle_page && !self.cached.contains(page as usize) {
            let map = &mut self.shuffle_maps[page as usize];
            map.clear();
            map.extend(0..count as u32);
            let mut rng = StdRng::seed_from_u64(self.options.seed ^ u64::from(page).wrapping_mul(0x9E37_79B9_7F4A_7C15));
            map.shuffle(&mut rng);
            self.cached.insert(page as usize);
        }

        Ok(count)
    }

    /// Persists the volatile state of the `len` terms currently in the pool.
    /// A no-op for algorithms without volatile state.
    fn write_volatile_page(&mut self, page: u32, len: usize) -> Result<(), InferenceError> {
        if T::VOLATILE_SIZE == 0 || self.options.readonly {
            return Ok(());
        }

        self.volatile_buffer.clear();
        for term in &self.pool[..len] {
            term.encode_volatile(&mut self.volatile_buffer);
        }
        let path = volatile_page_path(&self.cache_dir, page);
        let written = write_page_file(&path, len, &self.volatile_buffer)?;
        self.stats.log_write(written);
        Ok(())
    }
}

/// One pass over all cached terms.
///
/// A slot handed out by [`Epoch::next`] borrows the epoch mutably, so it has
/// to be dropped before the next call reuses the pool.
pub struct Epoch<'a, T: PageTerm> {
    store: &'a mut TermPageStore<T>,
    next_page: usize,
    current: Option<u32>,
    len: usize,
    cursor: usize,
    failed: bool,
}

impl<T: PageTerm> Epoch<'_, T> {
    pub fn next(&mut self) -> Result<Option<&mut T>, InferenceError> {
        loop {
            if self.failed {
                return Ok(None);
            }

            if self.cursor < self.len {
                let position = match self.current {
                    Some(page) if self.store.options.shuffle_page => {
                        self.store.shuffle_maps[page as usize][self.cursor] as usize
                    }
                    _ => self.cursor,
                };
                self.cursor += 1;
                return Ok(Some(&mut self.store.pool[position]));
            }

            if let Err(e) = self.close() {
                self.failed = true;
                return Err(e);
            }

            if self.next_page >= self.store.page_order.len() {
                return Ok(None);
            }
            let page = self.store.page_order[self.next_page];
            self.next_page += 1;

            match self.store.read_page(page) {
                Ok(len) => {
                    self.current = Some(page);
                    self.len = len;
                    self.cursor = 0;
                }
                Err(e) => {
                    self.failed = true;
                    return Err(e);
                }
            }
        }
    }

    /// Flushes the volatile state of the page in hand, if any. Called on page
    /// advance and by anyone abandoning the epoch early.
    pub fn close(&mut self) -> Result<(), InferenceError> {
        if let Some(page) = self.current.take() {
            let len = std::mem::take(&mut self.len);
            self.cursor = 0;
            self.store.write_volatile_page(page, len)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::{DcdTerm, ObjectiveTerm, SgdTerm};
    use tempfile::TempDir;

    fn term(i: u32) -> ObjectiveTerm {
        ObjectiveTerm::new(i as f32, 0.0, false, true, &[(1.0, i), (-1.0, i + 1)])
    }

    fn write_sgd(dir: &Path, count: u32, capacity: usize) -> PageManifest {
        let mut writer = PageWriter::<SgdTerm>::create(dir, capacity, DiskStats::new()).unwrap();
        for i in 0..count {
            writer.push(SgdTerm::new(term(i))).unwrap();
        }
        writer.finish().unwrap()
    }

    fn collect_weights<T: PageTerm>(store: &mut TermPageStore<T>) -> Vec<u32> {
        let mut epoch = store.open_epoch();
        let mut out = Vec::new();
        while let Some(t) = epoch.next().unwrap() {
            out.push(t.objective().weight as u32);
        }
        out
    }

    fn plain() -> StoreOptions {
        StoreOptions {
            shuffle_page: false,
            randomize_page_access: false,
            seed: 0,
            readonly: false,
            max_page_capacity: None,
        }
    }

    #[test]
    fn test_writer_splits_into_pages() {
        let dir = TempDir::new().unwrap();
        let manifest = write_sgd(dir.path(), 25, 10);
        assert_eq!(manifest.term_counts, vec![10, 10, 5]);
        assert_eq!(manifest.volatile_size, 0);
        assert!(term_page_path(dir.path(), 2).exists());
        assert!(!volatile_page_path(dir.path(), 0).exists());
    }

    #[test]
    fn test_epoch_visits_all_terms_in_order() {
        let dir = TempDir::new().unwrap();
        write_sgd(dir.path(), 25, 10);
        let mut store = TermPageStore::<SgdTerm>::open(dir.path(), plain(), DiskStats::new()).unwrap();

        assert_eq!(collect_weights(&mut store), (0..25).collect::<Vec<_>>());
        // Restartable: a second epoch sees the same terms.
        assert_eq!(collect_weights(&mut store), (0..25).collect::<Vec<_>>());
        assert_eq!(store.capacity(), 10);
    }

    #[test]
    fn test_shuffle_permutes_only_order() {
        let dir = TempDir::new().unwrap();
        write_sgd(dir.path(), 40, 20);
        let options = StoreOptions { shuffle_page: true, ..plain() };
        let mut store = TermPageStore::<SgdTerm>::open(dir.path(), options, DiskStats::new()).unwrap();

        let first = collect_weights(&mut store);
        let second = collect_weights(&mut store);
        assert_eq!(first, second, "shuffle map is fixed once a page is cached");

        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, (0..40).collect::<Vec<_>>());
        assert_ne!(first, (0..40).collect::<Vec<_>>());

        // Shuffling stays within a page.
        assert!(first[..20].iter().all(|w| *w < 20));
    }

    #[test]
    fn test_page_order_is_seed_controlled() {
        let dir = TempDir::new().unwrap();
        write_sgd(dir.path(), 64, 2);

        let open = |seed| {
            let options = StoreOptions { randomize_page_access: true, seed, ..plain() };
            TermPageStore::<SgdTerm>::open(dir.path(), options, DiskStats::new()).unwrap()
        };

        let mut a = open(11);
        a.open_epoch();
        let first = a.page_order().to_vec();
        a.open_epoch();
        assert_eq!(a.page_order(), first.as_slice());

        let mut b = open(11);
        b.open_epoch();
        assert_eq!(b.page_order(), first.as_slice());

        let mut c = open(12);
        c.open_epoch();
        assert_ne!(c.page_order(), first.as_slice());
    }

    #[test]
    fn test_short_body_is_fatal() {
        let dir = TempDir::new().unwrap();
        write_sgd(dir.path(), 5, 10);

        // Declare 500 body bytes but only provide 480.
        let path = term_page_path(dir.path(), 0);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&500u32.to_be_bytes());
        bytes.extend_from_slice(&5u32.to_be_bytes());
        bytes.extend(std::iter::repeat(0u8).take(480));
        fs::write(&path, bytes).unwrap();

        let mut store = TermPageStore::<SgdTerm>::open(dir.path(), plain(), DiskStats::new()).unwrap();
        let mut epoch = store.open_epoch();
        match epoch.next() {
            Err(InferenceError::PageIo { path: p, expected, actual, .. }) => {
                assert_eq!(p, path);
                assert_eq!(expected, 500);
                assert_eq!(actual, 480);
            }
            other => panic!("expected a page IO error, got {:?}", other.map(|t| t.is_some())),
        }
        assert!(epoch.next().unwrap().is_none());
    }

    #[test]
    fn test_short_header_is_fatal() {
        let dir = TempDir::new().unwrap();
        write_sgd(dir.path(), 5, 10);
        fs::write(term_page_path(dir.path(), 0), [1u8, 2, 3]).unwrap();

        let mut store = TermPageStore::<SgdTerm>::open(dir.path(), plain(), DiskStats::new()).unwrap();
        let mut epoch = store.open_epoch();
        let err = epoch.next().err().unwrap();
        assert!(matches!(err, InferenceError::PageIo { expected: 8, actual: 3, .. }));
    }

    #[test]
    fn test_missing_page_is_fatal() {
        let dir = TempDir::new().unwrap();
        write_sgd(dir.path(), 15, 10);
        fs::remove_file(term_page_path(dir.path(), 1)).unwrap();

        let mut store = TermPageStore::<SgdTerm>::open(dir.path(), plain(), DiskStats::new()).unwrap();
        let mut epoch = store.open_epoch();
        for _ in 0..10 {
            assert!(epoch.next().unwrap().is_some());
        }
        assert!(matches!(epoch.next(), Err(InferenceError::MissingPage(_))));
    }

    #[test]
    fn test_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let result = TermPageStore::<SgdTerm>::open(dir.path(), plain(), DiskStats::new());
        assert!(matches!(result, Err(InferenceError::MissingPage(_))));
    }

    #[test]
    fn test_volatile_state_persists_across_epochs() {
        let dir = TempDir::new().unwrap();
        let mut writer = PageWriter::<DcdTerm>::create(dir.path(), 4, DiskStats::new()).unwrap();
        for i in 0..10 {
            writer.push(DcdTerm::new(term(i))).unwrap();
        }
        writer.finish().unwrap();
        assert!(volatile_page_path(dir.path(), 2).exists());

        let stats = DiskStats::new();
        let options = StoreOptions { shuffle_page: true, ..plain() };
        let mut store = TermPageStore::<DcdTerm>::open(dir.path(), options, Arc::clone(&stats)).unwrap();
        {
            let mut epoch = store.open_epoch();
            while let Some(t) = epoch.next().unwrap() {
                t.lagrange = t.term.weight / 2.0;
            }
        }
        assert!(stats.bytes_written() > 0);

        let mut epoch = store.open_epoch();
        let mut seen = 0;
        while let Some(t) = epoch.next().unwrap() {
            assert_eq!(t.lagrange, t.term.weight / 2.0);
            seen += 1;
        }
        assert_eq!(seen, 10);
    }

    #[test]
    fn test_sgd_never_writes_volatile_pages() {
        let dir = TempDir::new().unwrap();
        write_sgd(dir.path(), 12, 5);
        let stats = DiskStats::new();
        let mut store = TermPageStore::<SgdTerm>::open(dir.path(), plain(), Arc::clone(&stats)).unwrap();
        collect_weights(&mut store);
        assert_eq!(stats.bytes_written(), 0);
        assert!(stats.bytes_read() > 0);
    }

    #[test]
    fn test_readonly_store_leaves_volatile_pages_alone() {
        let dir = TempDir::new().unwrap();
        let mut writer = PageWriter::<DcdTerm>::create(dir.path(), 4, DiskStats::new()).unwrap();
        writer.push(DcdTerm::new(term(3))).unwrap();
        writer.finish().unwrap();

        let options = StoreOptions { readonly: true, ..plain() };
        let mut store = TermPageStore::<DcdTerm>::open(dir.path(), options, DiskStats::new()).unwrap();
        {
            let mut epoch = store.open_epoch();
            while let Some(t) = epoch.next().unwrap() {
                t.lagrange = 1.0;
            }
        }
        let mut epoch = store.open_epoch();
        assert_eq!(epoch.next().unwrap().unwrap().lagrange, 0.0);
    }

    #[test]
    fn test_header_is_big_endian() {
        let dir = TempDir::new().unwrap();
        write_sgd(dir.path(), 1, 4);

        let mut body = Vec::new();
        SgdTerm::new(term(7)).encode(&mut body);
        let path = term_page_path(dir.path(), 0);
        let on_disk = fs::read(&path).unwrap();
        assert_eq!(&on_disk[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&on_disk[4..8], &1u32.to_be_bytes());

        // A page written by an external grounder: header in network order.
        let mut page = Vec::new();
        page.extend_from_slice(&(body.len() as u32).to_be_bytes());
        page.extend_from_slice(&1u32.to_be_bytes());
        page.extend_from_slice(&body);
        fs::write(&path, page).unwrap();

        let mut store = TermPageStore::<SgdTerm>::open(dir.path(), plain(), DiskStats::new()).unwrap();
        assert_eq!(collect_weights(&mut store), vec![7]);
    }

    #[test]
    fn test_page_capacity_limit() {
        let dir = TempDir::new().unwrap();
        write_sgd(dir.path(), 3, 8);

        let tight = StoreOptions { max_page_capacity: Some(4), ..plain() };
        let err = TermPageStore::<SgdTerm>::open(dir.path(), tight, DiskStats::new()).err().unwrap();
        assert!(matches!(err, InferenceError::Config(_)));

        let exact = StoreOptions { max_page_capacity: Some(8), ..plain() };
        let store = TermPageStore::<SgdTerm>::open(dir.path(), exact, DiskStats::new()).unwrap();
        assert_eq!(store.capacity(), 8);
    }

    #[test]
    fn test_oversized_term_rejected() {
        let dir = TempDir::new().unwrap();
        let mut writer = PageWriter::<SgdTerm>::create(dir.path(), 4, DiskStats::new()).unwrap();
        let atoms: Vec<(f32, u32)> = (0..=MAX_TERM_SIZE as u32).map(|i| (1.0, i)).collect();
        let big = ObjectiveTerm::new(1.0, 0.0, false, false, &atoms);

        assert!(writer.push(SgdTerm::new(big)).is_err());
        writer.push(SgdTerm::new(term(1))).unwrap();
        assert_eq!(writer.finish().unwrap().term_count(), 1);
    }

    #[test]
    fn test_algorithm_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        write_sgd(dir.path(), 3, 5);
        assert!(TermPageStore::<DcdTerm>::open(dir.path(), plain(), DiskStats::new()).is_err());
    }
}
