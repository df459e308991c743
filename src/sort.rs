//! Chunk sorter.

use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display};
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;
use rayon::slice::ParallelSliceMut;

use crate::codec::{LineError, LineReader, LineWriter};
use crate::collate::{ByteOrder, CollationBuilder, CollationError, CollatorPool};
use crate::file::File;
use crate::line::Line;
use crate::reorder::ReorderBuffer;

/// Default in-memory sorting budget in bytes.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Common I/O error.
    IO(io::Error),
    /// Line file reading error.
    Read(PathBuf, LineError),
    /// Line file writing error.
    Write(PathBuf, LineError),
    /// Collator initialization error.
    Collation(CollationError),
    /// Invalid sorter or splitter configuration.
    InvalidConfig(&'static str),
    /// A worker task stopped without reporting its result.
    TaskFailed(&'static str),
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::Read(_, err) => Some(err),
            SortError::Write(_, err) => Some(err),
            SortError::Collation(err) => Some(err),
            SortError::InvalidConfig(_) => None,
            SortError::TaskFailed(_) => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::Read(path, err) => write!(f, "{} reading error: {}", path.display(), err),
            SortError::Write(path, err) => write!(f, "{} writing error: {}", path.display(), err),
            SortError::Collation(err) => write!(f, "collation error: {}", err),
            SortError::InvalidConfig(reason) => write!(f, "invalid configuration: {}", reason),
            SortError::TaskFailed(reason) => write!(f, "worker task failed: {}", reason),
        }
    }
}

impl From<CollationError> for SortError {
    fn from(err: CollationError) -> Self {
        SortError::Collation(err)
    }
}

/// Sorter builder. Provides methods for [`Sorter`] initialization.
pub struct SorterBuilder<B: CollationBuilder = ByteOrder> {
    /// Number of threads to be used to sort chunks in parallel.
    threads_number: Option<usize>,
    /// Total size of chunks allowed to be in memory at once.
    max_file_size: u64,
    /// Collation builder, byte-wise ordering if not set.
    collation: Option<B>,
    /// Chunk file read/write buffer size.
    rw_buf_size: Option<usize>,
}

impl<B: CollationBuilder> SorterBuilder<B> {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        SorterBuilder::default()
    }

    /// Builds a [`Sorter`] instance using provided configuration.
    pub fn build(self) -> Result<Sorter<B>, SortError> {
        Sorter::new(self.threads_number, self.max_file_size, self.collation, self.rw_buf_size)
    }

    /// Sets number of threads to be used to sort chunks in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> SorterBuilder<B> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets total size of chunks allowed to be sorted or awaiting write at once.
    pub fn with_max_file_size(mut self, max_file_size: u64) -> SorterBuilder<B> {
        self.max_file_size = max_file_size;
        return self;
    }

    /// Sets collation used to order lines.
    pub fn with_collation(mut self, collation: B) -> SorterBuilder<B> {
        self.collation = Some(collation);
        return self;
    }

    /// Sets chunk read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> SorterBuilder<B> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }
}

impl<B: CollationBuilder> Default for SorterBuilder<B> {
    fn default() -> Self {
        SorterBuilder {
            threads_number: None,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            collation: None,
            rw_buf_size: None,
        }
    }
}

type Completion = (usize, Result<Vec<Line>, SortError>);

/// Memory admission state: how much data is dispatched to sorting but not yet written out.
#[derive(Debug)]
struct Admission {
    max_size: u64,
    scheduled_size: u64,
    in_flight: usize,
    next: usize,
}

impl Admission {
    fn new(max_size: u64) -> Self {
        Admission {
            max_size,
            scheduled_size: 0,
            in_flight: 0,
            next: 0,
        }
    }

    /// Returns the index of the next file allowed to be dispatched.
    /// A file is always admitted when nothing is in flight, even if it exceeds the budget on its own.
    fn admit(&mut self, files: &[File]) -> Option<usize> {
        let file = files.get(self.next)?;
        if self.in_flight > 0 && self.scheduled_size + file.size >= self.max_size {
            return None;
        }

        self.scheduled_size += file.size;
        self.in_flight += 1;
        self.next += 1;

        return Some(self.next - 1);
    }

    fn release(&mut self, size: u64) {
        self.scheduled_size -= size;
        self.in_flight -= 1;
    }
}

/// Chunk sorter.
///
/// Sorts an ordered list of chunk files in memory, concurrently, and writes them one after another to
/// a single output, keeping the order of the list. The total size of chunks being sorted or awaiting
/// their turn to be written is kept under `max_file_size`.
pub struct Sorter<B: CollationBuilder = ByteOrder> {
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Memory budget in bytes.
    max_file_size: u64,
    /// Collators shared by sorting tasks.
    collators: CollatorPool<B>,
    /// Chunk file read/write buffer size.
    rw_buf_size: Option<usize>,
}

impl<B: CollationBuilder> Sorter<B> {
    /// Creates a new sorter instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads to be used to sort chunks in parallel. If the parameter is [`None`]
    ///   threads number will be selected based on available CPU core number.
    /// * `max_file_size` - Total size of chunks allowed to be sorted or awaiting write at once.
    /// * `collation` - Collation builder. If the parameter is [`None`] lines are ordered byte-wise.
    /// * `rw_buf_size` - Chunks file read/write buffer size.
    pub fn new(
        threads_number: Option<usize>,
        max_file_size: u64,
        collation: Option<B>,
        rw_buf_size: Option<usize>,
    ) -> Result<Self, SortError> {
        if max_file_size == 0 {
            return Err(SortError::InvalidConfig("max file size must be positive"));
        }

        return Ok(Sorter {
            thread_pool: Self::init_thread_pool(threads_number)?,
            max_file_size,
            collators: CollatorPool::new(collation),
            rw_buf_size,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    /// Collators used by the sorter.
    pub fn collators(&self) -> &CollatorPool<B> {
        &self.collators
    }

    /// Sorts `files` and writes their lines to `output`.
    /// Lines of `files[i]` must all order before lines of `files[i + 1]`, as produced by
    /// [`Splitter`](crate::Splitter). Temporary files are deleted as soon as they are read.
    ///
    /// Returns a descriptor of the output file.
    pub fn sort(&self, output: &Path, files: &[File]) -> Result<File, SortError> {
        log::info!("sorting {} chunks into {}", files.len(), output.display());

        let mut writer =
            LineWriter::create(output, self.rw_buf_size).map_err(|err| SortError::Write(output.into(), err))?;

        let (completions_tx, completions_rx) = crossbeam_channel::unbounded::<Completion>();
        let mut admission = Admission::new(self.max_file_size);
        let mut reorder = ReorderBuffer::new();

        self.thread_pool.in_place_scope(|scope| -> Result<(), SortError> {
            self.schedule(scope, files, &mut admission, &completions_tx);

            while reorder.next_seq() < files.len() {
                let (seq, lines) = completions_rx
                    .recv()
                    .map_err(|_| SortError::TaskFailed("sorting tasks stopped unexpectedly"))?;

                reorder.insert(seq, lines?);
                while let Some((seq, lines)) = reorder.pop_ready() {
                    writer
                        .write_lines(&lines)
                        .map_err(|err| SortError::Write(output.into(), err))?;
                    log::debug!("chunk {} written ({} lines)", seq, lines.len());

                    admission.release(files[seq].size);
                    self.schedule(scope, files, &mut admission, &completions_tx);
                }
            }

            Ok(())
        })?;

        writer.finish(false).map_err(|err| SortError::Write(output.into(), err))
    }

    fn schedule<'scope>(
        &'scope self,
        scope: &rayon::Scope<'scope>,
        files: &'scope [File],
        admission: &mut Admission,
        completions: &Sender<Completion>,
    ) {
        while let Some(seq) = admission.admit(files) {
            let file = &files[seq];
            let completions = completions.clone();
            log::debug!("scheduling chunk {} ({} bytes)", seq, file.size);

            scope.spawn(move |_| {
                // a panicking task still reports, otherwise the writing loop waits for it forever
                let result = panic::catch_unwind(AssertUnwindSafe(|| self.sort_file(file)))
                    .unwrap_or_else(|_| Err(SortError::TaskFailed("sorting task panicked")));
                if let Err(err) = &result {
                    log::error!("chunk {} sorting failed: {}", file.path.display(), err);
                }
                // the receiver is gone only if the sort has already failed
                let _ = completions.send((seq, result));
            });
        }
    }

    fn sort_file(&self, file: &File) -> Result<Vec<Line>, SortError> {
        let lines = self.read_file(&file.path);

        if file.temporary {
            if let Err(err) = fs::remove_file(&file.path) {
                log::warn!("temporary file {} not removed: {}", file.path.display(), err);
            }
        }

        let mut lines = lines?;
        let checkout = self.collators.get()?;
        match checkout.collation() {
            Some(collation) => lines.sort_unstable_by(|a, b| a.cmp_collated(b, collation)),
            None => lines.par_sort_unstable_by(Line::cmp_bytes),
        }

        return Ok(lines);
    }

    fn read_file(&self, path: &Path) -> Result<Vec<Line>, SortError> {
        let reader = LineReader::open(path, self.rw_buf_size).map_err(|err| SortError::Read(path.into(), err))?;
        reader
            .collect::<Result<Vec<Line>, LineError>>()
            .map_err(|err| SortError::Read(path.into(), err))
    }
}

impl<B: CollationBuilder> Debug for Sorter<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sorter")
            .field("threads", &self.thread_pool.current_num_threads())
            .field("max_file_size", &self.max_file_size)
            .field("collators", &self.collators)
            .finish()
    }
}
