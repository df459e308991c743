//! Sample-based range splitter.

use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::codec::{LineError, LineReader, LineWriter, SeekReader};
use crate::collate::{ByteOrder, Collation, CollationBuilder, CollatorPool};
use crate::file::File;
use crate::line::Line;
use crate::sort::{SortError, DEFAULT_MAX_FILE_SIZE};

/// Number of lines handed to a partitioning worker at once.
const LINE_BATCH_SIZE: usize = 1000;
/// Capacity of every bucket writer queue, in batches.
const BUCKET_QUEUE_SIZE: usize = 64;
/// Number of consecutive splits that may leave a file undivided before it is accepted as is.
const MAX_STALLED_SPLITS: u32 = 3;

/// Splitter builder. Provides methods for [`Splitter`] initialization.
pub struct SplitterBuilder<B: CollationBuilder = ByteOrder> {
    /// Largest file size to be sorted in memory.
    max_file_size: u64,
    /// Expected size of a single partition.
    chunk_size: Option<u64>,
    /// Pivot sampling seed.
    seed: Option<u64>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Number of partitioning workers.
    workers_number: Option<usize>,
    /// Collation builder, byte-wise partitioning if not set.
    collation: Option<B>,
    /// Chunk file read/write buffer size.
    rw_buf_size: Option<usize>,
}

impl<B: CollationBuilder> SplitterBuilder<B> {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        SplitterBuilder::default()
    }

    /// Builds a [`Splitter`] instance using provided configuration.
    pub fn build(self) -> Result<Splitter<B>, SortError> {
        Splitter::new(
            self.max_file_size,
            self.chunk_size,
            self.seed,
            self.tmp_dir.as_deref(),
            self.workers_number,
            self.collation,
            self.rw_buf_size,
        )
    }

    /// Sets the largest file size to be sorted in memory.
    pub fn with_max_file_size(mut self, max_file_size: u64) -> SplitterBuilder<B> {
        self.max_file_size = max_file_size;
        return self;
    }

    /// Sets the expected partition size, not above the max file size.
    /// Defaults to a hundredth of the max file size.
    pub fn with_chunk_size(mut self, chunk_size: u64) -> SplitterBuilder<B> {
        self.chunk_size = Some(chunk_size);
        return self;
    }

    /// Sets pivot sampling seed. Splitting the same file with the same seed yields the same partitions.
    pub fn with_seed(mut self, seed: u64) -> SplitterBuilder<B> {
        self.seed = Some(seed);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> SplitterBuilder<B> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets number of partitioning workers.
    pub fn with_workers_number(mut self, workers_number: usize) -> SplitterBuilder<B> {
        self.workers_number = Some(workers_number);
        return self;
    }

    /// Sets collation used to order partitions. Must be the one the chunks are sorted with.
    pub fn with_collation(mut self, collation: B) -> SplitterBuilder<B> {
        self.collation = Some(collation);
        return self;
    }

    /// Sets chunk read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> SplitterBuilder<B> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }
}

impl<B: CollationBuilder> Default for SplitterBuilder<B> {
    fn default() -> Self {
        SplitterBuilder {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            chunk_size: None,
            seed: None,
            tmp_dir: None,
            workers_number: None,
            collation: None,
            rw_buf_size: None,
        }
    }
}

/// Splits a file into an ordered list of files small enough to be sorted in memory.
///
/// Pivot lines are sampled at random offsets of the file and every line is routed to the partition
/// between the two pivots surrounding it, so that sorting every partition and concatenating them in
/// list order yields the sorted file. Partitions that are still too large are split again.
///
/// Partition files live in a temporary directory owned by the splitter and removed when it is dropped.
pub struct Splitter<B: CollationBuilder = ByteOrder> {
    max_file_size: u64,
    chunk_size: u64,
    seed: u64,
    workers_number: usize,
    collators: CollatorPool<B>,
    rw_buf_size: Option<usize>,
    tmp_dir: tempfile::TempDir,
    next_tmp_file: usize,
}

impl<B: CollationBuilder> Splitter<B> {
    /// Creates a new splitter instance.
    ///
    /// # Arguments
    /// * `max_file_size` - Files up to this size are not split.
    /// * `chunk_size` - Expected partition size, it defines the number of sampled pivots. If the parameter is
    ///   [`None`] a hundredth of `max_file_size` is used.
    /// * `seed` - Pivot sampling seed. If the parameter is [`None`] a random one is used.
    /// * `tmp_path` - Directory to be used to store temporary data. If paramater is [`None`] default OS temporary
    ///   directory will be used.
    /// * `workers_number` - Number of partitioning workers. If the parameter is [`None`] it is selected based on
    ///   available CPU core number.
    /// * `collation` - Collation builder. If the parameter is [`None`] partitions are ordered byte-wise.
    /// * `rw_buf_size` - Chunks file read/write buffer size.
    pub fn new(
        max_file_size: u64,
        chunk_size: Option<u64>,
        seed: Option<u64>,
        tmp_path: Option<&Path>,
        workers_number: Option<usize>,
        collation: Option<B>,
        rw_buf_size: Option<usize>,
    ) -> Result<Self, SortError> {
        if max_file_size == 0 {
            return Err(SortError::InvalidConfig("max file size must be positive"));
        }
        let chunk_size = chunk_size.unwrap_or((max_file_size / 100).max(1));
        if chunk_size == 0 || chunk_size > max_file_size {
            return Err(SortError::InvalidConfig("chunk size must be positive and not above max file size"));
        }
        if workers_number == Some(0) {
            return Err(SortError::InvalidConfig("workers number must be positive"));
        }

        let seed = seed.unwrap_or_else(rand::random);
        let workers_number = workers_number.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(|threads| threads.get())
                .unwrap_or(1)
        });
        log::info!(
            "initializing splitter (workers: {}, chunk size: {}, seed: {})",
            workers_number,
            chunk_size,
            seed
        );

        return Ok(Splitter {
            max_file_size,
            chunk_size,
            seed,
            workers_number,
            collators: CollatorPool::new(collation),
            rw_buf_size,
            tmp_dir: Self::init_tmp_directory(tmp_path)?,
            next_tmp_file: 0,
        });
    }

    fn init_tmp_directory(tmp_path: Option<&Path>) -> Result<tempfile::TempDir, SortError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("huge-sort-");

        let tmp_dir = if let Some(tmp_path) = tmp_path {
            builder.tempdir_in(tmp_path)
        } else {
            builder.tempdir()
        }
        .map_err(|err| SortError::TempDir(err))?;

        log::info!("using {} as a temporary directory", tmp_dir.path().display());

        return Ok(tmp_dir);
    }

    /// Pivot sampling seed in use.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Directory holding the partition files.
    pub fn tmp_dir(&self) -> &Path {
        self.tmp_dir.path()
    }

    /// Splits `source` into files no larger than the max file size, ordered so that their sorted contents
    /// concatenate into the sorted source. `source` itself is returned if it is small enough.
    ///
    /// A partition consisting of records that cannot be told apart may stay larger than the max file size.
    pub fn split(&mut self, source: &Path) -> Result<Vec<File>, SortError> {
        let size = fs::metadata(source).map_err(SortError::IO)?.len();
        let mut rng = StdRng::seed_from_u64(self.seed);

        self.split_file(File::source(source, size), &mut rng, 0)
    }

    fn split_file(&mut self, file: File, rng: &mut StdRng, stalled: u32) -> Result<Vec<File>, SortError> {
        if file.size <= self.max_file_size {
            return Ok(vec![file]);
        }
        if stalled > MAX_STALLED_SPLITS {
            log::warn!(
                "{} ({} bytes) can not be split further, it will be sorted as a whole",
                file.path.display(),
                file.size
            );
            return Ok(vec![file]);
        }

        let pivots = self.pivots(&file, rng)?;
        if pivots.is_empty() {
            return self.split_file(file, rng, stalled + 1);
        }

        log::debug!(
            "splitting {} ({} bytes) into {} partitions",
            file.path.display(),
            file.size,
            pivots.len() + 1
        );
        let partitions = self.partition(&file, &pivots)?;

        let mut files = Vec::with_capacity(partitions.len());
        for partition in partitions {
            if partition.size <= self.max_file_size {
                files.push(partition);
                continue;
            }

            let stalled = if partition.size >= file.size { stalled + 1 } else { 0 };
            let path = partition.path.clone();
            let subfiles = self.split_file(partition, rng, stalled)?;

            if subfiles.iter().all(|subfile| subfile.path != path) {
                if let Err(err) = fs::remove_file(&path) {
                    log::warn!("temporary file {} not removed: {}", path.display(), err);
                }
            }
            files.extend(subfiles);
        }

        return Ok(files);
    }

    /// Samples pivot lines at random offsets of the file, ordered and without duplicates.
    fn pivots(&self, file: &File, rng: &mut StdRng) -> Result<Vec<Line>, SortError> {
        let chunk_count = (file.size - 1) / self.chunk_size + 1;

        let mut offsets: Vec<u64> = (1..chunk_count).map(|_| rng.gen_range(0..file.size)).collect();
        offsets.sort_unstable();

        let read_error = |err| SortError::Read(file.path.clone(), err);
        let mut reader = SeekReader::open(&file.path, self.rw_buf_size).map_err(read_error)?;

        let mut pivots = Vec::with_capacity(offsets.len());
        for offset in offsets {
            if let Some(line) = reader.line(offset).map_err(read_error)? {
                pivots.push(line);
            }
        }

        let checkout = self.collators.get()?;
        let collation = checkout.collation();
        pivots.sort_unstable_by(|a, b| a.cmp_with(b, collation));
        pivots.dedup_by(|a, b| a.same_record(b));

        return Ok(pivots);
    }

    /// Routes every line of the file to one of `pivots.len() + 1` partition files.
    fn partition(&mut self, file: &File, pivots: &[Line]) -> Result<Vec<File>, SortError> {
        let mut writers = Vec::with_capacity(pivots.len() + 1);
        for _ in 0..=pivots.len() {
            let path = self.next_tmp_path();
            let writer = LineWriter::create(&path, self.rw_buf_size).map_err(|err| SortError::Write(path, err))?;
            writers.push(writer);
        }
        let mut reader =
            LineReader::open(&file.path, self.rw_buf_size).map_err(|err| SortError::Read(file.path.clone(), err))?;

        let workers_number = self.workers_number;
        let collators = &self.collators;

        thread::scope(|scope| {
            let mut buckets = Vec::with_capacity(writers.len());
            let mut writer_handles = Vec::with_capacity(writers.len());
            for writer in writers {
                let (bucket_tx, bucket_rx) = crossbeam_channel::bounded(BUCKET_QUEUE_SIZE);
                buckets.push(bucket_tx);
                writer_handles.push(scope.spawn(move || write_partition(writer, bucket_rx)));
            }

            let (batch_tx, batch_rx) = crossbeam_channel::bounded(workers_number);
            let worker_handles: Vec<_> = (0..workers_number)
                .map(|_| {
                    let batches = batch_rx.clone();
                    let buckets = buckets.clone();
                    scope.spawn(move || route_batches(pivots, collators, batches, buckets))
                })
                .collect();
            drop(batch_rx);

            let read_result = read_batches(&mut reader, &batch_tx)
                .map_err(|err| match err {
                    ReadBatchesError::Read(err) => SortError::Read(file.path.clone(), err),
                    ReadBatchesError::Disconnected => SortError::TaskFailed("partitioning workers stopped"),
                });
            drop(batch_tx);

            let mut first_error = read_result.err();
            for handle in worker_handles {
                let result = handle
                    .join()
                    .unwrap_or(Err(SortError::TaskFailed("partitioning worker panicked")));
                if let Err(err) = result {
                    first_error.get_or_insert(err);
                }
            }
            drop(buckets);

            let mut partitions = Vec::with_capacity(writer_handles.len());
            for handle in writer_handles {
                match handle
                    .join()
                    .unwrap_or(Err(SortError::TaskFailed("partition writer panicked")))
                {
                    Ok(partition) => partitions.push(partition),
                    Err(err) => {
                        first_error.get_or_insert(err);
                    }
                }
            }

            match first_error {
                Some(err) => Err(err),
                None => Ok(partitions),
            }
        })
    }

    fn next_tmp_path(&mut self) -> PathBuf {
        let path = self.tmp_dir.path().join(format!("{}.txt", self.next_tmp_file));
        self.next_tmp_file += 1;
        path
    }
}

/// Index of the partition `line` belongs to: the number of pivots ordered before it.
/// A line carrying the same record as a pivot goes to the partition following that pivot.
pub(crate) fn partition_index<C: Collation + ?Sized>(pivots: &[Line], line: &Line, collation: Option<&C>) -> usize {
    let index = pivots.partition_point(|pivot| pivot.less(line, collation));
    if index < pivots.len() && pivots[index].same_record(line) {
        index + 1
    } else {
        index
    }
}

enum ReadBatchesError {
    Read(LineError),
    Disconnected,
}

fn read_batches(reader: &mut LineReader, batches: &Sender<Vec<Line>>) -> Result<(), ReadBatchesError> {
    let mut batch = Vec::with_capacity(LINE_BATCH_SIZE);
    while let Some(line) = reader.next_line().map_err(ReadBatchesError::Read)? {
        batch.push(line);
        if batch.len() >= LINE_BATCH_SIZE {
            let full = mem::replace(&mut batch, Vec::with_capacity(LINE_BATCH_SIZE));
            batches.send(full).map_err(|_| ReadBatchesError::Disconnected)?;
        }
    }

    if !batch.is_empty() {
        batches.send(batch).map_err(|_| ReadBatchesError::Disconnected)?;
    }

    Ok(())
}

fn route_batches<B: CollationBuilder>(
    pivots: &[Line],
    collators: &CollatorPool<B>,
    batches: Receiver<Vec<Line>>,
    buckets: Vec<Sender<Vec<Line>>>,
) -> Result<(), SortError> {
    let checkout = collators.get().map_err(|err| {
        log::error!("partitioning worker not started: {}", err);
        err
    })?;
    let collation = checkout.collation();

    for batch in batches {
        let mut routed: Vec<Vec<Line>> = vec![Vec::new(); buckets.len()];
        for line in batch {
            routed[partition_index(pivots, &line, collation)].push(line);
        }

        for (index, lines) in routed.into_iter().enumerate() {
            if lines.is_empty() {
                continue;
            }
            if let Err(err) = buckets[index].send(lines) {
                log::error!("partition {} writer stopped, {} lines dropped", index, err.into_inner().len());
            }
        }
    }

    Ok(())
}

fn write_partition(mut writer: LineWriter, lines: Receiver<Vec<Line>>) -> Result<File, SortError> {
    for batch in lines {
        if let Err(err) = writer.write_lines(&batch) {
            log::error!("partition {} writing failed: {}", writer.path().display(), err);
            return Err(SortError::Write(writer.path().into(), err));
        }
    }

    let path = writer.path().to_path_buf();
    writer.finish(true).map_err(|err| SortError::Write(path, err))
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::Path;

    use rand::{Rng, SeedableRng};
    use rstest::*;

    use super::{partition_index, SplitterBuilder};
    use crate::codec::LineReader;
    use crate::collate::test_utils::{AsciiCaseFold, CountingBuilder};
    use crate::collate::{ByteOrder, NoCollation};
    use crate::file::File;
    use crate::line::Line;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn write_random_input(path: &Path, count: usize, seed: u64) -> u64 {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let content: String = (0..count)
            .map(|index| {
                let len = rng.gen_range(1..12);
                let text: String = (0..len).map(|_| rng.gen_range(b'A'..=b'z') as char).collect();
                format!("{}.{}\n", index, text)
            })
            .collect();
        fs::write(path, &content).unwrap();
        content.len() as u64
    }

    fn read_all(file: &File) -> Vec<Line> {
        LineReader::open(&file.path, None)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[rstest]
    #[case(Line::new("a", 1, 0), 0)]
    #[case(Line::new("c", 0, 0), 0)]
    #[case(Line::new("c", 1, 0), 1)]
    #[case(Line::new("c", 1, 99), 1)]
    #[case(Line::new("c", 2, 0), 1)]
    #[case(Line::new("d", 0, 0), 1)]
    #[case(Line::new("f", 5, 7), 2)]
    #[case(Line::new("z", 0, 0), 2)]
    fn test_partition_index(#[case] line: Line, #[case] expected: usize) {
        let pivots = vec![Line::new("c", 1, 40), Line::new("f", 5, 7)];
        assert_eq!(partition_index(&pivots, &line, None::<&NoCollation>), expected);
    }

    #[test]
    fn test_partition_index_collated() {
        let pivots = vec![Line::new("B", 0, 0)];
        assert_eq!(partition_index(&pivots, &Line::new("a", 0, 0), Some(&AsciiCaseFold)), 0);
        assert_eq!(partition_index(&pivots, &Line::new("a", 0, 0), None::<&NoCollation>), 1);
    }

    #[rstest]
    fn test_split_small_file(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        let size = write_random_input(&input, 10, 1);

        let mut splitter = SplitterBuilder::<ByteOrder>::new()
            .with_max_file_size(size)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        assert_eq!(splitter.split(&input).unwrap(), vec![File::source(&input, size)]);
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_split_partitions(tmp_dir: tempfile::TempDir, #[case] collated: bool) {
        let input = tmp_dir.path().join("input.txt");
        let size = write_random_input(&input, 10_000, 2);

        let mut builder = SplitterBuilder::<CountingBuilder>::new()
            .with_max_file_size(8 * 1024)
            .with_chunk_size(4 * 1024)
            .with_seed(5)
            .with_workers_number(4)
            .with_tmp_dir(tmp_dir.path());
        if collated {
            builder = builder.with_collation(CountingBuilder::default());
        }
        let mut splitter = builder.build().unwrap();
        let files = splitter.split(&input).unwrap();

        assert!(files.len() > 1);
        assert!(files.iter().all(|file| file.temporary && file.size <= 8 * 1024));
        assert_eq!(files.iter().map(|file| file.size).sum::<u64>(), size);

        let compare = |a: &Line, b: &Line| {
            if collated {
                a.text.to_ascii_lowercase().cmp(&b.text.to_ascii_lowercase()).then(a.index.cmp(&b.index))
            } else {
                a.text.cmp(&b.text).then(a.index.cmp(&b.index))
            }
        };

        let mut previous_max: Option<Line> = None;
        let mut total = 0;
        for file in &files {
            let lines = read_all(file);
            assert_eq!(fs::metadata(&file.path).unwrap().len(), file.size);
            total += lines.len();

            if let (Some(max), Some(min)) = (&previous_max, lines.iter().min_by(|a, b| compare(*a, *b))) {
                assert!(compare(max, min).is_lt());
            }
            if let Some(max) = lines.iter().max_by(|a, b| compare(*a, *b)) {
                previous_max = Some(max.clone());
            }
        }
        assert_eq!(total, 10_000);
    }

    #[rstest]
    fn test_split_is_reproducible(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        write_random_input(&input, 5_000, 3);

        let split = |seed: u64| {
            let mut splitter = SplitterBuilder::<ByteOrder>::new()
                .with_max_file_size(4 * 1024)
                .with_chunk_size(2 * 1024)
                .with_seed(seed)
                .with_workers_number(3)
                .with_tmp_dir(tmp_dir.path())
                .build()
                .unwrap();
            let files = splitter.split(&input).unwrap();
            files
                .iter()
                .map(|file| {
                    let mut records: Vec<_> = read_all(file).into_iter().map(|l| (l.index, l.text)).collect();
                    records.sort();
                    records
                })
                .collect::<Vec<_>>()
        };

        assert_eq!(split(9), split(9));
    }

    #[rstest]
    fn test_split_identical_lines(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        let content = "7.same\n".repeat(1_000);
        fs::write(&input, &content).unwrap();

        let mut splitter = SplitterBuilder::<ByteOrder>::new()
            .with_max_file_size(1024)
            .with_chunk_size(512)
            .with_seed(1)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();
        let files = splitter.split(&input).unwrap();

        assert_eq!(files.iter().map(|file| file.size).sum::<u64>(), content.len() as u64);
        assert_eq!(files.iter().filter(|file| file.size > 0).count(), 1);
    }

    #[rstest]
    fn test_split_removes_intermediate_files(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        write_random_input(&input, 5_000, 4);

        // few pivots per split make oversized partitions and recursion likely
        let mut splitter = SplitterBuilder::<ByteOrder>::new()
            .with_max_file_size(8 * 1024)
            .with_chunk_size(8 * 1024)
            .with_seed(2)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();
        let files = splitter.split(&input).unwrap();

        let mut on_disk: Vec<_> = fs::read_dir(splitter.tmp_dir())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        on_disk.sort();
        let mut leaves: Vec<_> = files.into_iter().map(|file| file.path).collect();
        leaves.sort();

        assert_eq!(on_disk, leaves);
    }

    #[test]
    fn test_invalid_config() {
        assert!(SplitterBuilder::<ByteOrder>::new().with_max_file_size(0).build().is_err());
        assert!(SplitterBuilder::<ByteOrder>::new().with_chunk_size(0).build().is_err());
        assert!(SplitterBuilder::<ByteOrder>::new()
            .with_max_file_size(10)
            .with_chunk_size(11)
            .build()
            .is_err());
        assert!(SplitterBuilder::<ByteOrder>::new().with_workers_number(0).build().is_err());
    }
}
