//! `huge-sort` sorts line files that do not fit into memory.
//!
//! Every line of a file is a record `<index>.<text>\n` where `index` is a caller-assigned 64-bit ordinal
//! carried verbatim to the output and used to order records with identical text.
//!
//! # Overview
//!
//! Sorting is done in two steps:
//!
//! * **Split:**
//!   [`Splitter`] samples pivot lines at random offsets of the input and routes every line to the range
//!   between two adjacent pivots, writing one partition file per range. Partitions still larger than the
//!   memory budget are split again. Sampling is seeded, so a run can be reproduced.
//! * **Sort:**
//!   [`Sorter`] sorts partitions in memory, concurrently, and writes them to the output in partition order.
//!   The total size of partitions being sorted or waiting to be written is kept under the memory budget.
//!
//! Lines are ordered byte-wise by default. A locale-aware order is available through a [`Collation`]
//! (see `collate::icu`, enabled by the `collation` feature); it must be given to both the splitter and the sorter.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use huge_sort::{Sorter, SorterBuilder, Splitter, SplitterBuilder};
//!
//! let mut splitter: Splitter = SplitterBuilder::new()
//!     .with_max_file_size(100 * 1024 * 1024)
//!     .with_seed(42)
//!     .build()
//!     .unwrap();
//! let files = splitter.split(Path::new("input.txt")).unwrap();
//!
//! let sorter: Sorter = SorterBuilder::new()
//!     .with_max_file_size(100 * 1024 * 1024)
//!     .build()
//!     .unwrap();
//! sorter.sort(Path::new("output.txt"), &files).unwrap();
//! ```

pub mod check;
pub mod codec;
pub mod collate;
pub mod file;
pub mod line;
pub mod reorder;
pub mod sort;
pub mod split;

pub use check::check_sorted;
pub use codec::{LineError, LineReader, LineWriter, SeekReader};
pub use collate::{ByteOrder, Collation, CollationBuilder, CollationError, CollatorPool};
pub use file::File;
pub use line::Line;
pub use reorder::ReorderBuffer;
pub use sort::{SortError, Sorter, SorterBuilder, DEFAULT_MAX_FILE_SIZE};
pub use split::{Splitter, SplitterBuilder};
