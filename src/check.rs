//! Sorted file check.

use std::path::Path;

use crate::codec::LineReader;
use crate::collate::{CollationBuilder, CollatorPool};
use crate::sort::SortError;

/// Scans a line file and checks that every line is ordered after its predecessor.
///
/// Returns the byte position of the first line found out of order, [`None`] if the file is sorted.
pub fn check_sorted<B: CollationBuilder>(
    path: &Path,
    collators: &CollatorPool<B>,
    rw_buf_size: Option<usize>,
) -> Result<Option<u64>, SortError> {
    let mut reader = LineReader::open(path, rw_buf_size).map_err(|err| SortError::Read(path.into(), err))?;
    let checkout = collators.get()?;
    let collation = checkout.collation();

    let mut previous = None;
    while let Some(line) = reader.next_line().map_err(|err| SortError::Read(path.into(), err))? {
        if let Some(previous) = &previous {
            if line.less(previous, collation) {
                log::warn!("{} is not sorted: line at byte {} is out of order", path.display(), line.position);
                return Ok(Some(line.position));
            }
        }
        previous = Some(line);
    }

    log::debug!("{} is sorted", path.display());
    Ok(None)
}

#[cfg(test)]
mod test {
    use std::fs;

    use rstest::*;

    use super::check_sorted;
    use crate::collate::test_utils::CountingBuilder;
    use crate::collate::{ByteOrder, CollatorPool};

    #[rstest]
    #[case("", None, None)]
    #[case("1.a\n2.b\n3.c\n", None, None)]
    #[case("2.dup\n1.dup\n", Some(6), Some(6))]
    #[case("1.B\n2.a\n", None, Some(4))]
    #[case("1.a\n2.B\n", Some(4), None)]
    #[case("1.a\n2.a\n3.A\n", Some(8), None)]
    fn test_check_sorted(
        #[case] content: &str,
        #[case] expected_bytes: Option<u64>,
        #[case] expected_collated: Option<u64>,
    ) {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("lines.txt");
        fs::write(&path, content).unwrap();

        let bytes: CollatorPool<ByteOrder> = CollatorPool::default();
        assert_eq!(check_sorted(&path, &bytes, None).unwrap(), expected_bytes);

        let collated = CollatorPool::new(Some(CountingBuilder::default()));
        assert_eq!(check_sorted(&path, &collated, None).unwrap(), expected_collated);
    }
}
