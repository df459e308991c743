//! Line file codec.
//!
//! Every record is stored as the decimal index, a `.` byte, the raw payload and a terminating `\n`.
//! The first `.` of a line separates the index from the payload.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use crate::file::File;
use crate::line::Line;

const SEPARATOR: u8 = b'.';
const NEWLINE: u8 = b'\n';

/// Line reading error.
#[derive(Debug)]
pub enum LineError {
    /// Common I/O error.
    IO(io::Error),
    /// Malformed record.
    Decode { position: u64, reason: &'static str },
}

impl Error for LineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            LineError::IO(err) => Some(err),
            LineError::Decode { .. } => None,
        }
    }
}

impl Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            LineError::IO(err) => write!(f, "I/O operation failed: {}", err),
            LineError::Decode { position, reason } => {
                write!(f, "malformed line at byte {}: {}", position, reason)
            }
        }
    }
}

impl From<io::Error> for LineError {
    fn from(err: io::Error) -> Self {
        LineError::IO(err)
    }
}

/// Decodes a raw line (without the trailing newline) read at `position`.
fn decode(data: &[u8], position: u64) -> Result<Line, LineError> {
    let separator = data.iter().position(|&b| b == SEPARATOR).ok_or(LineError::Decode {
        position,
        reason: "index separator not found",
    })?;

    let index = std::str::from_utf8(&data[..separator])
        .ok()
        .and_then(|digits| digits.parse::<i64>().ok())
        .ok_or(LineError::Decode {
            position,
            reason: "index is not a 64-bit integer",
        })?;

    Ok(Line::new(&data[separator + 1..], index, position))
}

fn strip_newline(data: &[u8]) -> &[u8] {
    match data.last() {
        Some(&NEWLINE) => &data[..data.len() - 1],
        _ => data,
    }
}

fn open_reader(path: &Path, buf_size: Option<usize>) -> io::Result<io::BufReader<fs::File>> {
    let file = fs::File::open(path)?;
    Ok(match buf_size {
        Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
        None => io::BufReader::new(file),
    })
}

/// Sequential line reader tracking the byte position of every record.
pub struct LineReader {
    reader: io::BufReader<fs::File>,
    position: u64,
    buf: Vec<u8>,
}

impl LineReader {
    /// Opens a line file for reading.
    pub fn open(path: &Path, buf_size: Option<usize>) -> Result<Self, LineError> {
        Ok(LineReader {
            reader: open_reader(path, buf_size)?,
            position: 0,
            buf: Vec::new(),
        })
    }

    /// Reads the next record. Returns [`None`] at the end of the stream.
    /// A last line without a trailing newline is still a valid record.
    pub fn next_line(&mut self) -> Result<Option<Line>, LineError> {
        self.buf.clear();
        let read = self.reader.read_until(NEWLINE, &mut self.buf)?;
        if read == 0 {
            return Ok(None);
        }

        let position = self.position;
        self.position += read as u64;

        decode(strip_newline(&self.buf), position).map(Some)
    }

    /// Byte position of the next record.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Iterator for LineReader {
    type Item = Result<Line, LineError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_line().transpose()
    }
}

/// Random access line reader used for pivot sampling.
pub struct SeekReader {
    reader: io::BufReader<fs::File>,
    buf: Vec<u8>,
}

impl SeekReader {
    /// Opens a line file for random access reads.
    pub fn open(path: &Path, buf_size: Option<usize>) -> Result<Self, LineError> {
        Ok(SeekReader {
            reader: open_reader(path, buf_size)?,
            buf: Vec::new(),
        })
    }

    /// Seeks to `offset`, skips the line the offset lands in and decodes the next complete one.
    /// Returns [`None`] if there is no line after the one containing `offset`.
    pub fn line(&mut self, offset: u64) -> Result<Option<Line>, LineError> {
        self.reader.seek(io::SeekFrom::Start(offset))?;

        self.buf.clear();
        let skipped = self.reader.read_until(NEWLINE, &mut self.buf)?;
        if self.buf.last() != Some(&NEWLINE) {
            return Ok(None);
        }

        self.buf.clear();
        if self.reader.read_until(NEWLINE, &mut self.buf)? == 0 {
            return Ok(None);
        }

        decode(strip_newline(&self.buf), offset + skipped as u64).map(Some)
    }
}

/// Line writer counting the number of bytes written.
pub struct LineWriter {
    path: PathBuf,
    writer: io::BufWriter<fs::File>,
    size: u64,
    digits: itoa::Buffer,
}

impl LineWriter {
    /// Creates (or truncates) a line file.
    pub fn create(path: &Path, buf_size: Option<usize>) -> Result<Self, LineError> {
        let file = fs::File::create(path)?;
        let writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };

        Ok(LineWriter {
            path: path.to_path_buf(),
            writer,
            size: 0,
            digits: itoa::Buffer::new(),
        })
    }

    /// Encodes and writes a single record.
    pub fn write_line(&mut self, line: &Line) -> Result<(), LineError> {
        let digits = self.digits.format(line.index).as_bytes();

        self.writer.write_all(digits)?;
        self.writer.write_all(&[SEPARATOR])?;
        self.writer.write_all(&line.text)?;
        self.writer.write_all(&[NEWLINE])?;
        self.size += (digits.len() + line.text.len() + 2) as u64;

        Ok(())
    }

    /// Writes records in iteration order.
    pub fn write_lines<'a>(&mut self, lines: impl IntoIterator<Item = &'a Line>) -> Result<(), LineError> {
        for line in lines {
            self.write_line(line)?;
        }
        Ok(())
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path of the file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes the writer and returns a descriptor of the written file.
    pub fn finish(mut self, temporary: bool) -> Result<File, LineError> {
        self.writer.flush()?;
        Ok(File {
            path: self.path,
            size: self.size,
            temporary,
        })
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use rstest::*;

    use super::{LineError, LineReader, LineWriter, SeekReader};
    use crate::line::Line;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[rstest]
    fn test_write_read(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("lines.txt");
        let saved = vec![
            Line::new("banana", 3, 0),
            Line::new("", 0, 0),
            Line::new("with.dots.inside", -7, 0),
            Line::new("\u{e9}t\u{e9}", 9_000_000_000, 0),
        ];

        let mut writer = LineWriter::create(&path, None).unwrap();
        writer.write_lines(&saved).unwrap();
        let file = writer.finish(true).unwrap();

        let content = fs::read(&path).unwrap();
        assert_eq!(file.size, content.len() as u64);
        assert_eq!(
            content,
            "3.banana\n0.\n-7.with.dots.inside\n9000000000.\u{e9}t\u{e9}\n".as_bytes()
        );

        let restored: Result<Vec<Line>, LineError> = LineReader::open(&path, Some(16)).unwrap().collect();
        let restored = restored.unwrap();

        let records = |lines: &[Line]| lines.iter().map(|l| (l.index, l.text.clone())).collect::<Vec<_>>();
        assert_eq!(records(&restored), records(&saved));
        assert_eq!(
            restored.iter().map(|l| l.position).collect::<Vec<_>>(),
            vec![0, 9, 12, 32]
        );
    }

    #[rstest]
    fn test_read_last_line_without_newline(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("lines.txt");
        fs::write(&path, "1.a\n2.b").unwrap();

        let mut reader = LineReader::open(&path, None).unwrap();
        assert_eq!(reader.next_line().unwrap(), Some(Line::new("a", 1, 0)));
        assert_eq!(reader.next_line().unwrap(), Some(Line::new("b", 2, 4)));
        assert_eq!(reader.next_line().unwrap(), None);
        assert_eq!(reader.position(), 7);
    }

    #[rstest]
    #[case("no separator\n")]
    #[case("x1.text\n")]
    #[case(".text\n")]
    #[case("99999999999999999999.overflow\n")]
    fn test_read_malformed(tmp_dir: tempfile::TempDir, #[case] content: &str) {
        let path = tmp_dir.path().join("lines.txt");
        fs::write(&path, format!("1.ok\n{}", content)).unwrap();

        let mut reader = LineReader::open(&path, None).unwrap();
        assert!(reader.next_line().unwrap().is_some());
        match reader.next_line() {
            Err(LineError::Decode { position, .. }) => assert_eq!(position, 5),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[rstest]
    #[case(0, Some(Line::new("bb", 2, 4)))]
    #[case(3, Some(Line::new("bb", 2, 4)))]
    #[case(4, Some(Line::new("ccc", 3, 9)))]
    #[case(6, Some(Line::new("ccc", 3, 9)))]
    #[case(9, Some(Line::new("d", 4, 15)))]
    #[case(15, None)]
    #[case(17, None)]
    fn test_seek_reader(tmp_dir: tempfile::TempDir, #[case] offset: u64, #[case] expected: Option<Line>) {
        let path = tmp_dir.path().join("lines.txt");
        fs::write(&path, "1.a\n2.bb\n3.ccc\n4.d").unwrap();

        let mut reader = SeekReader::open(&path, Some(4)).unwrap();
        assert_eq!(reader.line(offset).unwrap(), expected);
    }
}
