//! Delimited-text output of the accepted draws, one draw per line.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use faer::Mat;

use crate::error::{HmcError, Result};

/// Writes packets of samples to a text file.
///
/// The file is opened once and reused for every packet of a run. Values
/// are written in scientific notation with `precision` digits.
pub struct CsvSampleWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    separator: char,
    precision: usize,
    rows_written: u64,
}

impl CsvSampleWriter {
    /// Open `path`, truncating it unless `append` is set.
    pub fn open<P: AsRef<Path>>(path: P, append: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)
            .map_err(|err| HmcError::io(&path, err))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            separator: ',',
            precision: 10,
            rows_written: 0,
        })
    }

    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written through this writer, not counting earlier runs.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Append all rows of `samples` and flush.
    pub fn write(&mut self, samples: &Mat<f64>) -> Result<()> {
        for row in 0..samples.nrows() {
            let mut line = String::new();
            for col in 0..samples.ncols() {
                if col > 0 {
                    line.push(self.separator);
                }
                line.push_str(&format!("{:.*e}", self.precision, samples[(row, col)]));
            }
            line.push('\n');
            self.writer
                .write_all(line.as_bytes())
                .map_err(|err| HmcError::io(&self.path, err))?;
        }
        self.rows_written += samples.nrows() as u64;
        self.writer
            .flush()
            .map_err(|err| HmcError::io(&self.path, err))
    }
}
