//! Tab-separated signal log.
//!
//! One header line naming the columns (`time` first), then one row per
//! physics tick of the scored phase. Readers substitute 0 for cells that are
//! missing or unparsable.

use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

/// Streaming writer for signal logs
pub struct TraceWriter<W: Write> {
    out: W,
    columns: usize,
    rows: usize,
}

impl<W: Write> TraceWriter<W> {
    /// Write the header line and return a writer for the rows
    pub fn new(mut out: W, columns: &[String]) -> io::Result<Self> {
        writeln!(out, "{}", columns.join("\t"))?;
        Ok(Self {
            out,
            columns: columns.len(),
            rows: 0,
        })
    }

    /// Write one row, padding short rows with zeros
    pub fn row(&mut self, values: &[f32]) -> io::Result<()> {
        let mut line = String::with_capacity(self.columns * 8);
        for i in 0..self.columns {
            if i > 0 {
                line.push('\t');
            }
            let v = values.get(i).copied().unwrap_or(0.0);
            line.push_str(&format!("{:.5}", v));
        }
        writeln!(self.out, "{}", line)?;
        self.rows += 1;
        Ok(())
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// A signal log read back into memory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f32>>,
}

impl Trace {
    /// Parse a signal log; every row is normalised to the header width
    pub fn read<R: BufRead>(reader: R) -> io::Result<Self> {
        let mut lines = reader.lines();
        let columns: Vec<String> = match lines.next() {
            Some(header) => header?.split('\t').map(str::to_string).collect(),
            None => return Ok(Self::default()),
        };
        let mut rows = Vec::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut row: Vec<f32> = line
                .split('\t')
                .map(|cell| cell.trim().parse().unwrap_or(0.0))
                .collect();
            row.resize(columns.len(), 0.0);
            rows.push(row);
        }
        Ok(Self { columns, rows })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::read(BufReader::new(std::fs::File::open(path)?))
    }

    /// All values of a named column
    pub fn column(&self, name: &str) -> Option<Vec<f32>> {
        let index = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|r| r[index]).collect())
    }
}
