use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::mem::take;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

fn needs_quotes(field: &str) -> bool {
    field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
}

/// Render one CSV line, newline included.
pub fn format_row<S: AsRef<str>>(fields: &[S]) -> String {
    let mut line = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        let field = field.as_ref();
        if needs_quotes(field) {
            line.push('"');
            line.push_str(&field.replace('"', "\"\""));
            line.push('"');
        } else {
            line.push_str(field);
        }
    }
    line.push('\n');
    line
}

/// Split one CSV record into fields. Quoted fields may contain separators,
/// doubled quotes and newlines. An unterminated quote runs to the end.
pub fn parse_line(line: &str) -> Vec<String> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);

    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if matches!(chars.peek(), Some('"')) {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.is_empty() => in_quotes = true,
            ',' if !in_quotes => fields.push(take(&mut field)),
            _ => field.push(ch),
        }
    }
    fields.push(field);
    fields
}

/// Reads CSV records line by line, joining physical lines while a quoted
/// field is still open. Blank lines are skipped. Bytes that are not valid
/// UTF-8 (a write torn inside a character) are replaced, not rejected.
pub struct RecordReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl RecordReader<BufReader<File>> {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }
}

fn quote_count(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&b| b == b'"').count()
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = io::Result<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.inner.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e)),
            }

            while quote_count(&self.buf) % 2 == 1 {
                match self.inner.read_until(b'\n', &mut self.buf) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => return Some(Err(e)),
                }
            }

            let record = String::from_utf8_lossy(&self.buf);
            if record.trim().is_empty() {
                continue;
            }
            return Some(Ok(parse_line(&record)));
        }
    }
}

/// Strip characters that are not valid in file names on common platforms.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '/' | '<' | '>' | ':' | '"' | '\\' | '|' | '*' | '?'))
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

/// `{index}_{name}.csv`, the per-entity output file.
pub fn entity_file_name(index: usize, name: &str) -> String {
    format!("{}_{}.csv", index, sanitize_file_name(name))
}

/// Bytes that terminate a torn last record so the next appended row starts
/// a record of its own: a closing quote when a quoted field was left open,
/// and the missing newline.
fn torn_tail_repair(file: &mut File, len: u64) -> io::Result<&'static [u8]> {
    file.seek(SeekFrom::Start(0))?;
    let mut quote_open = false;
    {
        let mut reader = BufReader::new(&mut *file);
        loop {
            let chunk = reader.fill_buf()?;
            if chunk.is_empty() {
                break;
            }
            quote_open ^= quote_count(chunk) % 2 == 1;
            let consumed = chunk.len();
            reader.consume(consumed);
        }
    }

    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;

    let repair: &'static [u8] = match (quote_open, last[0] == b'\n') {
        (true, _) => b"\"\n",
        (false, false) => b"\n",
        (false, true) => b"",
    };
    Ok(repair)
}

/// Append-only CSV writer for one entity.
///
/// Existing content is never truncated. The header is written only when
/// the file is new or empty, and every row is flushed as soon as it is
/// appended so an interrupted crawl leaves complete rows behind.
pub struct EntityWriter {
    file: File,
    path: PathBuf,
    rows_written: usize,
}

impl EntityWriter {
    pub fn open<S: AsRef<str>>(path: &Path, header: &[S]) -> io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            file.write_all(format_row(header).as_bytes())?;
            file.flush()?;
        } else {
            // A crash mid-row can leave the last record unterminated, possibly
            // inside a quoted field
            let repair = torn_tail_repair(&mut file, len)?;
            if !repair.is_empty() {
                file.write_all(repair)?;
                file.flush()?;
                warn!(path = %path.display(), "closed a torn row left by an interrupted write");
            }
            debug!(path = %path.display(), bytes = len, "appending to existing file");
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            rows_written: 0,
        })
    }

    pub fn append_row<S: AsRef<str>>(&mut self, fields: &[S]) -> io::Result<()> {
        self.file.write_all(format_row(fields).as_bytes())?;
        self.file.flush()?;
        self.rows_written += 1;
        Ok(())
    }

    /// Rows appended through this writer, header excluded.
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
