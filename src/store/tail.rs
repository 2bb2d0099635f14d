//! Tail locator: find the last content line of a partition file without
//! reading the whole file.
//!
//! Scans backward byte-by-byte from EOF until a line terminator is found,
//! then reverses the accumulated bytes. Partition files can be years of
//! minute candles, so the forward read is off the table.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, warn};

fn is_line_terminator(byte: u8) -> bool {
    byte == b'\n' || byte == b'\r'
}

/// Last non-empty line of a seekable byte source, or `None` when the source
/// is empty or holds only line terminators.
///
/// A trailing terminator still yields the true last content line; a source
/// with a single unterminated line yields that full line.
pub fn last_line<R: Read + Seek>(src: &mut R) -> std::io::Result<Option<String>> {
    let len = src.seek(SeekFrom::End(0))?;
    if len == 0 {
        return Ok(None);
    }

    let mut acc: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1];
    let mut pos = len;
    let mut in_line = false;

    while pos > 0 {
        pos -= 1;
        src.seek(SeekFrom::Start(pos))?;
        src.read_exact(&mut buf)?;

        if is_line_terminator(buf[0]) {
            if in_line {
                break;
            }
            // still inside the trailing terminator run
            continue;
        }
        in_line = true;
        acc.push(buf[0]);
    }

    if acc.is_empty() {
        return Ok(None);
    }
    acc.reverse();
    Ok(Some(String::from_utf8_lossy(&acc).into_owned()))
}

/// Last content line of a file on disk.
///
/// Absence (missing file, empty file) and I/O failures both map to `None`:
/// either way the caller has no resume position and must full-backfill. I/O
/// failures are logged, never propagated.
pub fn last_line_of_file(path: &Path) -> Option<String> {
    if !path.exists() {
        debug!(path = %path.display(), "no partition file yet");
        return None;
    }
    let result = File::open(path).and_then(|mut f| last_line(&mut f));
    match result {
        Ok(line) => line,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed reading file tail");
            None
        }
    }
}
