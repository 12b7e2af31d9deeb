// FILE: src/worker/capture.rs
//! Output Capture: redirects the engine's standard output to an in-memory
//! buffer for the duration of one command, optionally teeing to the
//! engine's log file if one is configured (§4.2 step 3, §2 "Output
//! Capture").

use std::io::{self, Write};
use std::path::PathBuf;

pub struct CaptureBuffer {
    buf: Vec<u8>,
    tee_file: Option<std::fs::File>,
}

impl CaptureBuffer {
    pub fn new(log_file: Option<&PathBuf>) -> io::Result<Self> {
        let tee_file = match log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Some(
                    std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)?,
                )
            }
            None => None,
        };
        Ok(CaptureBuffer {
            buf: Vec::new(),
            tee_file,
        })
    }

    pub fn take_text(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        text
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if let Some(f) = self.tee_file.as_mut() {
            f.write_all(data)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(f) = self.tee_file.as_mut() {
            f.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captured_bytes_are_readable_as_text() {
        let mut cap = CaptureBuffer::new(None).unwrap();
        write!(cap, "hello {}", 4).unwrap();
        assert_eq!(cap.take_text(), "hello 4");
        assert_eq!(cap.take_text(), "");
    }

    #[test]
    fn tee_file_receives_the_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("engine.log");
        {
            let mut cap = CaptureBuffer::new(Some(&log_path)).unwrap();
            write!(cap, "line one\n").unwrap();
        }
        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(contents, "line one\n");
    }
}
