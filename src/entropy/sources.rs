//! Slow-Poll Source Readers.
//!
//! Reads the raw bytes behind a [`SourceDescriptor`]: skip `skip_offset` bytes,
//! then read up to `read_count`. Errors are returned to the collector, which
//! logs and skips the source.

use std::io::{self, Read};
use std::path::Path;
use std::process::{Command, Stdio};

use crate::config::{SourceDescriptor, SourceLocator};

/// Largest buffer reserved up front; longer reads grow as data arrives.
const MAX_PREALLOC: usize = 64 * 1024;

/// Timeout applied to URL sources.
#[cfg(feature = "net")]
const URL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Reads the bytes a descriptor points at.
pub fn read_source(descriptor: &SourceDescriptor) -> io::Result<Vec<u8>> {
    let skip = descriptor.skip_offset();
    let count = descriptor.read_count();
    match descriptor.locator() {
        SourceLocator::File(path) => read_file(path, skip, count),
        SourceLocator::Url(url) => read_url(url, skip, count),
        SourceLocator::Program(command) => read_program(command, skip, count),
    }
}

/// Skips `skip` bytes of `reader`, then reads at most `count` bytes.
pub fn read_window<R: Read>(mut reader: R, skip: usize, count: usize) -> io::Result<Vec<u8>> {
    if skip > 0 {
        io::copy(&mut (&mut reader).take(skip as u64), &mut io::sink())?;
    }
    let mut buf = Vec::with_capacity(count.min(MAX_PREALLOC));
    reader.take(count as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

fn read_file(path: &Path, skip: usize, count: usize) -> io::Result<Vec<u8>> {
    let file = std::fs::File::open(path)?;
    read_window(file, skip, count)
}

#[cfg(feature = "net")]
fn read_url(url: &str, skip: usize, count: usize) -> io::Result<Vec<u8>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(URL_TIMEOUT)
        .build()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let resp = client
        .get(url)
        .send()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    if !resp.status().is_success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("HTTP status {}", resp.status()),
        ));
    }
    read_window(resp, skip, count)
}

#[cfg(not(feature = "net"))]
fn read_url(_url: &str, _skip: usize, _count: usize) -> io::Result<Vec<u8>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "URL sources require the `net` feature",
    ))
}

fn read_program(command: &str, skip: usize, count: usize) -> io::Result<Vec<u8>> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

    let mut child = Command::new(program)
        .args(parts)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    let result = match child.stdout.take() {
        Some(stdout) => read_window(stdout, skip, count),
        None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "no stdout")),
    };

    // The program may still be producing output; it is not needed any more.
    let _ = child.kill();
    let _ = child.wait();
    result
}
