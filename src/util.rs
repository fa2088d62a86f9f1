use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::scheduler::{ElementScheduler, Scheduler};

/// Residue classes used to spread synthetic inputs across clients.
const INPUT_CLASSES: usize = 8;

/// Reads one element per line. Lines are taken as raw Latin-1 bytes; a trailing `\r` is
/// dropped and blank lines are skipped.
pub fn read_elements(path: &Path) -> Result<Vec<Vec<u8>>> {
    let content = fs::read(path)?;
    let elements: Vec<Vec<u8>> = content
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.is_empty())
        .map(<[u8]>::to_vec)
        .collect();
    debug!("read {} elements from {:?}", elements.len(), path);
    Ok(elements)
}

/// Writes every revealed slot content, one per line, in slot order.
pub fn write_outputs(path: &Path, outputs: &[Option<Vec<u8>>]) -> Result<()> {
    let mut out = create(path)?;
    for content in outputs.iter().flatten() {
        out.write_all(content)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Writes the slot assignment as `NNNN: element` lines. With `verbose`, unassigned slots
/// are listed as `<EMPTY>`.
pub fn write_slot_dump(path: &Path, scheduler: &ElementScheduler, verbose: bool) -> Result<()> {
    let mut out = create(path)?;
    for index in 0..scheduler.slot_count() {
        match scheduler.element(index) {
            Some(element) => {
                write!(out, "{:04}: ", index)?;
                out.write_all(element)?;
                out.write_all(b"\n")?;
            }
            None if verbose => writeln!(out, "{:04}: <EMPTY>", index)?,
            None => {}
        }
    }
    out.flush()?;
    Ok(())
}

/// Writes synthetic inputs `<dir>/<i>.csv` for `clients` clients: client `i` gets every
/// integer below `limit` congruent to `i` modulo 8. Returns the files written.
pub fn gen_input(clients: usize, limit: usize, dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut files = Vec::with_capacity(clients);
    for client in 0..clients {
        let path = dir.join(format!("{}.csv", client));
        let mut out = BufWriter::new(fs::File::create(&path)?);
        for value in (0..limit).filter(|j| j % INPUT_CLASSES == client % INPUT_CLASSES) {
            writeln!(out, "{}", value)?;
        }
        out.flush()?;
        files.push(path);
    }
    Ok(files)
}

/// Decodes Latin-1 bytes for display.
pub fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn create(path: &Path) -> Result<BufWriter<fs::File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(BufWriter::new(fs::File::create(path)?))
}
