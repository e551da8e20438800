//! File device: guest-driven host file access through a register protocol.
//!
//! The name register points at a NUL-terminated path in RAM, resolved
//! against the device root (the working directory by default). Reads stream
//! through a kept-open handle; reading a directory yields a rendered
//! listing. Every operation reports its outcome through the success short;
//! host I/O failure never propagates through the bus.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};
use uxn_core::{Uxn, RAM_SIZE};

use crate::bus::{peek2, poke2, Device, SLOT_SIZE};

pub struct FileDevice {
    id: u8,
    root: PathBuf,
    name: Option<String>,
    state: State,
}

enum State {
    Idle,
    Reading(Source),
    Writing(File),
}

enum Source {
    File(File),
    /// Rendered directory listing and a cursor into it.
    Listing(Vec<u8>, usize),
}

impl FileDevice {
    pub fn new(id: u8) -> Self {
        Self::with_root(id, PathBuf::from("."))
    }

    /// All guest paths stay below `root`.
    pub fn with_root(id: u8, root: PathBuf) -> Self {
        Self {
            id,
            root,
            name: None,
            state: State::Idle,
        }
    }

    fn path(&self) -> Option<PathBuf> {
        self.name.as_ref().map(|n| self.root.join(n))
    }

    fn set_name(&mut self, ram: &[u8; RAM_SIZE], addr: u16) {
        self.state = State::Idle;
        let mut name = Vec::new();
        let mut a = addr;
        loop {
            let byte = ram[usize::from(a)];
            if byte == 0 {
                break;
            }
            name.push(byte);
            a = a.wrapping_add(1);
            if a == addr {
                break;
            }
        }
        match String::from_utf8(name) {
            Ok(s) if is_sane_path(&s) => {
                debug!(id = self.id, path = %s, "file selected");
                self.name = Some(s);
            }
            Ok(s) => {
                warn!(id = self.id, path = %s, "rejected file path");
                self.name = None;
            }
            Err(_) => {
                warn!(id = self.id, "file name is not valid utf-8");
                self.name = None;
            }
        }
    }

    /// Reads up to `dst.len()` bytes; 0 means error or end of stream.
    fn read(&mut self, dst: &mut [u8]) -> u16 {
        if matches!(self.state, State::Idle | State::Writing(_)) {
            let Some(path) = self.path() else {
                return 0;
            };
            let source = if path.is_dir() {
                Source::Listing(render_listing(&path), 0)
            } else {
                match File::open(&path) {
                    Ok(f) => Source::File(f),
                    Err(err) => {
                        debug!(id = self.id, path = %path.display(), %err, "open failed");
                        return 0;
                    }
                }
            };
            self.state = State::Reading(source);
        }
        let State::Reading(source) = &mut self.state else {
            return 0;
        };
        match source {
            Source::File(f) => match f.read(dst) {
                Ok(n) => n as u16,
                Err(err) => {
                    debug!(id = self.id, %err, "read failed");
                    0
                }
            },
            Source::Listing(bytes, cursor) => {
                let rest = &bytes[*cursor..];
                let n = rest.len().min(dst.len());
                dst[..n].copy_from_slice(&rest[..n]);
                *cursor += n;
                n as u16
            }
        }
    }

    /// Writes `src`; 0 means error. The append flag selects append over
    /// truncate when the handle is first opened.
    fn write(&mut self, src: &[u8], append: bool) -> u16 {
        if matches!(self.state, State::Idle | State::Reading(_)) {
            let Some(path) = self.path() else {
                return 0;
            };
            let opened = OpenOptions::new()
                .write(true)
                .create(true)
                .append(append)
                .truncate(!append)
                .open(&path);
            match opened {
                Ok(f) => self.state = State::Writing(f),
                Err(err) => {
                    debug!(id = self.id, path = %path.display(), %err, "open for write failed");
                    return 0;
                }
            }
        }
        let State::Writing(f) = &mut self.state else {
            return 0;
        };
        match f.write(src) {
            Ok(n) => n as u16,
            Err(err) => {
                debug!(id = self.id, %err, "write failed");
                0
            }
        }
    }

    /// Writes a listing entry for the named path; 0 on failure or when the
    /// destination is too small.
    fn stat(&mut self, dst: &mut [u8]) -> u16 {
        let Some(path) = self.path() else {
            return 0;
        };
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return 0;
        };
        let entry = render_entry(&path, name);
        if entry.len() > dst.len() {
            return 0;
        }
        dst[..entry.len()].copy_from_slice(&entry);
        entry.len() as u16
    }

    /// 0 on success, all-ones on failure.
    fn delete(&mut self) -> u16 {
        self.state = State::Idle;
        let Some(path) = self.path() else {
            return 0xFFFF;
        };
        match fs::remove_file(&path) {
            Ok(()) => 0,
            Err(err) => {
                debug!(id = self.id, path = %path.display(), %err, "delete failed");
                0xFFFF
            }
        }
    }
}

impl Device for FileDevice {
    fn deo(&mut self, uxn: &mut Uxn, slot: &mut [u8; SLOT_SIZE], port: u8, _value: u8) {
        let res = match port {
            0x5 => {
                let addr = peek2(slot, 0x4);
                let len = clamp_len(addr, peek2(slot, 0xA));
                let mut buf = vec![0u8; usize::from(len)];
                let n = self.stat(&mut buf);
                copy_into_ram(&mut uxn.ram, addr, &buf[..usize::from(n)]);
                n
            }
            0x6 => self.delete(),
            0x9 => {
                self.set_name(&uxn.ram, peek2(slot, 0x8));
                0
            }
            0xD => {
                let addr = peek2(slot, 0xC);
                let len = clamp_len(addr, peek2(slot, 0xA));
                let mut buf = vec![0u8; usize::from(len)];
                let n = self.read(&mut buf);
                copy_into_ram(&mut uxn.ram, addr, &buf[..usize::from(n)]);
                n
            }
            0xF => {
                let addr = peek2(slot, 0xE);
                let len = clamp_len(addr, peek2(slot, 0xA));
                let start = usize::from(addr);
                let append = slot[0x7] != 0;
                self.write(&uxn.ram[start..start + usize::from(len)], append)
            }
            _ => return,
        };
        poke2(slot, 0x2, res);
    }
}

/// Transfers may not run past the end of RAM.
fn clamp_len(addr: u16, len: u16) -> u16 {
    let room = (RAM_SIZE - usize::from(addr)) as u32;
    if u32::from(len) > room {
        room as u16
    } else {
        len
    }
}

fn copy_into_ram(ram: &mut [u8; RAM_SIZE], addr: u16, bytes: &[u8]) {
    let start = usize::from(addr);
    ram[start..start + bytes.len()].copy_from_slice(bytes);
}

/// Relative paths only, no parent traversal.
fn is_sane_path(s: &str) -> bool {
    let path = Path::new(s);
    !s.is_empty()
        && path.is_relative()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// One listing line: four hex digits of size (`----` for directories,
/// `????` for oversized, `!!!!` for unreadable), a space, the name.
fn render_entry(path: &Path, name: &str) -> Vec<u8> {
    let size = match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => return format!("---- {name}/\n").into_bytes(),
        Ok(meta) if meta.len() < 0x10000 => format!("{:04x}", meta.len()),
        Ok(_) => "????".to_owned(),
        Err(_) => "!!!!".to_owned(),
    };
    format!("{size} {name}\n").into_bytes()
}

fn render_listing(dir: &Path) -> Vec<u8> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_owned))
            .collect(),
        Err(err) => {
            debug!(path = %dir.display(), %err, "listing failed");
            return Vec::new();
        }
    };
    names.sort();
    let mut out = Vec::new();
    for name in names {
        out.extend_from_slice(&render_entry(&dir.join(&name), &name));
    }
    out
}
