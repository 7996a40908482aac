//! Hand-rolled INI persistence for the debug harness: a
//! window-geometry file (`key=integer` lines) and a per-CPU
//! breakpoints file (`0xADDR,TYPE[,SIZE]` lines). No config crate is
//! pulled in for this — two small line formats, read a line at a time
//! with `str::parse`.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use log::{error, info};

use super::{Breakpoint, Watchpoint, MAX_WATCHPOINTS};

#[derive(Debug, Clone, Copy, Default)]
pub struct WindowGeometry {
    pub width: i32,
    pub height: i32,
}

/// Read `width=`/`height=` lines from `path`. Missing file or garbage
/// lines are logged and otherwise ignored, leaving the corresponding
/// field at its default.
pub fn read_window_geometry(path: &Path) -> WindowGeometry {
    let mut geo = WindowGeometry::default();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => {
            info!(target: "lib86_exec", "could not open {} file", path.display());
            return geo;
        }
    };
    for line in BufReader::new(file).lines().map_while(Result::ok) {
        if let Some(value) = line.strip_prefix("width=") {
            match value.parse() {
                Ok(w) => geo.width = w,
                Err(_) => error!(target: "lib86_exec", "ignoring invalid line {line}"),
            }
        } else if let Some(value) = line.strip_prefix("height=") {
            match value.parse() {
                Ok(h) => geo.height = h,
                Err(_) => error!(target: "lib86_exec", "ignoring invalid line {line}"),
            }
        } else {
            error!(target: "lib86_exec", "ignoring invalid line {line}");
        }
    }
    geo
}

pub fn write_window_geometry(path: &Path, geo: WindowGeometry) {
    match File::create(path) {
        Ok(mut file) => {
            let _ = writeln!(file, "width={}", geo.width);
            let _ = writeln!(file, "height={}", geo.height);
        }
        Err(_) => error!(target: "lib86_exec", "could not save {} file", path.display()),
    }
}

/// Read the breakpoints/watchpoints file at `path`. Watchpoints beyond
/// [`MAX_WATCHPOINTS`] are dropped with a logged warning.
pub fn read_breakpoints_file(path: &Path) -> (Vec<Breakpoint>, Vec<Watchpoint>) {
    let mut breakpoints = Vec::new();
    let mut watchpoints = Vec::new();

    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => {
            info!(target: "lib86_exec", "could not open breakpoint file {}", path.display());
            return (breakpoints, watchpoints);
        }
    };

    for line in BufReader::new(file).lines().map_while(Result::ok) {
        let Some(rest) = line.strip_prefix("0x") else {
            error!(target: "lib86_exec", "ignoring invalid line {line}");
            continue;
        };
        let mut fields = rest.split(',');
        let Some(addr) = fields.next().and_then(|s| u32::from_str_radix(s, 16).ok()) else {
            error!(target: "lib86_exec", "ignoring invalid line {line}");
            continue;
        };
        let Some(kind) = fields.next().and_then(|s| s.parse::<u8>().ok()) else {
            error!(target: "lib86_exec", "ignoring invalid line {line}");
            continue;
        };
        match kind {
            0 => breakpoints.push(Breakpoint { addr, original_byte: 0 }),
            1 => {
                let Some(size) = fields.next().and_then(|s| s.parse::<u8>().ok()) else {
                    error!(target: "lib86_exec", "ignoring invalid line {line}");
                    continue;
                };
                if !matches!(size, 1 | 2 | 4 | 8) {
                    error!(target: "lib86_exec", "ignoring invalid line {line}");
                    continue;
                }
                if watchpoints.len() >= MAX_WATCHPOINTS {
                    error!(target: "lib86_exec", "ignoring invalid line {line}");
                    continue;
                }
                watchpoints.push(Watchpoint { addr, size });
            }
            _ => error!(target: "lib86_exec", "ignoring invalid line {line}"),
        }
    }

    (breakpoints, watchpoints)
}

pub fn write_breakpoints_file(path: &Path, breakpoints: &[Breakpoint], watchpoints: &[Watchpoint]) {
    let mut file = match File::create(path) {
        Ok(f) => f,
        Err(_) => {
            error!(target: "lib86_exec", "could not save breakpoint file {}", path.display());
            return;
        }
    };
    for bp in breakpoints {
        let _ = writeln!(file, "0x{:x},0", bp.addr);
    }
    for wp in watchpoints.iter().take(MAX_WATCHPOINTS) {
        let _ = writeln!(file, "0x{:x},1,{}", wp.addr, wp.size);
    }
}
