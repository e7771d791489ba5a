//! Readers for the `/sys` and `/proc` facts the scan pipeline needs.
//!
//! File I/O here is synchronous by design: it happens inside a scan phase
//! on a worker's event loop, and sysfs/procfs reads do not block on
//! device I/O.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Name of the per-device directory listing stacked lower devices.
const SLAVES_DIR: &str = "slaves";

fn device_dir(sysfs_root: &Path, devpath: &str) -> PathBuf {
    sysfs_root.join(devpath.trim_start_matches('/'))
}

/// Read a single-value sysfs file, stripping the trailing newline.
///
/// # Errors
///
/// I/O failure, or `InvalidData` when the file is empty.
pub fn read_value(path: &Path) -> io::Result<String> {
    let raw = fs::read_to_string(path)?;
    let value = raw.trim_end_matches('\n');
    if value.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no value found in {}", path.display()),
        ));
    }
    Ok(value.to_string())
}

/// Device numbers (`major:minor` strings) of all slaves of a whole disk,
/// read from `<sysfs>/<devpath>/slaves/*/dev`.
///
/// A slave directory whose `dev` file cannot be read is skipped with a
/// warning; the device may have disappeared while we were looking.
///
/// # Errors
///
/// Returns the directory enumeration failure.
pub fn disk_slave_devnos(sysfs_root: &Path, devpath: &str) -> io::Result<Vec<String>> {
    let slaves_dir = device_dir(sysfs_root, devpath).join(SLAVES_DIR);
    let mut out = Vec::new();
    for entry in fs::read_dir(&slaves_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let dev_path = entry.path().join("dev");
        match read_value(&dev_path) {
            Ok(devno) => out.push(devno),
            Err(err) => {
                warn!(path = %dev_path.display(), %err, "skipping unreadable slave device");
            }
        }
    }
    Ok(out)
}

/// Device number of the whole disk a partition belongs to, read from
/// `<sysfs>/<devpath>/../dev`.
///
/// # Errors
///
/// Returns the read failure.
pub fn partition_parent_devno(sysfs_root: &Path, devpath: &str) -> io::Result<String> {
    let path = device_dir(sysfs_root, devpath).join("../dev");
    read_value(&path)
}

/// Resolve the driver name registered for a block major number by
/// scanning the "Block devices:" section of `<proc>/devices`.
///
/// # Errors
///
/// Returns the read failure.
pub fn block_module_for_major(proc_root: &Path, major: u32) -> io::Result<Option<String>> {
    let content = fs::read_to_string(proc_root.join("devices"))?;
    let mut in_block_section = false;
    for line in content.lines() {
        if line.starts_with("Block devices:") {
            in_block_section = true;
            continue;
        }
        if !in_block_section {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(num), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        if num.parse::<u32>() == Ok(major) {
            return Ok(Some(name.to_string()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, write};

    #[test]
    fn read_value_strips_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev");
        write(&path, "8:16\n").unwrap();
        assert_eq!(read_value(&path).unwrap(), "8:16");
    }

    #[test]
    fn empty_value_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev");
        write(&path, "\n").unwrap();
        assert!(read_value(&path).is_err());
    }

    #[test]
    fn slaves_enumeration() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("devices/virtual/block/dm-0/slaves");
        for (slave, devno) in [("sda", "8:0\n"), ("sdb", "8:16\n")] {
            create_dir_all(base.join(slave)).unwrap();
            write(base.join(slave).join("dev"), devno).unwrap();
        }

        let mut devnos =
            disk_slave_devnos(dir.path(), "/devices/virtual/block/dm-0").unwrap();
        devnos.sort();
        assert_eq!(devnos, vec!["8:0", "8:16"]);
    }

    #[test]
    fn partition_parent() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("block/sda");
        let part = disk.join("sda1");
        create_dir_all(&part).unwrap();
        write(disk.join("dev"), "8:0\n").unwrap();

        assert_eq!(
            partition_parent_devno(dir.path(), "/block/sda/sda1").unwrap(),
            "8:0"
        );
    }

    #[test]
    fn proc_devices_block_section() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path().join("devices"),
            "Character devices:\n  1 mem\n  8 sg\n\nBlock devices:\n  8 sd\n  9 md\n253 device-mapper\n",
        )
        .unwrap();

        assert_eq!(
            block_module_for_major(dir.path(), 8).unwrap().as_deref(),
            Some("sd")
        );
        assert_eq!(
            block_module_for_major(dir.path(), 253).unwrap().as_deref(),
            Some("device-mapper")
        );
        // Major 1 appears only under character devices.
        assert_eq!(block_module_for_major(dir.path(), 1).unwrap(), None);
    }
}
