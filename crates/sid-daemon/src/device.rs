//! Device descriptor and udev environment parsing.
//!
//! The `SCAN` (and `CHECKPOINT`) payload is the device's udev
//! environment: a packed `dev_t` followed by NUL-terminated `KEY=VALUE`
//! strings. Parsing keeps every pair (they are imported into the UDEV
//! namespace of the KV store) and mirrors the well-known keys into a
//! typed descriptor.

use crate::protocol::ProtocolError;

/// udev event action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UdevAction {
    /// Unrecognized action string.
    #[default]
    Unknown,
    /// Device appeared.
    Add,
    /// Device changed.
    Change,
    /// Device disappeared.
    Remove,
    /// Device node moved.
    Move,
    /// Device came online.
    Online,
    /// Device went offline.
    Offline,
    /// Driver bound.
    Bind,
    /// Driver unbound.
    Unbind,
}

impl UdevAction {
    /// Parse the udev `ACTION` value.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "add" => Self::Add,
            "change" => Self::Change,
            "remove" => Self::Remove,
            "move" => Self::Move,
            "online" => Self::Online,
            "offline" => Self::Offline,
            "bind" => Self::Bind,
            "unbind" => Self::Unbind,
            _ => Self::Unknown,
        }
    }
}

/// udev device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UdevDevType {
    /// Unrecognized or missing `DEVTYPE`.
    #[default]
    Unknown,
    /// Whole disk.
    Disk,
    /// Partition of a disk.
    Partition,
}

impl UdevDevType {
    /// Parse the udev `DEVTYPE` value.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "disk" => Self::Disk,
            "partition" => Self::Partition,
            _ => Self::Unknown,
        }
    }
}

/// Typed device descriptor assembled from the udev environment.
#[derive(Debug, Clone, Default)]
pub struct UdevDevice {
    /// Event action.
    pub action: UdevAction,
    /// Device type.
    pub devtype: UdevDevType,
    /// Device path below `/sys` (the udev `DEVPATH`).
    pub path: String,
    /// Last element of the device path.
    pub name: String,
    /// Device major number.
    pub major: u32,
    /// Device minor number.
    pub minor: u32,
    /// udev event sequence number.
    pub seqnum: u64,
    /// Disk sequence number, when the kernel reports one.
    pub diskseq: u64,
    /// Synthetic event UUID, when present.
    pub synth_uuid: Option<String>,
}

/// Parsed udev environment: the typed descriptor plus every raw pair.
#[derive(Debug, Clone, Default)]
pub struct DeviceEnv {
    /// Device identity used as namespace part: `major_minor`.
    pub id: String,
    /// Typed descriptor.
    pub udev: UdevDevice,
    /// All `KEY=VALUE` pairs in arrival order.
    pub pairs: Vec<(String, String)>,
}

/// Replace `:` with `_` so a value can be embedded in a composite key.
#[must_use]
pub fn canonicalize_kv_key(s: &str) -> String {
    s.replace(':', "_")
}

/// Replace `-` with `_`, the canonical spelling of module names.
#[must_use]
pub fn canonicalize_module_name(s: &str) -> String {
    s.replace('-', "_")
}

/// Parse a `SCAN` payload: packed `dev_t` (8 bytes, native layout encoded
/// little-endian) followed by NUL-terminated `KEY=VALUE` strings.
///
/// # Errors
///
/// [`ProtocolError::BadUdevEnv`] on a short payload or a pair without
/// `=`.
pub fn parse_udev_env(payload: &[u8]) -> Result<DeviceEnv, ProtocolError> {
    if payload.len() < 8 {
        return Err(ProtocolError::BadUdevEnv {
            reason: format!("payload of {} bytes is shorter than a dev_t", payload.len()),
        });
    }

    let devno = u64::from_le_bytes(payload[..8].try_into().unwrap());
    let major = nix::sys::stat::major(devno) as u32;
    let minor = nix::sys::stat::minor(devno) as u32;

    let mut env = DeviceEnv {
        id: format!("{major}_{minor}"),
        udev: UdevDevice {
            major,
            minor,
            ..UdevDevice::default()
        },
        pairs: Vec::new(),
    };

    for chunk in payload[8..].split(|&b| b == 0) {
        if chunk.is_empty() {
            continue;
        }
        let s = std::str::from_utf8(chunk).map_err(|_| ProtocolError::BadUdevEnv {
            reason: "non-UTF-8 environment string".into(),
        })?;
        let (key, value) = s.split_once('=').ok_or_else(|| ProtocolError::BadUdevEnv {
            reason: format!("environment string without '=': {s}"),
        })?;
        if value.is_empty() {
            return Err(ProtocolError::BadUdevEnv {
                reason: format!("empty value for key {key}"),
            });
        }

        match key {
            "ACTION" => env.udev.action = UdevAction::parse(value),
            "DEVPATH" => {
                env.udev.path = value.to_string();
                env.udev.name = value.rsplit('/').next().unwrap_or(value).to_string();
            }
            "DEVTYPE" => env.udev.devtype = UdevDevType::parse(value),
            "SEQNUM" => env.udev.seqnum = value.parse().unwrap_or(0),
            "DISKSEQ" => env.udev.diskseq = value.parse().unwrap_or(0),
            "SYNTH_UUID" => env.udev.synth_uuid = Some(value.to_string()),
            _ => {}
        }
        env.pairs.push((key.to_string(), value.to_string()));
    }

    Ok(env)
}

/// Pack a device number and environment pairs into a `SCAN` payload.
/// This is the client-side inverse of [`parse_udev_env`].
#[must_use]
pub fn build_udev_env(major: u32, minor: u32, pairs: &[(&str, &str)]) -> Vec<u8> {
    let devno = nix::sys::stat::makedev(u64::from(major), u64::from(minor));
    let mut out = Vec::new();
    out.extend_from_slice(&devno.to_le_bytes());
    for (k, v) in pairs {
        out.extend_from_slice(k.as_bytes());
        out.push(b'=');
        out.extend_from_slice(v.as_bytes());
        out.push(0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fresh_disk_env() {
        let payload = build_udev_env(
            8,
            0,
            &[
                ("ACTION", "add"),
                ("DEVPATH", "/block/sda"),
                ("DEVTYPE", "disk"),
                ("SEQNUM", "42"),
                ("SYNTH_UUID", "abc"),
            ],
        );
        let env = parse_udev_env(&payload).unwrap();
        assert_eq!(env.id, "8_0");
        assert_eq!(env.udev.major, 8);
        assert_eq!(env.udev.minor, 0);
        assert_eq!(env.udev.action, UdevAction::Add);
        assert_eq!(env.udev.devtype, UdevDevType::Disk);
        assert_eq!(env.udev.name, "sda");
        assert_eq!(env.udev.seqnum, 42);
        assert_eq!(env.udev.synth_uuid.as_deref(), Some("abc"));
        assert_eq!(env.pairs.len(), 5);
    }

    #[test]
    fn short_payload_rejected() {
        assert!(parse_udev_env(&[1, 2, 3]).is_err());
    }

    #[test]
    fn pair_without_equals_rejected() {
        let mut payload = build_udev_env(8, 0, &[]);
        payload.extend_from_slice(b"NOEQUALS\0");
        assert!(parse_udev_env(&payload).is_err());
    }

    #[test]
    fn canonicalization() {
        assert_eq!(canonicalize_kv_key("8:0"), "8_0");
        assert_eq!(canonicalize_module_name("device-mapper"), "device_mapper");
    }
}
