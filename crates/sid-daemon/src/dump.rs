//! Rendering of admin-command output: DB dumps, DB statistics, version
//! information, and the resource tree, in the format the request header
//! selects.

use serde::Serialize;
use sid_core::store::{DbStats, KvStore};
use sid_core::value::{KvRecord, ValueFlags};

use crate::protocol::{OutputFormat, SID_PROTOCOL};

/// One worker entry of the resource tree.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerResource {
    /// Worker/session identifier.
    pub id: String,
    /// Worker process ID.
    pub pid: u32,
    /// Lifecycle state name.
    pub state: String,
}

#[derive(Serialize)]
struct RecordDump<'a> {
    key: &'a str,
    gennum: u16,
    seqnum: u64,
    flags: Vec<&'static str>,
    owner: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    values: Option<Vec<String>>,
}

fn flag_names(flags: ValueFlags) -> Vec<&'static str> {
    let mut out = Vec::new();
    for (bit, name) in [
        (ValueFlags::SYNC, "KV_SYNC"),
        (ValueFlags::PERSISTENT, "KV_PERSISTENT"),
        (ValueFlags::MOD_PROTECTED, "KV_MOD_PROTECTED"),
        (ValueFlags::MOD_PRIVATE, "KV_MOD_PRIVATE"),
        (ValueFlags::MOD_RESERVED, "KV_MOD_RESERVED"),
    ] {
        if flags.contains(bit) {
            out.push(name);
        }
    }
    out
}

/// Render bytes as text when printable, hex otherwise.
fn printable(data: &[u8]) -> String {
    let trimmed = data.strip_suffix(&[0]).unwrap_or(data);
    match std::str::from_utf8(trimmed) {
        Ok(s) if s.chars().all(|c| !c.is_control()) => s.to_string(),
        _ => trimmed.iter().map(|b| format!("{b:02x}")).collect(),
    }
}

fn record_dump<'a>(key: &'a str, record: &'a KvRecord) -> RecordDump<'a> {
    let (value, values) = match record.items() {
        Some(items) => (
            None,
            Some(items.iter().map(|i| printable(i)).collect::<Vec<_>>()),
        ),
        None => (record.data().map(printable), None),
    };
    RecordDump {
        key,
        gennum: record.header.gennum,
        seqnum: record.header.seqnum,
        flags: flag_names(record.header.flags),
        owner: &record.header.owner,
        value,
        values,
    }
}

/// Render the full record set of the store.
#[must_use]
pub fn render_records(kv: &KvStore, format: OutputFormat, persistent_only: bool) -> Vec<u8> {
    let records: Vec<_> = kv
        .iter_records()
        .filter(|(_, r)| !persistent_only || r.header.flags.contains(ValueFlags::PERSISTENT))
        .map(|(key, record)| record_dump(key, record))
        .collect();

    match format {
        OutputFormat::Json => {
            serde_json::to_vec_pretty(&serde_json::json!({ "siddb": records }))
                .unwrap_or_default()
        }
        OutputFormat::Env => {
            let mut out = String::new();
            for r in &records {
                let value = r
                    .value
                    .clone()
                    .or_else(|| r.values.as_ref().map(|v| v.join(" ")))
                    .unwrap_or_default();
                out.push_str(r.key);
                out.push('=');
                out.push_str(&value);
                out.push('\n');
            }
            out.into_bytes()
        }
        OutputFormat::Table => {
            let mut out = String::new();
            for r in &records {
                let value = r
                    .value
                    .clone()
                    .or_else(|| r.values.as_ref().map(|v| v.join(" ")))
                    .unwrap_or_default();
                out.push_str(&format!(
                    "{:<40} gen={:<4} seq={:<8} owner={:<12} [{}] {}\n",
                    r.key,
                    r.gennum,
                    r.seqnum,
                    r.owner,
                    r.flags.join("|"),
                    value
                ));
            }
            out.into_bytes()
        }
    }
}

/// Render store size statistics.
#[must_use]
pub fn render_stats(stats: &DbStats, format: OutputFormat) -> Vec<u8> {
    match format {
        OutputFormat::Json => serde_json::to_vec_pretty(&serde_json::json!({
            "keys_size": stats.key_size,
            "values_size": stats.value_size,
            "values_data_size": stats.value_data_size,
            "meta_size": stats.meta_size,
            "nr_records": stats.nr_kv_pairs,
        }))
        .unwrap_or_default(),
        OutputFormat::Env | OutputFormat::Table => format!(
            "KEYS_SIZE={}\nVALUES_SIZE={}\nVALUES_DATA_SIZE={}\nMETA_SIZE={}\nNR_RECORDS={}\n",
            stats.key_size,
            stats.value_size,
            stats.value_data_size,
            stats.meta_size,
            stats.nr_kv_pairs
        )
        .into_bytes(),
    }
}

/// Render daemon and protocol version information.
#[must_use]
pub fn render_version(format: OutputFormat) -> Vec<u8> {
    let version = env!("CARGO_PKG_VERSION");
    match format {
        OutputFormat::Json => serde_json::to_vec_pretty(&serde_json::json!({
            "SID_PROTOCOL": SID_PROTOCOL,
            "SID_VERSION": version,
        }))
        .unwrap_or_default(),
        OutputFormat::Env | OutputFormat::Table => {
            format!("SID_PROTOCOL={SID_PROTOCOL}\nSID_VERSION={version}\n").into_bytes()
        }
    }
}

/// Render the resource tree of the main process.
#[must_use]
pub fn render_resource_tree(workers: &[WorkerResource], format: OutputFormat) -> Vec<u8> {
    match format {
        OutputFormat::Json => serde_json::to_vec_pretty(&serde_json::json!({
            "sid": {
                "bridge": { "workers": workers },
            }
        }))
        .unwrap_or_default(),
        OutputFormat::Env => {
            let mut out = String::new();
            for w in workers {
                out.push_str(&format!("WORKER_{}={};{}\n", w.pid, w.id, w.state));
            }
            out.into_bytes()
        }
        OutputFormat::Table => {
            let mut out = String::from("sid\n└── bridge\n");
            for w in workers {
                out.push_str(&format!(
                    "    ├── worker-proxy {} (pid {}, {})\n",
                    w.id, w.pid, w.state
                ));
            }
            out.into_bytes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sid_core::value::ValueHeader;

    fn store() -> KvStore {
        let mut kv = KvStore::new();
        kv.set(
            "::U:8_0:::ACTION",
            KvRecord::blob(
                ValueHeader::new(1, 42, ValueFlags::SYNC | ValueFlags::PERSISTENT, "#core"),
                b"add\0".to_vec(),
            ),
        );
        kv.set(
            ":LYR:D:8_0:::#GMB",
            KvRecord::vector(
                ValueHeader::new(1, 42, ValueFlags::NONE, "#core"),
                vec![b":LYR:D:8_1::".to_vec()],
            ),
        );
        kv
    }

    #[test]
    fn env_dump_lists_every_record() {
        let out = String::from_utf8(render_records(&store(), OutputFormat::Env, false)).unwrap();
        assert!(out.contains("::U:8_0:::ACTION=add\n"));
        assert!(out.contains(":LYR:D:8_0:::#GMB=:LYR:D:8_1::\n"));
    }

    #[test]
    fn json_dump_is_valid_json() {
        let out = render_records(&store(), OutputFormat::Json, false);
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let records = parsed["siddb"].as_array().unwrap();
        assert_eq!(records.len(), 2);
        // BTreeMap order: "::U..." sorts before ":LYR...".
        assert_eq!(records[0]["key"], "::U:8_0:::ACTION");
        assert!(records[0]["flags"]
            .as_array()
            .unwrap()
            .iter()
            .any(|f| f == "KV_SYNC"));
    }

    #[test]
    fn persistent_filter() {
        let out =
            String::from_utf8(render_records(&store(), OutputFormat::Env, true)).unwrap();
        assert!(out.contains("ACTION"));
        assert!(!out.contains("#GMB"));
    }

    #[test]
    fn version_contains_protocol() {
        let out = String::from_utf8(render_version(OutputFormat::Env)).unwrap();
        assert!(out.contains("SID_PROTOCOL=2"));
    }

    #[test]
    fn stats_render() {
        let out = String::from_utf8(render_stats(&store().stats(), OutputFormat::Env)).unwrap();
        assert!(out.contains("NR_RECORDS=2"));
    }

    #[test]
    fn resource_tree_render() {
        let workers = vec![WorkerResource {
            id: "worker-1".into(),
            pid: 4242,
            state: "WORKER_ASSIGNED".into(),
        }];
        let out = String::from_utf8(render_resource_tree(&workers, OutputFormat::Json)).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(out.as_bytes()).unwrap();
        assert_eq!(parsed["sid"]["bridge"]["workers"][0]["pid"], 4242);
    }
}
