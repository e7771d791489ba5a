//! Delta algebra for vector-valued records.
//!
//! Three layers build on each other:
//!
//! 1. [`step`] — one sorted-merge pass over an old and a new vector,
//!    producing `plus` (elements added this step), `minus` (elements
//!    removed this step) and `final_items` (the value to store), according
//!    to the SET/PLUS/MINUS operator table.
//! 2. [`merge_absolute`] — folds a step's `plus`/`minus` into the
//!    previously accumulated absolute delta, dropping contradicting pairs
//!    (an element both added earlier and removed now, or vice versa).
//! 3. [`delta_set`] — applies a step to the store: writes the final value,
//!    persists the absolute `+`/`-` companion records under operator-
//!    prefixed keys, and propagates relation updates to the inverse key of
//!    every changed element. The inverse update recurses exactly one
//!    level: the inner call never carries the relation flag, which bounds
//!    the recursion the same way the relation graph itself is mirrored
//!    rather than walked.

use tracing::debug;

use crate::error::KvError;
use crate::key::{ns_part_from_key, KeySpec, KvOp};
use crate::store::{index_action, overwrite_guard, KvStore};
use crate::value::{sort_dedup, KvRecord, ValueFlags, ValueHeader, ValuePayload};

/// Which side effects a delta application performs beyond storing the
/// final value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaFlags {
    /// Persist absolute `+`/`-` companion records.
    pub with_diff: bool,
    /// Additionally propagate single-element updates to inverse keys.
    /// Implies the companion bookkeeping of `with_diff`.
    pub with_rel: bool,
}

impl DeltaFlags {
    /// No companions, no relation propagation; only the final value is
    /// stored. Used when replaying deltas into the main store.
    pub const NONE: Self = Self {
        with_diff: false,
        with_rel: false,
    };

    /// Companion records only.
    pub const DIFF: Self = Self {
        with_diff: true,
        with_rel: false,
    };

    /// Companion records plus inverse-key propagation.
    pub const DIFF_AND_REL: Self = Self {
        with_diff: true,
        with_rel: true,
    };

    /// Whether any companion bookkeeping is requested.
    #[must_use]
    pub const fn any(self) -> bool {
        self.with_diff || self.with_rel
    }
}

/// Key pair for relation-aware delta application.
#[derive(Debug, Clone)]
pub struct RelKeys {
    /// Spec of the key being updated.
    pub cur: KeySpec,
    /// Spec template of the related (inverse) key; its `ns_part` is filled
    /// from each changed element during propagation.
    pub rel: KeySpec,
}

/// Result of one delta step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaStep {
    /// Elements added by this step.
    pub plus: Vec<Vec<u8>>,
    /// Elements removed by this step.
    pub minus: Vec<Vec<u8>>,
    /// The value to store.
    pub final_items: Vec<Vec<u8>>,
}

/// Compute plus/minus/final for one operator application.
///
/// Both inputs must be sorted strictly ascending; the outputs are too.
///
/// # Errors
///
/// [`KvError::IllegalOp`] when `op` is [`KvOp::Illegal`].
pub fn step(op: KvOp, old: &[Vec<u8>], new: &[Vec<u8>]) -> Result<DeltaStep, KvError> {
    if op == KvOp::Illegal {
        return Err(KvError::IllegalOp { key: String::new() });
    }

    let mut out = DeltaStep::default();
    let (mut i_old, mut i_new) = (0, 0);

    while i_old < old.len() || i_new < new.len() {
        let cmp = match (old.get(i_old), new.get(i_new)) {
            (Some(o), Some(n)) => o.cmp(n),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => unreachable!(),
        };
        match cmp {
            std::cmp::Ordering::Less => {
                // Element only in the old vector.
                let e = &old[i_old];
                match op {
                    KvOp::Set => out.minus.push(e.clone()),
                    KvOp::Plus | KvOp::Minus => out.final_items.push(e.clone()),
                    KvOp::Illegal => unreachable!(),
                }
                i_old += 1;
            }
            std::cmp::Ordering::Greater => {
                // Element only in the new vector.
                let e = &new[i_new];
                match op {
                    KvOp::Set | KvOp::Plus => {
                        out.plus.push(e.clone());
                        out.final_items.push(e.clone());
                    }
                    // Removing a non-existing element is a no-op.
                    KvOp::Minus => {}
                    KvOp::Illegal => unreachable!(),
                }
                i_new += 1;
            }
            std::cmp::Ordering::Equal => {
                let e = &new[i_new];
                match op {
                    KvOp::Set | KvOp::Plus => out.final_items.push(e.clone()),
                    KvOp::Minus => out.minus.push(e.clone()),
                    KvOp::Illegal => unreachable!(),
                }
                i_old += 1;
                i_new += 1;
            }
        }
    }

    Ok(out)
}

/// Elements present in both sorted inputs.
fn intersect(a: &[Vec<u8>], b: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::new();
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// Elements of sorted `a` not present in sorted `drop`.
fn without(a: &[Vec<u8>], drop: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let mut j = 0;
    let mut out = Vec::new();
    for e in a {
        while j < drop.len() && drop[j].as_slice() < e.as_slice() {
            j += 1;
        }
        if j < drop.len() && drop[j] == *e {
            continue;
        }
        out.push(e.clone());
    }
    out
}

/// Fold a step's plus/minus into the previously stored absolute delta.
///
/// An element that appears in the old `+` record and this step's `minus`
/// (or in the old `-` record and this step's `plus`) contradicts itself
/// across the session and is dropped from both sides. Survivors are
/// merged and re-sorted.
#[must_use]
pub fn merge_absolute(
    old_plus: &[Vec<u8>],
    old_minus: &[Vec<u8>],
    step_plus: &[Vec<u8>],
    step_minus: &[Vec<u8>],
) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    // old plus vs. new minus, old minus vs. new plus.
    let contra_pm = intersect(old_plus, step_minus);
    let contra_mp = intersect(old_minus, step_plus);

    let mut abs_plus = without(old_plus, &contra_pm);
    abs_plus.extend(without(step_plus, &contra_mp));
    sort_dedup(&mut abs_plus);

    let mut abs_minus = without(old_minus, &contra_mp);
    abs_minus.extend(without(step_minus, &contra_pm));
    sort_dedup(&mut abs_minus);

    (abs_plus, abs_minus)
}

/// Apply a delta to `key` in `store`.
///
/// Stores the final value under `key`, and when `flags` request it and
/// `keys` is supplied, maintains the absolute `+`/`-` companion records
/// (flagged for synchronization) and propagates relation updates to the
/// inverse key of every element this step added or removed.
///
/// `items` must already be sorted; `header` supplies the generation and
/// sequence numbers, flags and owner stamped onto the stored value.
///
/// # Errors
///
/// [`KvError::IllegalOp`] for an illegal operator, [`KvError::NotVector`]
/// when `key` currently holds a blob value.
pub fn delta_set(
    store: &mut KvStore,
    key: &str,
    header: &ValueHeader,
    items: Vec<Vec<u8>>,
    op: KvOp,
    flags: DeltaFlags,
    keys: Option<&RelKeys>,
    index: bool,
) -> Result<DeltaStep, KvError> {
    if op == KvOp::Illegal {
        return Err(KvError::IllegalOp { key: key.to_string() });
    }

    // Stage 1: compute the step against the currently stored value and
    // write back the final vector. Ownership is not checked here; delta
    // targets are maintained by the core.
    let mut step_out: Option<DeltaStep> = None;
    let new_record = KvRecord::vector(header.clone(), items);
    let action = store.set_with(key, new_record, |old, new| {
        let old_items: &[Vec<u8>] = match old {
            Some(r) => r.items().ok_or(KvError::NotVector {
                key: key.to_string(),
            })?,
            None => &[],
        };
        let new_items = new.items().expect("delta input is vector-shaped");
        let s = step(op, old_items, new_items)?;
        let final_record = KvRecord {
            header: new.header.clone(),
            payload: ValuePayload::Vector(s.final_items.clone()),
        };
        let action = index_action(old, Some(&final_record));
        step_out = Some(s);
        Ok((final_record, action))
    })?;
    if index {
        store.apply_index(key, action);
    }
    let step = step_out.expect("update function ran");

    if !flags.any() {
        return Ok(step);
    }
    let Some(keys) = keys else {
        debug!(key, "delta companions requested without key specs, skipping");
        return Ok(step);
    };

    // Stage 2: fold this step into the absolute delta accumulated since
    // the snapshot began.
    let mut plus_spec = keys.cur.clone();
    plus_spec.op = KvOp::Plus;
    let plus_key = plus_spec.compose();
    let mut minus_spec = keys.cur.clone();
    minus_spec.op = KvOp::Minus;
    let minus_key = minus_spec.compose();

    let old_plus = store.get(&plus_key).and_then(|r| r.items().map(<[_]>::to_vec));
    let old_minus = store.get(&minus_key).and_then(|r| r.items().map(<[_]>::to_vec));

    let (abs_plus, abs_minus) = merge_absolute(
        old_plus.as_deref().unwrap_or(&[]),
        old_minus.as_deref().unwrap_or(&[]),
        &step.plus,
        &step.minus,
    );

    // Stage 3: write the companions and, per changed element, the inverse
    // relation record. The inner call drops the relation flag, which is
    // what bounds the recursion to one level.
    for (dir, dir_key, abs_items, old_existed, step_items) in [
        (KvOp::Plus, &plus_key, abs_plus, old_plus.is_some(), &step.plus),
        (KvOp::Minus, &minus_key, abs_minus, old_minus.is_some(), &step.minus),
    ] {
        if old_existed || !step_items.is_empty() {
            let abs_header = ValueHeader::new(
                header.gennum,
                header.seqnum,
                ValueFlags::CORE_DEFAULTS,
                header.owner.clone(),
            );
            let abs_record = KvRecord::vector(abs_header, abs_items);
            match store.set_with(dir_key, abs_record, |old, new| {
                overwrite_guard(dir_key, old, &new).map(|a| (new, a))
            }) {
                Ok(action) => {
                    if index {
                        store.apply_index(dir_key, action);
                    }
                }
                Err(err) => {
                    debug!(key = dir_key.as_str(), %err, "keeping old absolute delta record");
                }
            }
        }

        if step_items.is_empty() || !flags.with_rel {
            continue;
        }

        let anchor = keys.cur.compose_prefix();
        for element in step_items {
            let Ok(element_str) = std::str::from_utf8(element) else {
                debug!(key, "skipping non-UTF-8 relation element");
                continue;
            };
            let Some(ns_part) = ns_part_from_key(element_str) else {
                debug!(key, element = element_str, "relation element has no namespace part");
                continue;
            };

            let mut inverse = keys.rel.clone();
            inverse.ns_part = ns_part.to_string();
            let inverse_key = inverse.compose();

            let rel_header = ValueHeader::new(
                header.gennum,
                header.seqnum,
                ValueFlags::CORE_DEFAULTS.without(ValueFlags::SYNC),
                header.owner.clone(),
            );
            let rel_keys = RelKeys {
                cur: inverse,
                rel: keys.cur.clone(),
            };
            delta_set(
                store,
                &inverse_key,
                &rel_header,
                vec![anchor.clone().into_bytes()],
                dir,
                DeltaFlags::DIFF,
                Some(&rel_keys),
                index,
            )?;
        }
    }

    Ok(step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{KvNamespace, DOM_LAYER, ID_NULL};

    fn v(items: &[&str]) -> Vec<Vec<u8>> {
        let mut out: Vec<Vec<u8>> = items.iter().map(|s| s.as_bytes().to_vec()).collect();
        sort_dedup(&mut out);
        out
    }

    fn header() -> ValueHeader {
        ValueHeader::new(1, 42, ValueFlags::CORE_DEFAULTS.without(ValueFlags::SYNC), "#core")
    }

    fn gmb_spec(devno: &str) -> KeySpec {
        KeySpec {
            op: KvOp::Set,
            dom: DOM_LAYER.into(),
            ns: KvNamespace::Device,
            ns_part: devno.into(),
            id: ID_NULL.into(),
            id_part: ID_NULL.into(),
            core: "#GMB".into(),
        }
    }

    fn gin_spec() -> KeySpec {
        KeySpec {
            op: KvOp::Set,
            dom: DOM_LAYER.into(),
            ns: KvNamespace::Device,
            ns_part: ID_NULL.into(),
            id: ID_NULL.into(),
            id_part: ID_NULL.into(),
            core: "#GIN".into(),
        }
    }

    #[test]
    fn set_is_idempotent_on_final() {
        let old = v(&["a", "b"]);
        let new = v(&["b", "c"]);
        let s = step(KvOp::Set, &old, &new).unwrap();
        assert_eq!(s.final_items, new);
        assert_eq!(s.plus, v(&["c"]));
        assert_eq!(s.minus, v(&["a"]));
    }

    #[test]
    fn plus_is_union() {
        let old = v(&["a", "c"]);
        let new = v(&["b", "c"]);
        let s = step(KvOp::Plus, &old, &new).unwrap();
        assert_eq!(s.final_items, v(&["a", "b", "c"]));
        assert_eq!(s.plus, v(&["b"]));
        assert!(s.minus.is_empty());
    }

    #[test]
    fn minus_is_difference() {
        let old = v(&["a", "b", "c"]);
        let new = v(&["b", "x"]);
        let s = step(KvOp::Minus, &old, &new).unwrap();
        assert_eq!(s.final_items, v(&["a", "c"]));
        assert_eq!(s.minus, v(&["b"]));
        assert!(s.plus.is_empty());
    }

    #[test]
    fn step_from_empty_old() {
        let s = step(KvOp::Set, &[], &v(&["a"])).unwrap();
        assert_eq!(s.plus, v(&["a"]));
        assert_eq!(s.final_items, v(&["a"]));
        assert!(s.minus.is_empty());
    }

    #[test]
    fn illegal_op_rejected() {
        assert!(step(KvOp::Illegal, &[], &[]).is_err());
    }

    #[test]
    fn absolute_delta_drops_contradictions() {
        // Earlier in the session "b" was added; this step removes it again.
        let (abs_plus, abs_minus) = merge_absolute(&v(&["a", "b"]), &[], &[], &v(&["b"]));
        assert_eq!(abs_plus, v(&["a"]));
        assert!(abs_minus.is_empty());

        // And the mirror case.
        let (abs_plus, abs_minus) = merge_absolute(&[], &v(&["x"]), &v(&["x", "y"]), &[]);
        assert_eq!(abs_plus, v(&["y"]));
        assert!(abs_minus.is_empty());
    }

    #[test]
    fn delta_set_writes_final_and_companions() {
        let mut store = KvStore::new();
        let keys = RelKeys {
            cur: gmb_spec("8_0"),
            rel: gin_spec(),
        };
        let key = keys.cur.compose();

        let members = v(&[":LYR:D:8_1::", ":LYR:D:8_2::"]);
        delta_set(
            &mut store,
            &key,
            &header(),
            members.clone(),
            KvOp::Set,
            DeltaFlags::DIFF_AND_REL,
            Some(&keys),
            true,
        )
        .unwrap();

        assert_eq!(store.get(&key).unwrap().items().unwrap(), members.as_slice());

        // Absolute plus companion holds both additions and is indexed.
        let plus = store.get("+:LYR:D:8_0:::#GMB").unwrap();
        assert_eq!(plus.items().unwrap(), members.as_slice());
        assert!(plus.header.flags.contains(ValueFlags::SYNC));
        assert!(store.get(">+:LYR:D:8_0:::#GMB").is_some());

        // Inverse membership on both related devices.
        for devno in ["8_1", "8_2"] {
            let gin = store.get(&format!(":LYR:D:{devno}:::#GIN")).unwrap();
            assert_eq!(gin.items().unwrap(), v(&[":LYR:D:8_0::"]).as_slice());
        }
    }

    #[test]
    fn shrinking_set_updates_inverse_and_minus() {
        let mut store = KvStore::new();
        let keys = RelKeys {
            cur: gmb_spec("8_0"),
            rel: gin_spec(),
        };
        let key = keys.cur.compose();

        delta_set(
            &mut store,
            &key,
            &header(),
            v(&[":LYR:D:8_1::", ":LYR:D:8_2::", ":LYR:D:8_3::"]),
            KvOp::Set,
            DeltaFlags::DIFF_AND_REL,
            Some(&keys),
            true,
        )
        .unwrap();

        // Now shrink: 8_2 leaves the group.
        let s = delta_set(
            &mut store,
            &key,
            &header(),
            v(&[":LYR:D:8_1::", ":LYR:D:8_3::"]),
            KvOp::Set,
            DeltaFlags::DIFF_AND_REL,
            Some(&keys),
            true,
        )
        .unwrap();

        assert_eq!(s.minus, v(&[":LYR:D:8_2::"]));
        assert!(s.plus.is_empty());
        assert_eq!(
            store.get(&key).unwrap().items().unwrap(),
            v(&[":LYR:D:8_1::", ":LYR:D:8_3::"]).as_slice()
        );

        // The addition and removal of 8_2 contradict each other across the
        // session: it vanishes from the plus companion without appearing
        // in the minus companion.
        let plus = store.get("+:LYR:D:8_0:::#GMB").unwrap();
        assert_eq!(plus.items().unwrap(), v(&[":LYR:D:8_1::", ":LYR:D:8_3::"]).as_slice());
        let minus = store.get("-:LYR:D:8_0:::#GMB").unwrap();
        assert!(minus.items().unwrap().is_empty());

        // The inverse key no longer references the group.
        let gin = store.get(":LYR:D:8_2:::#GIN").unwrap();
        assert!(gin.items().unwrap().is_empty());
    }

    #[test]
    fn plus_then_minus_roundtrip_leaves_value_unchanged() {
        let mut store = KvStore::new();
        let keys = RelKeys {
            cur: gmb_spec("8_0"),
            rel: gin_spec(),
        };
        let key = keys.cur.compose();

        delta_set(
            &mut store,
            &key,
            &header(),
            v(&["m1"]),
            KvOp::Set,
            DeltaFlags::DIFF,
            Some(&keys),
            false,
        )
        .unwrap();

        delta_set(
            &mut store,
            &key,
            &header(),
            v(&["m2"]),
            KvOp::Plus,
            DeltaFlags::DIFF,
            Some(&keys),
            false,
        )
        .unwrap();
        delta_set(
            &mut store,
            &key,
            &header(),
            v(&["m2"]),
            KvOp::Minus,
            DeltaFlags::DIFF,
            Some(&keys),
            false,
        )
        .unwrap();

        assert_eq!(store.get(&key).unwrap().items().unwrap(), v(&["m1"]).as_slice());
    }

    #[test]
    fn delta_on_blob_value_is_rejected() {
        let mut store = KvStore::new();
        store.set(
            "k",
            KvRecord::blob(header(), b"blob".to_vec()),
        );
        let err = delta_set(
            &mut store,
            "k",
            &header(),
            v(&["a"]),
            KvOp::Plus,
            DeltaFlags::NONE,
            None,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, KvError::NotVector { .. }));
    }
}
