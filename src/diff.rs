//! Field-level comparison of two snapshots.
//!
//! Only records present in both snapshots are compared; a subnet that
//! appears or disappears between the two heights produces nothing. Values
//! are compared by exact equality with null as a distinct value: null vs.
//! a string is a change, null vs. null is not.

use crate::models::{ApproxChange, Field, Height, Snapshot};

/// Compare `prev` against `curr` and tag every difference with `height`.
///
/// Output is ordered by record id, then by the order of `fields`. Each
/// change carries `prev`'s value as `old_value` and `curr`'s as `new_value`.
pub fn diff_snapshots(
    prev: &Snapshot,
    curr: &Snapshot,
    height: Height,
    fields: &[Field],
) -> Vec<ApproxChange> {
    let mut changes = Vec::new();

    for (netuid, prev_info) in prev {
        let Some(curr_info) = curr.get(netuid) else {
            continue;
        };
        for &field in fields {
            let old = field.value(prev_info);
            let new = field.value(curr_info);
            if old != new {
                changes.push(ApproxChange {
                    height,
                    netuid: *netuid,
                    field,
                    old_value: old.map(str::to_string),
                    new_value: new.map(str::to_string),
                });
            }
        }
    }

    changes
}
