use crate::models::EditTable;
use rayon::prelude::*;

/// Combines tables computed over disjoint ID ranges.
///
/// Totals and per-namespace counts are summed per user; a user missing from
/// one side counts as zero there. Overlapping inputs are double counted.
pub fn merge(a: EditTable, b: EditTable) -> EditTable {
    let (mut larger, smaller) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    merge_into(&mut larger, smaller);
    larger
}

pub fn merge_into(target: &mut EditTable, other: EditTable) {
    for (user, count) in other {
        target.add(user, count);
    }
}

/// Parallel tree reduce over any number of partial tables.
pub fn reduce_tables(tables: Vec<EditTable>) -> EditTable {
    tables.into_par_iter().reduce(EditTable::new, merge)
}
