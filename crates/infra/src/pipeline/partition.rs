//! Splitting candidate sets into independent execution contexts.

use std::collections::BTreeMap;

use tracing::warn;

use dossier_core::CaseId;

/// Split `items` into at most `grid_size` partitions.
///
/// Below the grid cap every item gets its own partition keyed by
/// `{prefix}-{key(item)}`; beyond it, items are distributed round-robin over
/// `grid_size` chunk partitions. An empty input yields an empty map — a
/// no-op, not an error.
pub fn fan_out<T, F>(
    prefix: &str,
    items: Vec<T>,
    grid_size: usize,
    key: F,
) -> BTreeMap<String, Vec<T>>
where
    F: Fn(&T) -> String,
{
    let mut partitions: BTreeMap<String, Vec<T>> = BTreeMap::new();
    if items.is_empty() || grid_size == 0 {
        return partitions;
    }

    if items.len() <= grid_size {
        for item in items {
            partitions
                .entry(format!("{prefix}-{}", key(&item)))
                .or_default()
                .push(item);
        }
    } else {
        for (i, item) in items.into_iter().enumerate() {
            partitions
                .entry(format!("{prefix}-grid-{}", i % grid_size))
                .or_default()
                .push(item);
        }
    }
    partitions
}

/// Parse an explicit case-id allow-list.
///
/// Malformed identifiers are dropped with a warning, never fatal. The result
/// is deduplicated, preserving first-seen order.
pub fn parse_case_allow_list(raw: &[String]) -> Vec<CaseId> {
    let mut out: Vec<CaseId> = Vec::with_capacity(raw.len());
    for candidate in raw {
        match candidate.parse::<CaseId>() {
            Ok(case_id) => {
                if !out.contains(&case_id) {
                    out.push(case_id);
                }
            }
            Err(err) => {
                warn!(candidate = %candidate, error = %err, "dropping malformed case id");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_empty_map() {
        let partitions = fan_out("case", Vec::<CaseId>::new(), 8, |c| c.to_string());
        assert!(partitions.is_empty());
    }

    #[test]
    fn one_partition_per_item_below_grid() {
        let items: Vec<CaseId> = (0..3).map(|_| CaseId::new()).collect();
        let partitions = fan_out("case", items.clone(), 8, |c| c.to_string());

        assert_eq!(partitions.len(), 3);
        for item in &items {
            let part = &partitions[&format!("case-{item}")];
            assert_eq!(part.as_slice(), &[*item]);
        }
    }

    #[test]
    fn grid_caps_partition_count() {
        let items: Vec<CaseId> = (0..10).map(|_| CaseId::new()).collect();
        let partitions = fan_out("case", items.clone(), 4, |c| c.to_string());

        assert_eq!(partitions.len(), 4);
        let total: usize = partitions.values().map(Vec::len).sum();
        assert_eq!(total, 10);
        for item in &items {
            assert!(partitions.values().any(|p| p.contains(item)));
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn fan_out_loses_nothing_and_respects_the_grid(
                n in 0usize..64,
                grid in 1usize..16,
            ) {
                let items: Vec<u32> = (0..n as u32).collect();
                let partitions = fan_out("p", items, grid, |i| i.to_string());

                let total: usize = partitions.values().map(Vec::len).sum();
                prop_assert_eq!(total, n);
                prop_assert_eq!(partitions.len(), n.min(grid));
            }
        }
    }

    #[test]
    fn allow_list_drops_malformed_and_dedups() {
        let good = CaseId::new();
        let raw = vec![
            good.to_string(),
            "definitely-not-a-uuid".to_string(),
            good.to_string(),
        ];

        let parsed = parse_case_allow_list(&raw);
        assert_eq!(parsed, vec![good]);
    }
}
