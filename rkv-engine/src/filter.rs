//! Server-side evaluation of parsed filters.
//!
//! Filters run in expression order on the full row, before any column
//! restriction. A row-level filter may drop the row; cell-level filters
//! rewrite the surviving cells.

use std::collections::BTreeMap;

use rkv_common::{FilterSpec, WireCell};

/// Cells of one row keyed by `family:qualifier`.
pub type Cells = BTreeMap<String, WireCell>;

/// Runs every filter; `None` means the row is excluded.
pub fn apply_filters(filters: &[FilterSpec], cells: Cells) -> Option<Cells> {
    filters
        .iter()
        .try_fold(cells, |cells, filter| apply_one(filter, cells))
}

fn apply_one(filter: &FilterSpec, mut cells: Cells) -> Option<Cells> {
    match filter {
        FilterSpec::SingleColumnValueFilter {
            family,
            qualifier,
            comparator,
            value,
            filter_if_missing,
            ..
        } => {
            let key = format!("{family}:{qualifier}");
            match cells.get(&key) {
                Some(cell) if comparator.matches(&cell.value, value.as_bytes()) => Some(cells),
                Some(_) => None,
                None if *filter_if_missing => None,
                None => Some(cells),
            }
        }
        FilterSpec::FirstKeyOnlyFilter => {
            let first = cells.pop_first()?;
            Some(BTreeMap::from([first]))
        }
        FilterSpec::KeyOnlyFilter => {
            for cell in cells.values_mut() {
                cell.value.clear();
            }
            Some(cells)
        }
        FilterSpec::DependentColumnFilter { family, qualifier } => {
            let key = format!("{family}:{qualifier}");
            let stamp = cells.get(&key)?.timestamp;
            cells.retain(|_, cell| cell.timestamp == stamp);
            Some(cells)
        }
    }
}

/// Keeps only the cells selected by a column restriction.
///
/// Entries are `family:qualifier`, `family:` or a bare family name. An empty
/// restriction selects everything.
pub fn restrict_columns(columns: &[String], mut cells: Cells) -> Cells {
    if columns.is_empty() {
        return cells;
    }
    cells.retain(|key, _| columns.iter().any(|wanted| column_selected(wanted, key)));
    cells
}

fn column_selected(wanted: &str, key: &str) -> bool {
    let family = key.split_once(':').map_or(key, |(family, _)| family);
    match wanted.split_once(':') {
        Some((wanted_family, "")) => wanted_family == family,
        Some(_) => wanted == key,
        None => wanted == family,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rkv_common::Comparator;

    fn cells(entries: &[(&str, &str, i64)]) -> Cells {
        entries
            .iter()
            .map(|(k, v, ts)| {
                (
                    k.to_string(),
                    WireCell {
                        value: v.as_bytes().to_vec(),
                        timestamp: *ts,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn single_column_value_keeps_matching_rows() {
        let filter = FilterSpec::column_equals("d", "foo", "bar");
        assert!(apply_filters(&[filter.clone()], cells(&[("d:foo", "bar", 1)])).is_some());
        assert!(apply_filters(&[filter.clone()], cells(&[("d:foo", "baz", 1)])).is_none());
        assert!(apply_filters(&[filter], cells(&[("d:other", "x", 1)])).is_none());
    }

    #[test]
    fn single_column_value_keeps_missing_when_allowed() {
        let filter = FilterSpec::SingleColumnValueFilter {
            family: "d".into(),
            qualifier: "foo".into(),
            comparator: Comparator::Greater,
            value: "m".into(),
            filter_if_missing: false,
            latest_version_only: true,
        };
        assert!(apply_filters(&[filter.clone()], cells(&[("d:other", "x", 1)])).is_some());
        assert!(apply_filters(&[filter.clone()], cells(&[("d:foo", "z", 1)])).is_some());
        assert!(apply_filters(&[filter], cells(&[("d:foo", "a", 1)])).is_none());
    }

    #[test]
    fn first_key_and_key_only_chain() {
        let row = cells(&[("d:a", "1", 1), ("d:b", "2", 1)]);
        let out = apply_filters(
            &[FilterSpec::FirstKeyOnlyFilter, FilterSpec::KeyOnlyFilter],
            row,
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        assert!(out["d:a"].value.is_empty());
    }

    #[test]
    fn dependent_column_keeps_same_timestamp_cells() {
        let row = cells(&[("d:column5", "x", 7), ("d:a", "1", 7), ("d:b", "2", 3)]);
        let filter = FilterSpec::DependentColumnFilter {
            family: "d".into(),
            qualifier: "column5".into(),
        };
        let out = apply_filters(&[filter.clone()], row).unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["d:a", "d:column5"]);

        assert!(apply_filters(&[filter], cells(&[("d:a", "1", 7)])).is_none());
    }

    #[test]
    fn restriction_by_family_or_column() {
        let row = cells(&[("d:a", "1", 1), ("d:b", "2", 1), ("f:c", "3", 1)]);
        let only_a = restrict_columns(&["d:a".to_string()], row.clone());
        assert_eq!(only_a.len(), 1);

        let family = restrict_columns(&["f".to_string()], row.clone());
        assert_eq!(family.keys().collect::<Vec<_>>(), vec!["f:c"]);

        let family_colon = restrict_columns(&["d:".to_string()], row.clone());
        assert_eq!(family_colon.len(), 2);

        assert_eq!(restrict_columns(&[], row).len(), 3);
    }
}
