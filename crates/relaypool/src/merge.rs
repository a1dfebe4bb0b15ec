//! Merging of similar filters.
//!
//! Two filters are similar when they are identical except for the values of a
//! single list field (`ids`, `authors`, `kinds` or one tag constraint). Merging
//! unions that list. Filters with an empty list field match nothing and are
//! dropped.

use std::collections::HashMap;

use crate::filter::{Filter, GroupField};

/// Merge similar filters and remove filters that can match nothing.
///
/// Unmerged filters keep their relative order. A merged filter stays at the
/// position of the first filter of its group.
pub fn merge_similar_filters(filters: &[Filter]) -> Vec<Filter> {
    let mut merged: Vec<Filter> = Vec::with_capacity(filters.len());
    let mut owner_by_key: HashMap<String, usize> = HashMap::new();
    let mut keys_by_owner: Vec<Vec<(GroupField, String)>> = Vec::with_capacity(filters.len());

    for filter in filters {
        if filter.is_empty_match() {
            continue;
        }

        let fields = filter.group_fields();
        let keys: Vec<(GroupField, String)> = fields
            .into_iter()
            .map(|field| {
                let key = format!("{}{}", field, filter.stable_json_without(Some(&field)));
                (field, key)
            })
            .collect();

        let target = keys
            .iter()
            .find_map(|(field, key)| owner_by_key.get(key).map(|&owner| (owner, field.clone())));

        match target {
            Some((owner, field)) => {
                // The owner changes shape along `field`, so its keys for other fields go stale.
                let owned = std::mem::take(&mut keys_by_owner[owner]);
                for (other_field, other_key) in owned {
                    if other_field == field {
                        keys_by_owner[owner].push((other_field, other_key));
                    } else {
                        owner_by_key.remove(&other_key);
                    }
                }
                merged[owner].union_field(&field, filter);
            }
            None => {
                let owner = merged.len();
                for (_, key) in &keys {
                    owner_by_key.insert(key.clone(), owner);
                }
                keys_by_owner.push(keys);
                merged.push(filter.clone());
            }
        }
    }

    merged
}
