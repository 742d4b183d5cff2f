use std::collections::BTreeSet;

use common::utils::tokens::TokenCounter;
use graph_store::{Covariate, Entity, Relationship};

use super::community::format_rank;
use super::table::{section_banner, ContextTable};

/// Renders the selected entities as an `id | entity | description` table,
/// packing rows until `max_tokens`.
pub fn build_entity_context(
    selected: &[&Entity],
    counter: &TokenCounter,
    max_tokens: usize,
    include_entity_rank: bool,
    rank_description: &str,
    column_delimiter: char,
    context_name: &str,
) -> (String, ContextTable) {
    let mut columns = vec!["id", "entity", "description"];
    if include_entity_rank {
        columns.push(rank_description);
    }
    let mut table = ContextTable::new(&columns);
    if selected.is_empty() {
        return (String::new(), table);
    }

    let banner = section_banner(context_name);
    let mut tokens = counter.count(&format!("{banner}{}", table.to_delimited(column_delimiter)));
    if tokens > max_tokens {
        return (String::new(), table);
    }
    for entity in selected {
        let mut row = vec![
            entity.short_id.clone().unwrap_or_default(),
            entity.title.clone(),
            entity.description.clone().unwrap_or_default(),
        ];
        if include_entity_rank {
            row.push(entity.rank.to_string());
        }
        let row_tokens = counter.count(&format!(
            "{}\n",
            row.join(&column_delimiter.to_string())
        ));
        if tokens + row_tokens > max_tokens {
            break;
        }
        tokens += row_tokens;
        table.push_row(row);
    }

    (
        format!("{banner}{}", table.to_delimited(column_delimiter)),
        table,
    )
}

/// Relationships touching the selected entities: all in-network edges first,
/// then out-network edges up to `top_k · |selected|`, both ranked.
pub(crate) fn filter_relationships<'a>(
    selected: &[&Entity],
    relationships: &'a [Relationship],
    top_k_relationships: usize,
    ranking_attribute: &str,
) -> Vec<&'a Relationship> {
    let titles: BTreeSet<&str> = selected.iter().map(|e| e.title.as_str()).collect();

    let mut in_network: Vec<&Relationship> = relationships
        .iter()
        .filter(|rel| titles.contains(rel.source.as_str()) && titles.contains(rel.target.as_str()))
        .collect();
    let mut out_network: Vec<&Relationship> = relationships
        .iter()
        .filter(|rel| {
            titles.contains(rel.source.as_str()) != titles.contains(rel.target.as_str())
        })
        .collect();

    sort_by_ranking_attribute(&mut in_network, selected, ranking_attribute);
    sort_by_ranking_attribute(&mut out_network, selected, ranking_attribute);

    let budget = top_k_relationships.saturating_mul(selected.len().max(1));
    out_network.truncate(budget);
    in_network.extend(out_network);
    in_network
}

/// Sorts best-first by the named attribute when the relationships carry it,
/// by weight when asked for `weight`, and by the combined rank of both
/// endpoints otherwise. Ties break on combined endpoint rank, then weight.
fn sort_by_ranking_attribute(
    relationships: &mut [&Relationship],
    entities: &[&Entity],
    ranking_attribute: &str,
) {
    let rank_of = |title: &str| -> i64 {
        entities
            .iter()
            .find(|entity| entity.title == title)
            .map(|entity| entity.rank)
            .unwrap_or(0)
    };
    let attribute_of = |rel: &Relationship| -> Option<i64> {
        rel.attributes
            .as_ref()
            .and_then(|attrs| attrs.get(ranking_attribute))
            .and_then(|value| value.as_i64())
    };

    relationships.sort_by(|a, b| {
        let combined_a = rank_of(&a.source) + rank_of(&a.target);
        let combined_b = rank_of(&b.source) + rank_of(&b.target);
        let key_a = if ranking_attribute == "weight" {
            a.weight
        } else {
            attribute_of(a).map_or(combined_a as f64, |v| v as f64)
        };
        let key_b = if ranking_attribute == "weight" {
            b.weight
        } else {
            attribute_of(b).map_or(combined_b as f64, |v| v as f64)
        };
        key_b
            .total_cmp(&key_a)
            .then_with(|| combined_b.cmp(&combined_a))
            .then_with(|| b.weight.total_cmp(&a.weight))
    });
}

/// Renders the ranked relationship table for the selected entities.
pub fn build_relationship_context(
    selected: &[&Entity],
    relationships: &[Relationship],
    counter: &TokenCounter,
    max_tokens: usize,
    top_k_relationships: usize,
    include_relationship_weight: bool,
    ranking_attribute: &str,
    column_delimiter: char,
    context_name: &str,
) -> (String, ContextTable) {
    let mut columns = vec!["id", "source", "target", "description"];
    if include_relationship_weight {
        columns.push("weight");
    }
    let mut table = ContextTable::new(&columns);

    let filtered = filter_relationships(selected, relationships, top_k_relationships, ranking_attribute);
    if selected.is_empty() || filtered.is_empty() {
        return (String::new(), table);
    }

    let banner = section_banner(context_name);
    let mut tokens = counter.count(&format!("{banner}{}", table.to_delimited(column_delimiter)));
    if tokens > max_tokens {
        return (String::new(), table);
    }
    for rel in filtered {
        let mut row = vec![
            rel.short_id.clone().unwrap_or_default(),
            rel.source.clone(),
            rel.target.clone(),
            rel.description.clone().unwrap_or_default(),
        ];
        if include_relationship_weight {
            row.push(format_rank(rel.weight));
        }
        let row_tokens = counter.count(&format!(
            "{}\n",
            row.join(&column_delimiter.to_string())
        ));
        if tokens + row_tokens > max_tokens {
            break;
        }
        tokens += row_tokens;
        table.push_row(row);
    }

    (
        format!("{banner}{}", table.to_delimited(column_delimiter)),
        table,
    )
}

/// Renders one covariate class (e.g. claims) for the selected entities.
/// Attribute columns are the sorted union of the covariates' detail keys.
pub fn build_covariates_context(
    selected: &[&Entity],
    covariates: &[Covariate],
    counter: &TokenCounter,
    max_tokens: usize,
    column_delimiter: char,
    context_name: &str,
) -> (String, ContextTable) {
    let titles: BTreeSet<&str> = selected.iter().map(|e| e.title.as_str()).collect();
    let matching: Vec<&Covariate> = covariates
        .iter()
        .filter(|covariate| titles.contains(covariate.subject_id.as_str()))
        .collect();

    let attribute_columns: Vec<String> = matching
        .iter()
        .flat_map(|covariate| {
            covariate
                .attributes
                .iter()
                .flat_map(|attrs| attrs.keys().cloned())
        })
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect();

    let mut columns: Vec<&str> = vec!["id", "entity"];
    columns.extend(attribute_columns.iter().map(String::as_str));
    let mut table = ContextTable::new(&columns);

    if matching.is_empty() {
        return (String::new(), table);
    }

    let banner = section_banner(context_name);
    let mut tokens = counter.count(&format!("{banner}{}", table.to_delimited(column_delimiter)));
    if tokens > max_tokens {
        return (String::new(), table);
    }
    for covariate in matching {
        let mut row = vec![
            covariate.short_id.clone().unwrap_or_default(),
            covariate.subject_id.clone(),
        ];
        for column in &attribute_columns {
            let value = covariate
                .attributes
                .as_ref()
                .and_then(|attrs| attrs.get(column))
                .and_then(|value| value.as_str().map(str::to_string))
                .unwrap_or_default();
            row.push(value);
        }
        let row_tokens = counter.count(&format!(
            "{}\n",
            row.join(&column_delimiter.to_string())
        ));
        if tokens + row_tokens > max_tokens {
            break;
        }
        tokens += row_tokens;
        table.push_row(row);
    }

    (
        format!("{banner}{}", table.to_delimited(column_delimiter)),
        table,
    )
}
