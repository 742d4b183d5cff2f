use common::utils::tokens::TokenCounter;
use graph_store::{Entity, Relationship, TextUnit};

use super::table::{section_banner, ContextTable};

/// Number of relationships that tie `unit` to `entity`: edges touching the
/// entity whose `text_unit_ids` include this unit.
pub(crate) fn count_relationships(
    unit: &TextUnit,
    entity: &Entity,
    relationships: &[Relationship],
) -> usize {
    relationships
        .iter()
        .filter(|rel| rel.source == entity.title || rel.target == entity.title)
        .filter(|rel| {
            rel.text_unit_ids
                .as_ref()
                .is_some_and(|ids| ids.iter().any(|id| id == &unit.id))
        })
        .count()
}

/// Renders ranked text units as an `id | text` table under the budget.
pub fn build_text_unit_context(
    units: &[&TextUnit],
    counter: &TokenCounter,
    max_tokens: usize,
    column_delimiter: char,
    context_name: &str,
) -> (String, ContextTable) {
    let mut table = ContextTable::new(&["id", "text"]);
    if units.is_empty() {
        return (String::new(), table);
    }

    let banner = section_banner(context_name);
    let mut tokens = counter.count(&format!("{banner}{}", table.to_delimited(column_delimiter)));
    if tokens > max_tokens {
        return (String::new(), table);
    }
    for unit in units {
        let row = vec![unit.short_id.clone().unwrap_or_default(), unit.text.clone()];
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

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str, text: &str) -> TextUnit {
        TextUnit {
            id: id.to_string(),
            short_id: Some(id.to_string()),
            text: text.to_string(),
            ..TextUnit::default()
        }
    }

    #[test]
    fn test_count_relationships_requires_unit_reference() {
        let entity = Entity {
            title: "Alpha".to_string(),
            ..Entity::default()
        };
        let text_unit = unit("u1", "alpha text");
        let relationships = vec![
            Relationship {
                source: "Alpha".to_string(),
                target: "Beta".to_string(),
                text_unit_ids: Some(vec!["u1".to_string()]),
                ..Relationship::default()
            },
            Relationship {
                source: "Alpha".to_string(),
                target: "Gamma".to_string(),
                text_unit_ids: Some(vec!["u2".to_string()]),
                ..Relationship::default()
            },
            Relationship {
                source: "Delta".to_string(),
                target: "Epsilon".to_string(),
                text_unit_ids: Some(vec!["u1".to_string()]),
                ..Relationship::default()
            },
        ];
        assert_eq!(count_relationships(&text_unit, &entity, &relationships), 1);
    }

    #[test]
    fn test_text_unit_context_packs_under_budget() {
        let counter = TokenCounter::new("cl100k_base").unwrap();
        let units: Vec<TextUnit> = (0..10)
            .map(|i| unit(&format!("u{i}"), "a reasonably long text unit body for budgeting"))
            .collect();
        let refs: Vec<&TextUnit> = units.iter().collect();
        let (text, table) = build_text_unit_context(&refs, &counter, 60, '|', "Sources");
        assert!(text.starts_with("-----Sources-----\n"));
        assert!(table.rows.len() < 10);
        assert!(!table.rows.is_empty());
    }
}
