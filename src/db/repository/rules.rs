use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::db::{DatabaseError, ValidationRuleRecord};
use crate::pipeline::types::RuleSet;

pub fn insert_rules(conn: &Connection, rules: &RuleSet) -> Result<(), DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    write_rules(&tx, rules)?;
    tx.commit()?;
    Ok(())
}

pub(crate) fn write_rules(conn: &Connection, rules: &RuleSet) -> Result<(), DatabaseError> {
    for rule in rules.values().flatten() {
        let r = ValidationRuleRecord::to_record(rule)?;
        conn.execute(
            "INSERT INTO validation_rules (id, field_id, rule_type, rule, confidence,
             is_recommended, examples, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                r.id,
                r.field_id,
                r.rule_type,
                r.rule,
                r.confidence,
                r.is_recommended,
                r.examples,
                r.description,
            ],
        )?;
    }
    Ok(())
}

/// Every rule attached to a field of the given run, grouped by field id.
pub fn get_rules_for_run(conn: &Connection, run_id: &Uuid) -> Result<RuleSet, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT r.id, r.field_id, r.rule_type, r.rule, r.confidence, r.is_recommended,
         r.examples, r.description
         FROM validation_rules r
         JOIN extracted_fields f ON f.id = r.field_id
         WHERE f.run_id = ?1
         ORDER BY f.position, r.rowid",
    )?;

    let records = stmt
        .query_map(params![run_id.to_string()], |row| {
            Ok(ValidationRuleRecord {
                id: row.get(0)?,
                field_id: row.get(1)?,
                rule_type: row.get(2)?,
                rule: row.get(3)?,
                confidence: row.get(4)?,
                is_recommended: row.get(5)?,
                examples: row.get(6)?,
                description: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut rules = RuleSet::new();
    for record in &records {
        let rule = ValidationRuleRecord::from_record(record)?;
        rules.entry(rule.field_id).or_default().push(rule);
    }
    Ok(rules)
}
