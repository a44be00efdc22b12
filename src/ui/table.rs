use crate::access::Row;
use crate::value::Value;
use tabled::{Table, Tabled, builder::Builder, settings::Style};

#[derive(Tabled)]
pub struct PropertyRow {
    #[tabled(rename = "Property")]
    pub property: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

/// Table with caller-defined columns
pub struct TableBuilder {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TableBuilder {
    pub fn new<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn add_row<I, S>(&mut self, cells: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rows.push(cells.into_iter().map(Into::into).collect());
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn build(&self) -> String {
        if self.headers.is_empty() {
            return String::new();
        }
        let mut builder = Builder::default();
        builder.push_record(self.headers.clone());
        for row in &self.rows {
            builder.push_record(row.clone());
        }
        builder.build().with(Style::rounded()).to_string()
    }
}

/// Two-column property/value table
pub fn properties_table(properties: &[(&str, String)]) -> String {
    let rows: Vec<PropertyRow> = properties
        .iter()
        .map(|(property, value)| PropertyRow {
            property: property.to_string(),
            value: value.clone(),
        })
        .collect();
    if rows.is_empty() {
        return String::new();
    }
    Table::new(&rows).with(Style::rounded()).to_string()
}

/// Result rows as a table; column names come from the first row
pub fn rows_table(rows: &[Row]) -> String {
    let Some(first) = rows.first() else {
        return String::new();
    };
    let mut builder = TableBuilder::new(first.columns().iter().cloned());
    for row in rows {
        builder.add_row(row.values().iter().map(Value::to_string));
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_rows_table_lists_every_cell() {
        let columns: Arc<[String]> = Arc::from(vec!["id".to_string(), "name".to_string()]);
        let rows = vec![
            Row::new(columns.clone(), vec![Value::Integer(1), Value::Text("Ann".into())]),
            Row::new(columns, vec![Value::Integer(2), Value::Null]),
        ];
        let table = rows_table(&rows);
        for text in ["id", "name", "Ann", "NULL", "2"] {
            assert!(table.contains(text), "missing {text} in\n{table}");
        }
        assert!(rows_table(&[]).is_empty());
    }

    #[test]
    fn test_properties_table() {
        let table = properties_table(&[("version", "2".to_string()), ("location", ":memory:".to_string())]);
        assert!(table.contains("Property"));
        assert!(table.contains(":memory:"));
    }
}
