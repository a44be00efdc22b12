//! Statement analysis against a schema snapshot
//!
//! Resolution order:
//! 1. CTE names and column lists (`WITH x(a, b) AS (...)`)
//! 2. Write target (`INSERT INTO`, `UPDATE`, `DELETE FROM`)
//! 3. Table sources after every `FROM` / `JOIN`, with aliases
//! 4. Result aliases (`AS x` and implicit `expr x`)
//! 5. Column references, qualified and unqualified
//!
//! Scoping is flat: a column is accepted if any source of the statement
//! (including subqueries) has it. Sources whose columns are unknown (subqueries,
//! CTEs, table-valued functions) make unqualified references unverifiable, and
//! those are accepted.

use super::BindError;
use super::lexer::{Placeholder, Token, TokenKind, tokenize};
use super::template::{QueryTemplate, ReturnShape};
use crate::schema::{EntityDescriptor, SchemaSnapshot};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;

const KEYWORDS: &[&str] = &[
    "ABORT", "ACTION", "ADD", "AFTER", "ALL", "ALTER", "ALWAYS", "ANALYZE", "AND", "AS", "ASC",
    "ATTACH", "AUTOINCREMENT", "BEFORE", "BEGIN", "BETWEEN", "BY", "CASCADE", "CASE", "CAST",
    "CHECK", "COLLATE", "COLUMN", "COMMIT", "CONFLICT", "CONSTRAINT", "CREATE", "CROSS",
    "CURRENT", "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "DATABASE", "DEFAULT",
    "DEFERRABLE", "DEFERRED", "DELETE", "DESC", "DETACH", "DISTINCT", "DO", "DROP", "EACH",
    "ELSE", "END", "ESCAPE", "EXCEPT", "EXCLUDE", "EXCLUSIVE", "EXISTS", "EXPLAIN", "FAIL",
    "FALSE", "FILTER", "FIRST", "FOLLOWING", "FOR", "FOREIGN", "FROM", "FULL", "GENERATED",
    "GLOB", "GROUP", "GROUPS", "HAVING", "IF", "IGNORE", "IMMEDIATE", "IN", "INDEX", "INDEXED",
    "INITIALLY", "INNER", "INSERT", "INSTEAD", "INTERSECT", "INTO", "IS", "ISNULL", "JOIN",
    "KEY", "LAST", "LEFT", "LIKE", "LIMIT", "MATCH", "MATERIALIZED", "NATURAL", "NO", "NOT",
    "NOTHING", "NOTNULL", "NULL", "NULLS", "OF", "OFFSET", "ON", "OR", "ORDER", "OTHERS",
    "OUTER", "OVER", "PARTITION", "PLAN", "PRAGMA", "PRECEDING", "PRIMARY", "QUERY", "RAISE",
    "RANGE", "RECURSIVE", "REFERENCES", "REGEXP", "REINDEX", "RELEASE", "RENAME", "REPLACE",
    "RESTRICT", "RETURNING", "RIGHT", "ROLLBACK", "ROW", "ROWS", "SAVEPOINT", "SELECT", "SET",
    "TABLE", "TEMP", "TEMPORARY", "THEN", "TIES", "TO", "TRANSACTION", "TRIGGER", "TRUE",
    "UNBOUNDED", "UNION", "UNIQUE", "UPDATE", "USING", "VACUUM", "VALUES", "VIEW", "VIRTUAL",
    "WHEN", "WHERE", "WINDOW", "WITH", "WITHOUT",
];

const AGGREGATES: &[&str] = &["COUNT", "SUM", "TOTAL", "MIN", "MAX", "AVG", "GROUP_CONCAT", "STRING_AGG"];

/// Words that end a select list or a WHERE clause at their nesting depth
const CLAUSE_ENDS: &[&str] = &[
    "FROM", "WHERE", "GROUP", "HAVING", "ORDER", "LIMIT", "WINDOW", "UNION", "INTERSECT",
    "EXCEPT", "RETURNING", "ON",
];

fn is_keyword(word: &str) -> bool {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| KEYWORDS.iter().copied().collect())
        .contains(word.to_ascii_uppercase().as_str())
}

fn is_rowid(name: &str) -> bool {
    ["rowid", "oid", "_rowid_"]
        .iter()
        .any(|r| r.eq_ignore_ascii_case(name))
}

/// Statement category, from the leading keyword of the main statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl StatementKind {
    pub fn is_write(&self) -> bool {
        !matches!(self, StatementKind::Select)
    }
}

/// Whether a query is statically known to yield at most one row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowGuarantee {
    AtMostOne(&'static str),
    /// Not derivable from the text; checked at runtime
    Unchecked,
}

impl RowGuarantee {
    pub fn is_proven(&self) -> bool {
        matches!(self, RowGuarantee::AtMostOne(_))
    }
}

/// Output of [`analyze`]
#[derive(Debug, Clone)]
pub struct Analysis {
    pub kind: StatementKind,
    pub read_set: BTreeSet<String>,
    pub write_set: BTreeSet<String>,
    /// Result column names when they are statically known
    pub result_columns: Option<Vec<String>>,
    pub returns_rows: bool,
    pub row_guarantee: RowGuarantee,
    /// SQL with every placeholder rewritten to `?N`
    pub sql: String,
    /// Parameter names by position (`?1` is `params[0]`)
    pub params: Vec<String>,
}

#[derive(Debug, Clone)]
struct Source {
    /// Real table name (lowercase); `None` for subqueries, CTEs and functions
    table: Option<String>,
    depth: usize,
}

struct Analyzer<'a> {
    sql: &'a str,
    tokens: Vec<Token>,
    depth: Vec<usize>,
    snapshot: &'a SchemaSnapshot,
    consumed: Vec<bool>,
    sources: Vec<Source>,
    /// lowercase qualifier (alias or table name) → index into `sources`
    qualifiers: HashMap<String, usize>,
    ctes: HashSet<String>,
    cte_columns: HashSet<String>,
    result_aliases: HashSet<String>,
    read_set: BTreeSet<String>,
    target: Option<usize>,
}

/// Analyze `template` against `snapshot`
pub fn analyze(template: &QueryTemplate, snapshot: &SchemaSnapshot) -> Result<Analysis, BindError> {
    let mut tokens = tokenize(&template.sql)?;

    if let Some(pos) = tokens.iter().position(|t| t.is_symbol(";")) {
        if pos + 1 != tokens.len() {
            return Err(BindError::UnsupportedStatement(
                "multiple statements in one template".to_string(),
            ));
        }
        tokens.pop();
    }
    if tokens.is_empty() {
        return Err(BindError::Syntax("empty statement".to_string()));
    }

    let depth = nesting(&tokens)?;
    let n = tokens.len();
    let mut analyzer = Analyzer {
        sql: &template.sql,
        tokens,
        depth,
        snapshot,
        consumed: vec![false; n],
        sources: Vec::new(),
        qualifiers: HashMap::new(),
        ctes: HashSet::new(),
        cte_columns: HashSet::new(),
        result_aliases: HashSet::new(),
        read_set: BTreeSet::new(),
        target: None,
    };
    analyzer.run(template)
}

/// Paren depth before each token
fn nesting(tokens: &[Token]) -> Result<Vec<usize>, BindError> {
    let mut depths = Vec::with_capacity(tokens.len());
    let mut depth = 0usize;
    for token in tokens {
        if token.is_symbol(")") {
            depth = depth
                .checked_sub(1)
                .ok_or_else(|| BindError::Syntax("unbalanced parentheses".to_string()))?;
        }
        depths.push(depth);
        if token.is_symbol("(") {
            depth += 1;
        }
    }
    if depth != 0 {
        return Err(BindError::Syntax("unbalanced parentheses".to_string()));
    }
    // `(` itself sits at the outer depth; `)` was already decremented
    Ok(depths)
}

fn bare_ident(token: &Token) -> Option<&str> {
    match &token.kind {
        TokenKind::Word(w) if !is_keyword(w) => Some(w),
        TokenKind::QuotedIdent(w) => Some(w),
        _ => None,
    }
}

/// Tokens after which a following identifier can only be an alias
fn ends_operand(token: &Token) -> bool {
    match &token.kind {
        TokenKind::Word(w) => {
            !is_keyword(w) || ["NULL", "END", "TRUE", "FALSE"].iter().any(|k| w.eq_ignore_ascii_case(k))
        }
        TokenKind::QuotedIdent(_)
        | TokenKind::Number(_)
        | TokenKind::Str(_)
        | TokenKind::Blob
        | TokenKind::Param(_) => true,
        TokenKind::Symbol(s) => *s == ")",
    }
}

impl Analyzer<'_> {
    fn run(&mut self, template: &QueryTemplate) -> Result<Analysis, BindError> {
        let main = if self.tokens[0].is_keyword("WITH") {
            self.parse_ctes()?
        } else {
            0
        };

        let kind = match self.tokens.get(main).and_then(Token::keyword).as_deref() {
            Some("SELECT") | Some("VALUES") => StatementKind::Select,
            Some("INSERT") | Some("REPLACE") => StatementKind::Insert,
            Some("UPDATE") => StatementKind::Update,
            Some("DELETE") => StatementKind::Delete,
            Some(other) => return Err(BindError::UnsupportedStatement(other.to_string())),
            None => return Err(BindError::Syntax("missing statement after WITH".to_string())),
        };

        if kind.is_write() {
            self.parse_target(kind, main)?;
        }
        self.parse_sources()?;
        self.collect_aliases();
        self.check_columns()?;

        let (sql, params) = self.rewrite_placeholders(template)?;

        let returning = self.find_at_depth(main, 0, "RETURNING");
        let returns_rows = kind == StatementKind::Select || returning.is_some();
        let result_columns = match (kind, returning) {
            (StatementKind::Select, _) => self.select_columns(main),
            (_, Some(at)) => self.returning_columns(at),
            _ => None,
        };
        let row_guarantee = self.row_guarantee(kind, main);

        check_shape(template.shape, kind, returns_rows, result_columns.as_deref())?;

        let write_set = match self.target {
            Some(t) => {
                let table = self.sources[t].table.clone().unwrap_or_default();
                if kind == StatementKind::Insert && !self.insert_rewrites_rows(main) {
                    BTreeSet::from([table.to_ascii_lowercase()])
                } else {
                    self.snapshot.write_closure(&table)
                }
            }
            None => BTreeSet::new(),
        };

        Ok(Analysis {
            kind,
            read_set: std::mem::take(&mut self.read_set),
            write_set,
            result_columns,
            returns_rows,
            row_guarantee,
            sql,
            params,
        })
    }

    fn close_of(&self, open: usize) -> usize {
        let inner = self.depth[open] + 1;
        (open + 1..self.tokens.len())
            .find(|&j| self.tokens[j].is_symbol(")") && self.depth[j] + 1 == inner)
            .unwrap_or(self.tokens.len())
    }

    /// `REPLACE`, `INSERT OR REPLACE` and upserts with `DO UPDATE` delete or
    /// update existing rows, so foreign key actions can reach child tables
    fn insert_rewrites_rows(&self, main: usize) -> bool {
        let keyword_at = |i: usize, kw: &str| self.tokens.get(i).is_some_and(|t| t.is_keyword(kw));
        if keyword_at(main, "REPLACE") || (keyword_at(main + 1, "OR") && keyword_at(main + 2, "REPLACE")) {
            return true;
        }
        let mut from = main;
        while let Some(at) = self.find_at_depth(from, 0, "DO") {
            if keyword_at(at + 1, "UPDATE") {
                return true;
            }
            from = at + 1;
        }
        false
    }

    fn find_at_depth(&self, from: usize, depth: usize, kw: &str) -> Option<usize> {
        (from..self.tokens.len()).find(|&j| self.depth[j] == depth && self.tokens[j].is_keyword(kw))
    }

    /// `WITH [RECURSIVE] name[(cols)] AS [NOT] [MATERIALIZED] (...), ...`;
    /// returns the index of the main statement
    fn parse_ctes(&mut self) -> Result<usize, BindError> {
        self.consumed[0] = true;
        let mut i = 1;
        if self.tokens.get(i).is_some_and(|t| t.is_keyword("RECURSIVE")) {
            i += 1;
        }
        loop {
            let name = self
                .tokens
                .get(i)
                .and_then(Token::ident)
                .ok_or_else(|| BindError::Syntax("expected CTE name".to_string()))?
                .to_ascii_lowercase();
            self.consumed[i] = true;
            self.ctes.insert(name);
            i += 1;

            if self.tokens.get(i).is_some_and(|t| t.is_symbol("(")) {
                let close = self.close_of(i);
                for j in i + 1..close {
                    if let Some(col) = self.tokens[j].ident() {
                        self.cte_columns.insert(col.to_ascii_lowercase());
                        self.consumed[j] = true;
                    }
                }
                i = close + 1;
            }

            if !self.tokens.get(i).is_some_and(|t| t.is_keyword("AS")) {
                return Err(BindError::Syntax("expected AS in WITH clause".to_string()));
            }
            self.consumed[i] = true;
            i += 1;
            while self
                .tokens
                .get(i)
                .is_some_and(|t| t.is_keyword("NOT") || t.is_keyword("MATERIALIZED"))
            {
                i += 1;
            }
            if !self.tokens.get(i).is_some_and(|t| t.is_symbol("(")) {
                return Err(BindError::Syntax("expected ( after AS in WITH clause".to_string()));
            }
            i = self.close_of(i) + 1;

            if self.tokens.get(i).is_some_and(|t| t.is_symbol(",")) {
                i += 1;
            } else {
                return Ok(i);
            }
        }
    }

    /// Read `[schema .] name` at `i`; returns the name and the index after it
    fn table_name_at(&mut self, i: usize) -> Result<(String, usize), BindError> {
        let first = self
            .tokens
            .get(i)
            .and_then(Token::ident)
            .ok_or_else(|| BindError::Syntax("expected table name".to_string()))?
            .to_string();
        self.consumed[i] = true;
        let is_qualified = self.tokens.get(i + 1).is_some_and(|t| t.is_symbol("."))
            && self.tokens.get(i + 2).and_then(Token::ident).is_some();
        if is_qualified {
            self.consumed[i + 1] = true;
            self.consumed[i + 2] = true;
            let name = self.tokens[i + 2].ident().unwrap_or_default().to_string();
            return Ok((name, i + 3));
        }
        Ok((first, i + 1))
    }

    /// Optional `[AS] alias` at `i`; returns the alias and the index after it
    fn alias_at(&mut self, i: usize) -> (Option<String>, usize) {
        if self.tokens.get(i).is_some_and(|t| t.is_keyword("AS")) {
            if let Some(alias) = self.tokens.get(i + 1).and_then(Token::ident) {
                let alias = alias.to_ascii_lowercase();
                self.consumed[i] = true;
                self.consumed[i + 1] = true;
                return (Some(alias), i + 2);
            }
            return (None, i);
        }
        match self.tokens.get(i).and_then(bare_ident) {
            Some(alias) => {
                let alias = alias.to_ascii_lowercase();
                self.consumed[i] = true;
                (Some(alias), i + 1)
            }
            None => (None, i),
        }
    }

    /// Resolve a table name to a source; unknown tables fail
    fn add_source(&mut self, name: &str, alias: Option<String>, depth: usize) -> Result<usize, BindError> {
        let lower = name.to_ascii_lowercase();
        let table = if self.ctes.contains(&lower) {
            None
        } else if self.snapshot.has_table(&lower) {
            Some(lower.clone())
        } else {
            return Err(BindError::UnknownTable(name.to_string()));
        };
        let idx = self.sources.len();
        self.sources.push(Source { table, depth });
        self.qualifiers.insert(lower, idx);
        if let Some(alias) = alias {
            self.qualifiers.insert(alias, idx);
        }
        Ok(idx)
    }

    fn add_opaque(&mut self, alias: Option<String>, depth: usize) {
        let idx = self.sources.len();
        self.sources.push(Source { table: None, depth });
        if let Some(alias) = alias {
            self.qualifiers.insert(alias, idx);
        }
    }

    fn entity(&self, source: usize) -> Option<&EntityDescriptor> {
        self.sources[source]
            .table
            .as_deref()
            .and_then(|t| self.snapshot.entity(t))
    }

    fn parse_target(&mut self, kind: StatementKind, main: usize) -> Result<(), BindError> {
        self.consumed[main] = true;
        let mut i = main + 1;
        let depth = self.depth[main];

        match kind {
            StatementKind::Insert | StatementKind::Update => {
                if self.tokens.get(i).is_some_and(|t| t.is_keyword("OR")) {
                    self.consumed[i] = true;
                    self.consumed[i + 1] = true;
                    i += 2;
                }
                if kind == StatementKind::Insert {
                    if !self.tokens.get(i).is_some_and(|t| t.is_keyword("INTO")) {
                        return Err(BindError::Syntax("expected INTO".to_string()));
                    }
                    self.consumed[i] = true;
                    i += 1;
                }
            }
            StatementKind::Delete => {
                if !self.tokens.get(i).is_some_and(|t| t.is_keyword("FROM")) {
                    return Err(BindError::Syntax("expected FROM after DELETE".to_string()));
                }
                self.consumed[i] = true;
                i += 1;
            }
            StatementKind::Select => return Ok(()),
        }

        let (name, next) = self.table_name_at(i)?;
        if self.ctes.contains(&name.to_ascii_lowercase()) {
            return Err(BindError::UnsupportedStatement(format!(
                "cannot write to common table expression {name}"
            )));
        }
        let alias_start = next;
        let (alias, next) = if kind == StatementKind::Insert
            && !self.tokens.get(alias_start).is_some_and(|t| t.is_keyword("AS"))
        {
            (None, alias_start)
        } else {
            self.alias_at(alias_start)
        };
        let target = self.add_source(&name, alias, depth)?;
        self.target = Some(target);
        self.qualifiers.insert("excluded".to_string(), target);

        if kind == StatementKind::Insert && self.tokens.get(next).is_some_and(|t| t.is_symbol("(")) {
            let close = self.close_of(next);
            for j in next + 1..close {
                if let Some(col) = self.tokens[j].ident() {
                    let col = col.to_string();
                    self.require_column(target, &col)?;
                    self.consumed[j] = true;
                }
            }
        }
        Ok(())
    }

    fn parse_sources(&mut self) -> Result<(), BindError> {
        for k in 0..self.tokens.len() {
            if self.consumed[k] {
                continue;
            }
            let is_from = self.tokens[k].is_keyword("FROM");
            if is_from || self.tokens[k].is_keyword("JOIN") {
                self.consumed[k] = true;
                self.parse_table_list(k + 1, is_from)?;
            }
        }
        Ok(())
    }

    fn parse_table_list(&mut self, start: usize, allow_comma: bool) -> Result<(), BindError> {
        let mut i = start;
        loop {
            let Some(token) = self.tokens.get(i) else {
                return Ok(());
            };
            let depth = self.depth[i];

            if token.is_symbol("(") {
                let close = self.close_of(i);
                let (alias, next) = self.alias_at(close + 1);
                self.add_opaque(alias, depth);
                i = next;
            } else if token.ident().is_some() {
                let (name, next) = self.table_name_at(i)?;
                if self.tokens.get(next).is_some_and(|t| t.is_symbol("(")) {
                    // table-valued function such as json_each(...)
                    let close = self.close_of(next);
                    let (alias, after) = self.alias_at(close + 1);
                    self.add_opaque(alias, depth);
                    i = after;
                } else {
                    let (alias, after) = self.alias_at(next);
                    let idx = self.add_source(&name, alias, depth)?;
                    if let Some(table) = self.sources[idx].table.clone() {
                        self.read_set.insert(table);
                    }
                    i = after;
                }
            } else {
                return Ok(());
            }

            if self.tokens.get(i).is_some_and(|t| t.is_keyword("INDEXED")) {
                for j in i..(i + 3).min(self.tokens.len()) {
                    self.consumed[j] = true;
                }
                i += 3;
            } else if self.tokens.get(i).is_some_and(|t| t.is_keyword("NOT"))
                && self.tokens.get(i + 1).is_some_and(|t| t.is_keyword("INDEXED"))
            {
                i += 2;
            }

            if allow_comma && self.tokens.get(i).is_some_and(|t| t.is_symbol(",")) {
                i += 1;
                continue;
            }
            return Ok(());
        }
    }

    fn collect_aliases(&mut self) {
        for k in 1..self.tokens.len() {
            if self.consumed[k] {
                continue;
            }
            let Some(name) = bare_ident(&self.tokens[k]) else {
                continue;
            };
            if self.tokens.get(k + 1).is_some_and(|t| t.is_symbol("(") || t.is_symbol(".")) {
                continue;
            }
            let prev = &self.tokens[k - 1];
            let explicit = prev.is_keyword("AS");
            let implicit = ends_operand(prev) && !self.tokens[k - 1].is_symbol(".");
            if explicit || implicit {
                self.result_aliases.insert(name.to_ascii_lowercase());
                self.consumed[k] = true;
            }
        }
    }

    fn check_columns(&self) -> Result<(), BindError> {
        let mut k = 0;
        while k < self.tokens.len() {
            if self.consumed[k] {
                k += 1;
                continue;
            }
            let Some(name) = bare_ident(&self.tokens[k]).map(str::to_string) else {
                k += 1;
                continue;
            };
            let next = self.tokens.get(k + 1);

            if matches!(self.tokens[k].kind, TokenKind::Word(_)) && next.is_some_and(|t| t.is_symbol("(")) {
                k += 1;
                continue;
            }
            if k > 0 && (self.tokens[k - 1].is_keyword("COLLATE") || self.tokens[k - 1].is_symbol(".")) {
                k += 1;
                continue;
            }

            if next.is_some_and(|t| t.is_symbol(".")) {
                match self.tokens.get(k + 2) {
                    Some(t) if t.is_symbol("*") => self.resolve_qualifier(&name).map(|_| ())?,
                    Some(t) if t.ident().is_some() => {
                        let column = t.ident().unwrap_or_default().to_string();
                        self.check_qualified(&name, &column)?;
                    }
                    _ => return Err(BindError::Syntax(format!("dangling qualifier {name}."))),
                }
                k += 3;
                continue;
            }

            self.check_unqualified(&name)?;
            k += 1;
        }
        Ok(())
    }

    fn resolve_qualifier(&self, qualifier: &str) -> Result<Option<usize>, BindError> {
        let lower = qualifier.to_ascii_lowercase();
        if let Some(&idx) = self.qualifiers.get(&lower) {
            return Ok(Some(idx));
        }
        if lower == "main" || lower == "temp" {
            return Ok(None);
        }
        Err(BindError::UnknownTable(qualifier.to_string()))
    }

    fn require_column(&self, source: usize, column: &str) -> Result<(), BindError> {
        match self.entity(source) {
            Some(entity) if !entity.has_column(column) && !is_rowid(column) => {
                Err(BindError::UnknownColumn {
                    table: entity.table.clone(),
                    column: column.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn check_qualified(&self, qualifier: &str, column: &str) -> Result<(), BindError> {
        match self.resolve_qualifier(qualifier)? {
            Some(idx) => self.require_column(idx, column),
            None => Ok(()),
        }
    }

    fn check_unqualified(&self, column: &str) -> Result<(), BindError> {
        let lower = column.to_ascii_lowercase();
        if is_rowid(column) || self.result_aliases.contains(&lower) || self.cte_columns.contains(&lower) {
            return Ok(());
        }
        if self.sources.iter().any(|s| s.table.is_none()) {
            return Ok(());
        }
        let found = (0..self.sources.len())
            .filter_map(|i| self.entity(i))
            .any(|e| e.has_column(column));
        if found {
            return Ok(());
        }
        let tables: Vec<&str> = self
            .sources
            .iter()
            .filter_map(|s| s.table.as_deref())
            .collect();
        Err(BindError::UnknownColumn {
            table: if tables.is_empty() {
                "<no table>".to_string()
            } else {
                tables.join(", ")
            },
            column: column.to_string(),
        })
    }

    /// Match placeholders against the declared parameters and rewrite them to
    /// numbered form
    fn rewrite_placeholders(&self, template: &QueryTemplate) -> Result<(String, Vec<String>), BindError> {
        let mismatch = |found: Vec<String>| BindError::ParameterMismatch {
            expected: template.params.clone(),
            found,
        };

        let placeholders: Vec<(&Token, &Placeholder)> = self
            .tokens
            .iter()
            .filter_map(|t| match &t.kind {
                TokenKind::Param(p) => Some((t, p)),
                _ => None,
            })
            .collect();

        let named = placeholders.iter().filter(|(_, p)| matches!(p, Placeholder::Named(_))).count();
        if named != 0 && named != placeholders.len() {
            return Err(mismatch(vec!["<mixed named and positional placeholders>".to_string()]));
        }

        let mut sql = String::with_capacity(self.sql.len());
        let mut cursor = 0;
        let mut push = |sql: &mut String, token: &Token, replacement: String| {
            sql.push_str(&self.sql[cursor..token.start]);
            sql.push_str(&replacement);
            cursor = token.end;
        };

        if named > 0 {
            let mut order: Vec<String> = Vec::new();
            for &(_, p) in &placeholders {
                if let Placeholder::Named(name) = p {
                    if !order.contains(name) {
                        order.push(name.clone());
                    }
                }
            }
            if order != template.params {
                return Err(mismatch(order));
            }
            for &(token, p) in &placeholders {
                if let Placeholder::Named(name) = p {
                    let position = order.iter().position(|n| n == name).unwrap_or(0) + 1;
                    push(&mut sql, token, format!("?{position}"));
                }
            }
        } else {
            let mut next_anonymous = 0;
            let mut numbers = BTreeSet::new();
            for &(token, p) in &placeholders {
                match p {
                    Placeholder::Anonymous => {
                        next_anonymous += 1;
                        numbers.insert(next_anonymous);
                        push(&mut sql, token, format!("?{next_anonymous}"));
                    }
                    Placeholder::Numbered(n) => {
                        numbers.insert(*n);
                        next_anonymous = next_anonymous.max(*n);
                    }
                    Placeholder::Named(_) => {}
                }
            }
            let contiguous = numbers.iter().copied().eq(1..=template.params.len());
            if !contiguous {
                return Err(mismatch(numbers.iter().map(|n| format!("?{n}")).collect()));
            }
        }
        sql.push_str(&self.sql[cursor..]);
        Ok((sql, template.params.clone()))
    }

    /// Index range `(start, end)` of the select list of the SELECT at `sel`
    fn select_list(&self, sel: usize) -> (usize, usize) {
        let depth = self.depth[sel];
        let mut start = sel + 1;
        while self
            .tokens
            .get(start)
            .is_some_and(|t| t.is_keyword("DISTINCT") || t.is_keyword("ALL"))
        {
            start += 1;
        }
        let end = (start..self.tokens.len())
            .find(|&j| {
                self.depth[j] == depth
                    && CLAUSE_ENDS.iter().any(|kw| self.tokens[j].is_keyword(kw))
            })
            .unwrap_or(self.tokens.len());
        (start, end)
    }

    /// Split `start..end` at commas on the same depth
    fn split_items(&self, start: usize, end: usize) -> Vec<(usize, usize)> {
        let Some(depth) = self.depth.get(start).copied() else {
            return Vec::new();
        };
        let mut items = Vec::new();
        let mut item_start = start;
        for j in start..end {
            if self.depth[j] == depth && self.tokens[j].is_symbol(",") {
                items.push((item_start, j));
                item_start = j + 1;
            }
        }
        if item_start < end {
            items.push((item_start, end));
        }
        items
    }

    fn item_name(&self, start: usize, end: usize) -> String {
        let len = end - start;
        let last = &self.tokens[end - 1];
        if len >= 2 {
            let prev = &self.tokens[end - 2];
            let aliased = prev.is_keyword("AS") || (ends_operand(prev) && !prev.is_symbol("."));
            if aliased {
                if let Some(alias) = bare_ident(last) {
                    return alias.to_string();
                }
            }
        }
        if len == 1 || (len == 3 && self.tokens[start + 1].is_symbol(".")) {
            if let Some(name) = last.ident() {
                return name.to_string();
            }
        }
        self.sql[self.tokens[start].start..last.end].to_string()
    }

    fn expand_star(&self, sources: &[usize], columns: &mut Vec<String>) -> bool {
        for &idx in sources {
            match self.entity(idx) {
                Some(entity) => columns.extend(entity.column_names().map(str::to_string)),
                None => return false,
            }
        }
        true
    }

    fn select_columns(&self, main: usize) -> Option<Vec<String>> {
        if !self.tokens[main].is_keyword("SELECT") {
            return None;
        }
        let (start, end) = self.select_list(main);
        let depth = self.depth[main];
        let scope: Vec<usize> = (0..self.sources.len())
            .filter(|&i| self.sources[i].depth == depth && Some(i) != self.target)
            .collect();

        let mut columns = Vec::new();
        for (s, e) in self.split_items(start, end) {
            if e - s == 1 && self.tokens[s].is_symbol("*") {
                if !self.expand_star(&scope, &mut columns) {
                    return None;
                }
            } else if e - s == 3 && self.tokens[s + 2].is_symbol("*") {
                let qualifier = self.tokens[s].ident()?;
                let idx = self.qualifiers.get(&qualifier.to_ascii_lowercase()).copied()?;
                if !self.expand_star(&[idx], &mut columns) {
                    return None;
                }
            } else {
                columns.push(self.item_name(s, e));
            }
        }
        Some(columns)
    }

    fn returning_columns(&self, at: usize) -> Option<Vec<String>> {
        let target = self.target?;
        let mut columns = Vec::new();
        for (s, e) in self.split_items(at + 1, self.tokens.len()) {
            if e - s == 1 && self.tokens[s].is_symbol("*") {
                if !self.expand_star(&[target], &mut columns) {
                    return None;
                }
            } else {
                columns.push(self.item_name(s, e));
            }
        }
        Some(columns)
    }

    fn row_guarantee(&self, kind: StatementKind, main: usize) -> RowGuarantee {
        let depth = self.depth[main];

        if let Some(limit) = self.find_at_depth(main, depth, "LIMIT") {
            let bounded = matches!(
                self.tokens.get(limit + 1).map(|t| &t.kind),
                Some(TokenKind::Number(n)) if n == "1" || n == "0"
            );
            let has_offset_comma = self.tokens.get(limit + 2).is_some_and(|t| t.is_symbol(","));
            if bounded && !has_offset_comma {
                return RowGuarantee::AtMostOne("LIMIT 1");
            }
        }

        match kind {
            StatementKind::Select => {
                if !self.tokens[main].is_keyword("SELECT") {
                    return RowGuarantee::Unchecked;
                }
                if self.is_plain_aggregate(main) {
                    return RowGuarantee::AtMostOne("aggregate without GROUP BY");
                }
                let scope: Vec<usize> = (0..self.sources.len())
                    .filter(|&i| self.sources[i].depth == depth)
                    .collect();
                let has_join = (main..self.tokens.len())
                    .any(|j| self.depth[j] == depth && self.tokens[j].is_keyword("JOIN"));
                if scope.len() == 1 && !has_join && self.where_pins_unique_key(main, scope[0]) {
                    return RowGuarantee::AtMostOne("unique key equality");
                }
                RowGuarantee::Unchecked
            }
            StatementKind::Update | StatementKind::Delete => match self.target {
                Some(t) if self.where_pins_unique_key(main, t) => {
                    RowGuarantee::AtMostOne("unique key equality")
                }
                _ => RowGuarantee::Unchecked,
            },
            StatementKind::Insert => {
                let Some(values) = self.find_at_depth(main, depth, "VALUES") else {
                    return RowGuarantee::Unchecked;
                };
                let tuples = (values + 1..self.tokens.len())
                    .filter(|&j| self.depth[j] == depth && self.tokens[j].is_symbol("("))
                    .count();
                let more = (values + 1..self.tokens.len())
                    .any(|j| self.depth[j] == depth && self.tokens[j].is_symbol(","));
                if tuples == 1 && !more {
                    RowGuarantee::AtMostOne("single VALUES row")
                } else {
                    RowGuarantee::Unchecked
                }
            }
        }
    }

    fn is_plain_aggregate(&self, main: usize) -> bool {
        let depth = self.depth[main];
        if self.find_at_depth(main, depth, "GROUP").is_some() {
            return false;
        }
        let (start, end) = self.select_list(main);
        let items = self.split_items(start, end);
        !items.is_empty()
            && items.iter().all(|&(s, e)| {
                let is_aggregate = matches!(&self.tokens[s].kind, TokenKind::Word(w)
                    if AGGREGATES.iter().any(|a| a.eq_ignore_ascii_case(w)));
                if !is_aggregate || !self.tokens.get(s + 1).is_some_and(|t| t.is_symbol("(")) {
                    return false;
                }
                let close = self.close_of(s + 1);
                // nothing after the call but an optional alias
                e == close + 1 || e == close + 2 || (e == close + 3 && self.tokens[close + 1].is_keyword("AS"))
            })
    }

    /// True when the WHERE clause at the statement's depth is a conjunction
    /// pinning every column of a unique key of `source` to a value
    fn where_pins_unique_key(&self, main: usize, source: usize) -> bool {
        let Some(entity) = self.entity(source) else {
            return false;
        };
        let depth = self.depth[main];
        let Some(where_at) = self.find_at_depth(main, depth, "WHERE") else {
            return false;
        };
        let end = (where_at + 1..self.tokens.len())
            .find(|&j| {
                self.depth[j] == depth
                    && ["GROUP", "ORDER", "LIMIT", "RETURNING", "WINDOW", "UNION", "INTERSECT", "EXCEPT"]
                        .iter()
                        .any(|kw| self.tokens[j].is_keyword(kw))
            })
            .unwrap_or(self.tokens.len());

        let clause = where_at + 1..end;
        if clause
            .clone()
            .any(|j| self.tokens[j].is_keyword("OR") || (self.depth[j] > depth && self.tokens[j].is_keyword("SELECT")))
        {
            return false;
        }

        let is_value = |t: &Token| {
            matches!(
                t.kind,
                TokenKind::Param(_) | TokenKind::Number(_) | TokenKind::Str(_) | TokenKind::Blob
            )
        };
        // column token at `j`, possibly preceded by `qualifier .`
        let column_at = |j: usize| -> Option<String> {
            let token = self.tokens.get(j)?;
            if j >= 2 && self.tokens[j - 1].is_symbol(".") {
                let q = self.tokens[j - 2].ident()?.to_ascii_lowercase();
                if self.qualifiers.get(&q) != Some(&source) {
                    return None;
                }
            }
            bare_ident(token).map(str::to_ascii_lowercase)
        };

        let mut pinned = HashSet::new();
        for j in clause {
            let tok = &self.tokens[j];
            if self.depth[j] != depth || !(tok.is_symbol("=") || tok.is_symbol("==")) {
                continue;
            }
            let left_value = j > 0 && is_value(&self.tokens[j - 1]);
            let right_value = self.tokens.get(j + 1).is_some_and(is_value);
            if right_value && j > 0 {
                if let Some(col) = column_at(j - 1) {
                    pinned.insert(col);
                }
            }
            if left_value {
                let qualified = self.tokens.get(j + 2).is_some_and(|t| t.is_symbol("."));
                if let Some(col) = column_at(if qualified { j + 3 } else { j + 1 }) {
                    pinned.insert(col);
                }
            }
        }

        entity
            .unique_column_sets()
            .iter()
            .any(|set| set.iter().all(|c| pinned.contains(&c.to_ascii_lowercase())))
    }
}

fn check_shape(
    shape: ReturnShape,
    kind: StatementKind,
    returns_rows: bool,
    columns: Option<&[String]>,
) -> Result<(), BindError> {
    let fail = |reason: String| Err(BindError::ShapeMismatch { shape, reason });
    match shape {
        ReturnShape::Affected if !kind.is_write() => {
            fail("a SELECT does not report affected rows".to_string())
        }
        ReturnShape::Scalar | ReturnShape::Single | ReturnShape::Many if !returns_rows => {
            fail("statement returns no rows; add RETURNING or declare `affected`".to_string())
        }
        ReturnShape::Scalar => match columns {
            Some(cols) if cols.len() != 1 => {
                fail(format!("scalar query selects {} columns", cols.len()))
            }
            _ => Ok(()),
        },
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDescriptor, ForeignKeyAction, SchemaRegistry};
    use std::sync::Arc;

    fn snapshot() -> Arc<SchemaSnapshot> {
        let mut registry = SchemaRegistry::new(1);
        registry
            .register(
                EntityDescriptor::builder("person")
                    .column(ColumnDescriptor::integer("id"))
                    .column(ColumnDescriptor::text("name"))
                    .column(ColumnDescriptor::integer("age"))
                    .column(ColumnDescriptor::text("email").nullable())
                    .primary_key(["id"])
                    .auto_increment()
                    .unique("idx_person_email", ["email"])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                EntityDescriptor::builder("pet")
                    .column(ColumnDescriptor::integer("id"))
                    .column(ColumnDescriptor::text("name"))
                    .column(
                        ColumnDescriptor::integer("owner_id")
                            .references("person", "id")
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .primary_key(["id"])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry.seal().unwrap()
    }

    fn run(sql: &str, shape: ReturnShape, params: &[&str]) -> Result<Analysis, BindError> {
        let template = QueryTemplate::new(sql, shape).params(params.iter().copied());
        analyze(&template, &snapshot())
    }

    #[test]
    fn test_select_with_named_param() {
        let a = run("SELECT * FROM person WHERE age > :minAge", ReturnShape::Many, &["minAge"]).unwrap();
        assert_eq!(a.kind, StatementKind::Select);
        assert_eq!(a.sql, "SELECT * FROM person WHERE age > ?1");
        assert_eq!(a.read_set.iter().collect::<Vec<_>>(), vec!["person"]);
        assert!(a.write_set.is_empty());
        assert_eq!(a.result_columns.unwrap(), vec!["id", "name", "age", "email"]);
        assert_eq!(a.row_guarantee, RowGuarantee::Unchecked);
    }

    #[test]
    fn test_unknown_table_and_column() {
        let err = run("SELECT * FROM people", ReturnShape::Many, &[]).unwrap_err();
        assert_eq!(err, BindError::UnknownTable("people".into()));

        let err = run("SELECT nickname FROM person", ReturnShape::Many, &[]).unwrap_err();
        assert!(matches!(err, BindError::UnknownColumn { ref column, .. } if column == "nickname"));

        let err = run("SELECT p.nickname FROM person p", ReturnShape::Many, &[]).unwrap_err();
        assert!(matches!(err, BindError::UnknownColumn { ref table, .. } if table == "person"));

        let err = run("SELECT x.name FROM person p", ReturnShape::Many, &[]).unwrap_err();
        assert_eq!(err, BindError::UnknownTable("x".into()));
    }

    #[test]
    fn test_join_aliases_functions_and_result_aliases() {
        let a = run(
            "SELECT p.name AS owner, COUNT(*) n, lower(pet.name) FROM person AS p \
             LEFT JOIN pet ON pet.owner_id = p.id GROUP BY p.id ORDER BY n DESC, owner COLLATE NOCASE",
            ReturnShape::Many,
            &[],
        )
        .unwrap();
        assert_eq!(a.read_set.len(), 2);
        let cols = a.result_columns.unwrap();
        assert_eq!(cols[0], "owner");
        assert_eq!(cols[1], "n");
        assert_eq!(cols[2], "lower(pet.name)");
    }

    #[test]
    fn test_subquery_and_cte() {
        run(
            "SELECT name FROM person WHERE id IN (SELECT owner_id FROM pet WHERE name = :pet)",
            ReturnShape::Many,
            &["pet"],
        )
        .unwrap();

        let a = run(
            "WITH adults(pid) AS (SELECT id FROM person WHERE age >= 18) SELECT pid FROM adults",
            ReturnShape::Many,
            &[],
        )
        .unwrap();
        assert_eq!(a.read_set.iter().collect::<Vec<_>>(), vec!["person"]);
    }

    #[test]
    fn test_parameter_order_and_count() {
        let err = run("SELECT * FROM person WHERE age > :a AND name = :b", ReturnShape::Many, &["b", "a"])
            .unwrap_err();
        assert!(matches!(err, BindError::ParameterMismatch { .. }));

        let err = run("SELECT * FROM person WHERE age > ?", ReturnShape::Many, &[]).unwrap_err();
        assert!(matches!(err, BindError::ParameterMismatch { .. }));

        let err = run("SELECT * FROM person WHERE age > ? AND name = :n", ReturnShape::Many, &["a", "n"])
            .unwrap_err();
        assert!(matches!(err, BindError::ParameterMismatch { .. }));

        let a = run("SELECT * FROM person WHERE age > ? AND age < ?", ReturnShape::Many, &["lo", "hi"]).unwrap();
        assert_eq!(a.sql, "SELECT * FROM person WHERE age > ?1 AND age < ?2");

        let a = run(
            "SELECT * FROM person WHERE name = :n OR email = :n",
            ReturnShape::Many,
            &["n"],
        )
        .unwrap();
        assert_eq!(a.sql, "SELECT * FROM person WHERE name = ?1 OR email = ?1");
    }

    #[test]
    fn test_write_statements() {
        let a = run(
            "INSERT INTO person (name, age) VALUES (:name, :age)",
            ReturnShape::Affected,
            &["name", "age"],
        )
        .unwrap();
        assert_eq!(a.kind, StatementKind::Insert);
        assert!(a.read_set.is_empty());
        assert_eq!(a.write_set.iter().collect::<Vec<_>>(), vec!["person"]);

        let a = run(
            "INSERT OR REPLACE INTO person (id, name, age) VALUES (?, ?, ?)",
            ReturnShape::Affected,
            &["id", "name", "age"],
        )
        .unwrap();
        assert_eq!(a.write_set.iter().collect::<Vec<_>>(), vec!["person", "pet"]);

        let a = run("REPLACE INTO person (id, name, age) VALUES (?, ?, ?)", ReturnShape::Affected, &["id", "name", "age"])
            .unwrap();
        assert_eq!(a.write_set.iter().collect::<Vec<_>>(), vec!["person", "pet"]);

        let a = run("DELETE FROM person WHERE id = ?", ReturnShape::Affected, &["id"]).unwrap();
        assert_eq!(a.write_set.iter().collect::<Vec<_>>(), vec!["person", "pet"]);

        let err = run("INSERT INTO person (nick) VALUES (?)", ReturnShape::Affected, &["nick"]).unwrap_err();
        assert!(matches!(err, BindError::UnknownColumn { .. }));

        let a = run("UPDATE pet SET name = :name WHERE id = :id", ReturnShape::Affected, &["name", "id"]).unwrap();
        assert_eq!(a.write_set.iter().collect::<Vec<_>>(), vec!["pet"]);

        let a = run(
            "DELETE FROM pet WHERE owner_id IN (SELECT id FROM person WHERE age < 3)",
            ReturnShape::Affected,
            &[],
        )
        .unwrap();
        assert_eq!(a.read_set.iter().collect::<Vec<_>>(), vec!["person"]);
        assert_eq!(a.write_set.iter().collect::<Vec<_>>(), vec!["pet"]);
    }

    #[test]
    fn test_upsert_excluded() {
        let a = run(
            "INSERT INTO person (id, name, age) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            ReturnShape::Affected,
            &["id", "name", "age"],
        )
        .unwrap();
        assert_eq!(a.write_set.iter().collect::<Vec<_>>(), vec!["person", "pet"]);

        let a = run(
            "INSERT INTO person (id, name, age) VALUES (?, ?, ?) ON CONFLICT DO NOTHING",
            ReturnShape::Affected,
            &["id", "name", "age"],
        )
        .unwrap();
        assert_eq!(a.write_set.iter().collect::<Vec<_>>(), vec!["person"]);
    }

    #[test]
    fn test_shape_checks() {
        let err = run("SELECT * FROM person", ReturnShape::Affected, &[]).unwrap_err();
        assert!(matches!(err, BindError::ShapeMismatch { .. }));

        let err = run("DELETE FROM person", ReturnShape::Many, &[]).unwrap_err();
        assert!(matches!(err, BindError::ShapeMismatch { .. }));

        let err = run("SELECT name, age FROM person", ReturnShape::Scalar, &[]).unwrap_err();
        assert!(matches!(err, BindError::ShapeMismatch { .. }));

        let a = run("DELETE FROM person WHERE id = ? RETURNING name", ReturnShape::Single, &["id"]).unwrap();
        assert_eq!(a.result_columns.unwrap(), vec!["name"]);
        assert!(a.row_guarantee.is_proven());
    }

    #[test]
    fn test_row_guarantee() {
        let by_pk = run("SELECT * FROM person WHERE id = :id", ReturnShape::Single, &["id"]).unwrap();
        assert_eq!(by_pk.row_guarantee, RowGuarantee::AtMostOne("unique key equality"));

        let by_unique = run("SELECT * FROM person p WHERE :e = p.email", ReturnShape::Single, &["e"]).unwrap();
        assert!(by_unique.row_guarantee.is_proven());

        let limited = run("SELECT * FROM person ORDER BY age LIMIT 1", ReturnShape::Single, &[]).unwrap();
        assert_eq!(limited.row_guarantee, RowGuarantee::AtMostOne("LIMIT 1"));

        let counted = run("SELECT COUNT(*) AS total FROM person", ReturnShape::Scalar, &[]).unwrap();
        assert!(counted.row_guarantee.is_proven());

        let with_or = run(
            "SELECT * FROM person WHERE id = :id OR age = 3",
            ReturnShape::Single,
            &["id"],
        )
        .unwrap();
        assert_eq!(with_or.row_guarantee, RowGuarantee::Unchecked);

        let by_name = run("SELECT * FROM person WHERE name = ?", ReturnShape::Single, &["n"]).unwrap();
        assert_eq!(by_name.row_guarantee, RowGuarantee::Unchecked);
    }

    #[test]
    fn test_rejects_ddl_and_multiple_statements() {
        let err = run("DROP TABLE person", ReturnShape::Affected, &[]).unwrap_err();
        assert!(matches!(err, BindError::UnsupportedStatement(_)));

        let err = run("DELETE FROM person; DELETE FROM pet", ReturnShape::Affected, &[]).unwrap_err();
        assert!(matches!(err, BindError::UnsupportedStatement(_)));

        run("DELETE FROM person;", ReturnShape::Affected, &[]).unwrap();

        let err = run("SELECT (name FROM person", ReturnShape::Many, &[]).unwrap_err();
        assert!(matches!(err, BindError::Syntax(_)));
    }
}
