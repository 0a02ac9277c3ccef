//! Deterministic rewrites of model-generated SQL
//!
//! All rewrites work on the `sqlparser` token stream and splice replacements
//! into the original text, so identifiers inside string literals, comments or
//! longer identifiers are never touched and untouched text is kept verbatim.
//!
//! - `SUM|AVG|MIN|MAX(col)` gets `col::numeric` when `col` is stored as text
//! - `COUNT(DISTINCT *)` becomes `COUNT(DISTINCT ROW(c1, c2, ...))`
//! - bare references to the stored table can be swapped for a subquery
//! - `* EXCEPT (...)` is expanded, trailing `EXCEPT` set operations dropped
//!
//! When the text can't be tokenized it is returned unchanged.
//!
//! Before execution, `ensure_scoped_to` walks the parsed statement and rejects
//! any relation other than the caller's table or a CTE in scope.

use crate::error::{AnalystError, Result};
use crate::table_store::{quote_ident, ColumnSchema};
use sqlparser::ast::{Expr, Ident, ObjectName, Query, SetExpr, Statement, Visit, Visitor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer, Word};
use std::collections::HashMap;
use std::ops::ControlFlow;
use tracing::{debug, warn};

const NUMERIC_AGGREGATES: [&str; 4] = ["SUM", "AVG", "MIN", "MAX"];
const WRITE_KEYWORDS: [&str; 10] = [
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE", "COPY",
];
/// Functions that run SQL given as text, touch session settings or reach the server's files.
const BLOCKED_FUNCTIONS: [&str; 14] = [
    "set_config",
    "query_to_xml",
    "query_to_xmlschema",
    "query_to_xml_and_xmlschema",
    "table_to_xml",
    "cursor_to_xml",
    "dblink",
    "dblink_exec",
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_stat_file",
    "lo_import",
    "lo_export",
];

/// Trim whitespace and trailing semicolons.
pub fn trim_statement(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

/// Accept exactly one plain query. Anything else is an execution error.
pub fn ensure_read_only(sql: &str) -> Result<()> {
    let sql = trim_statement(sql);
    let rejected = |why: &str| Err(AnalystError::Execution(format!("Only read-only SELECT queries are allowed ({})", why)));

    match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
        Ok(statements) => {
            if statements.len() != 1 {
                return rejected("multiple statements");
            }
            match &statements[0] {
                Statement::Query(query) => {
                    if let SetExpr::Select(select) = query.body.as_ref() {
                        if select.into.is_some() {
                            return rejected("SELECT INTO");
                        }
                    }
                    if !query.locks.is_empty() {
                        return rejected("row locking");
                    }
                    Ok(())
                }
                _ => rejected("not a query"),
            }
        }
        Err(e) => {
            debug!("SQL parse failed ({}), checking keywords", e);
            let Some(lexed) = Lexed::new(sql) else {
                return rejected("unreadable SQL");
            };
            let words: Vec<String> = lexed
                .tokens
                .iter()
                .filter_map(|t| match t {
                    Token::Word(w) if w.quote_style.is_none() => Some(w.value.to_uppercase()),
                    _ => None,
                })
                .collect();
            let starts_ok = matches!(words.first().map(String::as_str), Some("SELECT") | Some("WITH"));
            let has_write = words.iter().any(|w| WRITE_KEYWORDS.contains(&w.as_str()));
            let has_separator = lexed.tokens.iter().any(|t| matches!(t, Token::SemiColon));
            if starts_ok && !has_write && !has_separator {
                Ok(())
            } else {
                rejected("not a SELECT")
            }
        }
    }
}

/// Accept only statements whose relations are `allowed` tables or CTEs
/// defined in an enclosing query. Unparsable text is rejected, since its
/// relations can't be checked.
pub fn ensure_scoped_to(sql: &str, allowed: &[&str]) -> Result<()> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, trim_statement(sql))
        .map_err(|e| AnalystError::Execution(format!("Could not verify which tables the query reads ({})", e)))?;
    let mut scope = RelationScope {
        allowed: allowed.iter().map(|t| t.to_lowercase()).collect(),
        ctes: Vec::new(),
    };
    match statements.visit(&mut scope) {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(why) => {
            warn!("Rejected generated SQL: {}", why);
            Err(AnalystError::Execution(why))
        }
    }
}

/// Allowed table names plus one frame of CTE names per enclosing query.
struct RelationScope {
    allowed: Vec<String>,
    ctes: Vec<Vec<String>>,
}

impl Visitor for RelationScope {
    type Break = String;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        let Some(with) = &query.with else {
            self.ctes.push(Vec::new());
            return ControlFlow::Continue(());
        };
        let names: Vec<String> = with.cte_tables.iter().map(|cte| normalized(&cte.alias.name)).collect();

        // A CTE body sees earlier CTEs only; a same-named relation inside it
        // is the real table. WITH RECURSIVE makes every name visible.
        for (i, cte) in with.cte_tables.iter().enumerate() {
            let visible = if with.recursive { names.clone() } else { names[..i].to_vec() };
            let mut inner = RelationScope { allowed: self.allowed.clone(), ctes: self.ctes.clone() };
            inner.ctes.push(visible);
            if let ControlFlow::Break(why) = cte.query.visit(&mut inner) {
                return ControlFlow::Break(why);
            }
        }

        self.ctes.push(names);
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.ctes.pop();
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        let known = match relation.0.as_slice() {
            [ident] => {
                let name = normalized(ident);
                self.allowed.contains(&name) || self.ctes.iter().flatten().any(|cte| *cte == name)
            }
            _ => false,
        };
        if known {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(format!("Queries may only read the uploaded table, not {}", relation))
        }
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if let Expr::Function(function) = expr {
            if let Some(last) = function.name.0.last() {
                let name = last.value.to_lowercase();
                if BLOCKED_FUNCTIONS.contains(&name.as_str()) {
                    return ControlFlow::Break(format!("Function {} is not allowed", name));
                }
            }
        }
        ControlFlow::Continue(())
    }
}

/// Unquoted identifiers fold to lower case, as Postgres does.
fn normalized(ident: &Ident) -> String {
    match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_lowercase(),
    }
}

/// Rewrites applied to every generated statement before execution.
#[derive(Debug, Clone, Default)]
pub struct SqlPatcher {
    column_types: HashMap<String, String>,
    data_columns: Vec<String>,
    substitution: Option<(String, String)>,
}

impl SqlPatcher {
    /// `schema` is the stored table's full column list; system columns are
    /// kept for casting but left out of `COUNT(DISTINCT ROW(...))`.
    pub fn new(schema: &[ColumnSchema]) -> Self {
        Self {
            column_types: schema.iter().map(|c| (c.name.clone(), c.data_type.clone())).collect(),
            data_columns: schema.iter().filter(|c| !c.is_system()).map(|c| c.name.clone()).collect(),
            substitution: None,
        }
    }

    /// Replace bare references to `table` with `(subquery)`.
    pub fn with_substitution(mut self, table: impl Into<String>, subquery: impl Into<String>) -> Self {
        self.substitution = Some((table.into(), subquery.into()));
        self
    }

    pub fn patch(&self, sql: &str) -> String {
        let mut patched = inject_numeric_casts(sql, &self.column_types);
        patched = rewrite_count_distinct_star(&patched, &self.data_columns);
        if let Some((table, subquery)) = &self.substitution {
            patched = substitute_table(&patched, table, subquery);
        }
        if patched != sql {
            debug!("Patched SQL: {}", patched);
        }
        patched
    }
}

pub fn inject_numeric_casts(sql: &str, column_types: &HashMap<String, String>) -> String {
    let Some(lexed) = Lexed::new(sql) else { return sql.to_string() };
    let mut edits = Vec::new();

    for (i, token) in lexed.tokens.iter().enumerate() {
        let Token::Word(func) = token else { continue };
        if func.quote_style.is_some() || !NUMERIC_AGGREGATES.contains(&func.value.to_uppercase().as_str()) {
            continue;
        }
        let Some(open) = lexed.next_significant(i).filter(|&j| lexed.tokens[j] == Token::LParen) else { continue };
        let Some(mut col) = lexed.next_significant(open) else { continue };
        // Qualified `t.col`: the column is the word after the period.
        if let Some(dot) = lexed.next_significant(col).filter(|&j| lexed.tokens[j] == Token::Period) {
            match lexed.next_significant(dot) {
                Some(j) => col = j,
                None => continue,
            }
        }
        let Token::Word(column) = &lexed.tokens[col] else { continue };
        if lexed.next_significant(col).map(|j| &lexed.tokens[j]) != Some(&Token::RParen) {
            continue;
        }
        if lookup_type(column_types, column).map(is_textual_type).unwrap_or(false) {
            edits.push(Edit::single(col, format!("{}::numeric", lexed.text(col))));
        }
    }

    lexed.render(edits)
}

pub fn rewrite_count_distinct_star(sql: &str, columns: &[String]) -> String {
    if columns.is_empty() {
        return sql.to_string();
    }
    let Some(lexed) = Lexed::new(sql) else { return sql.to_string() };
    let row_expr = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let mut edits = Vec::new();

    for (i, token) in lexed.tokens.iter().enumerate() {
        let Token::Word(func) = token else { continue };
        if func.quote_style.is_some() || !func.value.eq_ignore_ascii_case("COUNT") {
            continue;
        }
        let Some(seq) = lexed.significant_run(i, 4) else { continue };
        let matches = lexed.tokens[seq[0]] == Token::LParen
            && matches!(&lexed.tokens[seq[1]], Token::Word(w) if w.keyword == Keyword::DISTINCT)
            && lexed.tokens[seq[2]] == Token::Mul
            && lexed.tokens[seq[3]] == Token::RParen;
        if matches {
            edits.push(Edit {
                first: i,
                last: seq[3],
                replacement: format!("{}(DISTINCT ROW({}))", lexed.text(i), row_expr),
            });
        }
    }

    lexed.render(edits)
}

/// Swap bare `table` references (not `x.table`, not `table.col`) for the
/// subquery. A name in alias position, after `AS` or `)`, is left alone.
pub fn substitute_table(sql: &str, table: &str, subquery: &str) -> String {
    let Some(lexed) = Lexed::new(sql) else { return sql.to_string() };
    let mut edits = Vec::new();

    for (i, token) in lexed.tokens.iter().enumerate() {
        let Token::Word(word) = token else { continue };
        if !identifier_matches(word, table) {
            continue;
        }
        let prev = lexed.prev_significant(i).map(|j| &lexed.tokens[j]);
        let next = lexed.next_significant(i).map(|j| &lexed.tokens[j]);
        if prev == Some(&Token::Period) || next == Some(&Token::Period) {
            continue;
        }
        let is_alias = matches!(prev, Some(Token::RParen))
            || matches!(prev, Some(Token::Word(w)) if w.keyword == Keyword::AS);
        if is_alias {
            continue;
        }
        let has_alias = matches!(next, Some(Token::Word(w)) if w.keyword == Keyword::AS || w.keyword == Keyword::NoKeyword);
        let replacement = if has_alias {
            format!("({})", subquery)
        } else {
            format!("({}) AS {}", subquery, table)
        };
        edits.push(Edit::single(i, replacement));
    }

    lexed.render(edits)
}

/// Expand `* EXCEPT (a, b)` against `columns` and drop a top-level
/// `EXCEPT` set operation together with everything after it.
pub fn strip_except(sql: &str, columns: &[String]) -> String {
    let Some(lexed) = Lexed::new(sql) else { return sql.to_string() };
    let mut edits = Vec::new();
    let mut depth = 0i32;
    let mut i = 0;

    while i < lexed.tokens.len() {
        match &lexed.tokens[i] {
            Token::LParen => depth += 1,
            Token::RParen => depth -= 1,
            Token::Word(w) if w.keyword == Keyword::EXCEPT => {
                let star = lexed.prev_significant(i).filter(|&j| lexed.tokens[j] == Token::Mul);
                let open = lexed.next_significant(i).filter(|&j| lexed.tokens[j] == Token::LParen);
                if let (Some(star), Some(open)) = (star, open) {
                    let Some(close) = lexed.matching_paren(open) else { break };
                    let excluded: Vec<&str> = lexed.tokens[open..close]
                        .iter()
                        .filter_map(|t| match t {
                            Token::Word(w) => Some(w.value.as_str()),
                            _ => None,
                        })
                        .collect();
                    let kept: Vec<String> = columns
                        .iter()
                        .filter(|c| !excluded.iter().any(|e| e.eq_ignore_ascii_case(c)))
                        .map(|c| quote_ident(c))
                        .collect();
                    let replacement = if kept.is_empty() || columns.is_empty() {
                        "*".to_string()
                    } else {
                        kept.join(", ")
                    };
                    edits.push(Edit { first: star, last: close, replacement });
                    i = close + 1;
                    continue;
                }
                if depth == 0 {
                    edits.push(Edit { first: i, last: lexed.tokens.len() - 1, replacement: String::new() });
                    break;
                }
            }
            _ => {}
        }
        i += 1;
    }

    lexed.render(edits).trim().to_string()
}

fn is_textual_type(data_type: &str) -> bool {
    let ty = data_type.to_lowercase();
    ty.contains("text") || ty.contains("character")
}

fn identifier_matches(word: &Word, name: &str) -> bool {
    match word.quote_style {
        Some('"') => word.value == name,
        Some(_) => false,
        None => word.value.eq_ignore_ascii_case(name),
    }
}

/// Quoted identifiers match exactly, bare ones case-insensitively.
fn lookup_type<'a>(column_types: &'a HashMap<String, String>, word: &Word) -> Option<&'a str> {
    if let Some(ty) = column_types.get(&word.value) {
        return Some(ty);
    }
    if word.quote_style.is_some() {
        return None;
    }
    column_types
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(&word.value))
        .map(|(_, ty)| ty.as_str())
}

/// Replace tokens `first..=last` with `replacement`.
struct Edit {
    first: usize,
    last: usize,
    replacement: String,
}

impl Edit {
    fn single(index: usize, replacement: String) -> Self {
        Self { first: index, last: index, replacement }
    }
}

/// Token stream plus the byte offset each token starts at.
struct Lexed<'a> {
    sql: &'a str,
    tokens: Vec<Token>,
    starts: Vec<usize>,
}

impl<'a> Lexed<'a> {
    fn new(sql: &'a str) -> Option<Self> {
        let dialect = PostgreSqlDialect {};
        let located = match Tokenizer::new(&dialect, sql).tokenize_with_location() {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!("Could not tokenize SQL, leaving it unpatched: {}", e);
                return None;
            }
        };

        let mut line_starts = vec![0usize];
        line_starts.extend(sql.match_indices('\n').map(|(i, _)| i + 1));

        let mut tokens = Vec::with_capacity(located.len());
        let mut starts = Vec::with_capacity(located.len());
        for item in located {
            let line = usize::try_from(item.location.line).ok()?.checked_sub(1)?;
            let column = usize::try_from(item.location.column).ok()?.checked_sub(1)?;
            let line_start = *line_starts.get(line)?;
            let offset = sql[line_start..]
                .char_indices()
                .nth(column)
                .map(|(i, _)| line_start + i)
                .unwrap_or(sql.len());
            tokens.push(item.token);
            starts.push(offset);
        }
        Some(Self { sql, tokens, starts })
    }

    fn end(&self, i: usize) -> usize {
        self.starts.get(i + 1).copied().unwrap_or(self.sql.len())
    }

    fn text(&self, i: usize) -> &'a str {
        &self.sql[self.starts[i]..self.end(i)]
    }

    fn is_significant(token: &Token) -> bool {
        !matches!(token, Token::Whitespace(_))
    }

    fn next_significant(&self, from: usize) -> Option<usize> {
        (from + 1..self.tokens.len()).find(|&j| Self::is_significant(&self.tokens[j]))
    }

    fn prev_significant(&self, before: usize) -> Option<usize> {
        (0..before).rev().find(|&j| Self::is_significant(&self.tokens[j]))
    }

    /// Indices of the next `n` significant tokens after `from`.
    fn significant_run(&self, from: usize, n: usize) -> Option<Vec<usize>> {
        let mut run = Vec::with_capacity(n);
        let mut at = from;
        for _ in 0..n {
            at = self.next_significant(at)?;
            run.push(at);
        }
        Some(run)
    }

    fn matching_paren(&self, open: usize) -> Option<usize> {
        let mut depth = 0i32;
        for j in open..self.tokens.len() {
            match self.tokens[j] {
                Token::LParen => depth += 1,
                Token::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(j);
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn render(&self, mut edits: Vec<Edit>) -> String {
        if edits.is_empty() {
            return self.sql.to_string();
        }
        edits.sort_by_key(|e| e.first);
        let mut out = String::with_capacity(self.sql.len());
        let mut cursor = 0usize;
        for edit in edits {
            if edit.first < cursor {
                continue;
            }
            out.push_str(&self.sql[self.start_of(cursor)..self.starts[edit.first]]);
            out.push_str(&edit.replacement);
            cursor = edit.last + 1;
        }
        out.push_str(&self.sql[self.start_of(cursor)..]);
        out
    }

    fn start_of(&self, i: usize) -> usize {
        self.starts.get(i).copied().unwrap_or(self.sql.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn schema(pairs: &[(&str, &str)]) -> Vec<ColumnSchema> {
        pairs
            .iter()
            .map(|(n, t)| ColumnSchema { name: n.to_string(), data_type: t.to_string(), is_nullable: true })
            .collect()
    }

    #[test]
    fn test_sum_over_text_gets_cast() {
        let t = types(&[("amount", "text")]);
        assert_eq!(inject_numeric_casts("SELECT SUM(amount) FROM t", &t), "SELECT SUM(amount::numeric) FROM t");
    }

    #[test]
    fn test_cast_variants() {
        let t = types(&[("amount", "text"), ("qty", "numeric"), ("Price", "character varying")]);
        assert_eq!(
            inject_numeric_casts("select avg( Amount ), max(qty) from t", &t),
            "select avg( Amount::numeric ), max(qty) from t"
        );
        assert_eq!(
            inject_numeric_casts("SELECT MIN(\"Price\") FROM t", &t),
            "SELECT MIN(\"Price\"::numeric) FROM t"
        );
        assert_eq!(
            inject_numeric_casts("SELECT SUM(t.amount) FROM t", &t),
            "SELECT SUM(t.amount::numeric) FROM t"
        );
    }

    #[test]
    fn test_cast_leaves_literals_and_longer_names_alone() {
        let t = types(&[("amount", "text")]);
        let sql = "SELECT 'SUM(amount)' AS label, SUM(amount_total) FROM t";
        assert_eq!(inject_numeric_casts(sql, &t), sql);
    }

    #[test]
    fn test_cast_is_idempotent() {
        let t = types(&[("amount", "text")]);
        let once = inject_numeric_casts("SELECT SUM(amount) FROM t", &t);
        assert_eq!(inject_numeric_casts(&once, &t), once);
    }

    #[test]
    fn test_count_distinct_star() {
        let cols = vec!["name".to_string(), "amount".to_string()];
        assert_eq!(
            rewrite_count_distinct_star("SELECT COUNT(DISTINCT *) FROM t", &cols),
            "SELECT COUNT(DISTINCT ROW(\"name\", \"amount\")) FROM t"
        );
        assert_eq!(rewrite_count_distinct_star("SELECT COUNT(*) FROM t", &cols), "SELECT COUNT(*) FROM t");
    }

    #[test]
    fn test_patcher_skips_system_columns_in_row() {
        let s = schema(&[("id", "bigint"), ("created_at", "timestamp"), ("owner_id", "text"), ("name", "text")]);
        let patched = SqlPatcher::new(&s).patch("SELECT count(distinct *) FROM t");
        assert_eq!(patched, "SELECT count(DISTINCT ROW(\"name\")) FROM t");
    }

    #[test]
    fn test_substitute_table() {
        let sub = "SELECT name, amount FROM csv_1_abc WHERE amount <> ''";
        assert_eq!(
            substitute_table("SELECT name FROM csv_1_abc WHERE csv_1_abc.amount > '5'", "csv_1_abc", sub),
            format!("SELECT name FROM ({}) AS csv_1_abc WHERE csv_1_abc.amount > '5'", sub)
        );
        assert_eq!(
            substitute_table("SELECT t.name FROM csv_1_abc t", "csv_1_abc", sub),
            format!("SELECT t.name FROM ({}) t", sub)
        );
        assert_eq!(
            substitute_table("SELECT 'csv_1_abc' FROM other", "csv_1_abc", sub),
            "SELECT 'csv_1_abc' FROM other"
        );
    }

    #[test]
    fn test_substitute_table_keeps_alias_of_echoed_view() {
        let sub = "SELECT name, amount FROM csv_1_abc WHERE amount <> ''";
        let sql = format!("SELECT COUNT(*) AS n FROM ({}) AS csv_1_abc", sub);
        let patched = substitute_table(&sql, "csv_1_abc", sub);
        assert_eq!(
            patched,
            format!("SELECT COUNT(*) AS n FROM (SELECT name, amount FROM ({}) AS csv_1_abc WHERE amount <> '') AS csv_1_abc", sub)
        );
        assert!(Parser::parse_sql(&PostgreSqlDialect {}, &patched).is_ok());
        assert!(ensure_scoped_to(&patched, &["csv_1_abc"]).is_ok());

        let bare_alias = format!("SELECT n FROM ({}) csv_1_abc", sub);
        assert!(substitute_table(&bare_alias, "csv_1_abc", sub).ends_with(") csv_1_abc"));
    }

    #[test]
    fn test_scope_allows_own_table_aliases_and_ctes() {
        let allowed = ["csv_1_abc"];
        assert!(ensure_scoped_to("SELECT name FROM csv_1_abc", &allowed).is_ok());
        assert!(ensure_scoped_to("SELECT t.name FROM \"csv_1_abc\" t WHERE t.name <> ''", &allowed).is_ok());
        assert!(ensure_scoped_to("SELECT name FROM CSV_1_ABC", &allowed).is_ok());
        assert!(ensure_scoped_to(
            "WITH totals AS (SELECT name, COUNT(*) AS n FROM csv_1_abc GROUP BY name) SELECT * FROM totals",
            &allowed
        )
        .is_ok());
        assert!(ensure_scoped_to(
            "WITH a AS (SELECT name FROM csv_1_abc), b AS (SELECT name FROM a) SELECT * FROM b",
            &allowed
        )
        .is_ok());
        assert!(ensure_scoped_to("SELECT COUNT(*) FROM (SELECT DISTINCT name FROM csv_1_abc) d", &allowed).is_ok());
        assert!(ensure_scoped_to("SELECT 1 + 1 AS two", &allowed).is_ok());
    }

    #[test]
    fn test_scope_rejects_service_tables() {
        let allowed = ["csv_1_abc"];
        for sql in [
            "SELECT token, user_id FROM user_sessions",
            "SELECT a.name FROM csv_1_abc a JOIN files f ON f.table_name = 'csv_1_abc'",
            "SELECT name, (SELECT token FROM user_sessions LIMIT 1) FROM csv_1_abc",
            "SELECT name FROM csv_1_abc WHERE name IN (SELECT user_id FROM user_sessions)",
            "SELECT * FROM public.csv_1_abc",
            "SELECT * FROM pg_catalog.pg_tables",
            "SELECT * FROM csv_2_other",
            "WITH user_sessions AS (SELECT * FROM user_sessions) SELECT * FROM user_sessions",
            "WITH a AS (SELECT * FROM files), files AS (SELECT * FROM csv_1_abc) SELECT * FROM a",
        ] {
            assert!(matches!(ensure_scoped_to(sql, &allowed), Err(AnalystError::Execution(_))), "{}", sql);
        }
    }

    #[test]
    fn test_scope_ends_with_the_query_defining_a_cte() {
        let allowed = ["csv_1_abc"];
        let sql = "SELECT * FROM (WITH user_sessions AS (SELECT name FROM csv_1_abc) SELECT * FROM user_sessions) a \
                   CROSS JOIN user_sessions";
        assert!(ensure_scoped_to(sql, &allowed).is_err());
    }

    #[test]
    fn test_scope_blocks_sql_running_functions() {
        let allowed = ["csv_1_abc"];
        assert!(ensure_scoped_to("SELECT query_to_xml('SELECT * FROM user_sessions', true, false, '')", &allowed).is_err());
        assert!(ensure_scoped_to("SELECT set_config('app.current_user_id', 'u2', true), name FROM csv_1_abc", &allowed).is_err());
        assert!(ensure_scoped_to("SELECT name FROM csv_1_abc WHERE", &allowed).is_err());
    }

    #[test]
    fn test_strip_except() {
        let cols = vec!["name".to_string(), "email".to_string(), "amount".to_string()];
        assert_eq!(
            strip_except("SELECT * EXCEPT (email) FROM csv_1_abc", &cols),
            "SELECT \"name\", \"amount\" FROM csv_1_abc"
        );
        assert_eq!(
            strip_except("SELECT name FROM csv_1_abc EXCEPT SELECT name FROM csv_1_abc WHERE name = ''", &cols),
            "SELECT name FROM csv_1_abc"
        );
        assert_eq!(strip_except("SELECT name FROM csv_1_abc", &cols), "SELECT name FROM csv_1_abc");
    }

    #[test]
    fn test_read_only_guard() {
        assert!(ensure_read_only("SELECT 1;").is_ok());
        assert!(ensure_read_only("WITH x AS (SELECT 1 AS a) SELECT a FROM x").is_ok());
        assert!(ensure_read_only("DELETE FROM t").is_err());
        assert!(ensure_read_only("SELECT 1; DROP TABLE t").is_err());
        assert!(ensure_read_only("SELECT * INTO copy FROM t").is_err());
        assert!(matches!(ensure_read_only("UPDATE t SET a = 1"), Err(AnalystError::Execution(_))));
    }

    #[test]
    fn test_multiline_offsets() {
        let t = types(&[("amount", "text")]);
        let sql = "SELECT name,\n  SUM(amount) AS total\nFROM t\nGROUP BY name";
        assert_eq!(
            inject_numeric_casts(sql, &t),
            "SELECT name,\n  SUM(amount::numeric) AS total\nFROM t\nGROUP BY name"
        );
    }

    #[test]
    fn test_trim_statement() {
        assert_eq!(trim_statement("  SELECT 1 ;; \n"), "SELECT 1");
    }
}
