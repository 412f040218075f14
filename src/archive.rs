use crate::errors::{AppError, AppResult};
use crate::models::{ArchiveColumn, ArchivePage, ArchiveQuery, ArchiveTable};
use base64::Engine;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const MAX_PAGE_SIZE: u32 = 500;
const ROWID_ALIASES: [&str; 3] = ["rowid", "_rowid_", "oid"];

/// Row order used when the caller does not pick a sort column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultOrder {
    /// A rowid alias no real column shadows.
    Rowid(&'static str),
    /// `WITHOUT ROWID` tables, and rowid tables whose aliases are all shadowed.
    PrimaryKey(Vec<String>),
    Unordered,
}

/// Read-only browser over a legacy SQLite export.
#[derive(Debug)]
pub struct LegacyArchive {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl LegacyArchive {
    pub fn open(path: &Path) -> AppResult<Self> {
        if !path.is_file() {
            return Err(AppError::NotFound(format!("archive {}", path.display())));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        // Fail early on files that are not SQLite databases.
        conn.query_row("SELECT COUNT(1) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
            .map_err(|error| AppError::Validation(format!("{} is not a readable archive: {}", path.display(), error)))?;

        tracing::info!(path = %path.display(), "opened legacy archive");
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tables(&self) -> AppResult<Vec<ArchiveTable>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("archive mutex poisoned".to_string()))?;
        let names = table_names(&conn)?;
        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let columns = table_columns(&conn, &name)?;
            let row_count: i64 = conn.query_row(
                &format!("SELECT COUNT(1) FROM {}", quote_identifier(&name)),
                [],
                |row| row.get(0),
            )?;
            tables.push(ArchiveTable {
                name,
                columns,
                row_count,
            });
        }
        Ok(tables)
    }

    pub fn search(&self, query: &ArchiveQuery, default_page_size: u32) -> AppResult<ArchivePage> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("archive mutex poisoned".to_string()))?;

        let Some(table) = table_names(&conn)?.into_iter().find(|name| name == &query.table) else {
            return Err(AppError::NotFound(format!("archive table {}", query.table)));
        };
        let columns: Vec<String> = table_columns(&conn, &table)?
            .into_iter()
            .map(|column| column.name)
            .collect();

        let searched = match &query.columns {
            Some(requested) if !requested.is_empty() => {
                for column in requested {
                    ensure_column(&columns, column)?;
                }
                requested.clone()
            }
            _ => columns.clone(),
        };
        if let Some(sort) = &query.sort_column {
            ensure_column(&columns, sort)?;
        }

        let pattern = query.term.as_deref().and_then(normalize_term).map(|term| format!("%{}%", escape_like(&term)));
        let filter = match pattern {
            Some(_) => where_clause(&searched),
            None => String::new(),
        };
        let limit = clamp_page_size(query.limit, default_page_size);

        let count_sql = format!("SELECT COUNT(1) FROM {}{}", quote_identifier(&table), filter);
        let total: i64 = match &pattern {
            Some(pattern) => conn.query_row(&count_sql, [pattern], |row| row.get(0))?,
            None => conn.query_row(&count_sql, [], |row| row.get(0))?,
        };

        let order = default_order(&conn, &table, &columns)?;
        let page_sql = build_page_sql(&table, &filter, query.sort_column.as_deref(), query.descending, &order);
        let mut statement = conn.prepare(&page_sql)?;
        let mut bound: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(pattern) = pattern {
            bound.push(Box::new(pattern));
        }
        bound.push(Box::new(i64::from(limit)));
        bound.push(Box::new(i64::from(query.offset)));

        let column_names: Vec<String> = statement.column_names().into_iter().map(ToString::to_string).collect();
        let mut rows = statement.query(rusqlite::params_from_iter(bound.iter()))?;
        let mut page_rows = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = serde_json::Map::new();
            for (index, name) in column_names.iter().enumerate() {
                record.insert(name.clone(), normalize_value(row.get_ref(index)?));
            }
            page_rows.push(record);
        }

        tracing::debug!(table = %table, total, returned = page_rows.len(), "archive search");
        Ok(ArchivePage {
            table,
            columns: column_names,
            rows: page_rows,
            total,
            limit,
            offset: query.offset,
        })
    }
}

fn table_names(conn: &Connection) -> AppResult<Vec<String>> {
    let mut statement = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = statement
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

fn table_columns(conn: &Connection, table: &str) -> AppResult<Vec<ArchiveColumn>> {
    let mut statement = conn.prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))?;
    let columns = statement
        .query_map([], |row| {
            Ok(ArchiveColumn {
                name: row.get(1)?,
                decl_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn primary_key_columns(conn: &Connection, table: &str) -> AppResult<Vec<String>> {
    let mut statement = conn.prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))?;
    let mut keys = statement
        .query_map([], |row| Ok((row.get::<_, i64>(5)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    keys.retain(|(position, _)| *position > 0);
    keys.sort_by_key(|(position, _)| *position);
    Ok(keys.into_iter().map(|(_, name)| name).collect())
}

fn is_without_rowid(conn: &Connection, table: &str) -> AppResult<bool> {
    let sql = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten()
        .unwrap_or_default();
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase();
    Ok(normalized.contains("WITHOUT ROWID"))
}

pub fn default_order(conn: &Connection, table: &str, columns: &[String]) -> AppResult<DefaultOrder> {
    if !is_without_rowid(conn, table)? {
        let free_alias = ROWID_ALIASES
            .iter()
            .copied()
            .find(|alias| !columns.iter().any(|column| column.eq_ignore_ascii_case(alias)));
        if let Some(alias) = free_alias {
            return Ok(DefaultOrder::Rowid(alias));
        }
    }
    let keys = primary_key_columns(conn, table)?;
    if keys.is_empty() {
        Ok(DefaultOrder::Unordered)
    } else {
        Ok(DefaultOrder::PrimaryKey(keys))
    }
}

fn ensure_column(columns: &[String], column: &str) -> AppResult<()> {
    if columns.iter().any(|known| known == column) {
        return Ok(());
    }
    Err(AppError::Validation(format!("Unknown archive column '{}'", column)))
}

pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Trims and collapses whitespace; an empty term means "no filter".
pub fn normalize_term(term: &str) -> Option<String> {
    let collapsed = term.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for ch in term.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Every searched column is matched against the same `?1` pattern.
pub fn where_clause(columns: &[String]) -> String {
    if columns.is_empty() {
        return " WHERE 0".to_string();
    }
    let predicates = columns
        .iter()
        .map(|column| format!("CAST({} AS TEXT) LIKE ?1 ESCAPE '\\'", quote_identifier(column)))
        .collect::<Vec<_>>()
        .join(" OR ");
    format!(" WHERE ({})", predicates)
}

pub fn build_page_sql(
    table: &str,
    filter: &str,
    sort_column: Option<&str>,
    descending: bool,
    default_order: &DefaultOrder,
) -> String {
    let mut sql = format!("SELECT * FROM {}{}", quote_identifier(table), filter);
    match (sort_column, default_order) {
        (Some(column), _) => {
            sql.push_str(&format!(
                " ORDER BY {} {}",
                quote_identifier(column),
                if descending { "DESC" } else { "ASC" }
            ));
        }
        (None, DefaultOrder::Rowid(alias)) => sql.push_str(&format!(" ORDER BY {}", alias)),
        (None, DefaultOrder::PrimaryKey(keys)) => {
            let keys = keys.iter().map(|key| quote_identifier(key)).collect::<Vec<_>>().join(", ");
            sql.push_str(&format!(" ORDER BY {}", keys));
        }
        (None, DefaultOrder::Unordered) => {}
    }
    sql.push_str(" LIMIT ? OFFSET ?");
    sql
}

pub fn clamp_page_size(requested: Option<u32>, default_page_size: u32) -> u32 {
    requested.unwrap_or(default_page_size).clamp(1, MAX_PAGE_SIZE)
}

pub fn normalize_value(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(number) => serde_json::Value::from(number),
        ValueRef::Real(number) => serde_json::Number::from_f64(number)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).trim().to_string()),
        ValueRef::Blob(bytes) => serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        build_page_sql, default_order, escape_like, normalize_term, normalize_value, where_clause, DefaultOrder,
        LegacyArchive,
    };
    use crate::models::ArchiveQuery;
    use rusqlite::types::ValueRef;
    use rusqlite::{params, Connection};

    fn fixture(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("legacy.sqlite");
        let conn = Connection::open(&path).expect("create fixture");
        conn.execute_batch(
            "CREATE TABLE tickets (id INTEGER PRIMARY KEY, subject TEXT, body TEXT, score REAL, raw BLOB);
             CREATE TABLE \"odd \"\"name\"\"\" (value TEXT);",
        )
        .expect("schema");
        let rows: [(&str, &str, f64); 4] = [
            ("Refund request", "Customer wants 100% refund", 4.5),
            ("Login issue", "  cannot sign in  ", 2.0),
            ("Refund follow-up", "second_attempt at refund", 3.0),
            ("Shipping", "parcel lost", 1.0),
        ];
        for (subject, body, score) in rows {
            conn.execute(
                "INSERT INTO tickets (subject, body, score, raw) VALUES (?1, ?2, ?3, ?4)",
                params![subject, body, score, vec![1u8, 2, 3]],
            )
            .expect("insert");
        }
        path
    }

    #[test]
    fn terms_are_collapsed_and_escaped() {
        assert_eq!(normalize_term("  refund   policy "), Some("refund policy".to_string()));
        assert_eq!(normalize_term(" \t "), None);
        assert_eq!(escape_like(r"100%_a\b"), r"100\%\_a\\b");
    }

    #[test]
    fn sql_quotes_identifiers_and_binds_values() {
        let filter = where_clause(&["subject".to_string(), "we\"ird".to_string()]);
        assert_eq!(
            filter,
            " WHERE (CAST(\"subject\" AS TEXT) LIKE ?1 ESCAPE '\\' OR CAST(\"we\"\"ird\" AS TEXT) LIKE ?1 ESCAPE '\\')"
        );
        let sql = build_page_sql("tickets", "", Some("score"), true, &DefaultOrder::Rowid("rowid"));
        assert_eq!(sql, "SELECT * FROM \"tickets\" ORDER BY \"score\" DESC LIMIT ? OFFSET ?");
        let sql = build_page_sql(
            "kv",
            "",
            None,
            false,
            &DefaultOrder::PrimaryKey(vec!["a".to_string(), "b".to_string()]),
        );
        assert_eq!(sql, "SELECT * FROM \"kv\" ORDER BY \"a\", \"b\" LIMIT ? OFFSET ?");
        let sql = build_page_sql("kv", "", None, false, &DefaultOrder::Unordered);
        assert_eq!(sql, "SELECT * FROM \"kv\" LIMIT ? OFFSET ?");
    }

    #[test]
    fn values_are_normalized_for_json() {
        assert_eq!(normalize_value(ValueRef::Null), serde_json::Value::Null);
        assert_eq!(normalize_value(ValueRef::Integer(7)), serde_json::json!(7));
        assert_eq!(normalize_value(ValueRef::Real(f64::NAN)), serde_json::Value::Null);
        assert_eq!(normalize_value(ValueRef::Text(b"  padded ")), serde_json::json!("padded"));
        assert_eq!(normalize_value(ValueRef::Blob(&[1, 2, 3])), serde_json::json!("AQID"));
    }

    #[test]
    fn lists_tables_with_columns_and_counts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = LegacyArchive::open(&fixture(dir.path())).expect("open");
        let tables = archive.tables().expect("tables");
        let tickets = tables.iter().find(|table| table.name == "tickets").expect("tickets");
        assert_eq!(tickets.row_count, 4);
        assert_eq!(tickets.columns.len(), 5);
        assert_eq!(tickets.columns[3].decl_type, "REAL");
        assert!(tables.iter().any(|table| table.name == "odd \"name\""));
    }

    #[test]
    fn search_matches_case_insensitively_with_literal_wildcards() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = LegacyArchive::open(&fixture(dir.path())).expect("open");

        let page = archive
            .search(
                &ArchiveQuery {
                    table: "tickets".to_string(),
                    term: Some("  REFUND ".to_string()),
                    sort_column: Some("score".to_string()),
                    descending: true,
                    ..ArchiveQuery::default()
                },
                50,
            )
            .expect("search");
        assert_eq!(page.total, 2);
        assert_eq!(page.rows[0]["subject"], "Refund request");
        assert_eq!(page.rows[0]["raw"], "AQID");

        let literal = archive
            .search(
                &ArchiveQuery {
                    table: "tickets".to_string(),
                    term: Some("100%".to_string()),
                    columns: Some(vec!["body".to_string()]),
                    ..ArchiveQuery::default()
                },
                50,
            )
            .expect("search");
        assert_eq!(literal.total, 1);

        let underscore = archive
            .search(
                &ArchiveQuery {
                    table: "tickets".to_string(),
                    term: Some("n_i".to_string()),
                    ..ArchiveQuery::default()
                },
                50,
            )
            .expect("search");
        assert_eq!(underscore.total, 0);
    }

    #[test]
    fn paging_and_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = LegacyArchive::open(&fixture(dir.path())).expect("open");
        let page = archive
            .search(
                &ArchiveQuery {
                    table: "tickets".to_string(),
                    limit: Some(2),
                    offset: 2,
                    ..ArchiveQuery::default()
                },
                50,
            )
            .expect("page");
        assert_eq!(page.total, 4);
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.rows[0]["subject"], "Refund follow-up");
        assert_eq!(page.rows[1]["body"], "parcel lost");

        let bad_table = archive.search(
            &ArchiveQuery {
                table: "tickets; DROP TABLE tickets".to_string(),
                ..ArchiveQuery::default()
            },
            50,
        );
        assert!(bad_table.is_err());

        let bad_column = archive.search(
            &ArchiveQuery {
                table: "tickets".to_string(),
                columns: Some(vec!["nope".to_string()]),
                ..ArchiveQuery::default()
            },
            50,
        );
        assert!(bad_column.expect_err("unknown column").is_validation());
    }

    #[test]
    fn tables_without_rowid_page_by_primary_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keyed.sqlite");
        let conn = Connection::open(&path).expect("create");
        conn.execute_batch(
            "CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT) WITHOUT ROWID;
             INSERT INTO kv VALUES ('b', 'second'), ('a', 'first'), ('c', 'third');
             CREATE TABLE shadowed (rowid TEXT, label TEXT);
             INSERT INTO shadowed VALUES ('z', 'inserted first'), ('a', 'inserted second');",
        )
        .expect("schema");
        let columns = vec!["k".to_string(), "v".to_string()];
        assert_eq!(
            default_order(&conn, "kv", &columns).expect("order"),
            DefaultOrder::PrimaryKey(vec!["k".to_string()])
        );
        drop(conn);

        let archive = LegacyArchive::open(&path).expect("open");
        let page = archive
            .search(
                &ArchiveQuery {
                    table: "kv".to_string(),
                    ..ArchiveQuery::default()
                },
                50,
            )
            .expect("search without rowid");
        assert_eq!(page.total, 3);
        assert_eq!(page.rows[0]["k"], "a");
        assert_eq!(page.rows[2]["v"], "third");

        let shadowed = archive
            .search(
                &ArchiveQuery {
                    table: "shadowed".to_string(),
                    ..ArchiveQuery::default()
                },
                50,
            )
            .expect("search shadowed rowid");
        assert_eq!(shadowed.rows[0]["label"], "inserted first");
        assert_eq!(shadowed.rows[1]["label"], "inserted second");
    }

    #[test]
    fn missing_files_are_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(LegacyArchive::open(&dir.path().join("absent.sqlite")).is_err());
    }
}
