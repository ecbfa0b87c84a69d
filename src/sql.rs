use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertMechanic {
        id: Ulid,
        name: String,
    },
    DeleteMechanic {
        id: Ulid,
    },
    SelectMechanics,
    SelectAvailability {
        date: String,
        duration_minutes: i64,
    },
    InsertVisit {
        id: Ulid,
        mechanic_id: Ulid,
        client_id: Ulid,
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
        service_ids: Vec<Ulid>,
    },
    DeleteVisit {
        id: Ulid,
    },
    SelectVisits {
        id: Option<Ulid>,
        mechanic_id: Option<Ulid>,
    },
    AdvanceVisit {
        visit_id: Ulid,
        status: VisitStatus,
    },
}

const MECHANIC_COLUMNS: &[&str] = &["id", "name"];
const VISIT_COLUMNS: &[&str] = &["id", "mechanic_id", "client_id", "vehicle_id", "start", "end", "services"];
const TRANSITION_COLUMNS: &[&str] = &["visit_id", "status"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// The table a SELECT reads from, for describing result columns before the
/// statement's parameters are bound. `None` for anything else.
pub fn select_table(sql: &str) -> Option<String> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "mechanics" => {
            let row = Row::bind("mechanics", MECHANIC_COLUMNS, &insert.columns, &values)?;
            Ok(Command::InsertMechanic {
                id: parse_ulid_expr(row.get("id")?)?,
                name: parse_string_expr(row.get("name")?)?,
            })
        }
        "visits" => {
            let row = Row::bind("visits", VISIT_COLUMNS, &insert.columns, &values)?;
            Ok(Command::InsertVisit {
                id: parse_ulid_expr(row.get("id")?)?,
                mechanic_id: parse_ulid_expr(row.get("mechanic_id")?)?,
                client_id: parse_ulid_expr(row.get("client_id")?)?,
                vehicle_id: parse_ulid_expr(row.get("vehicle_id")?)?,
                start: parse_i64_expr(row.get("start")?)?,
                end: parse_i64_expr(row.get("end")?)?,
                service_ids: parse_ulid_list(row.get("services")?)?,
            })
        }
        "visit_transitions" => {
            let row = Row::bind("visit_transitions", TRANSITION_COLUMNS, &insert.columns, &values)?;
            let status = parse_string_expr(row.get("status")?)?;
            Ok(Command::AdvanceVisit {
                visit_id: parse_ulid_expr(row.get("visit_id")?)?,
                status: status.parse().map_err(SqlError::Parse)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "mechanics" => Ok(Command::DeleteMechanic { id }),
        "visits" => Ok(Command::DeleteVisit { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| e);

    match table.as_str() {
        "mechanics" => Ok(Command::SelectMechanics),
        "availability" => Ok(Command::SelectAvailability {
            date: parse_string_expr(filter("date").ok_or(SqlError::MissingFilter("date"))?)?,
            duration_minutes: parse_i64_expr(filter("duration").ok_or(SqlError::MissingFilter("duration"))?)?,
        }),
        "visits" => Ok(Command::SelectVisits {
            id: filter("id").map(parse_ulid_expr).transpose()?,
            mechanic_id: filter("mechanic_id").map(parse_ulid_expr).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Gather `column = value` pairs joined by AND. Other predicates are rejected
/// rather than silently ignored.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// VALUES bound to column names, either from an explicit column list or
/// positionally in the table's declared order.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn bind<C: std::fmt::Display>(
        table: &'static str,
        declared: &[&str],
        columns: &[C],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let names: Vec<String> = if columns.is_empty() {
            declared.iter().map(|c| c.to_string()).collect()
        } else {
            columns
                .iter()
                .map(|c| c.to_string().trim_matches('"').to_lowercase())
                .collect()
        };
        if names.len() != values.len() {
            return Err(SqlError::WrongArity(table, names.len(), values.len()));
        }
        if let Some(unknown) = names.iter().find(|n| !declared.contains(&n.as_str())) {
            return Err(SqlError::UnknownColumn(table, unknown.clone()));
        }
        Ok(Self {
            table,
            cells: names.into_iter().zip(values.iter()).collect(),
        })
    }

    fn get(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.cells
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, e)| *e)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// The single VALUES row of an INSERT. Multi-row inserts are not supported:
/// every booking is validated on its own.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut filters = Vec::new();
    collect_eq_filters(sel, &mut filters)?;
    match filters.as_slice() {
        [(col, value)] if col == "id" => parse_ulid_expr(value),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

/// A JSON array of ULID strings, e.g. `'["01H...", "01H..."]'`.
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    let raw = parse_string_expr(expr)?;
    let items: Vec<String> =
        serde_json::from_str(&raw).map_err(|e| SqlError::Parse(format!("services must be a JSON array of ULIDs: {e}")))?;
    items
        .iter()
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad service ULID {s:?}: {e}"))))
        .collect()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
