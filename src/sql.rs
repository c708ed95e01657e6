use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

/// Parsed command from SQL input.
///
/// Dates and prices stay as the client's text; the engine's validators turn
/// them into typed values so malformed input comes back as field errors.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertListing {
        id: Ulid,
        listing_type: String,
        country: String,
        city: String,
        title: String,
        price: Option<String>,
    },
    InsertRoomType {
        id: Ulid,
        listing_id: Ulid,
        title: String,
        price: String,
    },
    InsertRoom {
        id: Ulid,
        room_type_id: Ulid,
        room_number: String,
    },
    InsertReservation {
        id: Ulid,
        listing_id: Ulid,
        room_id: Option<Ulid>,
        check_in: String,
        check_out: String,
    },
    SelectUnits {
        checkin: Option<String>,
        checkout: Option<String>,
        max_price: Option<String>,
    },
    SelectListings,
    SelectReservations {
        listing_id: Option<Ulid>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

const LISTING_COLUMNS: &[&str] = &["id", "listing_type", "country", "city", "title", "price"];
const ROOM_TYPE_COLUMNS: &[&str] = &["id", "listing_id", "title", "price"];
const ROOM_COLUMNS: &[&str] = &["id", "room_type_id", "room_number"];
const RESERVATION_COLUMNS: &[&str] = &["id", "listing_id", "room_id", "check_in", "check_out"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "listings" => {
            let row = InsertRow::bind("listings", LISTING_COLUMNS, insert, values)?;
            let price = match row.optional("price") {
                Some(expr) => parse_text_or_null(expr)?,
                None => None,
            };
            Ok(Command::InsertListing {
                id: parse_ulid(row.required("id")?)?,
                listing_type: parse_text(row.required("listing_type")?)?,
                country: parse_text(row.required("country")?)?,
                city: parse_text(row.required("city")?)?,
                title: parse_text(row.required("title")?)?,
                price,
            })
        }
        "room_types" => {
            let row = InsertRow::bind("room_types", ROOM_TYPE_COLUMNS, insert, values)?;
            Ok(Command::InsertRoomType {
                id: parse_ulid(row.required("id")?)?,
                listing_id: parse_ulid(row.required("listing_id")?)?,
                title: parse_text(row.required("title")?)?,
                price: parse_text(row.required("price")?)?,
            })
        }
        "rooms" => {
            let row = InsertRow::bind("rooms", ROOM_COLUMNS, insert, values)?;
            Ok(Command::InsertRoom {
                id: parse_ulid(row.required("id")?)?,
                room_type_id: parse_ulid(row.required("room_type_id")?)?,
                room_number: parse_text(row.required("room_number")?)?,
            })
        }
        "reservations" => {
            let row = InsertRow::bind("reservations", RESERVATION_COLUMNS, insert, values)?;
            let room_id = match row.optional("room_id") {
                Some(expr) => parse_ulid_or_null(expr)?,
                None => None,
            };
            Ok(Command::InsertReservation {
                id: parse_ulid(row.required("id")?)?,
                listing_id: parse_ulid(row.required("listing_id")?)?,
                room_id,
                check_in: parse_text(row.required("check_in")?)?,
                check_out: parse_text(row.required("check_out")?)?,
            })
        }
        other => Err(SqlError::UnknownTable(other.to_string())),
    }
}

/// One VALUES row keyed by column name. Without a column list the values
/// follow the table's declared column order.
struct InsertRow {
    table: &'static str,
    values: Vec<(&'static str, Expr)>,
}

impl InsertRow {
    fn bind(
        table: &'static str,
        columns: &'static [&'static str],
        insert: &ast::Insert,
        values: Vec<Expr>,
    ) -> Result<Self, SqlError> {
        let names: Vec<&'static str> = if insert.columns.is_empty() {
            if values.len() > columns.len() {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            columns[..values.len()].to_vec()
        } else {
            if insert.columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
            }
            let mut names = Vec::with_capacity(insert.columns.len());
            for ident in &insert.columns {
                let name = ident.value.to_lowercase();
                let known = columns
                    .iter()
                    .find(|c| **c == name)
                    .ok_or_else(|| SqlError::UnknownColumn(table, name.clone()))?;
                if names.contains(known) {
                    return Err(SqlError::Parse(format!("column {name} specified more than once")));
                }
                names.push(*known);
            }
            names
        };
        Ok(Self {
            table,
            values: names.into_iter().zip(values).collect(),
        })
    }

    fn optional(&self, column: &str) -> Option<&Expr> {
        self.values.iter().find(|(c, _)| *c == column).map(|(_, e)| e)
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.optional(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "units" => Ok(Command::SelectUnits {
            checkin: filters.take("checkin"),
            checkout: filters.take("checkout"),
            max_price: filters.take("max_price"),
        }),
        "listings" => Ok(Command::SelectListings),
        "reservations" => {
            let listing_id = filters
                .take("listing_id")
                .map(|s| Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}"))))
                .transpose()?;
            Ok(Command::SelectReservations { listing_id })
        }
        other => Err(SqlError::UnknownTable(other.to_string())),
    }
}

/// `column = value` pairs from a WHERE clause joined by AND.
#[derive(Debug, Default)]
struct Filters(Vec<(String, String)>);

impl Filters {
    fn take(&mut self, column: &str) -> Option<String> {
        let pos = self.0.iter().rposition(|(c, _)| c == column)?;
        Some(self.0.swap_remove(pos).1)
    }
}

fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_filters(left, filters)?;
            collect_filters(right, filters)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            filters.0.push((column, parse_text(right)?));
            Ok(())
        }
        Expr::Nested(inner) => collect_filters(inner, filters),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

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

/// A literal as text: quoted strings verbatim, numbers as written.
fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    parse_text_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            _ => Err(SqlError::Parse(format!("expected literal, got {value:?}"))),
        }
    } else if let Expr::UnaryOp { op, expr: inner } = expr {
        let sign = match op {
            ast::UnaryOperator::Minus => "-",
            ast::UnaryOperator::Plus => "+",
            _ => return Err(SqlError::Parse(format!("expected literal, got {expr}"))),
        };
        Ok(parse_text_or_null(inner)?.map(|s| format!("{sign}{s}")))
    } else {
        Err(SqlError::Parse(format!("expected literal, got {expr}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_or_null(expr)?.ok_or_else(|| SqlError::Parse("expected ULID, got NULL".into()))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ulid::from_string(s)
            .map(Some)
            .map_err(|e| SqlError::Parse(format!("bad ULID: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected string or NULL, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
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
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
        }
    }
}

impl std::error::Error for SqlError {}
