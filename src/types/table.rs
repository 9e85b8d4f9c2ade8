use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::Error;

// Postgres truncates identifiers past 63 bytes.
static IDENTIFIER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid identifier pattern"));

// Every table carries these; quoted names are case-sensitive, so only the
// lowercase spellings collide.
const SYSTEM_COLUMNS: [&str; 6] = ["ctid", "xmin", "xmax", "cmin", "cmax", "tableoid"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IdentifierKind {
    Database,
    Table,
    Column,
    Role,
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IdentifierKind::Database => "database",
            IdentifierKind::Table => "table",
            IdentifierKind::Column => "column",
            IdentifierKind::Role => "role",
        })
    }
}

/// A database, table, column or role name that passed the allow-list. Only
/// values of this type are ever spliced into SQL text, always double-quoted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Identifier(String);

impl Identifier {
    pub(crate) fn parse(kind: IdentifierKind, name: &str) -> Result<Self, Error> {
        if !IDENTIFIER_PATTERN.is_match(name) {
            return Err(Error::InvalidIdentifier(format!(
                "{} name {:?} may only contain letters, digits and underscores, \
                 must not start with a digit, and is limited to 63 characters",
                kind, name
            )));
        }

        if matches!(kind, IdentifierKind::Database | IdentifierKind::Role) && is_reserved(name) {
            return Err(Error::InvalidIdentifier(format!(
                "{} name {:?} is reserved",
                kind, name
            )));
        }

        if kind == IdentifierKind::Column && SYSTEM_COLUMNS.contains(&name) {
            return Err(Error::InvalidIdentifier(format!(
                "column name {:?} conflicts with a system column",
                name
            )));
        }

        Ok(Self(name.to_owned()))
    }

    pub(crate) fn database(name: &str) -> Result<Self, Error> {
        Self::parse(IdentifierKind::Database, name)
    }

    pub(crate) fn table(name: &str) -> Result<Self, Error> {
        Self::parse(IdentifierKind::Table, name)
    }

    pub(crate) fn column(name: &str) -> Result<Self, Error> {
        Self::parse(IdentifierKind::Column, name)
    }

    pub(crate) fn role(name: &str) -> Result<Self, Error> {
        Self::parse(IdentifierKind::Role, name)
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// System schemas and the schema holding `api_users` are off limits.
fn is_reserved(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name == "public" || name == "information_schema" || name.starts_with("pg_")
}

pub(crate) fn qualified(database: &Identifier, table: &Identifier) -> String {
    format!("{}.{}", database.quoted(), table.quoted())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ColumnType {
    #[serde(alias = "str", alias = "string", alias = "varchar")]
    Text,
    #[serde(alias = "int", alias = "bigint")]
    Integer,
    #[serde(alias = "float", alias = "numeric")]
    Decimal,
    #[serde(alias = "bool")]
    Boolean,
    #[serde(alias = "datetime", alias = "timestamptz")]
    Timestamp,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Decimal => "decimal",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
        })
    }
}

impl ColumnType {
    pub(crate) fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "BIGINT",
            ColumnType::Decimal => "NUMERIC",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMPTZ",
        }
    }

    /// Maps an `information_schema.columns.data_type` value back to a logical
    /// type. Columns created outside this service may have no mapping.
    pub(crate) fn from_catalog(data_type: &str) -> Option<Self> {
        match data_type {
            "text" | "character varying" | "character" => Some(ColumnType::Text),
            "bigint" | "integer" | "smallint" => Some(ColumnType::Integer),
            "numeric" | "double precision" | "real" => Some(ColumnType::Decimal),
            "boolean" => Some(ColumnType::Boolean),
            "timestamp with time zone" | "timestamp without time zone" => {
                Some(ColumnType::Timestamp)
            }
            _ => None,
        }
    }

    pub(crate) fn convert(self, column: &Identifier, value: &Value) -> Result<SqlValue, Error> {
        let converted = match (self, value) {
            (_, Value::Null) => Some(SqlValue::Null),
            (ColumnType::Text, Value::String(s)) => Some(SqlValue::Text(s.clone())),
            (ColumnType::Integer, Value::Number(n)) => n.as_i64().map(SqlValue::Integer),
            (ColumnType::Decimal, Value::Number(n)) => Some(SqlValue::Decimal(n.to_string())),
            (ColumnType::Boolean, Value::Bool(b)) => Some(SqlValue::Boolean(*b)),
            (ColumnType::Timestamp, Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| SqlValue::Timestamp(t.with_timezone(&Utc))),
            _ => None,
        };

        converted.ok_or_else(|| {
            Error::SchemaMismatch(format!(
                "column {} expects a {} value, got {}",
                column,
                self,
                describe(value)
            ))
        })
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A value ready to bind as a statement parameter.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum SqlValue {
    Null,
    Text(String),
    Integer(i64),
    /// Kept as the decimal text so no precision is lost before the cast.
    Decimal(String),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
}

fn default_nullable() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct ColumnDescriptor {
    pub(crate) name: String,
    #[serde(rename = "type")]
    pub(crate) column_type: ColumnType,
    #[serde(default)]
    pub(crate) primary_key: bool,
    #[serde(default = "default_nullable")]
    pub(crate) nullable: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct Column {
    pub(crate) name: Identifier,
    pub(crate) column_type: ColumnType,
    pub(crate) primary_key: bool,
    pub(crate) nullable: bool,
}

/// A validated request-time table definition.
#[derive(Clone, Debug)]
pub(crate) struct TableDescriptor {
    pub(crate) database: Identifier,
    pub(crate) table: Identifier,
    pub(crate) columns: Vec<Column>,
}

impl TableDescriptor {
    pub(crate) fn new(
        database: &str,
        table: &str,
        columns: &[ColumnDescriptor],
    ) -> Result<Self, Error> {
        let database = Identifier::database(database)?;
        let table = Identifier::table(table)?;

        if columns.is_empty() {
            return Err(Error::InvalidDescriptor(
                "a table needs at least one column".into(),
            ));
        }

        let mut seen = HashSet::new();
        let columns = columns
            .iter()
            .map(|column| {
                let name = Identifier::column(&column.name)?;

                if !seen.insert(name.clone()) {
                    return Err(Error::InvalidDescriptor(format!(
                        "column {} is declared more than once",
                        name
                    )));
                }

                Ok(Column {
                    name,
                    column_type: column.column_type,
                    primary_key: column.primary_key,
                    nullable: column.nullable && !column.primary_key,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self {
            database,
            table,
            columns,
        })
    }

    pub(crate) fn create_statement(&self) -> String {
        let mut definitions: Vec<String> = self
            .columns
            .iter()
            .map(|column| {
                format!(
                    "{} {}{}",
                    column.name.quoted(),
                    column.column_type.sql_type(),
                    if column.nullable { "" } else { " NOT NULL" }
                )
            })
            .collect();

        let keys: Vec<String> = self
            .columns
            .iter()
            .filter(|column| column.primary_key)
            .map(|column| column.name.quoted())
            .collect();

        if !keys.is_empty() {
            definitions.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }

        format!(
            "CREATE TABLE {} ({})",
            qualified(&self.database, &self.table),
            definitions.join(", ")
        )
    }
}

/// One row of an insert request with every key checked against the allow-list.
pub(crate) type RowPayload = Vec<(Identifier, Value)>;

pub(crate) fn parse_row(row: &Map<String, Value>) -> Result<RowPayload, Error> {
    row.iter()
        .map(|(key, value)| Ok((Identifier::column(key)?, value.clone())))
        .collect()
}

#[derive(Clone, Debug)]
pub(crate) struct CatalogColumn {
    pub(crate) name: String,
    pub(crate) column_type: Option<ColumnType>,
}

/// The live shape of an existing table, as read from the catalog.
#[derive(Clone, Debug)]
pub(crate) struct TableShape {
    pub(crate) columns: Vec<CatalogColumn>,
    pub(crate) primary_key: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PreparedInsert {
    pub(crate) sql: String,
    pub(crate) values: Vec<SqlValue>,
}

impl TableShape {
    fn column(&self, name: &str) -> Option<&CatalogColumn> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// Builds a parameterized insert for `row`. When every primary key column
    /// is supplied, conflicting rows are updated in place. The statement
    /// returns whether the row was newly inserted.
    pub(crate) fn prepare(
        &self,
        database: &Identifier,
        table: &Identifier,
        row: &[(Identifier, Value)],
    ) -> Result<PreparedInsert, Error> {
        let mut names = Vec::with_capacity(row.len());
        let mut placeholders = Vec::with_capacity(row.len());
        let mut values = Vec::with_capacity(row.len());

        for (index, (name, value)) in row.iter().enumerate() {
            let column = self.column(name.as_str()).ok_or_else(|| {
                Error::SchemaMismatch(format!(
                    "column {} does not exist in table {}",
                    name, table
                ))
            })?;

            let column_type = column.column_type.ok_or_else(|| {
                Error::SchemaMismatch(format!("column {} has an unsupported type", name))
            })?;

            values.push(column_type.convert(name, value)?);
            names.push(name.quoted());
            placeholders.push(format!("${}::{}", index + 1, column_type.sql_type()));
        }

        let mut sql = if names.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", qualified(database, table))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                qualified(database, table),
                names.join(", "),
                placeholders.join(", ")
            )
        };

        let supplies_key = !self.primary_key.is_empty()
            && self
                .primary_key
                .iter()
                .all(|key| row.iter().any(|(name, _)| name.as_str() == key));

        if supplies_key {
            let keys: Vec<String> = self
                .primary_key
                .iter()
                .map(|key| format!("\"{}\"", key))
                .collect();

            let updates: Vec<String> = row
                .iter()
                .filter(|(name, _)| !self.primary_key.iter().any(|key| key == name.as_str()))
                .map(|(name, _)| format!("{0} = EXCLUDED.{0}", name.quoted()))
                .collect();

            if updates.is_empty() {
                sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", keys.join(", ")));
            } else {
                sql.push_str(&format!(
                    " ON CONFLICT ({}) DO UPDATE SET {}",
                    keys.join(", "),
                    updates.join(", ")
                ));
            }
        }

        sql.push_str(" RETURNING (xmax = 0) AS inserted");

        Ok(PreparedInsert { sql, values })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum Privilege {
    Select,
    Insert,
    Update,
    Delete,
    All,
}

impl Privilege {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            Privilege::Select => "SELECT",
            Privilege::Insert => "INSERT",
            Privilege::Update => "UPDATE",
            Privilege::Delete => "DELETE",
            Privilege::All => "ALL PRIVILEGES",
        }
    }
}
