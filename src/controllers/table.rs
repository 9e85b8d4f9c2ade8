use serde_json::value::RawValue;
use serde_json::{Map, Value};
use sqlx::Row;
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::Query;
use sqlx::types::Json;
use tracing::instrument;

use crate::core::error::Error;
use crate::core::store::{Session, Store, retry_once};
use crate::types::response::InsertSummary;
use crate::types::table::{
    CatalogColumn, ColumnDescriptor, ColumnType, Identifier, Privilege, SqlValue,
    TableDescriptor, TableShape, parse_row, qualified,
};

const UNDEFINED_TABLE: &str = "42P01";
const DUPLICATE_SCHEMA: &str = "42P06";
const DUPLICATE_TABLE: &str = "42P07";
const DUPLICATE_COLUMN: &str = "42701";
const DUPLICATE_OBJECT: &str = "42710";
const INVALID_SCHEMA_NAME: &str = "3F000";
const NOT_NULL_VIOLATION: &str = "23502";
const UNIQUE_VIOLATION: &str = "23505";
const DATA_EXCEPTION_CLASS: &str = "22";

/// Advisory lock key serializing role creation and grants.
const ROLE_LOCK_KEY: i64 = 0x7461_626c_6567_6174;

/// Creates, fills, reads and drops tables whose shape is only known at
/// request time. A "database" here is a PostgreSQL schema inside the
/// service's own database.
#[derive(Clone, Debug)]
pub(crate) struct TableController {
    store: Store,
}

impl TableController {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub(crate) async fn create_database(&self, name: &str) -> Result<(), Error> {
        let database = Identifier::database(name)?;
        let mut session = self.store.session().await?;

        if schema_exists(&mut session, &database).await? {
            return Err(Error::DatabaseExists(database.to_string()));
        }

        let statement = format!("CREATE SCHEMA {}", database.quoted());

        match session.execute(sqlx::query(&statement)).await {
            Ok(_) => {
                tracing::info!("created database {}", database);
                Ok(())
            }
            Err(e) if sqlstate(&e).as_deref() == Some(DUPLICATE_SCHEMA) => {
                Err(Error::DatabaseExists(database.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, columns))]
    pub(crate) async fn create_table(
        &self,
        database: &str,
        table: &str,
        columns: &[ColumnDescriptor],
    ) -> Result<(), Error> {
        let descriptor = TableDescriptor::new(database, table, columns)?;
        let mut session = self.store.session().await?;

        if !schema_exists(&mut session, &descriptor.database).await? {
            return Err(Error::DatabaseNotFound(descriptor.database.to_string()));
        }

        if table_exists(&mut session, &descriptor.database, &descriptor.table).await? {
            return Err(table_exists_error(&descriptor.database, &descriptor.table));
        }

        let statement = descriptor.create_statement();
        tracing::debug!("{}", statement);

        match session.execute(sqlx::query(&statement)).await {
            Ok(_) => {
                tracing::info!(
                    columns = descriptor.columns.len(),
                    "created table {}.{}",
                    descriptor.database,
                    descriptor.table
                );
                Ok(())
            }
            Err(e) => Err(match sqlstate(&e).as_deref() {
                Some(DUPLICATE_TABLE) => {
                    table_exists_error(&descriptor.database, &descriptor.table)
                }
                Some(INVALID_SCHEMA_NAME) => {
                    Error::DatabaseNotFound(descriptor.database.to_string())
                }
                Some(DUPLICATE_COLUMN) => Error::InvalidDescriptor(
                    "column name conflicts with a system column".into(),
                ),
                _ => e,
            }),
        }
    }

    pub(crate) async fn insert_row(
        &self,
        database: &str,
        table: &str,
        payload: &Map<String, Value>,
    ) -> Result<InsertSummary, Error> {
        self.insert_rows(database, table, std::slice::from_ref(payload))
            .await
    }

    /// Validates every row against the live catalog, then writes them all in
    /// one transaction. Nothing is written if any row is rejected.
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub(crate) async fn insert_rows(
        &self,
        database: &str,
        table: &str,
        rows: &[Map<String, Value>],
    ) -> Result<InsertSummary, Error> {
        let database = Identifier::database(database)?;
        let table = Identifier::table(table)?;
        let rows = rows.iter().map(parse_row).collect::<Result<Vec<_>, _>>()?;

        let mut session = self.store.session().await?;

        let shape = load_shape(&mut session, &database, &table)
            .await?
            .ok_or_else(|| table_not_found(&database, &table))?;

        let inserts = rows
            .iter()
            .map(|row| shape.prepare(&database, &table, row))
            .collect::<Result<Vec<_>, _>>()?;

        let mut summary = InsertSummary::default();
        let mut transaction = session.begin().await?;

        for insert in &inserts {
            let query = insert
                .values
                .iter()
                .fold(sqlx::query(&insert.sql), bind_value);

            match transaction.fetch_optional(query).await {
                Ok(Some(row)) if row.get::<bool, _>("inserted") => summary.added += 1,
                Ok(_) => summary.updated += 1,
                Err(e) => {
                    if !e.is_transient() {
                        if let Err(rollback) = transaction.rollback().await {
                            tracing::warn!("rollback failed: {}", rollback);
                        }
                    }

                    return Err(classify_write_error(e, &database, &table));
                }
            }
        }

        transaction.commit().await?;

        tracing::info!(
            added = summary.added,
            updated = summary.updated,
            "inserted into {}.{}",
            database,
            table
        );

        Ok(summary)
    }

    /// Returns every row as JSON, in physical storage order.
    #[instrument(skip(self))]
    pub(crate) async fn fetch_table(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Vec<Box<RawValue>>, Error> {
        let database = &Identifier::database(database)?;
        let table = &Identifier::table(table)?;
        let store = &self.store;

        retry_once(move || async move {
            let mut session = store.session().await?;

            if !table_exists(&mut session, database, table).await? {
                return Err(table_not_found(database, table));
            }

            let statement = format!(
                "SELECT row_to_json(t) FROM {} AS t ORDER BY t.ctid",
                qualified(database, table)
            );

            let rows = session
                .fetch_all(sqlx::query(&statement))
                .await
                .map_err(|e| classify_write_error(e, database, table))?;

            rows.iter()
                .map(|row| {
                    row.try_get::<Json<Box<RawValue>>, _>(0)
                        .map(|json| json.0)
                        .map_err(Error::from)
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    #[instrument(skip(self))]
    pub(crate) async fn delete_table(&self, database: &str, table: &str) -> Result<(), Error> {
        let database = Identifier::database(database)?;
        let table = Identifier::table(table)?;
        let mut session = self.store.session().await?;

        if !table_exists(&mut session, &database, &table).await? {
            return Err(table_not_found(&database, &table));
        }

        let statement = format!("DROP TABLE {}", qualified(&database, &table));

        match session.execute(sqlx::query(&statement)).await {
            Ok(_) => {
                tracing::info!("dropped table {}.{}", database, table);
                Ok(())
            }
            Err(e) => Err(classify_write_error(e, &database, &table)),
        }
    }

    /// Creates a login role for `database` when it does not exist yet and
    /// grants `privileges` on the database's current and future tables.
    /// Returns whether the role was created.
    #[instrument(skip(self, password))]
    pub(crate) async fn create_db_user(
        &self,
        database: &str,
        username: &str,
        password: &str,
        privileges: &[Privilege],
    ) -> Result<bool, Error> {
        let database = Identifier::database(database)?;
        let role = Identifier::role(username)?;

        if privileges.is_empty() {
            return Err(Error::InvalidDescriptor(
                "at least one privilege is required".into(),
            ));
        }

        let grants = if privileges.contains(&Privilege::All) {
            Privilege::All.sql().to_owned()
        } else {
            let mut grants: Vec<&str> = privileges.iter().map(|p| p.sql()).collect();
            grants.sort_unstable();
            grants.dedup();
            grants.join(", ")
        };

        let mut session = self.store.session().await?;

        if !schema_exists(&mut session, &database).await? {
            return Err(Error::DatabaseNotFound(database.to_string()));
        }

        match grant_role(&mut session, &database, &role, password, &grants).await {
            // A role created outside this service between the check and CREATE ROLE.
            Err(e)
                if matches!(
                    sqlstate(&e).as_deref(),
                    Some(UNIQUE_VIOLATION | DUPLICATE_OBJECT)
                ) =>
            {
                tracing::debug!("role {} appeared concurrently, granting again", role);
                grant_role(&mut session, &database, &role, password, &grants).await
            }
            result => result,
        }
    }
}

/// Creates `role` unless it exists and applies `grants` on `database`, all in
/// one transaction. Returns whether the role was created.
async fn grant_role(
    session: &mut Session,
    database: &Identifier,
    role: &Identifier,
    password: &str,
    grants: &str,
) -> Result<bool, Error> {
    let mut transaction = session.begin().await?;

    // Held until commit; concurrent requests check and create roles one at a time.
    transaction
        .execute(sqlx::query("SELECT pg_advisory_xact_lock($1)").bind(ROLE_LOCK_KEY))
        .await?;

    let role_exists: bool = transaction
        .fetch_one(
            sqlx::query("SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_roles WHERE rolname = $1)")
                .bind(role.as_str()),
        )
        .await?
        .get(0);

    if !role_exists {
        // Passwords cannot be bound in utility statements; let the server quote it.
        let statement: String = transaction
            .fetch_one(
                sqlx::query("SELECT format('CREATE ROLE %I LOGIN PASSWORD %L', $1::text, $2::text)")
                    .bind(role.as_str())
                    .bind(password),
            )
            .await?
            .get(0);

        transaction.execute(sqlx::query(&statement)).await?;
    }

    for statement in [
        format!(
            "GRANT USAGE ON SCHEMA {} TO {}",
            database.quoted(),
            role.quoted()
        ),
        format!(
            "GRANT {} ON ALL TABLES IN SCHEMA {} TO {}",
            grants,
            database.quoted(),
            role.quoted()
        ),
        format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA {} GRANT {} ON TABLES TO {}",
            database.quoted(),
            grants,
            role.quoted()
        ),
    ] {
        transaction.execute(sqlx::query(&statement)).await?;
    }

    transaction.commit().await?;

    tracing::info!(
        created = !role_exists,
        "granted {} on {} to {}",
        grants,
        database,
        role
    );

    Ok(!role_exists)
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Text(text) | SqlValue::Decimal(text) => query.bind(text.as_str()),
        SqlValue::Integer(integer) => query.bind(*integer),
        SqlValue::Boolean(boolean) => query.bind(*boolean),
        SqlValue::Timestamp(timestamp) => query.bind(*timestamp),
    }
}

async fn schema_exists(session: &mut Session, database: &Identifier) -> Result<bool, Error> {
    let row = session
        .fetch_one(
            sqlx::query("SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1)")
                .bind(database.as_str()),
        )
        .await?;

    Ok(row.get(0))
}

async fn table_exists(
    session: &mut Session,
    database: &Identifier,
    table: &Identifier,
) -> Result<bool, Error> {
    let row = session
        .fetch_one(
            sqlx::query(
                "SELECT EXISTS (
                    SELECT 1 FROM pg_catalog.pg_tables WHERE schemaname = $1 AND tablename = $2
                )",
            )
            .bind(database.as_str())
            .bind(table.as_str()),
        )
        .await?;

    Ok(row.get(0))
}

/// Reads column names, types and the primary key from the catalog. `None`
/// when the table does not exist.
async fn load_shape(
    session: &mut Session,
    database: &Identifier,
    table: &Identifier,
) -> Result<Option<TableShape>, Error> {
    if !table_exists(session, database, table).await? {
        return Ok(None);
    }

    let columns = session
        .fetch_all(
            sqlx::query(
                "SELECT column_name::text AS name, data_type::text AS data_type
                FROM information_schema.columns
                WHERE table_schema = $1 AND table_name = $2
                ORDER BY ordinal_position",
            )
            .bind(database.as_str())
            .bind(table.as_str()),
        )
        .await?
        .into_iter()
        .map(|row| {
            let data_type: String = row.get("data_type");

            CatalogColumn {
                name: row.get("name"),
                column_type: ColumnType::from_catalog(&data_type),
            }
        })
        .collect();

    let primary_key = session
        .fetch_all(
            sqlx::query(
                "SELECT a.attname::text AS name
                FROM pg_catalog.pg_index i
                JOIN pg_catalog.pg_attribute a
                    ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                WHERE i.indrelid = format('%I.%I', $1::text, $2::text)::regclass
                    AND i.indisprimary",
            )
            .bind(database.as_str())
            .bind(table.as_str()),
        )
        .await?
        .into_iter()
        .map(|row| row.get("name"))
        .collect();

    Ok(Some(TableShape {
        columns,
        primary_key,
    }))
}

fn sqlstate(e: &Error) -> Option<String> {
    match e {
        Error::Sql(sqlx::Error::Database(db_err)) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

/// Turns constraint and conversion failures into `SchemaMismatch` and a
/// concurrently dropped table into `TableNotFound`.
fn classify_write_error(e: Error, database: &Identifier, table: &Identifier) -> Error {
    let mapped = match (&e, sqlstate(&e)) {
        (Error::Sql(sqlx::Error::Database(db_err)), Some(code)) => match code.as_str() {
            UNDEFINED_TABLE | INVALID_SCHEMA_NAME => Some(table_not_found(database, table)),
            NOT_NULL_VIOLATION | UNIQUE_VIOLATION => {
                Some(Error::SchemaMismatch(db_err.message().to_owned()))
            }
            code if code.starts_with(DATA_EXCEPTION_CLASS) => {
                Some(Error::SchemaMismatch(db_err.message().to_owned()))
            }
            _ => None,
        },
        _ => None,
    };

    mapped.unwrap_or(e)
}

fn table_not_found(database: &Identifier, table: &Identifier) -> Error {
    Error::TableNotFound {
        database: database.to_string(),
        table: table.to_string(),
    }
}

fn table_exists_error(database: &Identifier, table: &Identifier) -> Error {
    Error::TableExists {
        database: database.to_string(),
        table: table.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::tests::{live_settings, unreachable_settings};
    use serde_json::json;

    const HOSTILE: [&str; 4] = ["users;", "users\"", "x'; DROP TABLE api_users; --", ""];

    fn columns() -> Vec<ColumnDescriptor> {
        serde_json::from_value(json!([
            {"name": "id", "type": "int", "primary_key": true},
            {"name": "name", "type": "str", "nullable": false},
            {"name": "score", "type": "float"},
            {"name": "active", "type": "bool"},
            {"name": "seen_at", "type": "datetime"}
        ]))
        .unwrap()
    }

    fn row(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn hostile_identifiers_never_reach_the_database() {
        let store = Store::new(unreachable_settings());
        let tables = TableController::new(store.clone());

        for name in HOSTILE {
            assert!(matches!(
                tables.create_database(name).await,
                Err(Error::InvalidIdentifier(_))
            ));
            assert!(matches!(
                tables.create_table("shop", name, &columns()).await,
                Err(Error::InvalidIdentifier(_))
            ));
            assert!(matches!(
                tables.create_table(name, "orders", &columns()).await,
                Err(Error::InvalidIdentifier(_))
            ));
            assert!(matches!(
                tables.insert_row("shop", name, &row(json!({"id": 1}))).await,
                Err(Error::InvalidIdentifier(_))
            ));
            assert!(matches!(
                tables.fetch_table(name, "orders").await,
                Err(Error::InvalidIdentifier(_))
            ));
            assert!(matches!(
                tables.delete_table("shop", name).await,
                Err(Error::InvalidIdentifier(_))
            ));
            assert!(matches!(
                tables
                    .create_db_user("shop", name, "pw", &[Privilege::Select])
                    .await,
                Err(Error::InvalidIdentifier(_))
            ));
        }

        let mut payload = Map::new();
        payload.insert("id\"; --".into(), json!(1));
        assert!(matches!(
            tables.insert_row("shop", "orders", &payload).await,
            Err(Error::InvalidIdentifier(_))
        ));

        assert!(!store.is_initialized());
    }

    #[tokio::test]
    async fn reserved_schemas_are_refused() {
        let store = Store::new(unreachable_settings());
        let tables = TableController::new(store.clone());

        assert!(matches!(
            tables.delete_table("public", "api_users").await,
            Err(Error::InvalidIdentifier(_))
        ));
        assert!(matches!(
            tables.fetch_table("pg_catalog", "pg_authid").await,
            Err(Error::InvalidIdentifier(_))
        ));
        assert!(!store.is_initialized());
    }

    #[tokio::test]
    async fn descriptor_errors_precede_any_connection() {
        let store = Store::new(unreachable_settings());
        let tables = TableController::new(store.clone());

        let duplicated = vec![
            ColumnDescriptor {
                name: "a".into(),
                column_type: ColumnType::Text,
                primary_key: false,
                nullable: true,
            };
            2
        ];

        assert!(matches!(
            tables.create_table("shop", "orders", &duplicated).await,
            Err(Error::InvalidDescriptor(_))
        ));
        assert!(matches!(
            tables.create_db_user("shop", "reader", "pw", &[]).await,
            Err(Error::InvalidDescriptor(_))
        ));

        let system: Vec<ColumnDescriptor> =
            serde_json::from_value(json!([{"name": "xmin", "type": "int"}])).unwrap();
        assert!(matches!(
            tables.create_table("shop", "orders", &system).await,
            Err(Error::InvalidIdentifier(_))
        ));
        assert!(!store.is_initialized());
    }

    async fn live() -> (TableController, String) {
        let database = format!(
            "t_{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let tables = TableController::new(Store::new(live_settings()));
        tables.create_database(&database).await.unwrap();
        (tables, database)
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL server at TABLEGATE_TEST_DATABASE_URL"]
    async fn database_and_table_lifecycle() {
        let (tables, db) = live().await;

        assert!(matches!(
            tables.create_database(&db).await,
            Err(Error::DatabaseExists(_))
        ));

        tables.create_table(&db, "people", &columns()).await.unwrap();
        assert!(matches!(
            tables.create_table(&db, "people", &columns()).await,
            Err(Error::TableExists { .. })
        ));

        assert!(tables.fetch_table(&db, "people").await.unwrap().is_empty());

        tables.delete_table(&db, "people").await.unwrap();
        assert!(matches!(
            tables.delete_table(&db, "people").await,
            Err(Error::TableNotFound { .. })
        ));
        assert!(matches!(
            tables.fetch_table(&db, "people").await,
            Err(Error::TableNotFound { .. })
        ));
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL server at TABLEGATE_TEST_DATABASE_URL"]
    async fn missing_database_is_reported() {
        let tables = TableController::new(Store::new(live_settings()));

        assert!(matches!(
            tables
                .create_table("no_such_database_here", "people", &columns())
                .await,
            Err(Error::DatabaseNotFound(_))
        ));
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL server at TABLEGATE_TEST_DATABASE_URL"]
    async fn inserts_upsert_and_read_back_in_order() {
        let (tables, db) = live().await;
        tables.create_table(&db, "people", &columns()).await.unwrap();

        let summary = tables
            .insert_rows(
                &db,
                "people",
                &[
                    row(json!({"id": 1, "name": "Ada", "score": 9.5, "active": true})),
                    row(json!({"id": 2, "name": "Grace", "seen_at": "2024-03-01T12:00:00Z"})),
                ],
            )
            .await
            .unwrap();
        assert_eq!(summary, InsertSummary { added: 2, updated: 0 });

        let summary = tables
            .insert_row(&db, "people", &row(json!({"id": 1, "name": "Ada L."})))
            .await
            .unwrap();
        assert_eq!(summary, InsertSummary { added: 0, updated: 1 });

        let rows: Vec<Value> = tables
            .fetch_table(&db, "people")
            .await
            .unwrap()
            .iter()
            .map(|raw| serde_json::from_str(raw.get()).unwrap())
            .collect();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], json!(2));
        assert_eq!(rows[1]["name"], json!("Ada L."));
        assert_eq!(rows[1]["active"], json!(true));
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL server at TABLEGATE_TEST_DATABASE_URL"]
    async fn rejected_rows_leave_nothing_behind() {
        let (tables, db) = live().await;
        tables.create_table(&db, "people", &columns()).await.unwrap();

        let unknown_key = tables
            .insert_rows(
                &db,
                "people",
                &[
                    row(json!({"id": 1, "name": "Ada"})),
                    row(json!({"id": 2, "name": "Grace", "nickname": "amazing"})),
                ],
            )
            .await;
        assert!(matches!(unknown_key, Err(Error::SchemaMismatch(_))));

        // Passes validation, then fails NOT NULL inside the transaction.
        let null_name = tables
            .insert_rows(
                &db,
                "people",
                &[
                    row(json!({"id": 1, "name": "Ada"})),
                    row(json!({"id": 2, "score": 1.0})),
                ],
            )
            .await;
        assert!(matches!(null_name, Err(Error::SchemaMismatch(_))));

        assert!(tables.fetch_table(&db, "people").await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL server at TABLEGATE_TEST_DATABASE_URL"]
    async fn insert_into_missing_table_is_not_found() {
        let (tables, db) = live().await;

        assert!(matches!(
            tables.insert_row(&db, "ghost", &row(json!({"id": 1}))).await,
            Err(Error::TableNotFound { .. })
        ));
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL server at TABLEGATE_TEST_DATABASE_URL"]
    async fn db_user_is_created_once_and_regranted() {
        let (tables, db) = live().await;
        let role = format!("{}_reader", db);

        assert!(tables
            .create_db_user(&db, &role, "pw", &[Privilege::Select])
            .await
            .unwrap());
        assert!(!tables
            .create_db_user(&db, &role, "pw", &[Privilege::Select, Privilege::Insert])
            .await
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "needs a PostgreSQL server at TABLEGATE_TEST_DATABASE_URL"]
    async fn concurrent_db_user_requests_all_succeed() {
        let (tables, db) = live().await;
        let role = format!("{}_shared", db);

        let attempts: Vec<_> = (0..4)
            .map(|_| {
                let tables = tables.clone();
                let db = db.clone();
                let role = role.clone();
                tokio::spawn(async move {
                    tables
                        .create_db_user(&db, &role, "pw", &[Privilege::Select])
                        .await
                })
            })
            .collect();

        let mut created = 0;
        for attempt in attempts {
            if attempt.await.unwrap().unwrap() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL server at TABLEGATE_TEST_DATABASE_URL"]
    async fn system_column_names_are_client_errors() {
        let (tables, db) = live().await;
        let columns: Vec<ColumnDescriptor> =
            serde_json::from_value(json!([{"name": "ctid", "type": "int"}])).unwrap();

        assert!(matches!(
            tables.create_table(&db, "t", &columns).await,
            Err(Error::InvalidIdentifier(_))
        ));
    }
}
