use serde::Deserialize;
use serde_json::{Map, Value};

use crate::types::table::{ColumnDescriptor, Privilege};

/// Form body of the token endpoint.
#[derive(Deserialize)]
pub(crate) struct LoginData {
    pub(crate) username: String,
    pub(crate) password: String,
}

#[derive(Deserialize)]
pub(crate) struct RegisterUser {
    pub(crate) username: String,
    pub(crate) password: String,
    #[serde(default)]
    pub(crate) is_admin: bool,
}

#[derive(Deserialize)]
pub(crate) struct CreateDatabase {
    pub(crate) db_name: String,
}

#[derive(Deserialize)]
pub(crate) struct CreateDbUser {
    pub(crate) username: String,
    pub(crate) password: String,
    pub(crate) db_name: String,
    pub(crate) privileges: Vec<Privilege>,
}

#[derive(Deserialize)]
pub(crate) struct CreateTable {
    pub(crate) db_name: String,
    pub(crate) table_name: String,
    pub(crate) table_schema: Vec<ColumnDescriptor>,
}

#[derive(Deserialize)]
pub(crate) struct InsertData {
    pub(crate) db_name: String,
    pub(crate) table_name: String,
    pub(crate) data: Vec<Map<String, Value>>,
}
