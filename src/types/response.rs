use serde::Serialize;
use serde_json::value::RawValue;

#[derive(Serialize)]
pub(crate) struct Message {
    pub(crate) message: String,
}

impl Message {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
pub(crate) struct Token {
    pub(crate) access_token: String,
    pub(crate) token_type: &'static str,
}

impl Token {
    pub(crate) fn bearer(access_token: String) -> Self {
        Self {
            access_token,
            token_type: "bearer",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub(crate) struct InsertSummary {
    pub(crate) added: u64,
    pub(crate) updated: u64,
}

#[derive(Serialize)]
pub(crate) struct Inserted {
    pub(crate) message: String,
    #[serde(flatten)]
    pub(crate) summary: InsertSummary,
}

/// Rows are passed through as the JSON Postgres rendered for them.
#[derive(Serialize)]
pub(crate) struct TableData {
    pub(crate) db_name: String,
    pub(crate) table_name: String,
    pub(crate) data: Vec<Box<RawValue>>,
}
