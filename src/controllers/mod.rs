pub(crate) mod guard;
pub(crate) mod table;
pub(crate) mod user;
