pub(crate) mod request;
pub(crate) mod response;
pub(crate) mod table;
pub(crate) mod user;
