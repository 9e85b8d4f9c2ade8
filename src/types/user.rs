pub(crate) type Username = String;

/// A row of `api_users`.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct Credential {
    pub(crate) id: i32,
    pub(crate) username: Username,
    pub(crate) password_hash: String,
    pub(crate) is_admin: bool,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("is_admin", &self.is_admin)
            .finish_non_exhaustive()
    }
}
