use crate::controllers::guard::Guard;
use crate::controllers::table::TableController;
use crate::controllers::user::UserController;
use crate::core::config::PoolSettings;
use crate::core::store::Store;
use crate::utils::auth::TokenService;
use crate::utils::password::PasswordHasher;

#[derive(Clone, Debug)]
pub(crate) struct AppState {
    pub(crate) store: Store,
    pub(crate) users: UserController,
    pub(crate) tables: TableController,
    pub(crate) hasher: PasswordHasher,
    pub(crate) guard: Guard<UserController>,
}

impl AppState {
    /// Wires every component to one lazily-connected store.
    pub(crate) fn new(pool: PoolSettings, tokens: TokenService, hasher: PasswordHasher) -> Self {
        let store = Store::new(pool);
        let users = UserController::new(store.clone());

        AppState {
            guard: Guard::new(tokens, users.clone()),
            tables: TableController::new(store.clone()),
            users,
            hasher,
            store,
        }
    }

    pub(crate) fn tokens(&self) -> &TokenService {
        self.guard.tokens()
    }
}
