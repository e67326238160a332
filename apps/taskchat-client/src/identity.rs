use taskchat_proto::{ClientId, UserRecord};
use tracing::{debug, info};

use crate::store::{self, LocalStore, StoreError, CACHED_USER_KEY, CLIENT_ID_KEY};

/// Returns the persisted client identity, minting and storing one on first
/// use. If another writer minted concurrently, its identity wins.
pub fn load_or_mint(store: &dyn LocalStore) -> Result<ClientId, StoreError> {
    if let Some((_, id)) = store::read::<ClientId>(store, CLIENT_ID_KEY)? {
        return Ok(id);
    }
    let minted = ClientId::mint();
    match store.store_if(CLIENT_ID_KEY, 0, serde_json::to_value(&minted)?) {
        Ok(_) => {
            info!(target = "taskchat::identity", client_id = %minted, "minted client identity");
            Ok(minted)
        }
        Err(conflict @ StoreError::Conflict { .. }) => {
            debug!(
                target = "taskchat::identity",
                "identity minted concurrently; adopting stored value"
            );
            match store::read::<ClientId>(store, CLIENT_ID_KEY)? {
                Some((_, id)) => Ok(id),
                None => Err(conflict),
            }
        }
        Err(err) => Err(err),
    }
}

/// Remembers the last user the server authenticated, for offline display.
pub fn cache_user(store: &dyn LocalStore, user: &UserRecord) -> Result<(), StoreError> {
    store::overwrite(store, CACHED_USER_KEY, user).map(|_| ())
}

pub fn cached_user(store: &dyn LocalStore) -> Result<Option<UserRecord>, StoreError> {
    Ok(store::read::<UserRecord>(store, CACHED_USER_KEY)?.map(|(_, user)| user))
}

pub fn forget_user(store: &dyn LocalStore) -> Result<(), StoreError> {
    store.remove(CACHED_USER_KEY)
}
