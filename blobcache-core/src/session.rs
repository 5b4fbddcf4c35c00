use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::store::AssetCache;

/// Authentication state of the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    SignedOut,
    SignedIn { user_id: String },
}

impl AuthState {
    pub fn is_signed_in(&self) -> bool {
        matches!(self, AuthState::SignedIn { .. })
    }
}

/// Clear `cache` whenever the observed auth state changes, so assets fetched
/// for one session never leak into the next.
///
/// Re-sending an identical state is not a transition. The task ends when the
/// sender is dropped.
pub fn spawn_session_guard(
    cache: AssetCache,
    mut auth: watch::Receiver<AuthState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut current = auth.borrow_and_update().clone();
        while auth.changed().await.is_ok() {
            let next = auth.borrow_and_update().clone();
            if next == current {
                continue;
            }
            log::info!(
                "Auth state changed (signed in: {} -> {}), clearing asset cache",
                current.is_signed_in(),
                next.is_signed_in()
            );
            cache.clear();
            current = next;
        }
        log::debug!("Auth state sender dropped, session guard exiting");
    })
}
