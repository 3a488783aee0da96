//! Authentication state trait and macro.

use super::session::SessionManager;

/// Trait for state types that give the access gate its session backend.
pub trait HasAuthBackend {
    fn sessions(&self) -> &SessionManager;
}

/// Implement `HasAuthBackend` for a state struct with the standard field.
///
/// The struct must have a `sessions: Arc<SessionManager>` field.
#[macro_export]
macro_rules! impl_has_auth_backend {
    ($state_type:ty) => {
        impl $crate::auth::HasAuthBackend for $state_type {
            fn sessions(&self) -> &$crate::auth::SessionManager {
                &self.sessions
            }
        }
    };
}
