//! Third-party OAuth on behalf of a session.

pub mod callback;
pub mod provider;
pub mod state;

pub use callback::{AuthorizationRequest, CallbackOutcome, CallbackParams, OAuthFlow};
pub use provider::{OAuthProvider, ProviderKind, ProviderRegistry};
pub use state::{StatePayload, StateSigner};
