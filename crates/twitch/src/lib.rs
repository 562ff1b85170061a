pub mod helix;
pub mod oauth;

pub use helix::{HelixClient, HelixError, HelixStream};
pub use oauth::{AppAccessToken, AppTokenCache, OAuthError, TwitchOAuthClient};
