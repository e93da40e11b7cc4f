//! Zoho OAuth defaults
//!
//! These identify the Bigin data center and token lifetime conventions. Client
//! credentials and tokens are never constants; they come from configuration.

use std::time::Duration;

/// Key of the credential row owned by this service
pub const DEFAULT_SERVICE_ID: &str = "zoho_bigin";

/// Token endpoint for the India data center (accounts.zoho.in)
pub const DEFAULT_TOKEN_URL: &str = "https://accounts.zoho.in/oauth/v2/token";

/// Refresh this long before the recorded expiry
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Lifetime assumed when the token endpoint omits `expires_in`
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Timeout for one token endpoint round trip
pub const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
