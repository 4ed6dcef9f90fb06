//! Random credentials: workspace passwords, access tokens, merchant order
//! ids. Alphanumeric only — several consumers (chpasswd stdin, the payment
//! gateway) reject punctuation.

use rand::Rng;
use rand::distributions::Alphanumeric;

/// Default password length for generated workspace credentials.
pub const DEFAULT_PASSWORD_LEN: usize = 18;

/// Random `[A-Za-z0-9]` string of the given length.
pub fn alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Workspace password with the default length.
pub fn password() -> String {
    alphanumeric(DEFAULT_PASSWORD_LEN)
}

/// Access token for the workspace row.
pub fn access_token() -> String {
    alphanumeric(32)
}

/// Fresh merchant order id: `BRT<epoch-seconds><company-id>`. Unique per
/// second per company, which matches how often the gateway lets a company
/// open a checkout.
pub fn merchant_oid(company_id: i64, now: chrono::DateTime<chrono::Utc>) -> String {
    format!("BRT{}{}", now.timestamp(), company_id)
}
