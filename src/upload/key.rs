//! Remote key generation
//!
//! Keys are `{prefix}{token}{.ext}`. Two token styles:
//!
//! - [`KeyStyle::Compact`]: 7 random alphanumerics followed by the epoch
//!   millis, e.g. `uploads/Xk2p9Qa1629536040000.png`
//! - [`KeyStyle::Long`]: 16 random alphanumerics, `-`, 16 random digits,
//!   e.g. `banner/dir/aZ81kq0PLm3d94Xs-4839201746352910.txt`

use rand::distr::{Alphanumeric, SampleString};
use rand::Rng;
use std::path::Path;

const COMPACT_TOKEN_LEN: usize = 7;
const LONG_TOKEN_LEN: usize = 16;
const LONG_DIGITS_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStyle {
    /// Direct uploads
    Compact,
    /// Files extracted from archives
    Long,
}

pub fn random_token(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::rng(), len)
}

fn random_digits(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

/// Extension of the last path component, without the dot
pub fn extension(original_name: &str) -> Option<&str> {
    let file_name = original_name.rsplit(['/', '\\']).next()?;
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
}

/// Join prefix segments with `/`.
///
/// Backslashes become `/`, empty segments are dropped, and a non-empty result
/// always ends with `/`.
pub fn join_prefix(parts: &[&str]) -> String {
    let mut joined = String::new();
    for segment in parts
        .iter()
        .flat_map(|part| part.split(['/', '\\']))
        .filter(|segment| !segment.is_empty())
    {
        joined.push_str(segment);
        joined.push('/');
    }
    joined
}

/// Generate a remote key for `original_name` under `prefix`
pub fn generate_key(prefix: &str, original_name: &str, style: KeyStyle) -> String {
    let mut key = join_prefix(&[prefix]);

    match style {
        KeyStyle::Compact => {
            key.push_str(&random_token(COMPACT_TOKEN_LEN));
            key.push_str(&chrono::Utc::now().timestamp_millis().to_string());
        }
        KeyStyle::Long => {
            key.push_str(&random_token(LONG_TOKEN_LEN));
            key.push('-');
            key.push_str(&random_digits(LONG_DIGITS_LEN));
        }
    }

    if let Some(ext) = extension(original_name) {
        key.push('.');
        key.push_str(ext);
    }
    key
}
