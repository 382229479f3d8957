//! Tenant ids, capability keys and document ids.
//!
//! All values come from the OS CSPRNG and are rendered in the URL-safe base64
//! alphabet behind a role prefix. Write and read keys carry 192 bits of
//! entropy; ids carry 96.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{DbError, DbResult};

pub const DATABASE_ID_PREFIX: &str = "db_";
pub const WRITE_KEY_PREFIX: &str = "wk_";
pub const READ_KEY_PREFIX: &str = "rk_";
pub const DOCUMENT_ID_PREFIX: &str = "doc_";

const DATABASE_ID_LENGTH: usize = 16;
const KEY_LENGTH: usize = 32;
const DOCUMENT_ID_LENGTH: usize = 16;

pub fn database_id() -> DbResult<String> {
    prefixed(DATABASE_ID_PREFIX, DATABASE_ID_LENGTH)
}

pub fn write_key() -> DbResult<String> {
    prefixed(WRITE_KEY_PREFIX, KEY_LENGTH)
}

pub fn read_key() -> DbResult<String> {
    prefixed(READ_KEY_PREFIX, KEY_LENGTH)
}

pub fn document_id() -> DbResult<String> {
    prefixed(DOCUMENT_ID_PREFIX, DOCUMENT_ID_LENGTH)
}

fn prefixed(prefix: &str, length: usize) -> DbResult<String> {
    Ok(format!("{}{}", prefix, random_string(length)?))
}

/// `length` URL-safe characters; every character carries 6 random bits.
fn random_string(length: usize) -> DbResult<String> {
    let mut bytes = vec![0u8; (length * 3).div_ceil(4)];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| DbError::GenerationFailure(format!("random source unavailable: {}", e)))?;

    let mut encoded = URL_SAFE_NO_PAD.encode(&bytes);
    encoded.truncate(length);
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn is_url_safe(s: &str) -> bool {
        s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    #[test]
    fn test_prefixes_and_lengths() {
        let id = database_id().unwrap();
        assert!(id.starts_with("db_"));
        assert_eq!(id.len(), 3 + DATABASE_ID_LENGTH);

        let wk = write_key().unwrap();
        assert!(wk.starts_with("wk_"));
        assert_eq!(wk.len(), 3 + KEY_LENGTH);

        let rk = read_key().unwrap();
        assert!(rk.starts_with("rk_"));
        assert_eq!(rk.len(), 3 + KEY_LENGTH);

        let doc = document_id().unwrap();
        assert!(doc.starts_with("doc_"));
        assert_eq!(doc.len(), 4 + DOCUMENT_ID_LENGTH);

        for value in [&id[3..], &wk[3..], &rk[3..], &doc[4..]] {
            assert!(is_url_safe(value), "{value} is not url safe");
        }
    }

    #[test]
    fn test_values_do_not_repeat() {
        let keys: HashSet<String> = (0..1000).map(|_| write_key().unwrap()).collect();
        assert_eq!(keys.len(), 1000);
    }
}
