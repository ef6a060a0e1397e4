//! Expiration checks for JWT-authorized references.
//!
//! Only the `exp` claim is looked at. Signatures are not verified; that is the job of whoever
//! accepts the token.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, Validation};
use serde::Deserialize;

use crate::requests::RequestError;

#[derive(Debug, Deserialize)]
struct Claims {
    exp: Option<i64>,
}

/// Reads the expiration time of `token`.
///
/// Returns `Ok(None)` for tokens without an `exp` claim.
pub fn jwt_expiration(token: &str) -> Result<Option<DateTime<Utc>>, RequestError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|err| RequestError::Malformed(format!("invalid token: {err}")))?;

    match data.claims.exp {
        None => Ok(None),
        Some(exp) => DateTime::from_timestamp(exp, 0)
            .map(Some)
            .ok_or_else(|| RequestError::Malformed(format!("invalid expiration {exp}"))),
    }
}

/// Whether `token` is expired at `now`.
///
/// Tokens which cannot be read count as expired. Tokens without `exp` never expire.
pub fn is_jwt_expired(token: &str, now: DateTime<Utc>) -> bool {
    match jwt_expiration(token) {
        Ok(Some(exp)) => exp <= now,
        Ok(None) => false,
        Err(_) => true,
    }
}

/// Orders tokens by how long they stay valid.
///
/// [`Ordering::Greater`] means `a` outlives `b`. Tokens without `exp` outlive every other token,
/// and unreadable tokens are outlived by every other token.
pub fn compare_jwt_lifetimes(a: &str, b: &str) -> Ordering {
    fn lifetime(token: &str) -> (u8, Option<DateTime<Utc>>) {
        match jwt_expiration(token) {
            Err(_) => (0, None),
            Ok(Some(exp)) => (1, Some(exp)),
            Ok(None) => (2, None),
        }
    }
    lifetime(a).cmp(&lifetime(b))
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use jsonwebtoken::{EncodingKey, Header};
    use serde::Serialize;

    use super::*;

    #[derive(Serialize)]
    struct TestClaims {
        sub: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        exp: Option<i64>,
    }

    fn token(exp: Option<DateTime<Utc>>) -> String {
        let claims = TestClaims {
            sub: "tester",
            exp: exp.map(|exp| exp.timestamp()),
        };
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"not checked"),
        )
        .unwrap()
    }

    #[test]
    fn test_expiration() {
        let exp = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(jwt_expiration(&token(Some(exp))), Ok(Some(exp)));
        assert_eq!(jwt_expiration(&token(None)), Ok(None));
        assert!(matches!(
            jwt_expiration("not.a.token"),
            Err(RequestError::Malformed(_))
        ));
    }

    #[test]
    fn test_is_expired() {
        let now = Utc::now();
        assert!(is_jwt_expired(&token(Some(now - TimeDelta::seconds(1))), now));
        assert!(!is_jwt_expired(&token(Some(now + TimeDelta::minutes(5))), now));
        assert!(!is_jwt_expired(&token(None), now));
        assert!(is_jwt_expired("garbage", now));
    }

    #[test]
    fn test_compare_lifetimes() {
        let now = Utc::now();
        let short = token(Some(now + TimeDelta::minutes(1)));
        let long = token(Some(now + TimeDelta::hours(1)));
        let forever = token(None);

        assert_eq!(compare_jwt_lifetimes(&long, &short), Ordering::Greater);
        assert_eq!(compare_jwt_lifetimes(&short, &long), Ordering::Less);
        assert_eq!(compare_jwt_lifetimes(&forever, &long), Ordering::Greater);
        assert_eq!(compare_jwt_lifetimes("garbage", &short), Ordering::Less);
        assert_eq!(compare_jwt_lifetimes(&short, &short), Ordering::Equal);
    }
}
