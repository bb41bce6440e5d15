use chrono::Utc;
use jsonwebtoken::{decode, encode, errors::Error as JwtError, Algorithm, DecodingKey,
                   EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::auth::{Identity, Role};

pub const TOKEN_TTL_SECS: i64 = 86_400;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub:  String,
    pub name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub exp:  i64,
}

impl From<Claims> for Identity {
    fn from(c: Claims) -> Self {
        Identity { user_id: c.sub, name: c.name, role: c.role, avatar: c.avatar }
    }
}

pub fn sign(who: &Identity, secret: &str) -> Result<String, JwtError> {
    let c = Claims {
        sub:    who.user_id.clone(),
        name:   who.name.clone(),
        role:   who.role,
        avatar: who.avatar.clone(),
        exp:    Utc::now().timestamp() + TOKEN_TTL_SECS,
    };
    encode(&Header::default(), &c, &EncodingKey::from_secret(secret.as_bytes()))
}

pub fn verify(token: &str, secret: &str) -> Result<Claims, JwtError> {
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()),
                     &Validation::new(Algorithm::HS256))
        .map(|d| d.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_token_verifies_with_same_secret() {
        let who = Identity::new("u1", "Ada", Role::Dj);
        let token = sign(&who, "s3cret").unwrap();
        let claims = verify(&token, "s3cret").unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.role, Role::Dj);
        assert!(verify(&token, "other").is_err());
    }
}
