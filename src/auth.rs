use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::{User, UserId};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: UserId,
    pub username: String,
    pub exp: u64,
}

/// Resolves bearer tokens issued by the account service to users.
#[derive(Clone)]
pub struct Identity {
    decoding: DecodingKey,
    validation: Validation,
}

impl Identity {
    pub fn new(secret: &str) -> Identity {
        Identity {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// `None` means anonymous: no token, a bad signature, or an expired token.
    pub fn resolve(&self, token: Option<&str>) -> Option<User> {
        let token = token?;
        match decode::<Claims>(token, &self.decoding, &self.validation) {
            Ok(data) => Some(User {
                id: data.claims.user_id,
                username: data.claims.username,
            }),
            Err(err) => {
                debug!("rejected bearer token: {err}");
                None
            }
        }
    }
}
