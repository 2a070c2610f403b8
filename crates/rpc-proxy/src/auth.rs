// fil-rpc-proxy - Caching JSON-RPC reverse proxy
// Copyright (C) 2024 fil-rpc-proxy contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Bearer-token verification in front of the proxy route

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use eyre::Result;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{config::Config, rpc, server::AppState};

/// Token claims: a permission list, plus an optional expiry.
///
/// The reference deployment ships `read` for clients and `admin` for the
/// refresh loops' self-issued tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Granted permissions
    #[serde(default)]
    pub perms: Vec<String>,
    /// Expiry as a unix timestamp; validated when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

/// HMAC-signed JWT issuing and verification.
pub struct JwtAuth {
    encoding: EncodingKey,
    decoding: DecodingKey,
    header: Header,
    validation: Validation,
}

impl JwtAuth {
    /// Builds keys from a raw secret and algorithm name.
    pub fn new(secret: &[u8], alg: &str) -> Result<Self> {
        let algorithm = match alg {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => eyre::bail!("unsupported jwt algorithm: {other}"),
        };
        let mut validation = Validation::new(algorithm);
        // expiry is enforced when the claim is present, but tokens without
        // one stay valid
        validation.set_required_spec_claims::<&str>(&[]);
        validation.validate_exp = true;

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            header: Header::new(algorithm),
            validation,
        })
    }

    /// Builds keys from the configured secret (plain or base64) and
    /// algorithm.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.secret_bytes()?, &config.jwt_alg)
    }

    /// Signs a token carrying the given permissions, without expiry.
    pub fn issue(&self, perms: &[String]) -> Result<String> {
        let claims = Claims { perms: perms.to_vec(), exp: None };
        Ok(jsonwebtoken::encode(&self.header, &claims, &self.encoding)?)
    }

    /// Verifies signature and expiry, returning the claims.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)?;
        Ok(data.claims)
    }
}

/// Middleware guarding the proxied route.
///
/// Extracts the bearer token from `Authorization` and rejects
/// missing/invalid/expired tokens with 401 and a JSON-RPC error envelope.
pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match token {
        Some(token) => match state.auth.verify(token) {
            Ok(_claims) => next.run(request).await,
            Err(err) => {
                debug!("rejected bearer token: {err}");
                unauthorized()
            }
        },
        None => unauthorized(),
    }
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(rpc::unauthenticated_envelope())).into_response()
}
