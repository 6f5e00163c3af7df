use std::time::Duration;

use extapi_auth::{ClaimMapping, OidcAuthenticator, OidcConfig};
use http::HeaderMap;
use http::header;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};

fn oidc_config(jwks_json: &str) -> OidcConfig {
    OidcConfig {
        issuer: "https://issuer.example".to_string(),
        audience: Some("extapi".to_string()),
        jwks_url: None,
        jwks_json: Some(jwks_json.to_string()),
        jwks_timeout: Duration::from_millis(2000),
        jwks_refresh_ttl: Duration::from_secs(300),
        clock_skew: Duration::from_secs(0),
        claims: ClaimMapping {
            principal_id: "sub".to_string(),
            roles: "groups".to_string(),
            authorities: "permissions".to_string(),
        },
    }
}

fn sign(claims: &serde_json::Value) -> String {
    let private_key_pem = include_bytes!("fixtures/test_rsa_private.pem");

    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some("test-kid".to_string());

    encode(
        &header,
        claims,
        &EncodingKey::from_rsa_pem(private_key_pem).expect("private key must parse"),
    )
    .expect("token encode should succeed")
}

fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        format!("Bearer {}", token)
            .parse()
            .expect("authorization header must parse"),
    );
    headers
}

#[tokio::test]
async fn authenticate_extracts_principal_from_valid_rs256_jwt() {
    let auth = OidcAuthenticator::new(oidc_config(include_str!("fixtures/test_jwks.json")))
        .await
        .expect("auth init should succeed");

    let token = sign(&serde_json::json!({
        "iss": "https://issuer.example",
        "sub": "dev",
        "aud": "extapi",
        "exp": 2000000000,
        "iat": 1000000000,
        "groups": ["Developer", "Administrator"],
        "permissions": "view_issues"
    }));

    let principal = auth
        .authenticate(&bearer(&token))
        .await
        .expect("authenticate should succeed");

    assert_eq!(principal.principal_id, "dev");
    assert_eq!(principal.roles, vec!["Administrator", "Developer"]);
    assert_eq!(principal.authorities, vec!["view_issues"]);
}

#[tokio::test]
async fn authenticate_rejects_wrong_audience() {
    let auth = OidcAuthenticator::new(oidc_config(include_str!("fixtures/test_jwks.json")))
        .await
        .expect("auth init should succeed");

    let token = sign(&serde_json::json!({
        "iss": "https://issuer.example",
        "sub": "dev",
        "aud": "someone-else",
        "exp": 2000000000,
        "iat": 1000000000
    }));

    let err = auth.authenticate(&bearer(&token)).await.unwrap_err();
    assert_eq!(err.code, "ERR_AUTH_INVALID");
}

#[tokio::test]
async fn authenticate_maps_nested_roles_and_scope_string() {
    let mut config = oidc_config(include_str!("fixtures/test_jwks.json"));
    config.claims.roles = "realm_access.roles".to_string();
    config.claims.authorities = "scope".to_string();
    let auth = OidcAuthenticator::new(config)
        .await
        .expect("auth init should succeed");

    let token = sign(&serde_json::json!({
        "iss": "https://issuer.example",
        "sub": "ops",
        "aud": "extapi",
        "exp": 2000000000,
        "iat": 1000000000,
        "realm_access": {"roles": ["Administrator"]},
        "scope": "view_issues edit_issues"
    }));

    let principal = auth
        .authenticate(&bearer(&token))
        .await
        .expect("authenticate should succeed");
    assert_eq!(principal.roles, vec!["Administrator"]);
    assert_eq!(principal.authorities, vec!["edit_issues", "view_issues"]);
}
