use http::HeaderMap;

mod oidc;

pub use oidc::{ClaimMapping, OidcAuthenticator, OidcConfig};

pub const PRINCIPAL_ID_HEADER: &str = "x-extapi-principal-id";
pub const ROLES_HEADER: &str = "x-extapi-roles";
pub const AUTHORITIES_HEADER: &str = "x-extapi-authorities";
pub const LOCAL_AUTH_SECRET_HEADER: &str = "x-extapi-local-auth-secret";

/// The authenticated caller. `roles` are checked against `requiresAnyRole`,
/// `authorities` against `requiresAllPermissions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: String,
    pub roles: Vec<String>,
    pub authorities: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl AuthError {
    pub(crate) fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

/// Builds a principal from trusted headers. Only meant for loopback
/// deployments or behind a proxy that sets the shared secret.
pub fn local_principal(
    headers: &HeaderMap,
    shared_secret: Option<&str>,
) -> Result<Principal, AuthError> {
    if let Some(expected) = shared_secret {
        let provided = header_str(headers, LOCAL_AUTH_SECRET_HEADER)
            .ok_or_else(|| AuthError::new("ERR_AUTH_REQUIRED", "missing local auth secret"))?;
        if provided != expected {
            return Err(AuthError::new("ERR_AUTH_INVALID", "invalid local auth secret"));
        }
    }

    let principal_id = header_str(headers, PRINCIPAL_ID_HEADER)
        .map(|v| v.to_string())
        .ok_or_else(|| {
            AuthError::new(
                "ERR_AUTH_REQUIRED",
                format!("missing {} header", PRINCIPAL_ID_HEADER),
            )
        })?;

    Ok(Principal {
        principal_id,
        roles: header_list(headers, ROLES_HEADER),
        authorities: header_list(headers, AUTHORITIES_HEADER),
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn header_list(headers: &HeaderMap, name: &str) -> Vec<String> {
    header_str(headers, name)
        .map(|raw| name_list(raw.split(',')))
        .unwrap_or_default()
}

/// Trimmed, sorted and deduplicated; blanks are dropped.
pub(crate) fn name_list<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out = names
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, value.parse().expect("header value must parse"));
        }
        headers
    }

    #[test]
    fn local_principal_reads_roles_and_authorities() {
        let principal = local_principal(
            &headers(&[
                (PRINCIPAL_ID_HEADER, "dev"),
                (ROLES_HEADER, "Developer, Administrator,,Developer"),
                (AUTHORITIES_HEADER, "view_issues"),
            ]),
            None,
        )
        .expect("local principal should parse");

        assert_eq!(principal.principal_id, "dev");
        assert_eq!(principal.roles, vec!["Administrator", "Developer"]);
        assert_eq!(principal.authorities, vec!["view_issues"]);
    }

    #[test]
    fn local_principal_requires_id_header() {
        let err = local_principal(&headers(&[(ROLES_HEADER, "Developer")]), None).unwrap_err();
        assert_eq!(err.code, "ERR_AUTH_REQUIRED");
    }

    #[test]
    fn local_principal_enforces_shared_secret() {
        let base = [(PRINCIPAL_ID_HEADER, "dev")];
        let err = local_principal(&headers(&base), Some("s3cret")).unwrap_err();
        assert_eq!(err.code, "ERR_AUTH_REQUIRED");

        let err = local_principal(
            &headers(&[(PRINCIPAL_ID_HEADER, "dev"), (LOCAL_AUTH_SECRET_HEADER, "nope")]),
            Some("s3cret"),
        )
        .unwrap_err();
        assert_eq!(err.code, "ERR_AUTH_INVALID");

        local_principal(
            &headers(&[(PRINCIPAL_ID_HEADER, "dev"), (LOCAL_AUTH_SECRET_HEADER, "s3cret")]),
            Some("s3cret"),
        )
        .expect("matching secret should pass");
    }
}
