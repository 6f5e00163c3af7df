use std::collections::BTreeSet;

/// Access requirements attached to an executor definition. An empty list
/// imposes no requirement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessRequirements {
    pub requires_any_role: Vec<String>,
    pub requires_all_permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDenied {
    message: String,
}

impl AccessDenied {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for AccessDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AccessDenied {}

impl AccessRequirements {
    /// Roles first, then permissions. Neither input is modified.
    pub fn check<R, A>(&self, roles: &[R], authorities: &[A]) -> Result<(), AccessDenied>
    where
        R: AsRef<str>,
        A: AsRef<str>,
    {
        check_roles(&self.requires_any_role, roles)?;
        check_permissions(&self.requires_all_permissions, authorities)
    }
}

pub fn check_roles<R: AsRef<str>>(requires_any_role: &[String], roles: &[R]) -> Result<(), AccessDenied> {
    if requires_any_role.is_empty() {
        return Ok(());
    }

    let held = roles.iter().map(|r| r.as_ref()).collect::<BTreeSet<_>>();
    if requires_any_role.iter().any(|r| held.contains(r.as_str())) {
        return Ok(());
    }

    Err(AccessDenied::new(format!(
        "missing any of: {}",
        requires_any_role.join(", ")
    )))
}

pub fn check_permissions<A: AsRef<str>>(
    requires_all_permissions: &[String],
    authorities: &[A],
) -> Result<(), AccessDenied> {
    if requires_all_permissions.is_empty() {
        return Ok(());
    }

    let held = authorities
        .iter()
        .map(|a| a.as_ref())
        .collect::<BTreeSet<_>>();
    let missing = requires_all_permissions
        .iter()
        .filter(|p| !held.contains(p.as_str()))
        .map(String::as_str)
        .collect::<Vec<_>>();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(AccessDenied::new(format!("missing: {}", missing.join(", "))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn any_role_grants_access() {
        let required = strings(&["Administrator"]);
        let err = check_roles(&required, &["Developer"]).unwrap_err();
        assert_eq!(err.message(), "missing any of: Administrator");

        check_roles(&required, &["Administrator", "Developer"])
            .expect("holding one required role should pass");
    }

    #[test]
    fn all_permissions_are_required() {
        let required = strings(&["view_issues", "edit_issues", "audit"]);
        let err = check_permissions(&required, &["view_issues"]).unwrap_err();
        assert_eq!(err.message(), "missing: edit_issues, audit");

        check_permissions(&required, &["audit", "edit_issues", "view_issues", "extra"])
            .expect("superset of permissions should pass");
    }

    #[test]
    fn empty_requirements_are_open() {
        let open = AccessRequirements::default();
        open.check::<&str, &str>(&[], &[])
            .expect("no requirements should pass");
    }

    #[test]
    fn checks_leave_inputs_untouched() {
        let reqs = AccessRequirements {
            requires_any_role: strings(&["Administrator", "Manager"]),
            requires_all_permissions: strings(&["view_issues", "audit"]),
        };
        let roles = strings(&["Manager", "Developer"]);
        let authorities = strings(&["view_issues"]);
        let before = (reqs.clone(), roles.clone(), authorities.clone());

        let err = reqs.check(&roles, &authorities).unwrap_err();
        assert_eq!(err.to_string(), "missing: audit");
        assert_eq!((reqs, roles, authorities), before);
    }

    #[test]
    fn role_check_runs_before_permission_check() {
        let reqs = AccessRequirements {
            requires_any_role: strings(&["Administrator"]),
            requires_all_permissions: strings(&["audit"]),
        };
        let err = reqs.check::<&str, &str>(&["Developer"], &[]).unwrap_err();
        assert!(err.message().starts_with("missing any of:"));
    }
}
