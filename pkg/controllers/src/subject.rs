use pkg_constants::labels::RBAC_API_GROUP;
use pkg_types::binding::SubjectFields;
use pkg_types::rbac::{Subject, SubjectKind};

use crate::error::RbacError;

/// Resolves the single subject a role template binding grants to.
///
/// `user_name` and `user_principal_name` describe the same user and may both
/// be set; the user name wins. Any other combination of set fields is
/// ambiguous. Service accounts are given as `namespace:name`.
pub fn build_subject(
    kind: &'static str,
    name: &str,
    fields: SubjectFields<'_>,
) -> Result<Subject, RbacError> {
    let user = if !fields.user_name.is_empty() {
        fields.user_name
    } else {
        fields.user_principal_name
    };

    let candidates = [
        (SubjectKind::User, user),
        (SubjectKind::Group, fields.group_principal_name),
        (SubjectKind::Group, fields.group_name),
        (SubjectKind::ServiceAccount, fields.service_account),
    ];
    let mut set = candidates.iter().filter(|(_, value)| !value.is_empty());
    let (subject_kind, value) = match (set.next(), set.next()) {
        (Some(found), None) => *found,
        (None, _) => {
            return Err(RbacError::MissingSubject {
                kind,
                name: name.to_string(),
            });
        }
        (Some(_), Some(_)) => {
            return Err(RbacError::AmbiguousSubject {
                kind,
                name: name.to_string(),
            });
        }
    };

    if subject_kind == SubjectKind::ServiceAccount {
        let (namespace, sa_name) = value
            .split_once(':')
            .filter(|(ns, n)| !ns.is_empty() && !n.is_empty())
            .ok_or_else(|| RbacError::InvalidServiceAccount {
                name: name.to_string(),
                value: value.to_string(),
            })?;
        return Ok(Subject {
            kind: SubjectKind::ServiceAccount,
            name: sa_name.to_string(),
            namespace: namespace.to_string(),
            api_group: String::new(),
        });
    }

    Ok(Subject {
        kind: subject_kind,
        name: value.to_string(),
        namespace: String::new(),
        api_group: RBAC_API_GROUP.to_string(),
    })
}
