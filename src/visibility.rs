//! Which schools and user profiles an authenticated actor may see or edit.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{Actor, Role, Scope, UserAccount};

/// Matches the identity-provider subject first. The email fallback only
/// applies to accounts not yet bound to a subject.
pub fn resolve_account<'a>(actor: &Actor, accounts: &'a [UserAccount]) -> Result<&'a UserAccount> {
    let by_subject = accounts
        .iter()
        .find(|account| account.auth_subject.as_deref() == Some(actor.subject.as_str()));

    by_subject
        .or_else(|| {
            accounts.iter().find(|account| {
                account.auth_subject.is_none()
                    && account.email.eq_ignore_ascii_case(actor.email.trim())
            })
        })
        .ok_or_else(|| {
            tracing::warn!(subject = %actor.subject, email = %actor.email, "unlinked account");
            EngineError::UnlinkedAccount(actor.email.clone())
        })
}

// Status never narrows scope.
pub fn scope(account: &UserAccount, all_schools: impl IntoIterator<Item = Uuid>) -> Scope {
    match account.role {
        Role::Admin => Scope {
            school_ids: all_schools.into_iter().collect(),
            can_see_all_users: true,
        },
        Role::RegionalCoordinator | Role::Other => Scope {
            school_ids: account.linked_schools.clone(),
            can_see_all_users: false,
        },
    }
}

pub fn can_read(account: &UserAccount, school_id: Uuid) -> bool {
    account.role == Role::Admin || account.linked_schools.contains(&school_id)
}

pub fn can_write(account: &UserAccount, school_id: Uuid) -> bool {
    match account.role {
        Role::Admin => true,
        Role::RegionalCoordinator => account.linked_schools.contains(&school_id),
        Role::Other => false,
    }
}

pub fn visible_users(account: &UserAccount, accounts: &[UserAccount]) -> Vec<UserAccount> {
    if account.role == Role::Admin {
        return accounts.to_vec();
    }

    accounts
        .iter()
        .filter(|other| {
            other.id == account.id
                || !other.linked_schools.is_disjoint(&account.linked_schools)
        })
        .cloned()
        .collect()
}

pub fn retain_in_scope<T>(scope: &Scope, items: Vec<T>, school_of: impl Fn(&T) -> Uuid) -> Vec<T> {
    items
        .into_iter()
        .filter(|item| scope.school_ids.contains(&school_of(item)))
        .collect()
}

pub fn shared_schools(a: &UserAccount, b: &UserAccount) -> BTreeSet<Uuid> {
    a.linked_schools
        .intersection(&b.linked_schools)
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountStatus;

    fn account(role: Role, email: &str, schools: &[Uuid]) -> UserAccount {
        UserAccount {
            id: Uuid::new_v4(),
            auth_subject: Some(format!("sub-{email}")),
            name: email.to_string(),
            email: email.to_string(),
            role,
            status: AccountStatus::Active,
            linked_schools: schools.iter().copied().collect(),
        }
    }

    #[test]
    fn admin_scope_covers_every_school() {
        let schools = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let admin = account(Role::Admin, "admin@seduc.example", &[]);
        let scope = scope(&admin, schools);
        assert_eq!(scope.school_ids.len(), 3);
        assert!(scope.can_see_all_users);
        assert!(can_write(&admin, Uuid::new_v4()));
    }

    #[test]
    fn coordinator_scope_is_linked_schools_only() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let coordinator = account(Role::RegionalCoordinator, "ana@seduc.example", &[a]);
        let scope = scope(&coordinator, [a, b]);
        assert!(scope.school_ids.contains(&a));
        assert!(!scope.school_ids.contains(&b));
        assert!(!scope.can_see_all_users);
        assert!(can_write(&coordinator, a));
        assert!(!can_write(&coordinator, b));
    }

    #[test]
    fn other_roles_read_but_never_write() {
        let a = Uuid::new_v4();
        let viewer = account(Role::Other, "viewer@seduc.example", &[a]);
        assert!(can_read(&viewer, a));
        assert!(!can_write(&viewer, a));
    }

    #[test]
    fn deactivation_does_not_change_scope() {
        let a = Uuid::new_v4();
        let mut coordinator = account(Role::RegionalCoordinator, "ana@seduc.example", &[a]);
        let before = scope(&coordinator, [a]);
        coordinator.status = AccountStatus::Inactive;
        let after = scope(&coordinator, [a]);
        assert_eq!(before, after);
        assert!(can_write(&coordinator, a));
    }

    #[test]
    fn user_listing_requires_a_shared_school() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let me = account(Role::RegionalCoordinator, "me@seduc.example", &[a, b]);
        let peer = account(Role::RegionalCoordinator, "peer@seduc.example", &[b, c]);
        let stranger = account(Role::RegionalCoordinator, "far@seduc.example", &[c]);
        let loner = account(Role::Other, "loner@seduc.example", &[]);
        let all = vec![me.clone(), peer.clone(), stranger.clone(), loner.clone()];

        let seen: Vec<_> = visible_users(&me, &all).into_iter().map(|u| u.email).collect();
        assert_eq!(seen, vec![me.email.clone(), peer.email.clone()]);
        assert_eq!(shared_schools(&me, &peer), BTreeSet::from([b]));

        let seen_by_loner = visible_users(&loner, &all);
        assert_eq!(seen_by_loner, vec![loner]);
    }

    #[test]
    fn unknown_actor_is_unlinked() {
        let accounts = vec![account(Role::Admin, "admin@seduc.example", &[])];
        let actor = Actor::new("sub-unknown", "nobody@seduc.example");
        assert!(matches!(
            resolve_account(&actor, &accounts),
            Err(EngineError::UnlinkedAccount(email)) if email == "nobody@seduc.example"
        ));
    }

    #[test]
    fn unbound_account_resolves_by_email() {
        let mut ana = account(Role::RegionalCoordinator, "ana@seduc.example", &[]);
        ana.auth_subject = None;
        let accounts = vec![ana];
        let actor = Actor::new("fresh-subject", "ANA@seduc.example");
        let resolved = resolve_account(&actor, &accounts).unwrap();
        assert_eq!(resolved.email, "ana@seduc.example");
    }

    #[test]
    fn bound_account_ignores_a_foreign_subject_with_its_email() {
        let accounts = vec![account(Role::Admin, "admin@seduc.example", &[])];
        let impostor = Actor::new("other-idp-subject", "admin@seduc.example");
        assert!(matches!(
            resolve_account(&impostor, &accounts),
            Err(EngineError::UnlinkedAccount(_))
        ));

        let owner = Actor::new("sub-admin@seduc.example", "admin@seduc.example");
        assert_eq!(resolve_account(&owner, &accounts).unwrap().email, "admin@seduc.example");
    }

    #[test]
    fn retain_in_scope_drops_out_of_scope_items() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let coordinator = account(Role::RegionalCoordinator, "ana@seduc.example", &[a]);
        let scope = scope(&coordinator, [a, b]);
        let kept = retain_in_scope(&scope, vec![(a, "one"), (b, "two")], |(school, _)| *school);
        assert_eq!(kept, vec![(a, "one")]);
    }
}
