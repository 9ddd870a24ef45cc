//! Keeping grant rows and the ACM share element in step.
//!
//! After [`normalize_permissions_from_acm`] runs:
//! - the owner holds a live grant with every flag,
//! - every live read grant names someone the share admits,
//! - an empty share is backed by a read grant for everyone,
//! - the ACM share is rebuilt from the live read grants.

use odrive_core::flatten;
use odrive_core::types::{Permission, PermissionFlags};
use odrive_crypto::{wrap_key, ContentKey, MasterKey};
use serde_json::Value;

use crate::acm::{
    acm_to_string, combine_share, group_grantee, group_share_fragment, is_everyone, parse_acm,
    share_to_permissions, user_share_fragment, AcmMap, EVERYONE_GROUP, SHARE_KEY,
};
use crate::{AuthError, AuthResult};

pub fn permission_for_user(dn: &str, flags: PermissionFlags) -> Permission {
    Permission::new(dn, user_share_fragment(dn), flags)
}

pub fn permission_for_group(
    project: &str,
    display_name: &str,
    group: &str,
    flags: PermissionFlags,
) -> Permission {
    Permission::new(
        group_grantee(project, group),
        group_share_fragment(project, display_name, group),
        flags,
    )
}

pub fn permission_for_owner(owner: &str) -> Permission {
    let mut p = permission_for_user(owner, PermissionFlags::all());
    p.created_by = owner.to_string();
    p
}

pub fn everyone_permission() -> Permission {
    Permission::new(EVERYONE_GROUP, "", PermissionFlags::read_only())
}

/// A fresh copy of `p` with read (and its key) removed.
pub fn without_read(p: &Permission) -> Permission {
    let mut copy = Permission::new(
        p.grantee.clone(),
        p.acm_share.clone(),
        PermissionFlags {
            read: false,
            ..p.flags
        },
    );
    copy.created_by = p.created_by.clone();
    copy
}

/// Fold each live read grant's share fragment into the ACM.
///
/// A live read grant for everyone wins outright: the share is dropped.
pub fn inject_permissions_into_acm(permissions: &[Permission], acm: &mut AcmMap) -> AuthResult<()> {
    for p in permissions.iter().filter(|p| p.is_live_read()) {
        if is_everyone(&p.grantee) {
            acm.remove(SHARE_KEY);
            return Ok(());
        }
        if p.acm_share.is_empty() {
            continue;
        }
        let fragment: Value = serde_json::from_str(&p.acm_share)
            .map_err(|e| AuthError::InvalidAcm(format!("grant share fragment: {e}")))?;
        let share = acm
            .entry(SHARE_KEY)
            .or_insert_with(|| Value::Object(Default::default()));
        combine_share(share, &fragment);
    }
    Ok(())
}

/// Replace the ACM share with one derived from `permissions` alone.
pub fn rebuild_acm_from_permissions(permissions: &[Permission], acm: &mut AcmMap) -> AuthResult<()> {
    acm.remove(SHARE_KEY);
    inject_permissions_into_acm(permissions, acm)
}

/// Convenience over raw ACM text.
pub fn rebuild_acm_string(permissions: &[Permission], raw_acm: &str) -> AuthResult<String> {
    let mut acm = parse_acm(raw_acm)?;
    rebuild_acm_from_permissions(permissions, &mut acm)?;
    Ok(acm_to_string(&acm))
}

/// Align grant rows with the ACM and rebuild the ACM from the result.
///
/// Returns the new grant list (including rows marked deleted that were
/// already persisted) and the rebuilt ACM.
pub fn normalize_permissions_from_acm(
    owner: &str,
    permissions: Vec<Permission>,
    raw_acm: &str,
    is_creating: bool,
) -> AuthResult<(Vec<Permission>, String)> {
    let mut acm = parse_acm(raw_acm)?;
    let share = acm.get(SHARE_KEY).cloned().unwrap_or(Value::Null);
    let mut share_perms = share_to_permissions(&share, PermissionFlags::read_only())?;
    for p in &mut share_perms {
        p.created_by = owner.to_string();
    }
    let acm_says_everyone = share_perms.is_empty();
    let owner_flat = flatten(owner);

    // An explicit everyone grant only survives when the share says everyone.
    let mut has_everyone = false;
    let mut out: Vec<Permission> = Vec::with_capacity(permissions.len() + share_perms.len() + 2);
    for mut p in permissions {
        if p.is_live_read() && is_everyone(&p.grantee) {
            if acm_says_everyone {
                has_everyone = true;
            } else {
                p.is_deleted = true;
            }
        }
        // Deleted rows that were never stored have nothing to record.
        if !p.is_deleted || !p.is_new() {
            out.push(p);
        }
    }

    // Grants implied by the share that no live row covers yet.
    for sp in &share_perms {
        let target = flatten(&sp.grantee);
        let held = out
            .iter()
            .any(|p| p.is_live_read() && flatten(&p.grantee) == target);
        if !held {
            out.push(sp.clone());
        }
    }

    if acm_says_everyone && !has_everyone {
        let mut everyone = everyone_permission();
        everyone.created_by = owner.to_string();
        out.push(everyone);
    }

    let owner_covered = out.iter().any(|p| {
        !p.is_deleted && flatten(&p.grantee) == owner_flat && p.flags == PermissionFlags::all()
    });
    if !owner_covered {
        out.push(permission_for_owner(owner));
    }

    // Read grants for anyone the share does not admit lose read.
    let mut in_share: Vec<String> = share_perms.iter().map(|p| flatten(&p.grantee)).collect();
    in_share.push(owner_flat.clone());
    let mut replacements = Vec::new();
    for p in out.iter_mut() {
        if !p.is_live_read() || is_everyone(&p.grantee) {
            continue;
        }
        let grantee = flatten(&p.grantee);
        if grantee == owner_flat {
            continue;
        }
        if acm_says_everyone || !in_share.contains(&grantee) {
            replacements.push(without_read(p));
            p.is_deleted = true;
        }
    }
    out.extend(replacements);

    // Rows left with no capability at all.
    let mut normalized = Vec::with_capacity(out.len());
    for mut p in out {
        if !p.is_deleted && p.flags.is_empty() {
            if is_creating || p.is_new() {
                continue;
            }
            p.is_deleted = true;
        }
        if p.is_deleted && p.is_new() {
            continue;
        }
        normalized.push(p);
    }

    rebuild_acm_from_permissions(&normalized, &mut acm)?;
    Ok((normalized, acm_to_string(&acm)))
}

/// Wrap `key` onto every live read grant that lacks it.
pub fn grant_keys(permissions: &mut [Permission], master: &MasterKey, key: &ContentKey) {
    for p in permissions.iter_mut() {
        if p.is_live_read() && p.wrapped_key.is_empty() {
            p.wrapped_key = wrap_key(master, &p.grantee, key);
        }
    }
}

/// Flattened names a caller answers to: their DN, their groups, everyone.
pub fn caller_grantees(dn: &str, groups: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(groups.len() + 2);
    out.push(flatten(dn));
    out.extend(groups.iter().map(|g| flatten(g)));
    out.push(flatten(EVERYONE_GROUP));
    out
}

/// Union of the flags granted to any of `grantees` by live rows.
pub fn effective_flags(permissions: &[Permission], grantees: &[String]) -> PermissionFlags {
    permissions
        .iter()
        .filter(|p| !p.is_deleted && grantees.contains(&flatten(&p.grantee)))
        .fold(PermissionFlags::default(), |acc, p| acc.union(p.flags))
}

/// The read grant a caller unwraps the content key through.
///
/// A grant naming the caller wins over a group grant, which wins over the
/// everyone grant.
pub fn find_read_grant<'a>(
    permissions: &'a [Permission],
    dn: &str,
    groups: &[String],
) -> Option<&'a Permission> {
    let live = || {
        permissions
            .iter()
            .filter(|p| p.is_live_read() && !p.wrapped_key.is_empty())
    };
    let me = flatten(dn);
    let groups: Vec<String> = groups.iter().map(|g| flatten(g)).collect();
    live()
        .find(|p| flatten(&p.grantee) == me)
        .or_else(|| live().find(|p| groups.contains(&flatten(&p.grantee))))
        .or_else(|| live().find(|p| is_everyone(&p.grantee)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use odrive_core::types::PermissionId;
    use odrive_crypto::{generate_content_key, unwrap_key};
    use secrecy::SecretString;
    use serde_json::json;
    use std::collections::BTreeSet;

    const OWNER: &str = "cn=alice,o=org";
    const BOB: &str = "cn=bob,o=org";

    fn live<'a>(perms: &'a [Permission], grantee: &str) -> Vec<&'a Permission> {
        perms
            .iter()
            .filter(|p| !p.is_deleted && flatten(&p.grantee) == flatten(grantee))
            .collect()
    }

    #[test]
    fn test_empty_share_means_everyone() {
        let (perms, acm) =
            normalize_permissions_from_acm(OWNER, vec![], r#"{"classif":"U"}"#, true).unwrap();
        let everyone = live(&perms, EVERYONE_GROUP);
        assert_eq!(everyone.len(), 1);
        assert!(everyone[0].flags.read);
        let owner = live(&perms, OWNER);
        assert_eq!(owner.len(), 1);
        assert_eq!(owner[0].flags, PermissionFlags::all());
        let acm: Value = serde_json::from_str(&acm).unwrap();
        assert!(acm.get("share").is_none(), "everyone keeps the share empty");
    }

    #[test]
    fn test_share_users_get_read_grants() {
        let raw = json!({"classif": "U", "share": {"users": [BOB]}}).to_string();
        let (perms, acm) = normalize_permissions_from_acm(OWNER, vec![], &raw, true).unwrap();
        assert!(live(&perms, EVERYONE_GROUP).is_empty());
        assert_eq!(live(&perms, BOB).len(), 1);
        let acm: Value = serde_json::from_str(&acm).unwrap();
        let users = acm["share"]["users"].as_array().unwrap();
        assert!(users.contains(&json!(BOB)));
        assert!(users.contains(&json!(OWNER)), "owner is folded into the share");
    }

    #[test]
    fn test_explicit_everyone_dropped_when_share_is_specific() {
        let raw = json!({"classif": "U", "share": {"users": [BOB]}}).to_string();
        let mut everyone = everyone_permission();
        everyone.id = Some(uuid_like(1));
        let (perms, _) = normalize_permissions_from_acm(OWNER, vec![everyone], &raw, false).unwrap();
        let rows: Vec<_> = perms.iter().filter(|p| is_everyone(&p.grantee)).collect();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_deleted, "stored row is marked deleted, not dropped");
    }

    #[test]
    fn test_read_outside_share_is_split() {
        let raw = json!({"classif": "U", "share": {"users": [BOB]}}).to_string();
        let mut carol = permission_for_user(
            "cn=carol",
            PermissionFlags {
                read: true,
                update: true,
                ..Default::default()
            },
        );
        carol.id = Some(uuid_like(2));
        let (perms, _) = normalize_permissions_from_acm(OWNER, vec![carol], &raw, false).unwrap();
        let rows: Vec<_> = perms.iter().filter(|p| flatten(&p.grantee) == "cncarol").collect();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|p| p.is_deleted && p.flags.read));
        assert!(rows
            .iter()
            .any(|p| !p.is_deleted && !p.flags.read && p.flags.update));
    }

    #[test]
    fn test_read_only_outside_share_disappears_on_create() {
        let raw = json!({"classif": "U", "share": {"users": [BOB]}}).to_string();
        let carol = permission_for_user("cn=carol", PermissionFlags::read_only());
        let (perms, _) = normalize_permissions_from_acm(OWNER, vec![carol], &raw, true).unwrap();
        assert!(perms.iter().all(|p| flatten(&p.grantee) != "cncarol"));
    }

    #[test]
    fn test_owner_never_loses_flags() {
        let (perms, _) =
            normalize_permissions_from_acm(OWNER, vec![], r#"{"classif":"U"}"#, true).unwrap();
        let (perms, _) =
            normalize_permissions_from_acm(OWNER, perms, r#"{"classif":"U"}"#, false).unwrap();
        assert_eq!(live(&perms, OWNER).len(), 1, "owner grant is not duplicated");
        assert_eq!(live(&perms, OWNER)[0].flags, PermissionFlags::all());
    }

    #[test]
    fn test_group_share_roundtrip() {
        let raw = json!({
            "classif": "U",
            "share": {"projects": {"dctc": {"disp_nm": "DCTC", "groups": ["ODrive"]}}}
        })
        .to_string();
        let (perms, acm) = normalize_permissions_from_acm(OWNER, vec![], &raw, true).unwrap();
        assert_eq!(live(&perms, "dctc_ODrive").len(), 1);
        let acm: Value = serde_json::from_str(&acm).unwrap();
        assert_eq!(acm["share"]["projects"]["dctc"]["groups"], json!(["ODrive"]));
    }

    #[test]
    fn test_grant_keys_and_find() {
        let master = MasterKey::new(SecretString::from("m".to_string())).unwrap();
        let key = generate_content_key();
        let raw = json!({"classif": "U", "share": {"users": [BOB]}}).to_string();
        let (mut perms, _) = normalize_permissions_from_acm(OWNER, vec![], &raw, true).unwrap();
        grant_keys(&mut perms, &master, &key);
        assert!(perms.iter().filter(|p| p.is_live_read()).all(|p| !p.wrapped_key.is_empty()));

        let grant = find_read_grant(&perms, "CN=Bob, O=Org", &[]).unwrap();
        let unwrapped = unwrap_key(&master, &grant.grantee, &grant.wrapped_key).unwrap();
        assert_eq!(unwrapped.as_bytes(), key.as_bytes());
        assert!(find_read_grant(&perms, "cn=mallory", &[]).is_none());
    }

    #[test]
    fn test_effective_flags_union() {
        let perms = vec![
            permission_for_user(BOB, PermissionFlags::read_only()),
            permission_for_group(
                "p",
                "P",
                "g",
                PermissionFlags {
                    update: true,
                    ..Default::default()
                },
            ),
        ];
        let grantees = caller_grantees(BOB, &[group_grantee("p", "g")]);
        let flags = effective_flags(&perms, &grantees);
        assert!(flags.read && flags.update && !flags.delete);
    }

    fn uuid_like(n: u8) -> PermissionId {
        PermissionId::from_bytes([n; 16])
    }

    // Two spellings of Bob on purpose.
    const USERS: [&str; 4] = [
        "cn=bob,o=org",
        "CN=Bob, O=Org",
        "cn=carol,o=org",
        "cn=dave,ou=ops,o=org",
    ];
    const GROUPS: [(&str, &str); 3] = [("dctc", "ODrive"), ("dctc", "G1"), ("proj", "ops")];

    fn share_acm(users: &[usize], groups: &[usize]) -> String {
        let mut share = serde_json::Map::new();
        if !users.is_empty() {
            share.insert("users".into(), json!(users.iter().map(|&u| USERS[u]).collect::<Vec<_>>()));
        }
        let mut projects = serde_json::Map::new();
        for &g in groups {
            let (project, group) = GROUPS[g];
            let entry = projects
                .entry(project)
                .or_insert_with(|| json!({"disp_nm": project.to_uppercase(), "groups": []}));
            if let Some(list) = entry["groups"].as_array_mut() {
                list.push(json!(group));
            }
        }
        if !projects.is_empty() {
            share.insert("projects".into(), Value::Object(projects));
        }
        let mut acm = json!({"classif": "U"});
        if !share.is_empty() {
            acm["share"] = Value::Object(share);
        }
        acm.to_string()
    }

    /// 0..4 users, 4..7 groups, 7 everyone, 8 the owner.
    fn existing_row(n: usize, choice: usize, bits: [bool; 5], stored: bool, deleted: bool) -> Permission {
        let flags = PermissionFlags {
            create: bits[0],
            read: bits[1],
            update: bits[2],
            delete: bits[3],
            share: bits[4],
        };
        let mut p = match choice {
            0..=3 => permission_for_user(USERS[choice], flags),
            4..=6 => {
                let (project, group) = GROUPS[choice - 4];
                permission_for_group(project, &project.to_uppercase(), group, flags)
            }
            7 => Permission::new(EVERYONE_GROUP, "", flags),
            _ => permission_for_user(OWNER, flags),
        };
        if stored {
            p.id = Some(uuid_like(n as u8 + 10));
        }
        p.is_deleted = deleted;
        p
    }

    proptest::proptest! {
        #[test]
        fn prop_share_matches_live_read_grants(
            users in proptest::collection::vec(0usize..4, 0..4),
            groups in proptest::collection::vec(0usize..3, 0..3),
            rows in proptest::collection::vec(
                (0usize..9, proptest::prelude::any::<[bool; 5]>(), proptest::prelude::any::<bool>(), proptest::prelude::any::<bool>()),
                0..6,
            ),
            creating in proptest::prelude::any::<bool>(),
        ) {
            let raw = share_acm(&users, &groups);
            let rows: Vec<Permission> = rows
                .into_iter()
                .enumerate()
                .map(|(n, (choice, bits, stored, deleted))| existing_row(n, choice, bits, stored, deleted))
                .collect();

            let (perms, acm) = normalize_permissions_from_acm(OWNER, rows, &raw, creating).unwrap();
            let acm: Value = serde_json::from_str(&acm).unwrap();
            let share = acm.get(SHARE_KEY).cloned().unwrap_or(Value::Null);
            let shared: BTreeSet<String> = share_to_permissions(&share, PermissionFlags::read_only())
                .unwrap()
                .iter()
                .map(|p| flatten(&p.grantee))
                .collect();
            let readers: BTreeSet<String> = perms
                .iter()
                .filter(|p| p.is_live_read() && !is_everyone(&p.grantee))
                .map(|p| flatten(&p.grantee))
                .collect();

            if perms.iter().any(|p| p.is_live_read() && is_everyone(&p.grantee)) {
                proptest::prop_assert!(shared.is_empty());
                proptest::prop_assert_eq!(readers, BTreeSet::from([flatten(OWNER)]));
            } else {
                proptest::prop_assert_eq!(shared, readers);
            }
            proptest::prop_assert!(live(&perms, OWNER)
                .iter()
                .any(|p| p.flags == PermissionFlags::all()));
        }
    }
}
