//! Group-membership based permission resolution.
//!
//! A feature is granted read access through membership in
//! `wdx-<feature>-ro` and read/write access through `wdx-<feature>-rw`.
//! Feature names are compared lower-case; groups without the prefix, the
//! suffix or a feature name in between are ignored.

use std::collections::BTreeSet;
use std::ffi::CString;
use std::io;
use std::mem;
use std::ptr;

use tracing::debug;
use wdx_core::{ServiceError, ServiceResult};

const PERMISSION_PREFIX: &str = "wdx-";
const READ_SUFFIX: &str = "-ro";
const WRITE_SUFFIX: &str = "-rw";

/// Supplies the OS group memberships of a user.
pub trait GroupSource: Send + Sync {
    /// All group names the user is a member of.
    fn user_groups(&self, user_name: &str) -> io::Result<Vec<String>>;
}

/// Per-feature read and write grants of one user.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UserPermissions {
    /// The user these grants belong to.
    pub user_name: String,
    /// Features the user may read.
    pub read_features: BTreeSet<String>,
    /// Features the user may write; always a subset of the readable ones.
    pub write_features: BTreeSet<String>,
}

impl UserPermissions {
    /// True when `feature` is readable.
    #[must_use]
    pub fn can_read(&self, feature: &str) -> bool {
        self.read_features.contains(&feature.to_ascii_lowercase())
    }

    /// True when `feature` is writable.
    #[must_use]
    pub fn can_write(&self, feature: &str) -> bool {
        self.write_features.contains(&feature.to_ascii_lowercase())
    }
}

/// Maps group membership to feature permissions.
pub struct PermissionResolver {
    groups: Box<dyn GroupSource>,
}

impl PermissionResolver {
    /// Creates a resolver over the given membership source.
    pub fn new(groups: Box<dyn GroupSource>) -> Self {
        Self { groups }
    }

    /// Resolves the permission set of `user_name`.
    pub fn get_user_permissions(&self, user_name: &str) -> ServiceResult<UserPermissions> {
        let groups = self.groups.user_groups(user_name).map_err(|error| {
            ServiceError::internal(format!("failed to determine user permissions: {error}"))
        })?;

        let mut read_features = BTreeSet::new();
        let mut write_features = BTreeSet::new();
        for group_name in groups {
            if let Some(feature) = feature_of(&group_name, READ_SUFFIX) {
                read_features.insert(feature);
            } else if let Some(feature) = feature_of(&group_name, WRITE_SUFFIX) {
                // write permissions implicitly grant read access
                read_features.insert(feature.clone());
                write_features.insert(feature);
            }
        }
        debug!(
            user_name,
            read = read_features.len(),
            write = write_features.len(),
            "resolved user permissions"
        );

        Ok(UserPermissions {
            user_name: user_name.to_owned(),
            read_features,
            write_features,
        })
    }

    /// Canonical group name granting `feature` at the given level.
    #[must_use]
    pub fn permission_name(feature: &str, writable: bool) -> String {
        let suffix = if writable { WRITE_SUFFIX } else { READ_SUFFIX };
        format!("{PERMISSION_PREFIX}{feature}{suffix}").to_ascii_lowercase()
    }
}

fn feature_of(group_name: &str, suffix: &str) -> Option<String> {
    let stem = group_name.strip_suffix(suffix)?;
    let feature = stem.strip_prefix(PERMISSION_PREFIX)?;
    if feature.is_empty() {
        return None;
    }
    Some(feature.to_ascii_lowercase())
}

/// Group membership from the OS account database.
pub struct SystemGroups;

impl GroupSource for SystemGroups {
    fn user_groups(&self, user_name: &str) -> io::Result<Vec<String>> {
        let cname = CString::new(user_name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "user name contains NUL"))?;

        // primary gid via getpwnam_r
        let mut pwd: libc::passwd = unsafe { mem::zeroed() };
        let mut pw_buffer = vec![0_u8; 16384];
        let mut pw_result: *mut libc::passwd = ptr::null_mut();
        let rc = unsafe {
            libc::getpwnam_r(
                cname.as_ptr(),
                &raw mut pwd,
                pw_buffer.as_mut_ptr().cast(),
                pw_buffer.len(),
                &raw mut pw_result,
            )
        };
        if pw_result.is_null() {
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no user named \"{user_name}\""),
            ));
        }

        // membership list via getgrouplist, growing the buffer on demand
        let mut count: libc::c_int = 32;
        let mut gids = vec![0 as libc::gid_t; count as usize];
        loop {
            let rc = unsafe {
                libc::getgrouplist(cname.as_ptr(), pwd.pw_gid, gids.as_mut_ptr(), &raw mut count)
            };
            if rc >= 0 {
                gids.truncate(count.max(0) as usize);
                break;
            }
            gids.resize(count.max(1) as usize, 0);
        }

        let mut names = Vec::with_capacity(gids.len());
        for gid in gids {
            if let Some(name) = group_name_of(gid)? {
                names.push(name);
            }
        }
        Ok(names)
    }
}

fn group_name_of(gid: libc::gid_t) -> io::Result<Option<String>> {
    let mut group: libc::group = unsafe { mem::zeroed() };
    let mut buffer = vec![0_u8; 16384];
    let mut result: *mut libc::group = ptr::null_mut();
    let rc = unsafe {
        libc::getgrgid_r(
            gid,
            &raw mut group,
            buffer.as_mut_ptr().cast(),
            buffer.len(),
            &raw mut result,
        )
    };
    if result.is_null() {
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        // a gid without a database entry is skipped, not an error
        return Ok(None);
    }
    let name = unsafe { std::ffi::CStr::from_ptr(group.gr_name) };
    Ok(Some(name.to_string_lossy().into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedGroups(Vec<&'static str>);

    impl GroupSource for FixedGroups {
        fn user_groups(&self, _user_name: &str) -> io::Result<Vec<String>> {
            Ok(self.0.iter().map(|&name| name.to_owned()).collect())
        }
    }

    fn resolve(groups: Vec<&'static str>) -> UserPermissions {
        PermissionResolver::new(Box::new(FixedGroups(groups)))
            .get_user_permissions("alice")
            .unwrap()
    }

    #[test]
    fn readonly_group_grants_read() {
        let permissions = resolve(vec!["wdx-firmware-ro"]);
        assert!(permissions.can_read("firmware"));
        assert!(!permissions.can_write("firmware"));
    }

    #[test]
    fn readwrite_group_grants_both() {
        let permissions = resolve(vec!["wdx-config-rw"]);
        assert!(permissions.can_read("config"));
        assert!(permissions.can_write("config"));
    }

    #[test]
    fn write_features_are_a_subset_of_read_features() {
        let permissions = resolve(vec![
            "wdx-a-rw",
            "wdx-b-ro",
            "wdx-c-rw",
            "audio",
            "wheel",
        ]);
        assert!(
            permissions
                .write_features
                .is_subset(&permissions.read_features)
        );
    }

    #[test]
    fn unrelated_groups_are_ignored() {
        let permissions = resolve(vec!["wheel", "docker", "users"]);
        assert!(permissions.read_features.is_empty());
        assert!(permissions.write_features.is_empty());
    }

    #[test]
    fn malformed_group_names_are_dropped() {
        let permissions = resolve(vec!["wdx--ro", "wdx-rw", "wdx-", "-ro", "wdx-x-RW"]);
        assert!(permissions.write_features.is_empty());
        assert!(permissions.read_features.is_empty());
    }

    #[test]
    fn feature_names_are_lower_cased() {
        let permissions = resolve(vec!["wdx-Firmware-ro"]);
        assert!(permissions.can_read("FIRMWARE"));
        assert!(permissions.read_features.contains("firmware"));
    }

    #[test]
    fn permission_name_is_canonical() {
        assert_eq!(
            PermissionResolver::permission_name("Firmware", false),
            "wdx-firmware-ro"
        );
        assert_eq!(
            PermissionResolver::permission_name("config", true),
            "wdx-config-rw"
        );
    }

    #[test]
    fn user_name_is_carried_through() {
        let permissions = resolve(vec![]);
        assert_eq!(permissions.user_name, "alice");
    }
}
