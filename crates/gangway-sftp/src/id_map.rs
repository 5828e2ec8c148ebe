//! Identity mapping between the host and instance uid/gid namespaces.
//!
//! A mounted directory is shared between two identity namespaces: the host
//! owns the files, the instance observes them through sshfs. Each mount
//! carries a pair of ordered `(host_id, instance_id)` lists used to
//! translate ownership in both directions: attributes sent to the instance
//! go through the forward maps, attributes received from the instance go
//! through the reverse maps before touching the host filesystem.

/// Ordered list of `(host_id, instance_id)` pairs.
///
/// The first matching entry wins in both directions; duplicate keys are
/// allowed and never rejected.
pub type IdMappings = Vec<(i64, i64)>;

/// Marker for "no ownership information available", e.g. on platforms that
/// cannot report a numeric owner. Mapping it forward yields the fallback id.
pub const NO_ID_INFO: i64 = -2;

/// An instance id of `DEFAULT_ID` in a mapping entry advertises the
/// configured default id instead of a concrete one.
pub const DEFAULT_ID: i64 = -1;

/// Forward translation, host id to instance id.
///
/// Unmapped ids pass through unchanged; `NO_ID_INFO` and entries mapping to
/// `DEFAULT_ID` both resolve to `id_if_not_found`.
pub fn mapped_id_for(id_maps: &[(i64, i64)], id: i64, id_if_not_found: i64) -> i64 {
    if id == NO_ID_INFO {
        return id_if_not_found;
    }

    match id_maps.iter().find(|(host, _)| *host == id) {
        Some((_, instance)) if *instance == DEFAULT_ID => id_if_not_found,
        Some((_, instance)) => *instance,
        None => id,
    }
}

/// Reverse translation, instance id to host id.
pub fn reverse_id_for(id_maps: &[(i64, i64)], id: i64, rev_id_if_not_found: i64) -> i64 {
    id_maps
        .iter()
        .find(|(_, instance)| *instance == id)
        .map_or(rev_id_if_not_found, |(host, _)| *host)
}

/// uid and gid translation for one mount, in both directions.
#[derive(Debug, Clone)]
pub struct IdMapper {
    uid_mappings: IdMappings,
    gid_mappings: IdMappings,
    default_uid: i64,
    default_gid: i64,
}

impl IdMapper {
    pub fn new(
        uid_mappings: IdMappings,
        gid_mappings: IdMappings,
        default_uid: i64,
        default_gid: i64,
    ) -> Self {
        Self {
            uid_mappings,
            gid_mappings,
            default_uid,
            default_gid,
        }
    }

    /// Host uid as the instance should observe it.
    pub fn mapped_uid_for(&self, uid: i64) -> i64 {
        mapped_id_for(&self.uid_mappings, uid, self.default_uid)
    }

    /// Host gid as the instance should observe it.
    pub fn mapped_gid_for(&self, gid: i64) -> i64 {
        mapped_id_for(&self.gid_mappings, gid, self.default_gid)
    }

    /// Instance-supplied uid translated back to a host uid.
    pub fn reverse_uid_for(&self, uid: i64, rev_uid_if_not_found: i64) -> i64 {
        reverse_id_for(&self.uid_mappings, uid, rev_uid_if_not_found)
    }

    /// Instance-supplied gid translated back to a host gid.
    pub fn reverse_gid_for(&self, gid: i64, rev_gid_if_not_found: i64) -> i64 {
        reverse_id_for(&self.gid_mappings, gid, rev_gid_if_not_found)
    }
}
