//! User-namespace ID mapping between container and host ids.

use anyhow::anyhow;

use crate::Result;

/// A single contiguous mapping range, as in `/proc/self/uid_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    /// First id inside the container.
    pub container_id: u32,
    /// First id on the host.
    pub host_id: u32,
    /// Number of ids in the range.
    pub size: u32,
}

/// An ordered set of uid and gid ranges which together define a bijection
/// between container-side and host-side numeric ids.
///
/// An empty mapping is the identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityMapping {
    /// Ranges for user ids.
    pub uid_maps: Vec<IdMap>,
    /// Ranges for group ids.
    pub gid_maps: Vec<IdMap>,
}

/// Forced ownership for every produced or extracted entry; overrides both
/// the source metadata and any active [`IdentityMapping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChownOpts {
    /// User id applied to every entry.
    pub uid: u32,
    /// Group id applied to every entry.
    pub gid: u32,
}

fn to_host_in(maps: &[IdMap], id: u32) -> Option<u32> {
    maps.iter()
        .find(|m| id >= m.container_id && (id - m.container_id) < m.size)
        .map(|m| m.host_id + (id - m.container_id))
}

fn to_container_in(maps: &[IdMap], id: u32) -> Option<u32> {
    maps.iter()
        .find(|m| id >= m.host_id && (id - m.host_id) < m.size)
        .map(|m| m.container_id + (id - m.host_id))
}

impl IdentityMapping {
    /// Whether this mapping is the identity (no ranges configured).
    pub fn is_empty(&self) -> bool {
        self.uid_maps.is_empty() && self.gid_maps.is_empty()
    }

    /// Translate a container-side `(uid, gid)` pair to host ids, as done
    /// when materializing entries on disk.
    pub fn to_host(&self, uid: u32, gid: u32) -> Result<(u32, u32)> {
        let huid = if self.uid_maps.is_empty() {
            uid
        } else {
            to_host_in(&self.uid_maps, uid)
                .ok_or_else(|| anyhow!("container uid {uid} has no host mapping"))?
        };
        let hgid = if self.gid_maps.is_empty() {
            gid
        } else {
            to_host_in(&self.gid_maps, gid)
                .ok_or_else(|| anyhow!("container gid {gid} has no host mapping"))?
        };
        Ok((huid, hgid))
    }

    /// Translate a host-side `(uid, gid)` pair to container ids, as done
    /// when recording entries into an archive.
    pub fn to_container(&self, uid: u32, gid: u32) -> Result<(u32, u32)> {
        let cuid = if self.uid_maps.is_empty() {
            uid
        } else {
            to_container_in(&self.uid_maps, uid)
                .ok_or_else(|| anyhow!("host uid {uid} has no container mapping"))?
        };
        let cgid = if self.gid_maps.is_empty() {
            gid
        } else {
            to_container_in(&self.gid_maps, gid)
                .ok_or_else(|| anyhow!("host gid {gid} has no container mapping"))?
        };
        Ok((cuid, cgid))
    }

    /// The host ids that container root maps to; used as the owner of
    /// directories synthesized during extraction.
    pub fn root_pair(&self) -> (u32, u32) {
        let uid = to_host_in(&self.uid_maps, 0).unwrap_or(0);
        let gid = to_host_in(&self.gid_maps, 0).unwrap_or(0);
        (uid, gid)
    }
}
