//! Which calls enter the duplicate request cache.

use crate::daemon::proto::rpc::{CallHeader, XdrReader};

pub const NFS_PROGRAM: u32 = 100003;
pub const NFS_V4: u32 = 4;
pub const NFSPROC4_COMPOUND: u32 = 1;

/// Decide whether a call is cached.
///
/// `flagged` is the op table's cacheable flag and `override_` a per-request
/// handler decision, which wins when present. NFSv4.1+ COMPOUNDs never enter
/// the cache.
pub fn cacheable(
    flagged: bool,
    header: &CallHeader,
    args: &[u8],
    override_: Option<bool>,
) -> bool {
    if is_v4_compound(header) && v4_minor_version(args).is_none_or(|minor| minor >= 1) {
        return false;
    }
    override_.unwrap_or(flagged)
}

fn is_v4_compound(header: &CallHeader) -> bool {
    header.prog == NFS_PROGRAM && header.vers == NFS_V4 && header.proc_num == NFSPROC4_COMPOUND
}

/// COMPOUND4args: `tag<>` then `minorversion`.
pub fn v4_minor_version(args: &[u8]) -> Option<u32> {
    let mut xdr = XdrReader::new(args);
    xdr.opaque(args.len())?;
    xdr.u32()
}
