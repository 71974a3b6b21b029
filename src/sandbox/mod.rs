pub mod child;
pub mod fuse;
pub mod overlay;

/// Overlay backend, fixed once after namespace negotiation.
///
/// The root-transition strategy is bound to the backend: pivot_root needs a
/// mount the caller controls privately, which the kernel overlay gives us;
/// the FUSE mount is held open by a helper process, so that path falls back
/// to chroot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Kernel overlayfs + pivot_root (requires CAP_SYS_ADMIN).
    KernelOverlay,
    /// fuse-overlayfs + chroot (user namespace path).
    FuseOverlay,
}

/// Whether the host root filesystem is itself an overlay mount.
///
/// The kernel refuses to stack more than two overlay levels, and persisting
/// an upper into a root that disappears with the container is a footgun, so
/// both paths need to know this up front.
pub fn host_root_is_overlay() -> bool {
    let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
        return false;
    };
    mounts.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let _device = fields.next();
        fields.next() == Some("/") && fields.next() == Some("overlay")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_root_is_overlay_matches_proc_mounts() {
        // Cross-check against /proc/mounts directly; the helper must agree
        // with whatever this host actually is.
        let mounts = std::fs::read_to_string("/proc/mounts").unwrap();
        let expected = mounts.lines().any(|l| {
            let f: Vec<&str> = l.split_whitespace().collect();
            f.len() >= 3 && f[1] == "/" && f[2] == "overlay"
        });
        assert_eq!(host_root_is_overlay(), expected);
    }
}
