//! Pre-flight checks for domprof
//!
//! Validates that the host can talk to the hypervisor before any domain is
//! paused. Provides clear, actionable error messages when it can't.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Result};
use std::path::Path;

/// Where xenfs normally exposes the hypervisor interface
const XEN_CAPABILITIES: &str = "/proc/xen/capabilities";

/// Run all pre-flight checks before opening the hypercall interface
pub fn run_preflight_checks(privcmd_path: &str) -> Result<()> {
    check_privileges()?;
    check_privcmd(Path::new(privcmd_path))?;
    check_control_domain();
    Ok(())
}

/// Privileged hypercalls are root-only
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }
    bail!(
        "Permission denied: domprof requires root privileges to issue domain control hypercalls.\n\n\
         Run with: sudo domprof ..."
    );
}

fn check_privcmd(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!(
            "Hypervisor interface not found: {}\n\n\
             domprof must run in the control domain of a Xen host.\n\
             Check that xenfs is mounted and the privcmd driver is loaded:\n  \
             modprobe xen-privcmd",
            path.display()
        );
    }
    Ok(())
}

/// Warn when this looks like an unprivileged guest
fn check_control_domain() {
    let Ok(caps) = std::fs::read_to_string(XEN_CAPABILITIES) else {
        return;
    };
    if !caps.contains("control_d") {
        eprintln!("warning: this does not appear to be the control domain, hypercalls may be refused");
    }
}
