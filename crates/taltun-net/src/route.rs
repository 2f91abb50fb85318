//! Interface addressing and kernel route installation.
//!
//! Shells out to `ip(8)`; "File exists" results are tolerated so restarts
//! against a half-configured interface are idempotent.

use ipnet::Ipv4Net;
use std::io;
use std::net::Ipv4Addr;
use std::process::Command;

/// Assign `ip/24` to the interface, set its MTU, and bring it up.
///
/// # Errors
///
/// Fails if any `ip` invocation fails for a reason other than the address
/// already being present.
pub fn configure_interface(name: &str, ip: Ipv4Addr, mtu: usize) -> io::Result<()> {
    run_ip(&["addr", "add", &format!("{ip}/24"), "dev", name])?;
    run_ip(&["link", "set", "dev", name, "mtu", &mtu.to_string()])?;
    run_ip(&["link", "set", "dev", name, "up"])?;
    tracing::info!(interface = name, %ip, mtu, "interface configured");
    Ok(())
}

/// Install kernel routes for `routes` pointing at the interface.
///
/// # Errors
///
/// Fails if any route cannot be added for a reason other than already
/// existing.
pub fn add_routes(name: &str, routes: &[Ipv4Net]) -> io::Result<()> {
    for route in routes {
        run_ip(&["route", "add", &route.to_string(), "dev", name])?;
        tracing::debug!(interface = name, %route, "route installed");
    }
    Ok(())
}

fn run_ip(args: &[&str]) -> io::Result<()> {
    let output = Command::new("ip").args(args).output()?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("File exists") {
        return Ok(());
    }
    Err(io::Error::other(format!(
        "ip {} failed: {}",
        args.join(" "),
        stderr.trim()
    )))
}
