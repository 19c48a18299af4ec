//! Helpers for running the `ip`, `iptables` and `ip6tables` tools.
//!
//! Child processes inherit the network namespace of the calling thread, so
//! a command run from inside [`crate::osl::Namespace::invoke`] acts on the
//! sandbox.

use std::process::Command;

use netplane_common::{NetError, NetResult};

/// Run `program` with `args`, failing on a non-zero exit status.
pub fn run(program: &str, args: &[&str]) -> NetResult<()> {
    output(program, args).map(|_| ())
}

/// Run `program` with `args` and return its standard output.
pub fn output(program: &str, args: &[&str]) -> NetResult<String> {
    let out = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| NetError::Internal {
            message: format!("Failed to execute {program}: {e}"),
        })?;

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(NetError::Internal {
            message: format!(
                "{program} {} failed: {}",
                args.join(" "),
                stderr.trim()
            ),
        });
    }

    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Whether `program` with `args` exits successfully. Spawn failures count as
/// failure.
#[must_use]
pub fn succeeds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Run `ip` with `args`.
pub fn ip(args: &[&str]) -> NetResult<()> {
    run("ip", args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_program() {
        let err = run("netplane-no-such-binary", &[]).unwrap_err();
        assert!(err.to_string().contains("Failed to execute"));
        assert!(!succeeds("netplane-no-such-binary", &[]));
    }

    #[test]
    fn failing_program() {
        assert!(run("false", &[]).is_err());
        assert!(succeeds("true", &[]));
    }

    #[test]
    fn captures_stdout() {
        let out = output("echo", &["hello"]).unwrap();
        assert_eq!(out.trim(), "hello");
    }
}
