//! Seatbelt profile construction.
//!
//! The profile is a static read-only baseline plus, when the caller asks for
//! it, one `file-write*` clause listing a `subpath` per writable root. Root
//! paths never appear in the profile text: each one is bound to a numbered
//! `WRITABLE_ROOT_<i>` parameter and handed to `sandbox-exec` as a separate
//! `-D` argument, so a path cannot smuggle profile syntax.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use super::error::SandboxError;

/// Read-only baseline, derived from Chrome's common.sb.
pub const READ_ONLY_SEATBELT_POLICY: &str = r#"(version 1)

; inspired by Chrome's sandbox policy:
; https://source.chromium.org/chromium/chromium/src/+/main:sandbox/policy/mac/common.sb;l=273-319;drc=7b3962fe2e5fc9e2ee58000dc8fbf3429d84d3bd

; start with closed-by-default
(deny default)

; allow read-only file operations
(allow file-read*)

; child processes inherit the policy of their parent
(allow process-exec)
(allow process-fork)
(allow signal (target self))

(allow file-write-data
  (require-all
    (path "/dev/null")
    (vnode-type CHARACTER-DEVICE)))

; sysctls permitted.
(allow sysctl-read
  (sysctl-name "hw.activecpu")
  (sysctl-name "hw.busfrequency_compat")
  (sysctl-name "hw.byteorder")
  (sysctl-name "hw.cacheconfig")
  (sysctl-name "hw.cachelinesize_compat")
  (sysctl-name "hw.cpufamily")
  (sysctl-name "hw.cpufrequency_compat")
  (sysctl-name "hw.cputype")
  (sysctl-name "hw.l1dcachesize_compat")
  (sysctl-name "hw.l1icachesize_compat")
  (sysctl-name "hw.l2cachesize_compat")
  (sysctl-name "hw.l3cachesize_compat")
  (sysctl-name "hw.logicalcpu_max")
  (sysctl-name "hw.machine")
  (sysctl-name "hw.ncpu")
  (sysctl-name "hw.nperflevels")
  (sysctl-name "hw.optional.arm.FEAT_BF16")
  (sysctl-name "hw.optional.arm.FEAT_DotProd")
  (sysctl-name "hw.optional.arm.FEAT_FCMA")
  (sysctl-name "hw.optional.arm.FEAT_FHM")
  (sysctl-name "hw.optional.arm.FEAT_FP16")
  (sysctl-name "hw.optional.arm.FEAT_I8MM")
  (sysctl-name "hw.optional.arm.FEAT_JSCVT")
  (sysctl-name "hw.optional.arm.FEAT_LSE")
  (sysctl-name "hw.optional.arm.FEAT_RDM")
  (sysctl-name "hw.optional.arm.FEAT_SHA512")
  (sysctl-name "hw.optional.armv8_2_sha512")
  (sysctl-name "hw.memsize")
  (sysctl-name "hw.pagesize")
  (sysctl-name "hw.packages")
  (sysctl-name "hw.pagesize_compat")
  (sysctl-name "hw.physicalcpu_max")
  (sysctl-name "hw.tbfrequency_compat")
  (sysctl-name "hw.vectorunit")
  (sysctl-name "kern.hostname")
  (sysctl-name "kern.maxfilesperproc")
  (sysctl-name "kern.osproductversion")
  (sysctl-name "kern.osrelease")
  (sysctl-name "kern.ostype")
  (sysctl-name "kern.osvariant_status")
  (sysctl-name "kern.osversion")
  (sysctl-name "kern.secure_kernel")
  (sysctl-name "kern.usrstack64")
  (sysctl-name "kern.version")
  (sysctl-name "sysctl.proc_cputype")
  (sysctl-name-prefix "hw.perflevel")
)"#;

/// Prefix of the template parameter bound to each writable root.
const WRITABLE_ROOT_PARAM: &str = "WRITABLE_ROOT_";

/// Caller-requested writable roots: a set that remembers insertion order.
///
/// Order matters because it decides which `WRITABLE_ROOT_<i>` name a root
/// is bound to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WritableRoots {
    roots: Vec<PathBuf>,
}

impl WritableRoots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a root unless an equal path is already present.
    /// Returns true if the root was added.
    pub fn insert(&mut self, root: impl Into<PathBuf>) -> bool {
        let root = root.into();
        if self.roots.contains(&root) {
            return false;
        }
        self.roots.push(root);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.roots.iter().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

impl<P: Into<PathBuf>> FromIterator<P> for WritableRoots {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        let mut roots = Self::new();
        for root in iter {
            roots.insert(root);
        }
        roots
    }
}

/// A `-D<name>=<value>` binding passed next to the profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyParam {
    pub name: String,
    pub value: PathBuf,
}

impl PolicyParam {
    /// Renders the binding as a single `sandbox-exec` argument.
    pub fn to_arg(&self) -> OsString {
        let mut arg = OsString::from(format!("-D{}=", self.name));
        arg.push(self.value.as_os_str());
        arg
    }
}

/// A requested root that was left out of the profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRoot {
    pub path: PathBuf,
    pub reason: String,
}

/// Which writable roots made it into the profile and which did not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RootReport {
    /// Canonical paths, in parameter order.
    pub granted: Vec<PathBuf>,
    pub skipped: Vec<SkippedRoot>,
}

/// A fully built Seatbelt profile and its parameter bindings.
///
/// Built fresh for every call and dropped once the child has exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatbeltPolicy {
    text: String,
    params: Vec<PolicyParam>,
    skipped: Vec<SkippedRoot>,
}

impl SeatbeltPolicy {
    /// Builds the profile for the given roots.
    ///
    /// Roots that do not exist or cannot be canonicalized are skipped with a
    /// warning; they never fail the build.
    pub fn build(roots: &WritableRoots) -> Self {
        let mut params = Vec::new();
        let mut skipped = Vec::new();
        if roots.is_empty() {
            debug!("No writable roots requested; using read-only baseline");
        }

        for root in roots.iter() {
            match canonical_root(root) {
                Ok(real_root) => {
                    let name = format!("{WRITABLE_ROOT_PARAM}{}", params.len());
                    params.push(PolicyParam {
                        name,
                        value: real_root,
                    });
                }
                Err(err) => {
                    warn!("{err}. Skipping.");
                    let reason = match err {
                        SandboxError::WritableRootUnusable { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    skipped.push(SkippedRoot {
                        path: root.to_path_buf(),
                        reason,
                    });
                }
            }
        }

        let mut text = READ_ONLY_SEATBELT_POLICY.to_string();
        if !params.is_empty() {
            text.push_str("\n(allow file-write*\n");
            for param in &params {
                text.push_str(&format!("  (subpath (param \"{}\"))\n", param.name));
            }
            text.push(')');
        }

        debug!("Full sandbox policy:\n{text}");

        Self {
            text,
            params,
            skipped,
        }
    }

    /// The complete profile text handed to `sandbox-exec -p`.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn params(&self) -> &[PolicyParam] {
        &self.params
    }

    /// Granted and skipped roots, for reporting back to the caller.
    pub fn report(&self) -> RootReport {
        RootReport {
            granted: self.params.iter().map(|p| p.value.clone()).collect(),
            skipped: self.skipped.clone(),
        }
    }

    /// Arguments for the enforcement front end:
    /// `-p <profile> -D... -- <command...>`.
    pub fn launch_args(&self, command: &[String]) -> Vec<OsString> {
        let mut args = Vec::with_capacity(3 + self.params.len() + command.len());
        args.push(OsString::from("-p"));
        args.push(OsString::from(&self.text));
        args.extend(self.params.iter().map(PolicyParam::to_arg));
        args.push(OsString::from("--"));
        args.extend(command.iter().map(OsString::from));
        args
    }
}

/// The kernel resolves symlinks, so the profile must name the real path.
fn canonical_root(root: &Path) -> Result<PathBuf, SandboxError> {
    if !root.exists() {
        return Err(SandboxError::WritableRootUnusable {
            path: root.to_path_buf(),
            reason: "path does not exist".to_string(),
        });
    }
    std::fs::canonicalize(root).map_err(|e| SandboxError::WritableRootUnusable {
        path: root.to_path_buf(),
        reason: format!("could not get real path: {e}"),
    })
}
