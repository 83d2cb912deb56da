//! Share admission and selection.
//!
//! A share is a `//host/export` address. Placement asks a `CapacityProbe` for a fresh
//! `{total, available, allocated}` triple per share (never cached), filters by the
//! admission policy and picks the least-allocated eligible share; ties keep the order
//! in which shares were declared.
//!
//! Also here: the shares file format and `-o` option parsing.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::metrics::{record_share_rejected, record_share_selected};

pub const GIB: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShareCapacity {
    pub total: u64,
    pub available: u64,
    pub allocated: u64,
}

pub trait CapacityProbe: Send + Sync {
    fn capacity(&self, share: &str) -> Result<ShareCapacity>;
}

#[derive(Debug, Clone, Copy)]
pub struct AdmissionPolicy {
    pub used_ratio: f64,
    pub oversub_ratio: f64,
}

impl AdmissionPolicy {
    pub fn from_config(cfg: &DriverConfig) -> Self {
        Self {
            used_ratio: cfg.used_ratio,
            oversub_ratio: cfg.oversub_ratio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Admission {
    Eligible,
    Empty,
    OverUsed { used: f64 },
    NoRoom { apparent_available: f64 },
    OverSubscribed { ratio: f64 },
}

impl Admission {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Admission::Eligible)
    }
}

/// Admission verdict for placing `requested_bytes` on a share with capacity `cap`.
pub fn check_admission(cap: &ShareCapacity, policy: &AdmissionPolicy, requested_bytes: u64) -> Admission {
    if cap.total == 0 {
        return Admission::Empty;
    }
    let total = cap.total as f64;

    let used = (cap.total.saturating_sub(cap.available)) as f64 / total;
    if used > policy.used_ratio {
        return Admission::OverUsed { used };
    }

    let apparent_size = (total * policy.oversub_ratio).max(0.0);
    let apparent_available = (apparent_size - cap.allocated as f64).max(0.0);
    if apparent_available <= requested_bytes as f64 {
        return Admission::NoRoom { apparent_available };
    }

    let ratio = cap.allocated as f64 / total;
    if ratio >= policy.oversub_ratio {
        return Admission::OverSubscribed { ratio };
    }
    Admission::Eligible
}

pub fn is_share_eligible(
    probe: &dyn CapacityProbe,
    policy: &AdmissionPolicy,
    share: &str,
    size_gib: u64,
) -> Result<bool> {
    let cap = probe
        .capacity(share)
        .with_context(|| format!("capacity of {}", share))?;
    let verdict = check_admission(&cap, policy, size_gib.saturating_mul(GIB));
    if !verdict.is_eligible() {
        debug!("shares: {} rejected for {} GiB: {:?}", share, size_gib, verdict);
    }
    Ok(verdict.is_eligible())
}

/// Pick the eligible share with the least allocated bytes.
pub fn select_share(
    probe: &dyn CapacityProbe,
    policy: &AdmissionPolicy,
    candidates: &[String],
    size_gib: u64,
) -> Result<String> {
    if candidates.is_empty() {
        return Err(DriverError::NoSharesAvailable.into());
    }
    let requested = size_gib.saturating_mul(GIB);

    let mut best: Option<(&String, u64)> = None;
    for share in candidates {
        let cap = probe
            .capacity(share)
            .with_context(|| format!("capacity of {}", share))?;
        let verdict = check_admission(&cap, policy, requested);
        if !verdict.is_eligible() {
            record_share_rejected();
            debug!("shares: {} rejected for {} GiB: {:?}", share, size_gib, verdict);
            continue;
        }
        match best {
            Some((_, alloc)) if alloc <= cap.allocated => {}
            _ => best = Some((share, cap.allocated)),
        }
    }

    match best {
        Some((share, allocated)) => {
            record_share_selected();
            info!(
                "shares: selected {} for {} GiB (allocated={})",
                share, size_gib, allocated
            );
            Ok(share.clone())
        }
        None => Err(DriverError::NoEligibleShare { size_gib }.into()),
    }
}

// ---------------- shares file ----------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShareEntry {
    pub address: String,
    /// Raw option string following the address (e.g. `-o username=u,password=p`).
    pub options: Option<String>,
}

fn is_share_address(s: &str) -> bool {
    // //<host>/<export>, both parts non-empty
    let Some(rest) = s.strip_prefix("//") else {
        return false;
    };
    match rest.find('/') {
        Some(i) => i > 0 && i + 1 < rest.len(),
        None => false,
    }
}

/// One share per line; blank lines and `#` comments are skipped, malformed addresses
/// are skipped with a warning.
pub fn parse_shares(text: &str) -> Vec<ShareEntry> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(address) = parts.next() else {
            continue;
        };
        if !is_share_address(address) {
            warn!("shares: ignoring malformed share address '{}'", address);
            continue;
        }
        let rest: Vec<&str> = parts.collect();
        out.push(ShareEntry {
            address: address.to_string(),
            options: if rest.is_empty() {
                None
            } else {
                Some(rest.join(" "))
            },
        });
    }
    out
}

pub fn load_shares_config(path: &Path) -> Result<Vec<ShareEntry>> {
    if !path.exists() {
        return Err(DriverError::InvalidConfig(format!(
            "shares config file {} does not exist",
            path.display()
        ))
        .into());
    }
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(parse_shares(&text))
}

// ---------------- mount options ----------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    /// Bare flags (`noperm`, `ro`, ...).
    pub flags: Vec<String>,
    pub values: BTreeMap<String, String>,
}

impl MountOptions {
    /// Parse `-o a,b=c -o d` style strings. The `-o` markers are optional.
    pub fn parse(option_str: &str) -> Self {
        let mut opts = MountOptions::default();
        for tok in option_str.split_whitespace() {
            if tok == "-o" {
                continue;
            }
            for item in tok.split(',').filter(|s| !s.is_empty()) {
                match item.split_once('=') {
                    Some((k, v)) => {
                        opts.values.insert(k.to_string(), v.to_string());
                    }
                    None => opts.flags.push(item.to_string()),
                }
            }
        }
        opts
    }

    /// Overlay `other` on top of `self` (values from `other` win).
    pub fn merged(mut self, other: &MountOptions) -> Self {
        for f in &other.flags {
            if !self.flags.contains(f) {
                self.flags.push(f.clone());
            }
        }
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
        self
    }

    /// Comma-joined form for `mount -o`.
    pub fn to_option_string(&self) -> String {
        let mut parts: Vec<String> = self.flags.clone();
        parts.extend(self.values.iter().map(|(k, v)| format!("{}={}", k, v)));
        parts.join(",")
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.values.is_empty()
    }

    pub fn credentials(&self) -> Credentials {
        parse_credentials(&self.values)
    }

    /// Samba wants a bare user name: fold `user`/`username` into `username` without domain.
    pub fn normalize_credentials(mut self) -> Self {
        let creds = self.credentials();
        self.values.remove("user");
        self.values.insert("username".to_string(), creds.username);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

/// `user` (or `username`) with any `DOMAIN\` prefix removed; `guest` when absent.
pub fn parse_credentials(values: &BTreeMap<String, String>) -> Credentials {
    let raw = values
        .get("user")
        .or_else(|| values.get("username"))
        .map(String::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("guest");
    let username = raw.rsplit('\\').next().unwrap_or(raw);
    Credentials {
        username: username.to_string(),
        password: values
            .get("password")
            .or_else(|| values.get("pass"))
            .cloned(),
    }
}
