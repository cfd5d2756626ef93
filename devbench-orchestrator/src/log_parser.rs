//! Extracts structured signals from provisioning script output.
//!
//! The script speaks a loose line protocol: `status:<value>`, `VM_IP=<ip>`,
//! `SSH_INFO=<value>`, `VNC_INFO=<value>` and the bare `VM_CREATION_COMPLETE`
//! marker. Markers may appear anywhere in a line, after arbitrary prefixes
//! such as timestamps, and one line can carry several of them.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::VmStatus;

pub const COMPLETION_MARKER: &str = "VM_CREATION_COMPLETE";

static STATUS_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)status:").expect("Hardcoded status marker pattern should always compile")
});
static IP_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)VM_IP=").expect("Hardcoded VM_IP marker pattern should always compile")
});
static SSH_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)SSH_INFO=").expect("Hardcoded SSH_INFO marker pattern should always compile")
});
static VNC_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)VNC_INFO=").expect("Hardcoded VNC_INFO marker pattern should always compile")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedSignal {
    StatusChanged(VmStatus),
    /// A `status:` value outside the known vocabulary, kept verbatim.
    UnknownStatus(String),
    IpAddress(String),
    SshInfo(String),
    VncInfo(String),
    Completed,
}

fn value_after(marker: &Regex, line: &str) -> Option<String> {
    marker
        .find(line)
        .map(|m| line[m.end()..].trim().to_string())
}

/// Parse one line of output. Unrecognized and blank lines yield nothing.
pub fn parse_line(line: &str) -> Vec<ParsedSignal> {
    let mut signals = Vec::new();
    if line.trim().is_empty() {
        return signals;
    }

    // The last `status:` wins, so "status: x status: running" reports running.
    if let Some(m) = STATUS_MARKER.find_iter(line).last() {
        let value = line[m.end()..].trim();
        signals.push(match value.parse::<VmStatus>() {
            Ok(status) => ParsedSignal::StatusChanged(status),
            Err(unknown) => ParsedSignal::UnknownStatus(unknown.0),
        });
    }

    if let Some(ip) = value_after(&IP_MARKER, line) {
        signals.push(ParsedSignal::IpAddress(ip));
    }
    if let Some(ssh) = value_after(&SSH_MARKER, line) {
        signals.push(ParsedSignal::SshInfo(ssh));
    }
    if let Some(vnc) = value_after(&VNC_MARKER, line) {
        signals.push(ParsedSignal::VncInfo(vnc));
    }
    if line.contains(COMPLETION_MARKER) {
        signals.push(ParsedSignal::Completed);
    }

    signals
}
