//! Suspicious request detection
//!
//! Detection only: a match produces a `SUSPICIOUS_REQUEST` event, the request
//! itself is still served.

use super::Severity;

/// Attack tooling; a hit is more than curiosity
const ATTACK_TOOLS: &[&str] = &["sqlmap", "nikto", "nmap", "masscan", "zgrab", "nuclei", "dirbuster"];

/// Generic automation clients
const AUTOMATION_AGENTS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "curl",
    "wget",
    "python-requests",
    "python-urllib",
    "go-http-client",
    "scrapy",
    "headless",
];

/// Paths nobody but a scanner asks for
const PROBE_PATHS: &[&str] = &[
    "/.env",
    "/.git",
    "/wp-admin",
    "/wp-login",
    "/phpmyadmin",
    "/admin.php",
    "/config.php",
    "/server-status",
    "/actuator",
];

const TRAVERSAL_MARKERS: &[&str] = &["../", "..%2f", "%2e%2e", "/etc/passwd"];

const INJECTION_MARKERS: &[&str] = &["<script", "%3cscript", "union select", "union%20select"];

/// A detected pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub severity: Severity,
    pub reasons: Vec<String>,
}

/// Inspect a request's user agent and path (with query)
pub fn detect(user_agent: Option<&str>, path_and_query: &str) -> Option<Detection> {
    let mut severity: Option<Severity> = None;
    let mut reasons = Vec::new();
    let mut raise = |level: Severity, reason: String| {
        severity = Some(severity.map_or(level, |s| s.max(level)));
        reasons.push(reason);
    };

    let agent = user_agent.unwrap_or("").to_lowercase();
    if let Some(tool) = ATTACK_TOOLS.iter().find(|t| agent.contains(*t)) {
        raise(Severity::High, format!("attack tool user agent: {}", tool));
    } else if let Some(client) = AUTOMATION_AGENTS.iter().find(|a| agent.contains(*a)) {
        raise(Severity::Low, format!("automation user agent: {}", client));
    }

    let path = path_and_query.to_lowercase();
    if let Some(probe) = PROBE_PATHS.iter().find(|p| path.starts_with(*p)) {
        raise(Severity::Medium, format!("sensitive path probe: {}", probe));
    }
    if TRAVERSAL_MARKERS.iter().any(|m| path.contains(m)) {
        raise(Severity::High, "path traversal attempt".to_string());
    }
    if INJECTION_MARKERS.iter().any(|m| path.contains(m)) {
        raise(Severity::High, "injection attempt".to_string());
    }

    let mut severity = severity?;
    // Attack tooling combined with an exploit payload
    if reasons.len() > 1 && severity == Severity::High {
        severity = Severity::Critical;
    }

    Some(Detection { severity, reasons })
}
