use chrono::TimeZone as _;

pub fn build_host() -> &'static str {
    option_env!("SERVERNODE_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("SERVERNODE_BUILD_TIME").unwrap_or("unknown")
}

pub fn git_rev() -> &'static str {
    option_env!("SERVERNODE_GIT_REV").unwrap_or("unknown")
}

pub fn format_build_time_pretty(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(epoch) = raw.strip_prefix("epoch:") {
        if let Ok(secs) = epoch.trim().parse::<i64>() {
            if let Some(dt) = chrono::Utc.timestamp_opt(secs, 0).single() {
                return dt.format("%Y-%m-%d %H:%M:%S").to_string();
            }
        }
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return dt
            .with_timezone(&chrono::Utc)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
    }
    raw.replace('T', " ").trim_end_matches('Z').to_string()
}

/// One-line identification used by the boot event and the `version` command.
pub fn banner() -> String {
    format!(
        "servernode {} (rev {}, built on {} at {} UTC)",
        env!("CARGO_PKG_VERSION"),
        git_rev(),
        build_host(),
        format_build_time_pretty(build_time_raw())
    )
}
