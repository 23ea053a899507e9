//! Configuration loader — merges env vars, .env file, and config.toml.

use common::config::BotConfig;
use common::{Error, PinnedStop};
use std::path::Path;

fn parse_bool(raw: &str) -> bool {
    let lowered = raw.trim().to_ascii_lowercase();
    lowered != "0" && lowered != "false" && lowered != "no" && lowered != "off"
}

fn parse_u64(raw: &str, env_name: &str) -> Result<u64, Error> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| Error::Config(format!("{env_name} must be an integer >= 0")))
}

fn parse_u16(raw: &str, env_name: &str) -> Result<u16, Error> {
    raw.trim()
        .parse::<u16>()
        .map_err(|_| Error::Config(format!("{env_name} must be a port number")))
}

fn parse_i32(raw: &str, env_name: &str) -> Result<i32, Error> {
    raw.trim()
        .parse::<i32>()
        .map_err(|_| Error::Config(format!("{env_name} must be an integer")))
}

fn parse_non_negative_f64(raw: &str, env_name: &str) -> Result<f64, Error> {
    let parsed = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| Error::Config(format!("{env_name} must be a number >= 0")))?;
    if parsed < 0.0 {
        return Err(Error::Config(format!("{env_name} must be a number >= 0")));
    }
    Ok(parsed)
}

fn validate_config(config: &BotConfig) -> Result<(), Error> {
    let mut issues: Vec<String> = Vec::new();

    if config.cache.fresh_ttl_secs == 0 {
        issues.push("cache.fresh_ttl_secs must be > 0".into());
    }
    if config.cache.stale_ttl_secs <= config.cache.fresh_ttl_secs {
        issues.push("cache.stale_ttl_secs must be greater than cache.fresh_ttl_secs".into());
    }
    if config.cache.fetch_timeout_secs == 0 {
        issues.push("cache.fetch_timeout_secs must be > 0".into());
    }
    if config.cache.result_limit == 0 {
        issues.push("cache.result_limit must be > 0".into());
    }

    if config.refresher.poll_interval_secs == 0 {
        issues.push("refresher.poll_interval_secs must be > 0".into());
    }

    if config.automation.enabled {
        if config.automation.stop_id.trim().is_empty() {
            issues.push("automation.stop_id is required when automation is enabled".into());
        }
        if config.automation.route_id.trim().is_empty() {
            issues.push("automation.route_id is required when automation is enabled".into());
        }
        if config.automation.command_timeout_secs == 0 {
            issues.push("automation.command_timeout_secs must be > 0".into());
        }
    }

    for stop in &config.stops {
        if stop.stop_id.trim().is_empty() {
            issues.push("stops entries must have a stop_id".into());
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "Invalid config:\n - {}",
            issues.join("\n - ")
        )))
    }
}

/// Merge pinned stops from an external stops file: entries replace a
/// config stop with the same id, otherwise append.
fn merge_stops(base: &mut Vec<PinnedStop>, extra: Vec<PinnedStop>) {
    for stop in extra {
        if let Some(existing) = base.iter_mut().find(|s| s.stop_id == stop.stop_id) {
            *existing = stop;
        } else {
            base.push(stop);
        }
    }
}

fn load_stops_file(path: &str) -> Result<Vec<PinnedStop>, Error> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read stops file {}: {}", path, e)))?;
    serde_json::from_str(&contents)
        .map_err(|e| Error::Config(format!("Failed to parse stops file {}: {}", path, e)))
}

/// Load bot configuration from environment and optional config file.
pub fn load_config() -> Result<BotConfig, Error> {
    // 1. Load .env file from project root or parent directories.
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {}", e);
    }

    // 2. Start with defaults.
    let mut config = BotConfig::default();

    // 3. Try loading config.toml if it exists.
    let config_path = Path::new("config.toml");
    if config_path.exists() {
        let contents = std::fs::read_to_string(config_path)
            .map_err(|e| Error::Config(format!("Failed to read config.toml: {}", e)))?;
        config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config.toml: {}", e)))?;
    }

    // 4. Override with environment variables (highest priority).
    if let Ok(key) = std::env::var("MBTA_API_KEY") {
        config.mbta_api_key = key;
    }
    if let Ok(host) = std::env::var("HOST") {
        let trimmed = host.trim();
        if !trimmed.is_empty() {
            config.server.host = trimmed.to_string();
        }
    }
    if let Ok(port) = std::env::var("PORT") {
        config.server.port = parse_u16(&port, "PORT")?;
    }
    if let Ok(raw) = std::env::var("REFRESH_INTERVAL_SECS") {
        config.refresher.poll_interval_secs = parse_u64(&raw, "REFRESH_INTERVAL_SECS")?;
    }
    if let Ok(raw) = std::env::var("AUTOMATION_ENABLED") {
        config.automation.enabled = parse_bool(&raw);
    }
    if let Ok(raw) = std::env::var("AUTOMATION_STOP_ID") {
        config.automation.stop_id = raw.trim().to_string();
    }
    if let Ok(raw) = std::env::var("AUTOMATION_STOP_NAME") {
        config.automation.stop_name = raw.trim().to_string();
    }
    if let Ok(raw) = std::env::var("AUTOMATION_ROUTE_ID") {
        config.automation.route_id = raw.trim().to_string();
    }
    if let Ok(raw) = std::env::var("AUTOMATION_ROUTE_TYPE") {
        config.automation.route_type = parse_i32(&raw, "AUTOMATION_ROUTE_TYPE")?;
    }
    if let Ok(raw) = std::env::var("AUTOMATION_LEAD_MINUTES") {
        config.automation.lead_minutes = parse_non_negative_f64(&raw, "AUTOMATION_LEAD_MINUTES")?;
    }
    if let Ok(raw) = std::env::var("AUTOMATION_PASS_SECONDS") {
        config.automation.pass_seconds = parse_u64(&raw, "AUTOMATION_PASS_SECONDS")?;
    }
    if let Ok(raw) = std::env::var("AUTOMATION_POLL_SECS") {
        config.automation.poll_seconds = parse_u64(&raw, "AUTOMATION_POLL_SECS")?;
    }
    if let Ok(raw) = std::env::var("AUTOMATION_WEBHOOK_URL") {
        config.automation.webhook_url = raw.trim().to_string();
    }
    if let Ok(raw) = std::env::var("AUTOMATION_WEBHOOK_TOKEN") {
        config.automation.webhook_token = raw.trim().to_string();
    }
    if let Ok(raw) = std::env::var("AUTOMATION_RAISE_COMMAND") {
        config.automation.raise_command = raw;
    }
    if let Ok(raw) = std::env::var("AUTOMATION_RESTORE_COMMAND") {
        config.automation.restore_command = raw;
    }

    // 5. Merge the external pinned-stop list, when configured.
    if let Ok(path) = std::env::var("STOPS_FILE") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            merge_stops(&mut config.stops, load_stops_file(trimmed)?);
        }
    }

    // 6. Apply the soft minimums, then validate.
    config.automation = config.automation.clone().clamped();
    validate_config(&config)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = BotConfig::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn stale_ttl_must_exceed_fresh_ttl() {
        let mut config = BotConfig::default();
        config.cache.stale_ttl_secs = config.cache.fresh_ttl_secs;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("stale_ttl_secs"));
    }

    #[test]
    fn automation_soft_minimums_are_clamped() {
        let mut config = BotConfig::default();
        config.automation.poll_seconds = 1;
        config.automation.pass_seconds = 2;
        config.automation.result_limit = 1;
        config.automation.lead_minutes = -3.0;

        let clamped = config.automation.clamped();
        assert_eq!(clamped.poll_seconds, 3);
        assert_eq!(clamped.pass_seconds, 10);
        assert_eq!(clamped.result_limit, 6);
        assert_eq!(clamped.lead_minutes, 0.0);
    }

    #[test]
    fn stops_file_entries_override_config_stops() {
        let mut base = vec![PinnedStop {
            stop_id: "place-sdmnl".into(),
            name: "Suffolk Downs".into(),
            route_type: Some(1),
            route_id: None,
        }];
        merge_stops(
            &mut base,
            vec![
                PinnedStop {
                    stop_id: "place-sdmnl".into(),
                    name: "Suffolk Downs (renamed)".into(),
                    route_type: Some(1),
                    route_id: Some("Blue".into()),
                },
                PinnedStop {
                    stop_id: "place-orhte".into(),
                    name: "Orient Heights".into(),
                    route_type: Some(1),
                    route_id: None,
                },
            ],
        );

        assert_eq!(base.len(), 2);
        assert_eq!(base[0].name, "Suffolk Downs (renamed)");
        assert_eq!(base[1].stop_id, "place-orhte");
    }
}
