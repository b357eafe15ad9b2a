//! Device-level settings collected by the setup flow.
//!
//! A [`DeviceConfig`] is immutable for the duration of a session; a new one
//! replaces it wholesale on reconfiguration. It is persisted only through a
//! [`ConfigStore`] as flat string keys.

use std::{collections::BTreeMap, env, fmt, str::FromStr, time::Duration};

use anyhow::{Result, bail};
use chrono::{DateTime, Timelike, Utc};

use crate::store::{ConfigStore, StoreError};

/// Store keys.
pub mod keys {
    pub const WIFI_SSID: &str = "wifi_ssid";
    pub const WIFI_PASSWORD: &str = "wifi_password";
    pub const GITHUB_TOKEN: &str = "github_token";
    pub const GITHUB_USERNAME: &str = "github_username";
    pub const REPOSITORIES: &str = "repositories";
    pub const COMMIT_INTERVAL: &str = "commit_interval_secs";
    pub const PR_INTERVAL: &str = "pr_interval_secs";
    pub const REVIEW_INTERVAL: &str = "review_interval_secs";
    pub const REVIEW_INTERVAL_OFF: &str = "review_interval_off_secs";
    pub const WORK_START_HOUR: &str = "work_start_hour";
    pub const WORK_END_HOUR: &str = "work_end_hour";
    pub const LED_BRIGHTNESS: &str = "led_brightness";
    pub const SETUP_SSID: &str = "setup_ssid";
    pub const SETUP_PASSWORD: &str = "setup_password";
}

const ENV_PREFIX: &str = "GITGLOW_";

/// A monitored `owner/name` repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Repository {
    owner: String,
    name: String,
}

impl Repository {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl FromStr for Repository {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        match trimmed.split_once('/') {
            Some((owner, name)) if is_valid_segment(owner) && is_valid_segment(name) => Ok(Self {
                owner: owner.to_string(),
                name: name.to_string(),
            }),
            _ => bail!("Repository '{trimmed}' is not in owner/name form"),
        }
    }
}

/// Parses a comma separated repository list, skipping blank entries.
pub fn parse_repositories(list: &str) -> Result<Vec<Repository>> {
    let mut repositories: Vec<Repository> = Vec::new();
    for entry in list.split(',').filter(|e| !e.trim().is_empty()) {
        let repository: Repository = entry.parse()?;
        if !repositories.contains(&repository) {
            repositories.push(repository);
        }
    }
    Ok(repositories)
}

/// Base polling cadence per signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub commits_secs: u32,
    pub pull_requests_secs: u32,
    pub review_secs: u32,
    pub review_off_secs: u32,
    pub work_start_hour: u8,
    pub work_end_hour: u8,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            commits_secs: 900,
            pull_requests_secs: 120,
            review_secs: 60,
            review_off_secs: 300,
            work_start_hour: 9,
            work_end_hour: 18,
        }
    }
}

impl PollIntervals {
    pub fn commits(&self) -> Duration {
        Duration::from_secs(u64::from(self.commits_secs))
    }

    pub fn pull_requests(&self) -> Duration {
        Duration::from_secs(u64::from(self.pull_requests_secs))
    }

    /// Review comment cadence; faster inside working hours (UTC).
    pub fn review_comments(&self, now: DateTime<Utc>) -> Duration {
        let secs = if self.is_work_hour(now.hour()) {
            self.review_secs
        } else {
            self.review_off_secs
        };
        Duration::from_secs(u64::from(secs))
    }

    /// Working hours may wrap past midnight (e.g. 22..6).
    pub fn is_work_hour(&self, hour: u32) -> bool {
        let start = u32::from(self.work_start_hour);
        let end = u32::from(self.work_end_hour);
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub github_token: String,
    pub github_username: String,
    pub repositories: Vec<Repository>,
    pub intervals: PollIntervals,
    pub led_brightness: u8,
    pub setup_ssid: String,
    pub setup_password: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_password: String::new(),
            github_token: String::new(),
            github_username: String::new(),
            repositories: Vec::new(),
            intervals: PollIntervals::default(),
            led_brightness: 128,
            setup_ssid: "GitGlow-Setup".to_string(),
            setup_password: String::new(),
        }
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |s: &str| if s.is_empty() { "" } else { "***" };
        f.debug_struct("DeviceConfig")
            .field("wifi_ssid", &self.wifi_ssid)
            .field("wifi_password", &redact(&self.wifi_password))
            .field("github_token", &redact(&self.github_token))
            .field("github_username", &self.github_username)
            .field("repositories", &self.repositories)
            .field("intervals", &self.intervals)
            .field("led_brightness", &self.led_brightness)
            .field("setup_ssid", &self.setup_ssid)
            .finish_non_exhaustive()
    }
}

impl DeviceConfig {
    /// Whether the device has everything it needs to leave setup mode.
    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.wifi_ssid.trim().is_empty() {
            missing.push(keys::WIFI_SSID);
        }
        if self.github_token.trim().is_empty() {
            missing.push(keys::GITHUB_TOKEN);
        }
        if self.github_username.trim().is_empty() {
            missing.push(keys::GITHUB_USERNAME);
        }
        if self.repositories.is_empty() {
            missing.push(keys::REPOSITORIES);
        }
        missing
    }

    /// Local validation. Token authentication is checked separately against
    /// the API.
    pub fn validate(&self) -> Result<()> {
        let missing = self.missing_fields();
        if !missing.is_empty() {
            bail!("Device configuration incomplete, missing: {}", missing.join(", "));
        }

        let iv = &self.intervals;
        if iv.commits_secs == 0
            || iv.pull_requests_secs == 0
            || iv.review_secs == 0
            || iv.review_off_secs == 0
        {
            bail!("Poll intervals must be positive");
        }
        if iv.work_start_hour > 23 || iv.work_end_hour > 24 {
            bail!(
                "Work hours {}..{} are out of range",
                iv.work_start_hour,
                iv.work_end_hour
            );
        }
        Ok(())
    }

    /// Reads a configuration from the store, falling back to defaults for
    /// absent keys. Values that do not parse are reported as corruption.
    pub fn load(store: &dyn ConfigStore) -> Result<Self, StoreError> {
        let defaults = Self::default();
        let default_iv = defaults.intervals;

        let repositories = parse_repositories(&store.load(keys::REPOSITORIES, "")?)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(Self {
            wifi_ssid: store.load(keys::WIFI_SSID, "")?,
            wifi_password: store.load(keys::WIFI_PASSWORD, "")?,
            github_token: store.load(keys::GITHUB_TOKEN, "")?,
            github_username: store.load(keys::GITHUB_USERNAME, "")?,
            repositories,
            intervals: PollIntervals {
                commits_secs: load_number(store, keys::COMMIT_INTERVAL, default_iv.commits_secs)?,
                pull_requests_secs: load_number(
                    store,
                    keys::PR_INTERVAL,
                    default_iv.pull_requests_secs,
                )?,
                review_secs: load_number(store, keys::REVIEW_INTERVAL, default_iv.review_secs)?,
                review_off_secs: load_number(
                    store,
                    keys::REVIEW_INTERVAL_OFF,
                    default_iv.review_off_secs,
                )?,
                work_start_hour: load_number(
                    store,
                    keys::WORK_START_HOUR,
                    default_iv.work_start_hour,
                )?,
                work_end_hour: load_number(store, keys::WORK_END_HOUR, default_iv.work_end_hour)?,
            },
            led_brightness: clamp_brightness(load_number(
                store,
                keys::LED_BRIGHTNESS,
                i64::from(defaults.led_brightness),
            )?),
            setup_ssid: store.load(keys::SETUP_SSID, &defaults.setup_ssid)?,
            setup_password: store.load(keys::SETUP_PASSWORD, &defaults.setup_password)?,
        })
    }

    pub fn save(&self, store: &mut dyn ConfigStore) -> Result<(), StoreError> {
        let repositories = self
            .repositories
            .iter()
            .map(Repository::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let iv = &self.intervals;

        let entries = [
            (keys::WIFI_SSID, self.wifi_ssid.clone()),
            (keys::WIFI_PASSWORD, self.wifi_password.clone()),
            (keys::GITHUB_TOKEN, self.github_token.clone()),
            (keys::GITHUB_USERNAME, self.github_username.clone()),
            (keys::REPOSITORIES, repositories),
            (keys::COMMIT_INTERVAL, iv.commits_secs.to_string()),
            (keys::PR_INTERVAL, iv.pull_requests_secs.to_string()),
            (keys::REVIEW_INTERVAL, iv.review_secs.to_string()),
            (keys::REVIEW_INTERVAL_OFF, iv.review_off_secs.to_string()),
            (keys::WORK_START_HOUR, iv.work_start_hour.to_string()),
            (keys::WORK_END_HOUR, iv.work_end_hour.to_string()),
            (keys::LED_BRIGHTNESS, self.led_brightness.to_string()),
            (keys::SETUP_SSID, self.setup_ssid.clone()),
            (keys::SETUP_PASSWORD, self.setup_password.clone()),
        ];

        let values: BTreeMap<String, String> = entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        store.save_all(&values)
    }

    /// Writes `candidate` into a store that does not yet hold a complete
    /// configuration. Returns whether the store was written.
    pub fn seed(store: &mut dyn ConfigStore, candidate: &Self) -> Result<bool, StoreError> {
        if !candidate.is_complete() || Self::load(&*store)?.is_complete() {
            return Ok(false);
        }
        candidate.save(store)?;
        Ok(true)
    }

    /// Builds a configuration from `GITGLOW_*` environment variables.
    pub fn from_environment() -> Result<Self> {
        Self::from_lookup(|name| env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(token) = lookup("GITHUB_TOKEN") {
            config.github_token = token;
        }
        if let Some(username) = lookup("GITHUB_USERNAME") {
            config.github_username = username;
        }
        if let Some(ssid) = lookup("WIFI_SSID") {
            config.wifi_ssid = ssid;
        }
        if let Some(password) = lookup("WIFI_PASSWORD") {
            config.wifi_password = password;
        }
        if let Some(repositories) = lookup("REPOSITORIES") {
            config.repositories = parse_repositories(&repositories)?;
        }
        if let Some(brightness) = lookup("LED_BRIGHTNESS") {
            let value: i64 = brightness
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid LED brightness '{brightness}': {e}"))?;
            config.led_brightness = clamp_brightness(value);
        }

        Ok(config)
    }
}

fn clamp_brightness(value: i64) -> u8 {
    u8::try_from(value.clamp(0, i64::from(u8::MAX))).unwrap_or(u8::MAX)
}

fn load_number<T>(store: &dyn ConfigStore, key: &str, default: T) -> Result<T, StoreError>
where
    T: FromStr + ToString,
{
    let raw = store.load(key, &default.to_string())?;
    raw.trim()
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("{key} has invalid value '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MockConfigStore};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    fn complete_config() -> DeviceConfig {
        DeviceConfig {
            wifi_ssid: "home".into(),
            wifi_password: "secret".into(),
            github_token: "ghp_token".into(),
            github_username: "octocat".into(),
            repositories: vec!["octocat/hello".parse().unwrap()],
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn repository_parses_owner_and_name() {
        let repo: Repository = " rust-lang/rust ".parse().unwrap();
        assert_eq!(repo.owner(), "rust-lang");
        assert_eq!(repo.name(), "rust");
        assert_eq!(repo.to_string(), "rust-lang/rust");
    }

    #[test]
    fn repository_rejects_malformed_entries() {
        for bad in ["", "octocat", "/hello", "octocat/", "a/b/c", "oct cat/hello"] {
            assert!(bad.parse::<Repository>().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn parse_repositories_skips_blanks_and_duplicates() {
        let repos = parse_repositories("a/b, ,c/d,a/b,").unwrap();
        let names: Vec<String> = repos.iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["a/b", "c/d"]);
    }

    #[test]
    fn default_is_incomplete() {
        let config = DeviceConfig::default();
        assert!(!config.is_complete());
        assert_eq!(
            config.missing_fields(),
            vec![
                keys::WIFI_SSID,
                keys::GITHUB_TOKEN,
                keys::GITHUB_USERNAME,
                keys::REPOSITORIES
            ]
        );
        assert_eq!(config.setup_ssid, "GitGlow-Setup");
        assert_eq!(config.led_brightness, 128);
    }

    #[test]
    fn validate_accepts_complete_config() {
        assert!(complete_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let mut config = complete_config();
        config.intervals.pull_requests_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn review_interval_follows_work_hours() {
        let intervals = PollIntervals::default();
        let morning = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2024, 3, 4, 22, 0, 0).unwrap();

        assert_eq!(intervals.review_comments(morning), Duration::from_secs(60));
        assert_eq!(intervals.review_comments(night), Duration::from_secs(300));
    }

    #[test]
    fn work_hours_can_wrap_midnight() {
        let intervals = PollIntervals {
            work_start_hour: 22,
            work_end_hour: 6,
            ..PollIntervals::default()
        };
        assert!(intervals.is_work_hour(23));
        assert!(intervals.is_work_hour(3));
        assert!(!intervals.is_work_hour(12));
    }

    #[test]
    fn save_then_load_through_store() {
        let mut store = MemoryStore::new();
        let mut config = complete_config();
        config.repositories.push("rust-lang/rust".parse().unwrap());
        config.intervals.commits_secs = 1800;
        config.led_brightness = 40;

        config.save(&mut store).unwrap();
        let loaded = DeviceConfig::load(&store).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn load_empty_store_yields_defaults() {
        let store = MemoryStore::new();
        assert_eq!(DeviceConfig::load(&store).unwrap(), DeviceConfig::default());
    }

    #[test]
    fn load_reports_unparseable_number_as_corrupt() {
        let mut store = MemoryStore::new();
        store.save(keys::LED_BRIGHTNESS, "bright").unwrap();

        let result = DeviceConfig::load(&store);
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn load_clamps_out_of_range_brightness() {
        let mut store = MemoryStore::new();
        store.save(keys::LED_BRIGHTNESS, "300").unwrap();
        assert_eq!(DeviceConfig::load(&store).unwrap().led_brightness, 255);

        store.save(keys::LED_BRIGHTNESS, "-20").unwrap();
        assert_eq!(DeviceConfig::load(&store).unwrap().led_brightness, 0);
    }

    #[test]
    fn save_writes_every_key_in_one_batch() {
        let mut store = MockConfigStore::new();
        store.expect_save().never();
        store
            .expect_save_all()
            .times(1)
            .withf(|values| values.len() == 14 && values[keys::GITHUB_USERNAME] == "octocat")
            .returning(|_| Ok(()));

        complete_config().save(&mut store).unwrap();
    }

    #[test]
    fn seed_fills_an_unconfigured_store_only() {
        let mut store = MemoryStore::new();
        assert!(DeviceConfig::seed(&mut store, &complete_config()).unwrap());
        assert_eq!(DeviceConfig::load(&store).unwrap(), complete_config());

        let mut other = complete_config();
        other.github_username = "someone".into();
        assert!(!DeviceConfig::seed(&mut store, &other).unwrap());
        assert_eq!(DeviceConfig::load(&store).unwrap().github_username, "octocat");

        let mut empty = MemoryStore::new();
        assert!(!DeviceConfig::seed(&mut empty, &DeviceConfig::default()).unwrap());
    }

    #[test]
    fn load_propagates_store_failure() {
        let mut store = MockConfigStore::new();
        store
            .expect_load()
            .returning(|_, _| Err(StoreError::Corrupt("bad sector".into())));

        assert!(matches!(
            DeviceConfig::load(&store),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let rendered = format!("{:?}", complete_config());
        assert!(!rendered.contains("ghp_token"));
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("octocat"));
    }

    #[test]
    fn from_lookup_clamps_brightness() {
        let config = DeviceConfig::from_lookup(|name| match name {
            "LED_BRIGHTNESS" => Some("900".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.led_brightness, 255);

        let config = DeviceConfig::from_lookup(|name| match name {
            "LED_BRIGHTNESS" => Some("-3".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.led_brightness, 0);
    }

    #[test]
    #[serial]
    fn from_environment_reads_prefixed_variables() {
        // SAFETY: serialised with other env-mutating tests.
        unsafe {
            env::set_var("GITGLOW_GITHUB_TOKEN", "env_token");
            env::set_var("GITGLOW_GITHUB_USERNAME", "envuser");
            env::set_var("GITGLOW_WIFI_SSID", "envnet");
            env::set_var("GITGLOW_REPOSITORIES", "envuser/one, envuser/two");
        }

        let config = DeviceConfig::from_environment().unwrap();

        unsafe {
            env::remove_var("GITGLOW_GITHUB_TOKEN");
            env::remove_var("GITGLOW_GITHUB_USERNAME");
            env::remove_var("GITGLOW_WIFI_SSID");
            env::remove_var("GITGLOW_REPOSITORIES");
        }

        assert_eq!(config.github_token, "env_token");
        assert_eq!(config.github_username, "envuser");
        assert_eq!(config.repositories.len(), 2);
        assert!(config.is_complete());
    }
}
